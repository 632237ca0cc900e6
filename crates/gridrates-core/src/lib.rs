//! Core domain model and run-outcome types for gridrates.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gridrates-core";

/// Term sentinel for month-to-month plans, distinct from "term unknown".
pub const MONTH_TO_MONTH_TERM: i32 = 0;

/// Term sentinel for synthesized benchmark records: always active.
pub const BENCHMARK_TERM_MONTHS: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commodity {
    Electric,
    Gas,
}

impl Commodity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Commodity::Electric => "electric",
            Commodity::Gas => "gas",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanType {
    Fixed,
    Variable,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Fixed => "Fixed",
            PlanType::Variable => "Variable",
        }
    }
}

impl std::fmt::Display for PlanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured utility/commodity comparison page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilityTarget {
    pub slug: String,
    pub display_name: String,
    pub commodity: Commodity,
    /// Display unit recorded on persisted rows. Electric targets use ¢/kWh;
    /// gas unit conventions differ per utility ($/Mcf vs $/Ccf).
    pub rate_unit: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_customer_class")]
    pub customer_class: String,
}

fn default_true() -> bool {
    true
}

fn default_customer_class() -> String {
    "residential".to_string()
}

/// Canonical competitive-supplier offer, one per qualifying table row.
///
/// Identity fields (`utility_slug`, `supplier`, `plan_type`, `term_months`,
/// `capture_date`) never change after creation; rate and fees may differ
/// run-to-run for the same identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferRecord {
    pub utility_slug: String,
    pub commodity: Commodity,
    pub supplier: String,
    pub plan_type: PlanType,
    pub rate_value: f64,
    pub rate_unit: String,
    pub term_months: i32,
    pub is_intro: bool,
    pub early_termination_fee: Option<f64>,
    pub monthly_fee: Option<f64>,
    pub signup_url: Option<String>,
    pub capture_date: NaiveDate,
}

/// Benchmark "price to compare" rate, synthesized from page prose rather
/// than scraped from a table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    pub utility_slug: String,
    pub commodity: Commodity,
    pub supplier: String,
    pub rate_value: f64,
    pub rate_unit: String,
    pub term_months: i32,
    pub capture_date: NaiveDate,
}

impl BenchmarkRecord {
    pub fn synthesize(target: &UtilityTarget, rate_value: f64, capture_date: NaiveDate) -> Self {
        Self {
            utility_slug: target.slug.clone(),
            commodity: target.commodity,
            supplier: format!("{} (Standard Offer)", target.display_name),
            rate_value,
            rate_unit: target.rate_unit.clone(),
            term_months: BENCHMARK_TERM_MONTHS,
            capture_date,
        }
    }

    /// View as an offer so a single persistence path handles both kinds.
    pub fn into_offer(self) -> OfferRecord {
        OfferRecord {
            utility_slug: self.utility_slug,
            commodity: self.commodity,
            supplier: self.supplier,
            plan_type: PlanType::Variable,
            rate_value: self.rate_value,
            rate_unit: self.rate_unit,
            term_months: self.term_months,
            is_intro: false,
            early_termination_fee: None,
            monthly_fee: None,
            signup_url: None,
            capture_date: self.capture_date,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutcomeKind {
    Ok,
    TableNotFound,
    ZeroRowsParsed,
    ParseError,
    FetchFailed,
}

/// Machine-readable per-target outcome, the run's observability surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub target_slug: String,
    pub outcome: OutcomeKind,
    pub rows_emitted: usize,
    pub raw_document_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub capture_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<TargetOutcome>,
    pub rows_applied: usize,
    pub rows_skipped: usize,
    pub rows_failed: usize,
}
