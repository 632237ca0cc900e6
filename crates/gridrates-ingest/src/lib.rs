//! Ingestion orchestration and Postgres persistence for gridrates.
//!
//! One run walks the configured targets sequentially: fetch (with a single
//! alternate-render-mode fallback), archive the raw page, extract, classify
//! a per-target outcome, and upsert whatever was recovered. Everything
//! short of a missing database configuration is recovered at the smallest
//! possible scope so one bad source page never blocks the others.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use gridrates_core::{
    OfferRecord, OutcomeKind, RunReport, TargetOutcome, UtilityTarget,
};
use gridrates_extract::{parse_document, ExtractError, NoOffersReason, ParsedDocument};
use gridrates_fetch::{
    DocumentFetcher, RawPageStore, RenderApiConfig, RenderApiFetcher, RenderMode,
    MIN_DOCUMENT_BYTES,
};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Acquire, Postgres, QueryBuilder, Transaction};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gridrates-ingest";

// ------------------------------------------------------------- configuration

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    pub targets_path: PathBuf,
    pub archive_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub render_api_url: String,
    pub render_api_key: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub polite_delay_ms: u64,
    pub min_document_bytes: usize,
    pub scheduler_enabled: bool,
    pub ingest_cron_1: String,
    pub ingest_cron_2: String,
}

impl IngestConfig {
    /// Read configuration from the environment. Missing store or render-API
    /// credentials are the one class of error that aborts a whole run; no
    /// target-level recovery is meaningful without them.
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL_UNPOOLED")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .context("DATABASE_URL_UNPOOLED or DATABASE_URL must be set")?;
        let render_api_key =
            std::env::var("RENDER_API_KEY").context("RENDER_API_KEY must be set")?;

        Ok(Self {
            database_url,
            targets_path: std::env::var("GRIDRATES_TARGETS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./targets.yaml")),
            archive_dir: std::env::var("GRIDRATES_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./archive")),
            reports_dir: std::env::var("GRIDRATES_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            render_api_url: std::env::var("RENDER_API_URL")
                .unwrap_or_else(|_| "https://api.zyte.com/v1/extract".to_string()),
            render_api_key,
            user_agent: std::env::var("GRIDRATES_USER_AGENT")
                .unwrap_or_else(|_| "gridrates-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("GRIDRATES_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            polite_delay_ms: std::env::var("GRIDRATES_POLITE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_200),
            min_document_bytes: std::env::var("GRIDRATES_MIN_DOCUMENT_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(MIN_DOCUMENT_BYTES),
            scheduler_enabled: std::env::var("GRIDRATES_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            ingest_cron_1: std::env::var("INGEST_CRON_1")
                .unwrap_or_else(|_| "0 11 * * *".to_string()),
            ingest_cron_2: std::env::var("INGEST_CRON_2")
                .unwrap_or_else(|_| "0 23 * * *".to_string()),
        })
    }
}

pub async fn connect_pool(config: &IngestConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("connecting to postgres")
}

// ------------------------------------------------------------ target registry

#[derive(Debug, Clone, Deserialize)]
pub struct TargetRegistry {
    pub targets: Vec<UtilityTarget>,
}

impl TargetRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing target registry yaml")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

// ----------------------------------------------------- outcome classification

/// Reduce one target's fetch+parse result to its reported outcome. An
/// undersized document classifies as a fetch failure even when best-effort
/// parsing still recovered rows; rows are persisted regardless.
pub fn classify_outcome(
    document_size: usize,
    min_document_bytes: usize,
    parsed: &Result<ParsedDocument, ExtractError>,
) -> (OutcomeKind, Option<String>) {
    if document_size < min_document_bytes {
        return (OutcomeKind::FetchFailed, None);
    }
    match parsed {
        Err(err) => (OutcomeKind::ParseError, Some(err.to_string())),
        Ok(doc) if doc.offers.is_empty() => match doc.debug.reason {
            Some(NoOffersReason::ZeroRowsParsed) => (OutcomeKind::ZeroRowsParsed, None),
            Some(NoOffersReason::TableNotFound) | None => (OutcomeKind::TableNotFound, None),
        },
        Ok(_) => (OutcomeKind::Ok, None),
    }
}

// ------------------------------------------------------- persistence upserter

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl std::ops::AddAssign for UpsertSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.applied += rhs.applied;
        self.skipped += rhs.skipped;
        self.failed += rhs.failed;
    }
}

/// What the live `offers` table actually exposes. The store drifts between
/// deployments (`day` vs `date`, `plan` vs `product_type`, optional extras),
/// so the insert statement is built against the observed columns rather
/// than a fixed schema contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffersSchema {
    pub date_column: String,
    pub has_plan: bool,
    pub has_product_type: bool,
    pub has_unit: bool,
    pub has_is_intro: bool,
    pub has_signup_url: bool,
    pub has_source: bool,
}

impl OffersSchema {
    pub fn from_columns(columns: &HashSet<String>) -> Result<Self> {
        let date_column = if columns.contains("day") {
            "day".to_string()
        } else if columns.contains("date") {
            "date".to_string()
        } else {
            anyhow::bail!("offers table has neither a 'day' nor a 'date' column");
        };
        let has_plan = columns.contains("plan");
        let has_product_type = columns.contains("product_type");
        if !has_plan && !has_product_type {
            anyhow::bail!("offers table has neither a 'plan' nor a 'product_type' column");
        }
        Ok(Self {
            date_column,
            has_plan,
            has_product_type,
            has_unit: columns.contains("unit"),
            has_is_intro: columns.contains("is_intro"),
            has_signup_url: columns.contains("signup_url"),
            has_source: columns.contains("source"),
        })
    }

    /// Column used in the upsert identity key when both plan spellings exist.
    pub fn plan_key(&self) -> &'static str {
        if self.has_product_type {
            "product_type"
        } else {
            "plan"
        }
    }
}

async fn sniff_offers_schema(pool: &PgPool) -> Result<OffersSchema> {
    let columns: Vec<String> = sqlx::query_scalar(
        "SELECT column_name FROM information_schema.columns WHERE table_name = 'offers'",
    )
    .fetch_all(pool)
    .await
    .context("inspecting offers schema")?;
    OffersSchema::from_columns(&columns.into_iter().collect())
}

async fn ensure_upsert_index(pool: &PgPool, schema: &OffersSchema) -> Result<()> {
    let index_name = format!("offers_uni_{}_uid_{}", schema.date_column, schema.plan_key());
    let sql = format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {index_name} \
         ON offers (utility_id, supplier, {}, term_months, {})",
        schema.plan_key(),
        schema.date_column
    );
    sqlx::query(&sql)
        .execute(pool)
        .await
        .context("ensuring upsert unique index")?;
    Ok(())
}

/// Idempotently register the owning utility and return its id.
pub async fn ensure_utility(pool: &PgPool, target: &UtilityTarget) -> Result<i32> {
    if let Some(id) = sqlx::query_scalar::<_, i32>("SELECT id FROM utilities WHERE slug = $1")
        .bind(&target.slug)
        .fetch_optional(pool)
        .await
        .context("looking up utility")?
    {
        return Ok(id);
    }

    sqlx::query_scalar::<_, i32>(
        "INSERT INTO utilities (slug, display_name, name, commodity, customer_class) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (slug) DO UPDATE \
           SET display_name   = EXCLUDED.display_name, \
               name           = EXCLUDED.name, \
               commodity      = EXCLUDED.commodity, \
               customer_class = EXCLUDED.customer_class \
         RETURNING id",
    )
    .bind(&target.slug)
    .bind(&target.display_name)
    .bind(&target.display_name)
    .bind(target.commodity.as_str())
    .bind(&target.customer_class)
    .fetch_one(pool)
    .await
    .context("registering utility")
}

/// Minimum validity for persistence. Term 0 is the month-to-month sentinel
/// and passes; a non-finite rate or blank supplier does not.
pub fn record_is_valid(offer: &OfferRecord) -> bool {
    !offer.supplier.trim().is_empty() && offer.rate_value.is_finite()
}

fn build_insert<'a>(
    schema: &'a OffersSchema,
    utility_id: i32,
    source_url: &'a str,
    offer: &'a OfferRecord,
) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new("INSERT INTO offers (utility_id, supplier, ");
    if schema.has_plan {
        qb.push("plan, ");
    }
    if schema.has_product_type {
        qb.push("product_type, ");
    }
    qb.push("rate_cents_per_kwh, term_months, early_termination_fee, monthly_fee");
    if schema.has_unit {
        qb.push(", unit");
    }
    if schema.has_is_intro {
        qb.push(", is_intro");
    }
    if schema.has_signup_url {
        qb.push(", signup_url");
    }
    if schema.has_source {
        qb.push(", source");
    }
    qb.push(", ");
    qb.push(&schema.date_column);
    qb.push(") VALUES (");

    {
        let plan = offer.plan_type.as_str();
        let mut values = qb.separated(", ");
        values.push_bind(utility_id);
        values.push_bind(&offer.supplier);
        if schema.has_plan {
            // same value into both spellings so NOT NULL holds on either
            values.push_bind(plan);
        }
        if schema.has_product_type {
            values.push_bind(plan);
        }
        values.push_bind(offer.rate_value);
        values.push_bind(offer.term_months);
        values.push_bind(offer.early_termination_fee);
        values.push_bind(offer.monthly_fee);
        if schema.has_unit {
            values.push_bind(&offer.rate_unit);
        }
        if schema.has_is_intro {
            values.push_bind(offer.is_intro);
        }
        if schema.has_signup_url {
            values.push_bind(offer.signup_url.as_deref());
        }
        if schema.has_source {
            values.push_bind(source_url);
        }
        values.push_bind(offer.capture_date);
    }

    qb.push(") ON CONFLICT (utility_id, supplier, ");
    qb.push(schema.plan_key());
    qb.push(", term_months, ");
    qb.push(&schema.date_column);
    qb.push(
        ") DO UPDATE SET \
           rate_cents_per_kwh    = EXCLUDED.rate_cents_per_kwh, \
           early_termination_fee = EXCLUDED.early_termination_fee, \
           monthly_fee           = EXCLUDED.monthly_fee",
    );
    qb
}

async fn upsert_single(
    tx: &mut Transaction<'_, Postgres>,
    schema: &OffersSchema,
    utility_id: i32,
    source_url: &str,
    offer: &OfferRecord,
) -> Result<(), sqlx::Error> {
    // nested transaction = SAVEPOINT; dropping it on error rolls back only
    // this row and the batch continues
    let mut savepoint = tx.begin().await?;
    build_insert(schema, utility_id, source_url, offer)
        .build()
        .execute(&mut *savepoint)
        .await?;
    savepoint.commit().await?;
    Ok(())
}

/// Insert-or-update a batch of records sharing a capture date. Conflict
/// resolution touches only the mutable fields (rate, fees); identity fields
/// are never overwritten. Row-level failures are isolated per savepoint.
pub async fn upsert_offers(
    pool: &PgPool,
    target: &UtilityTarget,
    offers: &[OfferRecord],
) -> Result<UpsertSummary> {
    let mut summary = UpsertSummary::default();
    if offers.is_empty() {
        return Ok(summary);
    }

    let utility_id = ensure_utility(pool, target).await?;
    let schema = sniff_offers_schema(pool).await?;
    ensure_upsert_index(pool, &schema).await?;

    let mut tx = pool.begin().await.context("opening offers transaction")?;
    for offer in offers {
        if !record_is_valid(offer) {
            summary.skipped += 1;
            continue;
        }
        match upsert_single(&mut tx, &schema, utility_id, &target.url, offer).await {
            Ok(()) => summary.applied += 1,
            Err(err) => {
                summary.failed += 1;
                warn!(
                    target_slug = %target.slug,
                    supplier = %offer.supplier,
                    term_months = offer.term_months,
                    error = %err,
                    "offer row failed to upsert; continuing batch"
                );
            }
        }
    }
    tx.commit().await.context("committing offers transaction")?;

    Ok(summary)
}

// ------------------------------------------------------ ingestion orchestrator

pub struct IngestPipeline {
    config: IngestConfig,
    fetcher: Box<dyn DocumentFetcher>,
    archive: RawPageStore,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig) -> Result<Self> {
        let fetcher = RenderApiFetcher::new(RenderApiConfig {
            endpoint: config.render_api_url.clone(),
            api_key: config.render_api_key.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            backoff: Default::default(),
        })?;
        let archive = RawPageStore::new(config.archive_dir.clone());
        Ok(Self {
            config,
            fetcher: Box::new(fetcher),
            archive,
        })
    }

    pub fn with_fetcher(mut self, fetcher: Box<dyn DocumentFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Fetch a target's document, retrying once with the alternate render
    /// mode when the result is missing or undersized. Always returns text
    /// (possibly empty) so every target produces a classified outcome.
    async fn fetch_with_fallback(&self, target: &UtilityTarget) -> String {
        let mut document = match self
            .fetcher
            .fetch(&target.slug, &target.url, RenderMode::Browser)
            .await
        {
            Ok(text) => text,
            Err(err) => {
                warn!(target_slug = %target.slug, error = %err, "primary fetch failed");
                String::new()
            }
        };

        if document.len() < self.config.min_document_bytes {
            let fallback_mode = RenderMode::Browser.alternate();
            warn!(
                target_slug = %target.slug,
                size = document.len(),
                ?fallback_mode,
                "document undersized; retrying with alternate render mode"
            );
            match self
                .fetcher
                .fetch(&target.slug, &target.url, fallback_mode)
                .await
            {
                Ok(fallback) if fallback.len() > document.len() => document = fallback,
                Ok(_) => {}
                Err(err) => {
                    warn!(target_slug = %target.slug, error = %err, "fallback fetch failed");
                }
            }
        }

        document
    }

    async fn process_target(
        &self,
        pool: &PgPool,
        target: &UtilityTarget,
        capture_date: NaiveDate,
    ) -> (TargetOutcome, UpsertSummary) {
        let document = self.fetch_with_fallback(target).await;
        let document_size = document.len();

        if !document.is_empty() {
            // archival is debugging support, never a reason to fail a target
            if let Err(err) = self
                .archive
                .store_page(Utc::now(), &target.slug, &document)
                .await
            {
                warn!(target_slug = %target.slug, error = %err, "raw page archival failed");
            }
        }

        let parsed = parse_document(&document, target, capture_date);
        let (outcome, parse_error) =
            classify_outcome(document_size, self.config.min_document_bytes, &parsed);

        let mut rows_emitted = 0;
        let mut summary = UpsertSummary::default();
        if let Ok(doc) = &parsed {
            rows_emitted = doc.debug.rows_emitted;
            let mut records = doc.offers.clone();
            if let Some(benchmark) = doc.benchmark.clone() {
                records.push(benchmark.into_offer());
            }
            if !records.is_empty() {
                match upsert_offers(pool, target, &records).await {
                    Ok(batch) => summary = batch,
                    Err(err) => {
                        summary.failed += records.len();
                        warn!(
                            target_slug = %target.slug,
                            error = %err,
                            "offer batch failed to persist"
                        );
                    }
                }
            }
        }

        let outcome = TargetOutcome {
            target_slug: target.slug.clone(),
            outcome,
            rows_emitted,
            raw_document_size: document_size,
            parse_error,
        };
        (outcome, summary)
    }

    /// Run one full ingestion pass over every enabled target, sequentially
    /// and with a polite delay between targets. There is no cross-target
    /// transaction: aborting between targets leaves earlier commits intact.
    pub async fn run_once(&self, pool: &PgPool) -> Result<RunReport> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let capture_date = started_at.date_naive();

        let registry = TargetRegistry::load(&self.config.targets_path).await?;
        let targets: Vec<UtilityTarget> =
            registry.targets.into_iter().filter(|t| t.enabled).collect();

        let mut outcomes = Vec::with_capacity(targets.len());
        let mut totals = UpsertSummary::default();

        for (index, target) in targets.iter().enumerate() {
            let (outcome, summary) = self.process_target(pool, target, capture_date).await;
            info!(
                target_slug = %target.slug,
                outcome = ?outcome.outcome,
                rows_emitted = outcome.rows_emitted,
                raw_document_size = outcome.raw_document_size,
                applied = summary.applied,
                "target processed"
            );
            outcomes.push(outcome);
            totals += summary;

            if index + 1 < targets.len() {
                tokio::time::sleep(Duration::from_millis(self.config.polite_delay_ms)).await;
            }
        }

        let report = RunReport {
            run_id,
            capture_date,
            started_at,
            finished_at: Utc::now(),
            outcomes,
            rows_applied: totals.applied,
            rows_skipped: totals.skipped,
            rows_failed: totals.failed,
        };
        self.write_report(&report).await?;
        Ok(report)
    }

    async fn write_report(&self, report: &RunReport) -> Result<()> {
        let report_dir = self.config.reports_dir.join(report.run_id.to_string());
        fs::create_dir_all(&report_dir)
            .await
            .with_context(|| format!("creating {}", report_dir.display()))?;
        let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
        let path = report_dir.join("run.json");
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Build the cron scheduler when enabled: two pulls a day by default, each
/// a discrete batch run.
pub async fn maybe_build_scheduler(
    pipeline: Arc<IngestPipeline>,
    pool: PgPool,
) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let crons = [
        pipeline.config.ingest_cron_1.clone(),
        pipeline.config.ingest_cron_2.clone(),
    ];
    for cron in crons {
        let pipeline = pipeline.clone();
        let pool = pool.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            let pool = pool.clone();
            Box::pin(async move {
                match pipeline.run_once(&pool).await {
                    Ok(report) => info!(
                        run_id = %report.run_id,
                        targets = report.outcomes.len(),
                        rows_applied = report.rows_applied,
                        "scheduled ingest run complete"
                    ),
                    Err(err) => warn!(error = %err, "scheduled ingest run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

pub async fn run_ingest_once_from_env() -> Result<RunReport> {
    let config = IngestConfig::from_env()?;
    let pool = connect_pool(&config).await?;
    let pipeline = IngestPipeline::new(config)?;
    pipeline.run_once(&pool).await
}
