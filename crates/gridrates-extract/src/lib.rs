//! Offer extraction engine: heuristic table discovery, header-to-field
//! mapping, cell normalization, and benchmark-rate extraction.
//!
//! The source pages are independently maintained comparison tables with no
//! schema contract, so everything here is best-effort: rows that cannot be
//! normalized are dropped, and a document without a qualifying table is an
//! expected outcome, not an error.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::NaiveDate;
use gridrates_core::{
    BenchmarkRecord, Commodity, OfferRecord, PlanType, UtilityTarget, MONTH_TO_MONTH_TERM,
};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "gridrates-extract";

/// Electric rates parsed below this are assumed to be $/kWh and rescaled
/// ×100 into ¢/kWh. The same column header renders either unit across
/// source pages with no reliable indicator; there is no confirmation
/// signal, so a legitimately sub-threshold cent rate would be misread.
pub const DOLLARS_PER_UNIT_THRESHOLD: f64 = 0.50;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid target url {url}: {source}")]
    BaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

// ---------------------------------------------------------------- selectors

static TABLE_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table").expect("table selector"));
static THEAD_CELL_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("thead th").expect("thead selector"));
static ROW_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("tr").expect("tr selector"));
static HEADER_CELL_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("th, td").expect("header cell selector"));
static DATA_CELL_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("td").expect("td selector"));
static ANCHOR_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("anchor selector"));

fn collapse_ws(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: ElementRef<'_>) -> String {
    collapse_ws(&el.text().collect::<String>())
}

// --------------------------------------------------------- header classifier

/// Semantic column roles recognized in comparison-table headers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum SemanticField {
    Supplier,
    Rate,
    PlanType,
    IntroFlag,
    TermMonths,
    EarlyTerminationFee,
    MonthlyFee,
}

/// Ordered alias dictionary. Evaluation order is load-bearing: header texts
/// overlap in vocabulary ("Early Termination Fee" contains "term"), so
/// groups are tested top-to-bottom and the first match wins.
static HEADER_ALIASES: LazyLock<Vec<(Regex, SemanticField)>> = LazyLock::new(|| {
    let alias = |pattern: &str, field: SemanticField| {
        (Regex::new(pattern).expect("header alias pattern"), field)
    };
    vec![
        alias(r"^supplier", SemanticField::Supplier),
        alias(r"^early|termination\s*fee", SemanticField::EarlyTerminationFee),
        alias(r"^monthly", SemanticField::MonthlyFee),
        alias(
            r"^\$\s*/?\s*kwh$|^rate\s*\$\s*/\s*kwh$|^\$\s*/\s*[a-z]{2,4}$|^price",
            SemanticField::Rate,
        ),
        alias(r"^rate\s*type$|^type$|^plan", SemanticField::PlanType),
        alias(r"^intro", SemanticField::IntroFlag),
        alias(r"term", SemanticField::TermMonths),
    ]
});

/// Map one raw header label to a semantic field, or `None` for headers the
/// dictionary does not recognize (renewable content, promo columns, ...).
pub fn classify_header(label: &str) -> Option<SemanticField> {
    let normalized = collapse_ws(label).to_lowercase();
    if normalized.is_empty() {
        return None;
    }
    HEADER_ALIASES
        .iter()
        .find(|(pattern, _)| pattern.is_match(&normalized))
        .map(|(_, field)| *field)
}

/// Sparse column-index mapping for one header row. When two columns claim
/// the same field, the leftmost wins.
#[derive(Debug, Clone, Default)]
pub struct ColumnMap {
    by_field: BTreeMap<SemanticField, usize>,
}

impl ColumnMap {
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Self {
        let mut by_field = BTreeMap::new();
        for (index, label) in labels.iter().enumerate() {
            if let Some(field) = classify_header(label.as_ref()) {
                by_field.entry(field).or_insert(index);
            }
        }
        Self { by_field }
    }

    pub fn index_of(&self, field: SemanticField) -> Option<usize> {
        self.by_field.get(&field).copied()
    }

    pub fn recognized(&self) -> usize {
        self.by_field.len()
    }

    /// Supplier and term are the minimum a table must classify to qualify.
    pub fn covers_required(&self) -> bool {
        self.by_field.contains_key(&SemanticField::Supplier)
            && self.by_field.contains_key(&SemanticField::TermMonths)
    }
}

// ------------------------------------------------------------ table selector

#[derive(Debug, Clone)]
pub struct CandidateTable<'a> {
    pub element: ElementRef<'a>,
    pub header_labels: Vec<String>,
    pub columns: ColumnMap,
    pub score: usize,
}

/// Scan every table, score each by how many semantic fields its header row
/// satisfies, and pick the best. Ties break by document order. `None` is an
/// expected outcome for redesigned or tableless pages.
pub fn select_offer_table(document: &Html) -> Option<CandidateTable<'_>> {
    let mut best: Option<CandidateTable<'_>> = None;

    for table in document.select(&TABLE_SELECTOR) {
        let mut header_labels: Vec<String> =
            table.select(&THEAD_CELL_SELECTOR).map(element_text).collect();
        if header_labels.is_empty() {
            // no explicit header row element; fall back to the first row
            header_labels = table
                .select(&ROW_SELECTOR)
                .next()
                .map(|row| row.select(&HEADER_CELL_SELECTOR).map(element_text).collect())
                .unwrap_or_default();
        }
        if header_labels.iter().all(String::is_empty) {
            continue;
        }

        let columns = ColumnMap::from_labels(&header_labels);
        if !columns.covers_required() {
            continue;
        }

        let score = columns.recognized();
        if best.as_ref().map_or(true, |b| score > b.score) {
            best = Some(CandidateTable {
                element: table,
                header_labels,
                columns,
                score,
            });
        }
    }

    best
}

// --------------------------------------------------------- field normalizers

fn numeric_token(raw: &str) -> Option<f64> {
    let filtered: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if filtered.is_empty() {
        return None;
    }
    filtered.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse a rate cell. Electric values below [`DOLLARS_PER_UNIT_THRESHOLD`]
/// are rescaled into ¢/kWh exactly once, here; callers must not rescale
/// again. Gas rates pass through unscaled since their unit is recorded
/// per-target.
pub fn parse_rate(raw: &str, commodity: Commodity) -> Option<f64> {
    let value = numeric_token(raw)?;
    match commodity {
        Commodity::Electric if value < DOLLARS_PER_UNIT_THRESHOLD => {
            Some((value * 10_000.0).round() / 100.0)
        }
        _ => Some(value),
    }
}

static MONTH_TO_MONTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)month\s*[-\u{2010}-\u{2015}]?\s*to\s*[-\u{2010}-\u{2015}]?\s*month")
        .expect("month-to-month pattern")
});
static FIRST_INT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("integer pattern"));

/// Extract a term length in months. "Month-to-Month" maps to the
/// [`MONTH_TO_MONTH_TERM`] sentinel, distinct from an unparsable cell.
pub fn parse_term(raw: &str) -> Option<i32> {
    if MONTH_TO_MONTH_RE.is_match(raw) {
        return Some(MONTH_TO_MONTH_TERM);
    }
    FIRST_INT_RE
        .find(raw)
        .and_then(|m| m.as_str().parse::<i32>().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLabel {
    pub plan_type: PlanType,
    pub intro_hint: bool,
}

/// Normalize a plan-type cell. "Fixed" outranks "Variable"; "Intro" is a
/// modifier, not a plan type. Unrecognized text defaults to Variable, since
/// unknown labels are usually promotional variable offers rather than
/// malformed fixed ones.
pub fn parse_plan_label(raw: &str) -> PlanLabel {
    let lower = raw.to_lowercase();
    let plan_type = if lower.contains("fixed") {
        PlanType::Fixed
    } else {
        PlanType::Variable
    };
    PlanLabel {
        plan_type,
        intro_hint: lower.contains("intro"),
    }
}

/// Parse a fee cell. Absent or non-numeric cells are "no value", never zero.
pub fn parse_money(raw: &str) -> Option<f64> {
    numeric_token(raw)
}

pub fn parse_intro_flag(raw: &str) -> bool {
    raw.to_lowercase().contains("yes")
}

// ---------------------------------------------------------- supplier cleanup

/// Mashed-token repairs for observed markup artifacts, applied in order
/// before any truncation. Grows as new artifacts show up in source pages.
static SUPPLIER_REPAIRS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        // corporate suffix glued straight onto a street number:
        // "Acme Energy LLC123 Main St" -> "Acme Energy 123 Main St"
        (
            Regex::new(r"(?i)\b(?:LLC|L\.L\.C\.|Inc|Ltd|Corp)\.?,?\s*(\d)")
                .expect("suffix repair pattern"),
            "$1",
        ),
        // "d/b/a" glued onto the trade name
        (
            Regex::new(r"(?i)\bd/b/a(\S)").expect("dba repair pattern"),
            "d/b/a $1",
        ),
    ]
});

static SUPPLIER_BOILERPLATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:company\s*url|sign\s*up|terms\s*of\s*service|offer\s*details)\b")
        .expect("boilerplate pattern")
});

/// Address/phone fragments that mark where a supplier label stops being a
/// name. Truncation only applies when the match starts past index 0, so
/// names that legitimately begin with digits survive.
static SUPPLIER_CUTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bP\.?\s*O\.?\s*Box\b",
        r"(?i)\bSuite\b",
        r"(?i)\bSte\b",
        r"(?i)\bStreet\b",
        r"(?i)\bSt\b",
        r"(?i)\bRoad\b",
        r"(?i)\bRd\b",
        r"(?i)\bAve\b",
        r"(?i)\bBlvd\b",
        r"(?i)\bLane\b",
        r"(?i)\bDr\b",
        r"(?i)\b(?:AL|AK|AZ|AR|CA|CO|CT|DC|DE|FL|GA|HI|IA|ID|IL|IN|KS|KY|LA|MA|MD|ME|MI|MN|MO|MS|MT|NC|ND|NE|NH|NJ|NM|NV|NY|OH|OK|OR|PA|RI|SC|SD|TN|TX|UT|VA|VT|WA|WI|WV)\b[, ]?\d{5}",
        r"\(\d{3}\)\s*\d{3}[-\s.]?\d{4}",
        r"\d{3}[-\s.]?\d{3}[-\s.]?\d{4}",
        r"\d{1,5}\s+\w",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("supplier cut pattern"))
    .collect()
});

/// Best-effort cosmetic cleanup of a supplier cell: repair mashed tokens,
/// strip trailing UI chrome, truncate at address/phone fragments, collapse
/// leftovers. Shortens the label, never rejects it, and is idempotent.
pub fn clean_supplier(raw: &str) -> String {
    let mut s = collapse_ws(raw);

    for (pattern, replacement) in SUPPLIER_REPAIRS.iter() {
        s = pattern.replace_all(&s, *replacement).into_owned();
    }

    if let Some(start) = SUPPLIER_BOILERPLATE_RE.find(&s).map(|m| m.start()) {
        s.truncate(start);
    }

    for pattern in SUPPLIER_CUTS.iter() {
        match pattern.find(&s).map(|m| m.start()) {
            Some(start) if start > 0 => s.truncate(start),
            _ => {}
        }
    }

    collapse_ws(&s.replace('|', ""))
}

// ------------------------------------------------------ signup-link extractor

static SIGNUP_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)sign\s*up|company\s*url").expect("signup label pattern"));

/// Find the first navigable signup/company link inside the supplier cell.
/// Relative paths resolve against the source page; non-http(s) schemes
/// (javascript:, mailto:) are rejected.
pub fn extract_signup_url(cell: ElementRef<'_>, base: Option<&Url>) -> Option<String> {
    for anchor in cell.select(&ANCHOR_SELECTOR) {
        let label = element_text(anchor);
        if !SIGNUP_LABEL_RE.is_match(&label) {
            continue;
        }
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() {
            continue;
        }
        let resolved = match base {
            Some(base) => base.join(href).ok(),
            None => Url::parse(href).ok(),
        };
        let Some(resolved) = resolved else { continue };
        if matches!(resolved.scheme(), "http" | "https") {
            return Some(resolved.to_string());
        }
    }
    None
}

// ------------------------------------------------------- benchmark extractor

/// The benchmark figure is published as prose, not a table cell, e.g.
/// "... the Price to Compare for residential customers is $0.0750 per kWh".
static BENCHMARK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)price\s+to\s+compare.*?\bis\b.*?\$?\s*([0-9]+(?:\.[0-9]+)?)")
        .expect("benchmark pattern")
});

/// Scan the document's full visible text for a benchmark-rate sentence,
/// independent of table structure. At most one record per document; no
/// match is not an error.
pub fn extract_benchmark(
    document: &Html,
    target: &UtilityTarget,
    capture_date: NaiveDate,
) -> Option<BenchmarkRecord> {
    let text: String = document.root_element().text().collect::<Vec<_>>().join(" ");
    let captures = BENCHMARK_RE.captures(&text)?;
    let rate = parse_rate(captures.get(1)?.as_str(), target.commodity)?;
    Some(BenchmarkRecord::synthesize(target, rate, capture_date))
}

// ------------------------------------------------------------ record builder

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NoOffersReason {
    TableNotFound,
    ZeroRowsParsed,
}

/// Extraction metadata letting the orchestrator tell "table not found"
/// apart from "table found, zero rows emitted".
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParseDebug {
    pub reason: Option<NoOffersReason>,
    pub header_labels: Vec<String>,
    pub rows_emitted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedDocument {
    pub offers: Vec<OfferRecord>,
    pub benchmark: Option<BenchmarkRecord>,
    pub debug: ParseDebug,
}

/// Run the full engine over one document: pick the best table, walk its
/// data rows through the normalizers, and extract the prose benchmark.
///
/// A row is emitted only when supplier, rate, and term all resolve; source
/// tables routinely contain decorative or partial rows, so failures here
/// are silently dropped rather than reported.
pub fn parse_document(
    html: &str,
    target: &UtilityTarget,
    capture_date: NaiveDate,
) -> Result<ParsedDocument, ExtractError> {
    let base = Url::parse(&target.url).map_err(|source| ExtractError::BaseUrl {
        url: target.url.clone(),
        source,
    })?;

    let document = Html::parse_document(html);
    let benchmark = extract_benchmark(&document, target, capture_date);

    let Some(candidate) = select_offer_table(&document) else {
        return Ok(ParsedDocument {
            offers: Vec::new(),
            benchmark,
            debug: ParseDebug {
                reason: Some(NoOffersReason::TableNotFound),
                ..ParseDebug::default()
            },
        });
    };

    let mut offers = Vec::new();
    for row in candidate.element.select(&ROW_SELECTOR) {
        let cells: Vec<ElementRef<'_>> = row.select(&DATA_CELL_SELECTOR).collect();
        if cells.is_empty() {
            // header rows carry th cells only
            continue;
        }

        let cell_for = |field: SemanticField| {
            candidate
                .columns
                .index_of(field)
                .and_then(|index| cells.get(index))
                .copied()
        };
        let text_for =
            |field: SemanticField| cell_for(field).map(element_text).unwrap_or_default();

        let supplier = clean_supplier(&text_for(SemanticField::Supplier));
        let rate = parse_rate(&text_for(SemanticField::Rate), target.commodity);
        let term = parse_term(&text_for(SemanticField::TermMonths));

        let (Some(rate_value), Some(term_months)) = (rate, term) else {
            continue;
        };
        if supplier.is_empty() {
            continue;
        }

        let plan = parse_plan_label(&text_for(SemanticField::PlanType));
        let intro_cell = cell_for(SemanticField::IntroFlag)
            .map(|cell| parse_intro_flag(&element_text(cell)))
            .unwrap_or(false);
        let signup_url = cell_for(SemanticField::Supplier)
            .and_then(|cell| extract_signup_url(cell, Some(&base)));

        offers.push(OfferRecord {
            utility_slug: target.slug.clone(),
            commodity: target.commodity,
            supplier,
            plan_type: plan.plan_type,
            rate_value,
            rate_unit: target.rate_unit.clone(),
            term_months,
            is_intro: intro_cell || plan.intro_hint,
            early_termination_fee: cell_for(SemanticField::EarlyTerminationFee)
                .and_then(|cell| parse_money(&element_text(cell))),
            monthly_fee: cell_for(SemanticField::MonthlyFee)
                .and_then(|cell| parse_money(&element_text(cell))),
            signup_url,
            capture_date,
        });
    }

    let rows_emitted = offers.len();
    Ok(ParsedDocument {
        offers,
        benchmark,
        debug: ParseDebug {
            reason: (rows_emitted == 0).then_some(NoOffersReason::ZeroRowsParsed),
            header_labels: candidate.header_labels.clone(),
            rows_emitted,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn electric_target() -> UtilityTarget {
        UtilityTarget {
            slug: "aep-ohio".to_string(),
            display_name: "AEP Ohio".to_string(),
            commodity: Commodity::Electric,
            rate_unit: "¢/kWh".to_string(),
            url: "https://energychoice.example.gov/compare.aspx?TerritoryId=6".to_string(),
            enabled: true,
            customer_class: "residential".to_string(),
        }
    }

    fn gas_target() -> UtilityTarget {
        UtilityTarget {
            slug: "dominion-energy-ohio".to_string(),
            display_name: "Dominion Energy Ohio".to_string(),
            commodity: Commodity::Gas,
            rate_unit: "$/Mcf".to_string(),
            url: "https://energychoice.example.gov/compare.aspx?Category=Gas".to_string(),
            enabled: true,
            customer_class: "residential".to_string(),
        }
    }

    fn capture_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 3).expect("date")
    }

    #[test]
    fn header_classification_follows_priority_order() {
        assert_eq!(classify_header("Supplier"), Some(SemanticField::Supplier));
        assert_eq!(classify_header("$/kWh"), Some(SemanticField::Rate));
        assert_eq!(classify_header("Rate Type"), Some(SemanticField::PlanType));
        assert_eq!(classify_header("Term (Months)"), Some(SemanticField::TermMonths));
        assert_eq!(classify_header("Intro"), Some(SemanticField::IntroFlag));
        assert_eq!(classify_header("Monthly Fee"), Some(SemanticField::MonthlyFee));
        // overlap case: contains "term" but must not classify as a term
        assert_eq!(
            classify_header("Early Termination Fee"),
            Some(SemanticField::EarlyTerminationFee)
        );
        assert_eq!(
            classify_header("Termination Fee"),
            Some(SemanticField::EarlyTerminationFee)
        );
        assert_eq!(classify_header("Renewable Content"), None);
        assert_eq!(classify_header("  suPPlier  name "), Some(SemanticField::Supplier));
    }

    #[test]
    fn gas_rate_headers_classify_as_rate() {
        assert_eq!(classify_header("$/Mcf"), Some(SemanticField::Rate));
        assert_eq!(classify_header("$/Ccf"), Some(SemanticField::Rate));
        assert_eq!(classify_header("Price per Mcf"), Some(SemanticField::Rate));
    }

    #[test]
    fn duplicate_field_columns_keep_the_leftmost() {
        let columns = ColumnMap::from_labels(&["Supplier", "Price", "$/kWh", "Term"]);
        assert_eq!(columns.index_of(SemanticField::Rate), Some(1));
        assert_eq!(columns.index_of(SemanticField::TermMonths), Some(3));
        assert_eq!(columns.recognized(), 3);
    }

    #[test]
    fn electric_rates_rescale_below_threshold_only() {
        assert_eq!(parse_rate("0.0899", Commodity::Electric), Some(8.99));
        assert_eq!(parse_rate("$0.0849", Commodity::Electric), Some(8.49));
        assert_eq!(parse_rate("8.49¢", Commodity::Electric), Some(8.49));
        assert_eq!(parse_rate("9 ¢", Commodity::Electric), Some(9.0));
        // at the threshold: unchanged
        assert_eq!(parse_rate("0.50", Commodity::Electric), Some(0.50));
        // normalizing an already-normalized value must not double-scale
        let once = parse_rate("0.0899", Commodity::Electric).expect("rate");
        assert_eq!(parse_rate(&once.to_string(), Commodity::Electric), Some(once));
        assert_eq!(parse_rate("N/A", Commodity::Electric), None);
        assert_eq!(parse_rate("", Commodity::Electric), None);
    }

    #[test]
    fn gas_rates_pass_through_unscaled() {
        assert_eq!(parse_rate("0.45", Commodity::Gas), Some(0.45));
        assert_eq!(parse_rate("$4.29", Commodity::Gas), Some(4.29));
    }

    #[test]
    fn term_parser_handles_integers_and_month_to_month() {
        assert_eq!(parse_term("12"), Some(12));
        assert_eq!(parse_term("12 mo"), Some(12));
        assert_eq!(parse_term("6 months"), Some(6));
        assert_eq!(parse_term("Month-to-Month"), Some(MONTH_TO_MONTH_TERM));
        assert_eq!(parse_term("month to month"), Some(MONTH_TO_MONTH_TERM));
        assert_eq!(parse_term("N/A"), None);
        assert_eq!(parse_term(""), None);
    }

    #[test]
    fn plan_labels_prioritize_fixed_and_default_to_variable() {
        assert_eq!(parse_plan_label("Fixed").plan_type, PlanType::Fixed);
        assert_eq!(parse_plan_label("Intro Fixed").plan_type, PlanType::Fixed);
        assert!(parse_plan_label("Intro Fixed").intro_hint);
        assert_eq!(parse_plan_label("Variable").plan_type, PlanType::Variable);
        assert_eq!(parse_plan_label("Special Promo").plan_type, PlanType::Variable);
        assert!(parse_plan_label("Introductory").intro_hint);
    }

    #[test]
    fn money_parser_returns_no_value_rather_than_zero() {
        assert_eq!(parse_money("$150"), Some(150.0));
        assert_eq!(parse_money("99.95"), Some(99.95));
        assert_eq!(parse_money(""), None);
        assert_eq!(parse_money("None"), None);
    }

    #[test]
    fn intro_flag_requires_affirmative_token() {
        assert!(parse_intro_flag("Yes"));
        assert!(parse_intro_flag("yes*"));
        assert!(!parse_intro_flag("No"));
        assert!(!parse_intro_flag(""));
    }

    #[test]
    fn supplier_cleanup_strips_mashed_address() {
        assert_eq!(
            clean_supplier("Acme Energy LLC123 Main St Columbus OH 43215"),
            "Acme Energy"
        );
    }

    #[test]
    fn supplier_cleanup_strips_ui_chrome_and_phones() {
        assert_eq!(clean_supplier("Bright Power Company Url Sign Up"), "Bright Power");
        assert_eq!(clean_supplier("Volt Co (614) 555-1212"), "Volt Co");
        assert_eq!(clean_supplier("Volt Co 614-555-1212"), "Volt Co");
        assert_eq!(clean_supplier("NOPEC P.O. Box 4186"), "NOPEC");
    }

    #[test]
    fn supplier_cleanup_keeps_leading_digit_names() {
        // a cut pattern that matches at index 0 must not destroy the name
        assert_eq!(clean_supplier("3 Rivers Power"), "3 Rivers Power");
    }

    #[test]
    fn supplier_cleanup_is_idempotent() {
        let raw = "Acme Energy LLC123 Main St Columbus OH 43215 Sign Up";
        let once = clean_supplier(raw);
        assert_eq!(clean_supplier(&once), once);

        let plain = clean_supplier("Direct Energy Services");
        assert_eq!(clean_supplier(&plain), plain);
    }

    #[test]
    fn table_selection_requires_supplier_and_term() {
        let html = r#"
            <html><body>
            <table>
              <tr><th>Navigation</th><th>Links</th></tr>
              <tr><td>Home</td><td>About</td></tr>
            </table>
            <table>
              <tr><th>Supplier</th><th>$/kWh</th></tr>
              <tr><td>No Term Energy</td><td>8.10</td></tr>
            </table>
            <table>
              <tr><th>Supplier</th><th>Term</th></tr>
              <tr><td>Thin Energy</td><td>12</td></tr>
            </table>
            <table>
              <thead><tr><th>Supplier</th><th>Rate Type</th><th>$/kWh</th><th>Term (Months)</th></tr></thead>
              <tbody><tr><td>Rich Energy</td><td>Fixed</td><td>9.99</td><td>12</td></tr></tbody>
            </table>
            </body></html>"#;
        let document = Html::parse_document(html);
        let candidate = select_offer_table(&document).expect("candidate");
        // the four-field table outscores the minimal supplier+term table
        assert_eq!(candidate.score, 4);
        assert!(candidate.header_labels.iter().any(|h| h == "Rate Type"));
    }

    #[test]
    fn table_selection_ties_break_by_document_order() {
        let html = r#"
            <table>
              <tr><th>Supplier</th><th>Term</th></tr>
              <tr><td>First Co</td><td>6</td></tr>
            </table>
            <table>
              <tr><th>Supplier</th><th>Term</th></tr>
              <tr><td>Second Co</td><td>6</td></tr>
            </table>"#;
        let document = Html::parse_document(html);
        let candidate = select_offer_table(&document).expect("candidate");
        let text: String = candidate.element.text().collect();
        assert!(text.contains("First Co"));
    }

    #[test]
    fn missing_table_yields_reason_not_error() {
        let parsed = parse_document(
            "<html><body><p>Maintenance window</p></body></html>",
            &electric_target(),
            capture_date(),
        )
        .expect("parse");
        assert!(parsed.offers.is_empty());
        assert_eq!(parsed.debug.reason, Some(NoOffersReason::TableNotFound));
        assert_eq!(parsed.debug.rows_emitted, 0);
    }

    #[test]
    fn qualifying_table_with_no_valid_rows_reports_zero_rows() {
        let html = r#"
            <table>
              <tr><th>Supplier</th><th>$/kWh</th><th>Term</th></tr>
              <tr><td>Decorative Energy</td><td>call us</td><td>varies</td></tr>
            </table>"#;
        let parsed = parse_document(html, &electric_target(), capture_date()).expect("parse");
        assert!(parsed.offers.is_empty());
        assert_eq!(parsed.debug.reason, Some(NoOffersReason::ZeroRowsParsed));
    }

    #[test]
    fn rows_missing_rate_or_term_are_never_emitted() {
        let html = r#"
            <table>
              <tr><th>Supplier</th><th>$/kWh</th><th>Term</th></tr>
              <tr><td>Has Everything</td><td>0.0899</td><td>12</td></tr>
              <tr><td>No Rate Energy</td><td></td><td>12</td></tr>
              <tr><td>No Term Energy</td><td>8.99</td><td></td></tr>
              <tr><td></td><td>8.99</td><td>12</td></tr>
            </table>"#;
        let parsed = parse_document(html, &electric_target(), capture_date()).expect("parse");
        assert_eq!(parsed.offers.len(), 1);
        assert_eq!(parsed.offers[0].supplier, "Has Everything");
        assert_eq!(parsed.debug.rows_emitted, 1);
    }

    #[test]
    fn concrete_row_scenario_normalizes_every_field() {
        let html = r#"
            <table>
              <tr><th>Supplier</th><th>Rate Type</th><th>$/kWh</th><th>Term (Months)</th><th>Intro</th></tr>
              <tr>
                <td>Acme Energy LLC123 Main St Columbus OH 43215</td>
                <td>Fixed</td>
                <td>0.0899</td>
                <td>12</td>
                <td>No</td>
              </tr>
            </table>"#;
        let parsed = parse_document(html, &electric_target(), capture_date()).expect("parse");
        assert_eq!(parsed.offers.len(), 1);
        let offer = &parsed.offers[0];
        assert_eq!(offer.supplier, "Acme Energy");
        assert_eq!(offer.plan_type, PlanType::Fixed);
        assert_eq!(offer.rate_value, 8.99);
        assert_eq!(offer.term_months, 12);
        assert!(!offer.is_intro);
        assert_eq!(offer.rate_unit, "¢/kWh");
        assert_eq!(offer.capture_date, capture_date());
    }

    #[test]
    fn signup_links_resolve_and_reject_non_navigable_schemes() {
        let html = r#"
            <table>
              <tr><th>Supplier</th><th>$/kWh</th><th>Term</th></tr>
              <tr>
                <td>Linked Energy <a href="javascript:void(0)">Sign Up</a>
                    <a href="/enroll?offer=7">Sign Up</a></td>
                <td>9.20</td><td>12</td>
              </tr>
              <tr>
                <td>Mail Only Energy <a href="mailto:sales@example.com">Sign Up</a></td>
                <td>9.30</td><td>12</td>
              </tr>
            </table>"#;
        let parsed = parse_document(html, &electric_target(), capture_date()).expect("parse");
        assert_eq!(parsed.offers.len(), 2);
        assert_eq!(
            parsed.offers[0].signup_url.as_deref(),
            Some("https://energychoice.example.gov/enroll?offer=7")
        );
        assert_eq!(parsed.offers[1].signup_url, None);
        // the boilerplate strip keeps the label clean despite the link text
        assert_eq!(parsed.offers[0].supplier, "Linked Energy");
    }

    #[test]
    fn benchmark_scenario_synthesizes_standard_offer() {
        let html = r#"
            <html><body>
            <p>For residential customers, the Price to Compare for this
               territory is $0.0750 per kWh through the next billing cycle.</p>
            </body></html>"#;
        let document = Html::parse_document(html);
        let benchmark =
            extract_benchmark(&document, &electric_target(), capture_date()).expect("benchmark");
        assert_eq!(benchmark.supplier, "AEP Ohio (Standard Offer)");
        assert_eq!(benchmark.rate_value, 7.50);
        assert_eq!(benchmark.term_months, 1);
    }

    #[test]
    fn benchmark_absence_is_not_an_error() {
        let document = Html::parse_document("<html><body><p>No rates here.</p></body></html>");
        assert!(extract_benchmark(&document, &electric_target(), capture_date()).is_none());
    }

    #[test]
    fn gas_benchmark_is_not_rescaled() {
        let html = "<p>The Price to Compare for this service area is $4.29 per Mcf.</p>";
        let document = Html::parse_document(html);
        let benchmark =
            extract_benchmark(&document, &gas_target(), capture_date()).expect("benchmark");
        assert_eq!(benchmark.rate_value, 4.29);
        assert_eq!(benchmark.supplier, "Dominion Energy Ohio (Standard Offer)");
    }

    #[test]
    fn month_to_month_rows_survive_the_validity_gate() {
        let html = r#"
            <table>
              <tr><th>Supplier</th><th>$/kWh</th><th>Term</th></tr>
              <tr><td>Rolling Energy</td><td>10.5</td><td>Month-to-Month</td></tr>
            </table>"#;
        let parsed = parse_document(html, &electric_target(), capture_date()).expect("parse");
        assert_eq!(parsed.offers.len(), 1);
        assert_eq!(parsed.offers[0].term_months, MONTH_TO_MONTH_TERM);
    }
}
