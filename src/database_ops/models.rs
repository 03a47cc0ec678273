//! Row structs for the five tables this crate owns. Column names follow the
//! NFC-e domain: `ean` is the GTIN (with the receipt sentinel "SEM GTIN" when
//! absent) and `ncm` is the 8-digit Mercosur fiscal classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Receipt text used when a line item carries no GTIN.
pub const NO_GTIN: &str = "SEM GTIN";

/// Minimum digit count for an EAN we are willing to look up externally.
pub const MIN_EAN_DIGITS: usize = 8;

/// Returns true when `ean` is a real, lookup-worthy GTIN (not the sentinel,
/// at least 8 digits).
pub fn is_usable_ean(ean: &str) -> bool {
    let trimmed = ean.trim();
    trimmed != NO_GTIN
        && trimmed.len() >= MIN_EAN_DIGITS
        && trimmed.chars().all(|c| c.is_ascii_digit())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentStatus {
    Pending,
    Completed,
    Failed,
    Backlog,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Completed => "completed",
            EnrichmentStatus::Failed => "failed",
            EnrichmentStatus::Backlog => "backlog",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    Processing,
    Extracting,
    Success,
    Error,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStatus::Processing => "processing",
            ExtractionStatus::Extracting => "extracting",
            ExtractionStatus::Success => "success",
            ExtractionStatus::Error => "error",
        }
    }
}

/// One raw receipt line, immutable once written except for the enrichment
/// status fields the worker flips.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PurchaseRow {
    pub id: i64,
    pub market_id: String,
    pub ean: String,
    pub ncm: String,
    pub product_name: String,
    pub quantity: f64,
    pub unidade_comercial: String,
    pub unit_price: f64,
    pub total_price: f64,
    pub nfce_url: String,
    pub purchase_date: DateTime<Utc>,
    pub enriched: bool,
    pub enrichment_status: String,
    pub enrichment_error: Option<String>,
    pub enrichment_attempts: i32,
}

/// Deduplicated, displayable product identity within one market.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UniqueProductRow {
    pub id: i64,
    pub market_id: String,
    pub ean: String,
    pub ncm: String,
    pub product_name: String,
    pub unidade_comercial: String,
    pub price: f64,
    pub nfce_url: String,
    pub last_updated: DateTime<Utc>,
}

/// One extraction job over a receipt URL. At most one row may be in
/// `extracting` across the whole system at any instant.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProcessedUrlRow {
    pub id: i64,
    pub nfce_url: String,
    pub market_id: String,
    pub products_count: i32,
    pub status: String,
    pub processed_at: DateTime<Utc>,
    pub extraction_started_at: Option<DateTime<Utc>>,
}

/// Append-only record of one resolution attempt.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LookupLogRow {
    pub id: i64,
    pub run_id: Uuid,
    pub nfce_url: String,
    pub market_id: String,
    pub gtin: String,
    pub ncm: String,
    pub original_name: String,
    pub final_name: Option<String>,
    pub source_used: Option<String>,
    pub discovered_ean: Option<String>,
    pub success: bool,
    pub execution_time_ms: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Terminal record for a line no source could resolve; waits for curation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BacklogRow {
    pub id: i64,
    pub purchase_id: i64,
    pub market_id: String,
    pub ean: String,
    pub ncm: String,
    pub product_name: String,
    pub reason: String,
    pub curated: bool,
    pub created_at: DateTime<Utc>,
}

/// One incoming line item as handed over by the receipt extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLineItem {
    pub ncm: String,
    #[serde(default = "default_ean")]
    pub ean: String,
    #[serde(rename = "product", default)]
    pub product_name: String,
    #[serde(default)]
    pub quantity: f64,
    #[serde(default = "default_unit")]
    pub unidade_comercial: String,
    #[serde(default)]
    pub unit_price: f64,
    #[serde(default)]
    pub total_price: f64,
}

fn default_ean() -> String {
    NO_GTIN.to_string()
}

fn default_unit() -> String {
    "UN".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_and_short_eans_are_not_usable() {
        assert!(!is_usable_ean(NO_GTIN));
        assert!(!is_usable_ean("1234567"));
        assert!(!is_usable_ean(""));
        assert!(!is_usable_ean("78910001AB103"));
    }

    #[test]
    fn real_gtins_are_usable() {
        assert!(is_usable_ean("78910001"));
        assert!(is_usable_ean("7891000100103"));
        assert!(is_usable_ean(" 7891000100103 "));
    }

    #[test]
    fn raw_line_defaults_fill_missing_fields() {
        let item: RawLineItem =
            serde_json::from_str(r#"{"ncm":"04021000","product":"LEITE COND NINHO"}"#).unwrap();
        assert_eq!(item.ean, NO_GTIN);
        assert_eq!(item.unidade_comercial, "UN");
        assert_eq!(item.quantity, 0.0);
    }
}
