//! Append-only lookup audit trail. Besides debugging, the trail doubles as a
//! local cache: a later line with the same raw text and NCM but no GTIN can
//! reuse the EAN an earlier successful lookup discovered.

use anyhow::Result;
use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use super::db::Db;

#[derive(Debug, Clone)]
pub struct LookupAudit {
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
}

/// A previously discovered (name, ean) pair recalled from the trail.
#[derive(Debug, Clone)]
pub struct AuditReuse {
    pub final_name: String,
    pub discovered_ean: String,
}

pub async fn append(db: &Db, entry: &LookupAudit) -> Result<()> {
    sqlx::query(
        "INSERT INTO product_lookup_log \
         (run_id, nfce_url, market_id, gtin, ncm, original_name, final_name, source_used, \
          discovered_ean, success, execution_time_ms, error_message, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)",
    )
    .persistent(false)
    .bind(entry.run_id)
    .bind(&entry.nfce_url)
    .bind(&entry.market_id)
    .bind(&entry.gtin)
    .bind(&entry.ncm)
    .bind(&entry.original_name)
    .bind(&entry.final_name)
    .bind(&entry.source_used)
    .bind(&entry.discovered_ean)
    .bind(entry.success)
    .bind(entry.execution_time_ms)
    .bind(&entry.error_message)
    .bind(Utc::now())
    .execute(&db.pool)
    .await?;
    Ok(())
}

/// Most recent successful attempt for the same raw text + NCM that discovered
/// a barcode. Both the name and the EAN are reused verbatim.
pub async fn find_reuse(db: &Db, original_name: &str, ncm: &str) -> Result<Option<AuditReuse>> {
    let row = sqlx::query(
        "SELECT final_name, discovered_ean FROM product_lookup_log \
         WHERE original_name=$1 AND ncm=$2 AND success=true \
           AND final_name IS NOT NULL AND discovered_ean IS NOT NULL \
         ORDER BY created_at DESC LIMIT 1",
    )
    .persistent(false)
    .bind(original_name)
    .bind(ncm)
    .fetch_optional(&db.pool)
    .await?;
    Ok(row.map(|r| AuditReuse {
        final_name: r.get("final_name"),
        discovered_ean: r.get("discovered_ean"),
    }))
}
