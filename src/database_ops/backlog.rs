//! Terminal backlog for lines no source could resolve. Rows wait here for
//! manual curation; the worker never re-attempts them automatically.

use anyhow::Result;
use tracing::info;

use super::db::Db;
use super::models::PurchaseRow;

pub async fn push(db: &Db, line: &PurchaseRow, reason: &str) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO enrichment_backlog \
         (purchase_id, market_id, ean, ncm, product_name, reason, curated, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,false,now()) \
         RETURNING id",
    )
    .persistent(false)
    .bind(line.id)
    .bind(&line.market_id)
    .bind(&line.ean)
    .bind(&line.ncm)
    .bind(&line.product_name)
    .bind(reason)
    .fetch_one(&db.pool)
    .await?;
    info!(
        backlog_id = id,
        purchase_id = line.id,
        name = %line.product_name,
        "line sent to curation backlog"
    );
    Ok(id)
}

pub async fn uncurated_count(db: &Db) -> Result<i64> {
    let n: i64 =
        sqlx::query_scalar("SELECT count(*) FROM enrichment_backlog WHERE curated=false")
            .persistent(false)
            .fetch_one(&db.pool)
            .await?;
    Ok(n)
}
