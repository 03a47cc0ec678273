//! All-or-nothing batch persistence of raw receipt lines.
//!
//! The store is reached through a pooler that only gives us single-statement
//! insert/update/select/delete, so instead of a real transaction the writer
//! keeps an explicit undo log for the current call: every inserted id and
//! every canonical pre-image is recorded before the write, and the first
//! failure replays the log backwards before the error is surfaced.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use super::db::Db;
use super::models::{is_usable_ean, RawLineItem, UniqueProductRow};

#[derive(Debug, Error)]
#[error("batch write failed at item {index} of {total}: {cause}")]
pub struct BatchWriteError {
    pub index: usize,
    pub total: usize,
    pub cause: anyhow::Error,
    /// False when the compensating rollback itself hit an error; partial rows
    /// may remain and the log lines carry the ids.
    pub rollback_complete: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveResult {
    pub saved_to_purchases: usize,
    pub created_unique: usize,
    pub updated_unique: usize,
}

/// Undo log scoped to one `write_batch` call. Compensation order matters:
/// ledger rows first, then canonical inserts, then canonical restores.
#[derive(Debug, Default)]
pub struct UndoLog {
    inserted_purchase_ids: Vec<i64>,
    inserted_unique_ids: Vec<i64>,
    updated_unique_backup: Vec<UniqueProductRow>,
}

impl UndoLog {
    pub fn record_purchase_insert(&mut self, id: i64) {
        self.inserted_purchase_ids.push(id);
    }

    pub fn record_unique_insert(&mut self, id: i64) {
        self.inserted_unique_ids.push(id);
    }

    pub fn record_unique_pre_image(&mut self, row: UniqueProductRow) {
        self.updated_unique_backup.push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.inserted_purchase_ids.is_empty()
            && self.inserted_unique_ids.is_empty()
            && self.updated_unique_backup.is_empty()
    }

    pub fn purchase_inserts(&self) -> &[i64] {
        &self.inserted_purchase_ids
    }

    pub fn unique_inserts(&self) -> &[i64] {
        &self.inserted_unique_ids
    }

    pub fn unique_pre_images(&self) -> &[UniqueProductRow] {
        &self.updated_unique_backup
    }

    /// Replay the log: delete inserted rows, restore captured pre-images.
    /// Every step is idempotent (delete/update by id), so a partially applied
    /// rollback can be retried. Returns false when any step failed.
    async fn replay(&self, db: &Db) -> bool {
        let mut clean = true;
        for id in &self.inserted_purchase_ids {
            if let Err(e) = sqlx::query("DELETE FROM purchases WHERE id=$1")
                .persistent(false)
                .bind(id)
                .execute(&db.pool)
                .await
            {
                error!(purchase_id = id, error = %e, "rollback: purchase delete failed");
                clean = false;
            }
        }
        for id in &self.inserted_unique_ids {
            if let Err(e) = sqlx::query("DELETE FROM unique_products WHERE id=$1")
                .persistent(false)
                .bind(id)
                .execute(&db.pool)
                .await
            {
                error!(unique_id = id, error = %e, "rollback: unique_products delete failed");
                clean = false;
            }
        }
        for old in &self.updated_unique_backup {
            let res = sqlx::query(
                "UPDATE unique_products \
                 SET market_id=$2, ean=$3, ncm=$4, product_name=$5, unidade_comercial=$6, \
                     price=$7, nfce_url=$8, last_updated=$9 \
                 WHERE id=$1",
            )
            .persistent(false)
            .bind(old.id)
            .bind(&old.market_id)
            .bind(&old.ean)
            .bind(&old.ncm)
            .bind(&old.product_name)
            .bind(&old.unidade_comercial)
            .bind(old.price)
            .bind(&old.nfce_url)
            .bind(old.last_updated)
            .execute(&db.pool)
            .await;
            if let Err(e) = res {
                error!(unique_id = old.id, error = %e, "rollback: pre-image restore failed");
                clean = false;
            }
        }
        clean
    }
}

/// Persist a full receipt: every line into `purchases` (status pending) and a
/// raw-name seed of `unique_products`. Fails as a unit — the first error rolls
/// back everything this call wrote and surfaces a `BatchWriteError`.
#[instrument(skip(db, items), fields(market_id = %market_id, items = items.len()))]
pub async fn write_batch(
    db: &Db,
    market_id: &str,
    items: &[RawLineItem],
    nfce_url: &str,
    purchase_date: Option<DateTime<Utc>>,
) -> Result<SaveResult, BatchWriteError> {
    let purchase_date = purchase_date.unwrap_or_else(Utc::now);
    let mut undo = UndoLog::default();
    let mut result = SaveResult::default();

    for (idx, item) in items.iter().enumerate() {
        match insert_purchase(db, market_id, item, nfce_url, purchase_date).await {
            Ok(id) => {
                undo.record_purchase_insert(id);
                result.saved_to_purchases += 1;
            }
            Err(cause) => {
                return Err(fail(db, &mut undo, idx, items.len(), cause).await);
            }
        }
    }

    for (idx, item) in items.iter().enumerate() {
        match seed_unique(db, market_id, item, nfce_url, &mut undo).await {
            Ok(true) => result.created_unique += 1,
            Ok(false) => result.updated_unique += 1,
            Err(cause) => {
                return Err(fail(db, &mut undo, idx, items.len(), cause).await);
            }
        }
    }

    info!(
        saved = result.saved_to_purchases,
        created = result.created_unique,
        updated = result.updated_unique,
        "receipt batch committed"
    );
    Ok(result)
}

async fn fail(
    db: &Db,
    undo: &mut UndoLog,
    index: usize,
    total: usize,
    cause: anyhow::Error,
) -> BatchWriteError {
    warn!(
        index,
        purchases = undo.purchase_inserts().len(),
        uniques = undo.unique_inserts().len(),
        restores = undo.unique_pre_images().len(),
        "batch write failed; rolling back"
    );
    let rollback_complete = undo.replay(db).await;
    BatchWriteError {
        index,
        total,
        cause,
        rollback_complete,
    }
}

async fn insert_purchase(
    db: &Db,
    market_id: &str,
    item: &RawLineItem,
    nfce_url: &str,
    purchase_date: DateTime<Utc>,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO purchases \
         (market_id, ncm, ean, product_name, quantity, unidade_comercial, total_price, \
          unit_price, nfce_url, purchase_date, enriched, enrichment_status, enrichment_attempts) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,false,'pending',0) \
         RETURNING id",
    )
    .persistent(false)
    .bind(market_id)
    .bind(&item.ncm)
    .bind(&item.ean)
    .bind(&item.product_name)
    .bind(item.quantity)
    .bind(&item.unidade_comercial)
    .bind(item.total_price)
    .bind(item.unit_price)
    .bind(nfce_url)
    .bind(purchase_date)
    .fetch_one(&db.pool)
    .await?;
    Ok(id)
}

/// Seed the latest-price view with the raw line. Returns true on insert,
/// false on update. Pre-images are captured before any update so a later
/// failure in the same batch can restore them.
async fn seed_unique(
    db: &Db,
    market_id: &str,
    item: &RawLineItem,
    nfce_url: &str,
    undo: &mut UndoLog,
) -> Result<bool> {
    let existing: Option<UniqueProductRow> = if is_usable_ean(&item.ean) {
        sqlx::query_as("SELECT * FROM unique_products WHERE market_id=$1 AND ean=$2")
            .persistent(false)
            .bind(market_id)
            .bind(item.ean.trim())
            .fetch_optional(&db.pool)
            .await?
    } else {
        sqlx::query_as("SELECT * FROM unique_products WHERE market_id=$1 AND product_name=$2")
            .persistent(false)
            .bind(market_id)
            .bind(&item.product_name)
            .fetch_optional(&db.pool)
            .await?
    };

    match existing {
        Some(old) => {
            let old_id = old.id;
            undo.record_unique_pre_image(old);
            let updated = sqlx::query(
                "UPDATE unique_products \
                 SET ncm=$2, ean=$3, product_name=$4, unidade_comercial=$5, price=$6, \
                     nfce_url=$7, last_updated=now() \
                 WHERE id=$1",
            )
            .persistent(false)
            .bind(old_id)
            .bind(&item.ncm)
            .bind(&item.ean)
            .bind(&item.product_name)
            .bind(&item.unidade_comercial)
            .bind(item.unit_price)
            .bind(nfce_url)
            .execute(&db.pool)
            .await?;
            if updated.rows_affected() == 0 {
                return Err(anyhow!("unique_products row {} vanished mid-batch", old_id));
            }
            Ok(false)
        }
        None => {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO unique_products \
                 (market_id, ncm, ean, product_name, unidade_comercial, price, nfce_url, last_updated) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,now()) \
                 RETURNING id",
            )
            .persistent(false)
            .bind(market_id)
            .bind(&item.ncm)
            .bind(&item.ean)
            .bind(&item.product_name)
            .bind(&item.unidade_comercial)
            .bind(item.unit_price)
            .bind(nfce_url)
            .fetch_one(&db.pool)
            .await?;
            undo.record_unique_insert(id);
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pre_image(id: i64) -> UniqueProductRow {
        UniqueProductRow {
            id,
            market_id: "MKT11111111".into(),
            ean: "7891000100103".into(),
            ncm: "04021000".into(),
            product_name: "Leite Condensado Ninho 395g".into(),
            unidade_comercial: "UN".into(),
            price: 7.49,
            nfce_url: "https://nfce.example/abc".into(),
            last_updated: Utc.with_ymd_and_hms(2025, 11, 2, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn undo_log_tracks_every_write_kind_in_order() {
        let mut undo = UndoLog::default();
        assert!(undo.is_empty());

        undo.record_purchase_insert(11);
        undo.record_purchase_insert(12);
        undo.record_unique_insert(31);
        undo.record_unique_pre_image(pre_image(7));

        assert!(!undo.is_empty());
        assert_eq!(undo.purchase_inserts(), &[11, 12]);
        assert_eq!(undo.unique_inserts(), &[31]);
        assert_eq!(undo.unique_pre_images().len(), 1);
        assert_eq!(undo.unique_pre_images()[0].id, 7);
    }

    #[test]
    fn batch_error_reports_failing_index_and_cause() {
        let err = BatchWriteError {
            index: 4,
            total: 10,
            cause: anyhow!("duplicate key"),
            rollback_complete: true,
        };
        let msg = err.to_string();
        assert!(msg.contains("item 4 of 10"));
        assert!(msg.contains("duplicate key"));
    }
}
