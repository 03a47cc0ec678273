//! One-shot enrichment worker: drains pending receipt lines in batches,
//! strictly sequentially, until a poll comes back empty. Sequential order is
//! deliberate — it lets registry/audit reuse see products discovered earlier
//! in the same batch, and keeps two lookups from racing over the same rotor
//! credential. A rate-limit signal aborts the whole run: the remaining rows
//! stay pending instead of being misclassified as unmatched.

use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::database_ops::audit::{self, LookupAudit};
use crate::database_ops::backlog;
use crate::database_ops::canonical;
use crate::database_ops::db::Db;
use crate::database_ops::models::{EnrichmentStatus, PurchaseRow};
use crate::resolver::{self, DbIndex, ExternalSources, Resolution, ResolveItem};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: i64,
    pub sleep_between_batches: Duration,
    pub max_attempts: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            sleep_between_batches: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        use crate::util::env::env_parse;
        Self {
            batch_size: env_parse("BATCH_SIZE", 10i64).max(1),
            sleep_between_batches: Duration::from_secs(env_parse(
                "SLEEP_BETWEEN_BATCHES_SECS",
                5u64,
            )),
            max_attempts: env_parse("MAX_ENRICH_ATTEMPTS", 5i32).max(1),
        }
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub run_id: Option<Uuid>,
    pub batches: u32,
    pub completed: u32,
    pub backlogged: u32,
    pub failed: u32,
    /// True when the run stopped because the credential pool was exhausted;
    /// unprocessed rows were left pending.
    pub rate_limited: bool,
}

/// Classification of one failed attempt under the bounded-retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Row stays pollable for a future run.
    Retryable,
    /// Attempt cap reached; the row leaves the polling set for good.
    Terminal,
}

pub fn classify_failure(attempts_after: i32, max_attempts: i32) -> FailureKind {
    if attempts_after >= max_attempts {
        FailureKind::Terminal
    } else {
        FailureKind::Retryable
    }
}

/// Drain the queue. Returns the summary; `Err` only for store-level failures
/// that make further progress meaningless.
#[instrument(skip(db, sources, cfg))]
pub async fn run<E: ExternalSources>(
    db: &Db,
    sources: &mut E,
    cfg: &WorkerConfig,
) -> Result<RunSummary> {
    let run_id = Uuid::new_v4();
    let mut summary = RunSummary {
        run_id: Some(run_id),
        ..Default::default()
    };
    info!(%run_id, batch_size = cfg.batch_size, "enrichment run starting");

    // Monotonic id cursor: a row is visited at most once per run, so a line
    // marked failed-retryable cannot come straight back in the next poll.
    let mut cursor: i64 = 0;

    'run: loop {
        let rows = fetch_pollable(db, cursor, cfg.batch_size).await?;
        if rows.is_empty() {
            info!(%run_id, "queue is empty; enrichment complete");
            break;
        }
        info!(%run_id, batch = summary.batches + 1, items = rows.len(), "processing batch");

        for row in &rows {
            cursor = cursor.max(row.id);
            let started = Instant::now();
            let item = ResolveItem {
                ean: &row.ean,
                product_name: &row.product_name,
                ncm: &row.ncm,
                market_id: &row.market_id,
            };
            let index = DbIndex::new(db);
            match resolver::resolve(&index, sources, &item).await {
                Ok(Resolution::Resolved {
                    name,
                    discovered_ean,
                    source,
                }) => {
                    let ean = discovered_ean
                        .clone()
                        .unwrap_or_else(|| row.ean.clone());
                    canonical::upsert(
                        db,
                        &row.market_id,
                        &ean,
                        &row.ncm,
                        &name,
                        &row.unidade_comercial,
                        row.unit_price,
                        &row.nfce_url,
                    )
                    .await?;
                    mark_completed(db, row.id).await?;
                    log_attempt(
                        db,
                        run_id,
                        row,
                        started,
                        Some(name.as_str()),
                        Some(source.as_str()),
                        discovered_ean.as_deref(),
                        None,
                    )
                    .await;
                    info!(purchase_id = row.id, source = source.as_str(), "line enriched");
                    summary.completed += 1;
                }
                Ok(Resolution::Backlog) => {
                    backlog::push(db, row, "no source could resolve").await?;
                    mark_backlog(db, row.id).await?;
                    log_attempt(db, run_id, row, started, None, None, None, Some("unresolved"))
                        .await;
                    summary.backlogged += 1;
                }
                Ok(Resolution::RateLimited) => {
                    log_attempt(
                        db,
                        run_id,
                        row,
                        started,
                        None,
                        None,
                        None,
                        Some("credential pool exhausted"),
                    )
                    .await;
                    warn!(
                        %run_id,
                        purchase_id = row.id,
                        "credential pool exhausted; aborting run, remaining rows stay pending"
                    );
                    summary.rate_limited = true;
                    break 'run;
                }
                Err(err) => {
                    let attempts = row.enrichment_attempts + 1;
                    let kind = classify_failure(attempts, cfg.max_attempts);
                    let terminal = kind == FailureKind::Terminal;
                    mark_failed(db, row.id, attempts, kind, &err.to_string()).await?;
                    log_attempt(db, run_id, row, started, None, None, None, Some(&err.to_string()))
                        .await;
                    warn!(
                        purchase_id = row.id,
                        attempts,
                        terminal,
                        error = %err,
                        "enrichment attempt failed"
                    );
                    summary.failed += 1;
                }
            }
        }

        summary.batches += 1;
        tokio::time::sleep(cfg.sleep_between_batches).await;
    }

    info!(
        %run_id,
        batches = summary.batches,
        completed = summary.completed,
        backlogged = summary.backlogged,
        failed = summary.failed,
        rate_limited = summary.rate_limited,
        "enrichment run finished"
    );
    Ok(summary)
}

async fn fetch_pollable(db: &Db, after_id: i64, limit: i64) -> Result<Vec<PurchaseRow>> {
    let rows = sqlx::query_as(
        "SELECT * FROM purchases WHERE enriched=false AND id > $1 ORDER BY id ASC LIMIT $2",
    )
    .persistent(false)
    .bind(after_id)
    .bind(limit)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows)
}

async fn mark_completed(db: &Db, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE purchases \
         SET enriched=true, enrichment_status=$2, enrichment_error=NULL \
         WHERE id=$1",
    )
    .persistent(false)
    .bind(id)
    .bind(EnrichmentStatus::Completed.as_str())
    .execute(&db.pool)
    .await?;
    Ok(())
}

async fn mark_backlog(db: &Db, id: i64) -> Result<()> {
    // Backlog is terminal: enriched=true keeps the row out of future polls
    // until someone curates it.
    sqlx::query(
        "UPDATE purchases \
         SET enriched=true, enrichment_status=$2, \
             enrichment_error='all sources exhausted; awaiting curation' \
         WHERE id=$1",
    )
    .persistent(false)
    .bind(id)
    .bind(EnrichmentStatus::Backlog.as_str())
    .execute(&db.pool)
    .await?;
    Ok(())
}

async fn mark_failed(
    db: &Db,
    id: i64,
    attempts: i32,
    kind: FailureKind,
    error: &str,
) -> Result<()> {
    let terminal = kind == FailureKind::Terminal;
    sqlx::query(
        "UPDATE purchases \
         SET enriched=$2, enrichment_status=$3, enrichment_error=$4, \
             enrichment_attempts=$5 \
         WHERE id=$1",
    )
    .persistent(false)
    .bind(id)
    .bind(terminal)
    .bind(EnrichmentStatus::Failed.as_str())
    .bind(error)
    .bind(attempts)
    .execute(&db.pool)
    .await?;
    Ok(())
}

/// Audit append is best-effort: a lost log line must not fail the item.
#[allow(clippy::too_many_arguments)]
async fn log_attempt(
    db: &Db,
    run_id: Uuid,
    row: &PurchaseRow,
    started: Instant,
    final_name: Option<&str>,
    source_used: Option<&str>,
    discovered_ean: Option<&str>,
    error_message: Option<&str>,
) {
    let entry = LookupAudit {
        run_id,
        nfce_url: row.nfce_url.clone(),
        market_id: row.market_id.clone(),
        gtin: row.ean.clone(),
        ncm: row.ncm.clone(),
        original_name: row.product_name.clone(),
        final_name: final_name.map(str::to_string),
        source_used: source_used.map(str::to_string),
        discovered_ean: discovered_ean.map(str::to_string),
        success: final_name.is_some(),
        execution_time_ms: started.elapsed().as_millis() as i64,
        error_message: error_message.map(str::to_string),
    };
    if let Err(err) = audit::append(db, &entry).await {
        error!(purchase_id = row.id, error = %err, "failed to append lookup audit entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_stay_retryable_below_the_cap() {
        assert_eq!(classify_failure(1, 5), FailureKind::Retryable);
        assert_eq!(classify_failure(4, 5), FailureKind::Retryable);
    }

    #[test]
    fn cap_reached_is_terminal() {
        assert_eq!(classify_failure(5, 5), FailureKind::Terminal);
        assert_eq!(classify_failure(7, 5), FailureKind::Terminal);
    }

    #[test]
    fn default_config_matches_contract() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.sleep_between_batches, Duration::from_secs(5));
        assert_eq!(cfg.max_attempts, 5);
    }
}
