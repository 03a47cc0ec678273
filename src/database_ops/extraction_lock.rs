//! Cross-process mutual exclusion over the receipt extraction step.
//!
//! The store offers no advisory lock through the pooler, so exclusivity is
//! approximated with an optimistic claim-then-verify protocol over the
//! `processed_urls` table: claim `processing -> extracting` with a conditional
//! update, wait a settle window, then re-scan. Exactly one `extracting` row
//! that is ours means the lock is held; seeing more than one means a race,
//! and the loser reverts itself and backs off with jitter. A periodic sweep
//! reclaims rows left `extracting` by crashed workers.
//!
//! `max_wait` and the settle window run on `Instant`; record staleness is
//! judged against store time so local clock skew cannot mis-reclaim.

use anyhow::Result;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use super::db::Db;
use super::models::{ExtractionStatus, ProcessedUrlRow};

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub stale_after: Duration,
    pub max_wait: Duration,
    pub sweep_interval: Duration,
    pub backoff_base: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            settle_delay: Duration::from_millis(500),
            stale_after: Duration::from_secs(300),
            max_wait: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
            backoff_base: Duration::from_millis(400),
        }
    }
}

impl LockConfig {
    pub fn from_env() -> Self {
        use crate::util::env::env_parse;
        Self {
            poll_interval: Duration::from_secs(env_parse("EXTRACTION_POLL_SECS", 2u64)),
            settle_delay: Duration::from_millis(env_parse("EXTRACTION_SETTLE_MS", 500u64)),
            stale_after: Duration::from_secs(env_parse("EXTRACTION_STALE_SECS", 300u64)),
            max_wait: Duration::from_secs(env_parse("EXTRACTION_MAX_WAIT_SECS", 600u64)),
            sweep_interval: Duration::from_secs(env_parse("EXTRACTION_SWEEP_SECS", 30u64)),
            backoff_base: Duration::from_millis(env_parse("EXTRACTION_BACKOFF_MS", 400u64)),
        }
    }
}

/// What the post-settle re-scan showed about our claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimVerdict {
    /// Exactly one extracting row and it is ours.
    Won,
    /// More than one extracting row: a competing claimant slipped through the
    /// same window. Revert and back off.
    Raced,
    /// Our row is no longer extracting (swept or externally reset).
    Vanished,
}

/// Pure decision over the re-scan result.
pub fn judge_claim(extracting_ids: &[i64], own_id: i64) -> ClaimVerdict {
    match extracting_ids {
        [single] if *single == own_id => ClaimVerdict::Won,
        ids if ids.contains(&own_id) => ClaimVerdict::Raced,
        _ => ClaimVerdict::Vanished,
    }
}

/// Linear backoff with additive jitter, so competing claimants desynchronize.
pub fn backoff_delay<R: Rng>(base: Duration, attempt: u32, rng: &mut R) -> Duration {
    let scaled = base.saturating_mul(attempt.max(1));
    scaled + Duration::from_millis(rng.gen_range(0..250))
}

pub struct ExtractionLock {
    db: Db,
    cfg: LockConfig,
}

impl ExtractionLock {
    pub fn new(db: Db, cfg: LockConfig) -> Self {
        Self { db, cfg }
    }

    pub fn config(&self) -> &LockConfig {
        &self.cfg
    }

    /// Duplicate-receipt guard: an already-processed URL is surfaced so the
    /// caller can refuse re-ingestion instead of scraping twice.
    pub async fn find_processed(&self, nfce_url: &str) -> Result<Option<ProcessedUrlRow>> {
        let row = sqlx::query_as("SELECT * FROM processed_urls WHERE nfce_url=$1")
            .persistent(false)
            .bind(nfce_url)
            .fetch_optional(&self.db.pool)
            .await?;
        Ok(row)
    }

    /// Register a new extraction job in `processing` state.
    pub async fn create_record(&self, nfce_url: &str) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO processed_urls \
             (nfce_url, market_id, products_count, status, processed_at) \
             VALUES ($1, 'PROCESSING', 0, 'processing', now()) \
             RETURNING id",
        )
        .persistent(false)
        .bind(nfce_url)
        .fetch_one(&self.db.pool)
        .await?;
        Ok(id)
    }

    /// Try to become the single `extracting` record. Blocks up to `max_wait`
    /// (config default 600s), polling with jitter. Returns false on timeout
    /// or when the record is not claimable.
    #[instrument(skip(self))]
    pub async fn acquire(&self, record_id: i64, max_wait: Option<Duration>) -> Result<bool> {
        let deadline = Instant::now() + max_wait.unwrap_or(self.cfg.max_wait);
        let mut last_sweep = Instant::now();
        let mut attempt: u32 = 0;

        // Opening sweep so a crashed worker's leftover row cannot starve us
        // for a full sweep period.
        self.sweep_stale().await?;

        loop {
            if Instant::now() >= deadline {
                warn!(record_id, "lock acquisition timed out");
                return Ok(false);
            }
            if last_sweep.elapsed() >= self.cfg.sweep_interval {
                self.sweep_stale().await?;
                last_sweep = Instant::now();
            }

            let holders = self.extracting_ids().await?;
            if holders.is_empty() {
                let claimed = sqlx::query(
                    "UPDATE processed_urls \
                     SET status='extracting', extraction_started_at=now() \
                     WHERE id=$1 AND status='processing'",
                )
                .persistent(false)
                .bind(record_id)
                .execute(&self.db.pool)
                .await?;

                if claimed.rows_affected() == 0 {
                    // Not in `processing` anymore: finished, errored or
                    // claimed by someone re-driving the same record.
                    warn!(record_id, "record not claimable");
                    return Ok(false);
                }

                tokio::time::sleep(self.cfg.settle_delay).await;

                let after_settle = self.extracting_ids().await?;
                match judge_claim(&after_settle, record_id) {
                    ClaimVerdict::Won => {
                        info!(record_id, "extraction lock acquired");
                        return Ok(true);
                    }
                    ClaimVerdict::Raced => {
                        attempt += 1;
                        let delay = {
                            let mut rng = rand::thread_rng();
                            backoff_delay(self.cfg.backoff_base, attempt, &mut rng)
                        };
                        warn!(
                            record_id,
                            holders = after_settle.len(),
                            backoff_ms = delay.as_millis() as u64,
                            "claim race detected; reverting"
                        );
                        self.revert_claim(record_id).await?;
                        tokio::time::sleep(delay).await;
                    }
                    ClaimVerdict::Vanished => {
                        warn!(record_id, "claim vanished during settle window");
                        return Ok(false);
                    }
                }
            } else {
                debug!(record_id, holder = ?holders.first(), "lock busy; waiting");
                let delay = {
                    let mut rng = rand::thread_rng();
                    self.cfg.poll_interval + Duration::from_millis(rng.gen_range(0..250))
                };
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Leave the `extracting` state with a final verdict and bookkeeping.
    #[instrument(skip(self))]
    pub async fn release(
        &self,
        record_id: i64,
        final_status: ExtractionStatus,
        market_id: Option<&str>,
        products_count: Option<i32>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE processed_urls \
             SET status=$2, \
                 market_id=COALESCE($3, market_id), \
                 products_count=COALESCE($4, products_count) \
             WHERE id=$1",
        )
        .persistent(false)
        .bind(record_id)
        .bind(final_status.as_str())
        .bind(market_id)
        .bind(products_count)
        .execute(&self.db.pool)
        .await?;
        info!(record_id, status = final_status.as_str(), "extraction lock released");
        Ok(())
    }

    /// Force-error records stuck in `extracting` beyond the staleness window,
    /// treating them as abandoned by a crashed worker. Returns reclaimed count.
    pub async fn sweep_stale(&self) -> Result<u64> {
        let stale_secs = self.cfg.stale_after.as_secs_f64();
        let swept = sqlx::query(
            "UPDATE processed_urls \
             SET status='error' \
             WHERE status='extracting' \
               AND extraction_started_at IS NOT NULL \
               AND extraction_started_at < now() - ($1 * interval '1 second')",
        )
        .persistent(false)
        .bind(stale_secs)
        .execute(&self.db.pool)
        .await?
        .rows_affected();
        if swept > 0 {
            warn!(swept, "reclaimed stale extracting records");
        }
        Ok(swept)
    }

    async fn extracting_ids(&self) -> Result<Vec<i64>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM processed_urls WHERE status='extracting'")
                .persistent(false)
                .fetch_all(&self.db.pool)
                .await?;
        Ok(ids)
    }

    async fn revert_claim(&self, record_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE processed_urls \
             SET status='processing', extraction_started_at=NULL \
             WHERE id=$1 AND status='extracting'",
        )
        .persistent(false)
        .bind(record_id)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn sole_holder_wins() {
        assert_eq!(judge_claim(&[42], 42), ClaimVerdict::Won);
    }

    #[test]
    fn competing_claims_race_and_exactly_one_survives() {
        // Two records raced into the settle window: each sees both ids and
        // must revert itself, so neither keeps `extracting` unilaterally.
        assert_eq!(judge_claim(&[42, 43], 42), ClaimVerdict::Raced);
        assert_eq!(judge_claim(&[42, 43], 43), ClaimVerdict::Raced);
        // After one reverts, the re-claiming record sees itself alone.
        assert_eq!(judge_claim(&[43], 43), ClaimVerdict::Won);
    }

    #[test]
    fn swept_claim_is_vanished() {
        assert_eq!(judge_claim(&[], 42), ClaimVerdict::Vanished);
        assert_eq!(judge_claim(&[99], 42), ClaimVerdict::Vanished);
    }

    #[test]
    fn backoff_grows_with_attempts_and_stays_bounded() {
        let base = Duration::from_millis(400);
        let mut rng = StdRng::seed_from_u64(1);
        let d1 = backoff_delay(base, 1, &mut rng);
        let d3 = backoff_delay(base, 3, &mut rng);
        assert!(d1 >= base && d1 < base + Duration::from_millis(250));
        assert!(d3 >= base * 3 && d3 < base * 3 + Duration::from_millis(250));
    }

    #[test]
    fn zeroth_attempt_backs_off_at_least_one_base() {
        let base = Duration::from_millis(400);
        let mut rng = StdRng::seed_from_u64(2);
        assert!(backoff_delay(base, 0, &mut rng) >= base);
    }

    #[test]
    fn default_windows_match_contract() {
        let cfg = LockConfig::default();
        assert_eq!(cfg.stale_after, Duration::from_secs(300));
        assert_eq!(cfg.max_wait, Duration::from_secs(600));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(30));
        assert_eq!(cfg.poll_interval, Duration::from_secs(2));
    }
}
