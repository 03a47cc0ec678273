use anyhow::Result;
use tracing::{info, warn};

use precos_enrich::database_ops::backlog;
use precos_enrich::resolver::LiveSources;
use precos_enrich::util::env as env_util;
use precos_enrich::worker::{self, WorkerConfig};
use precos_enrich::Db;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_util::init_env();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    env_util::preflight_check(
        "enrichment_worker",
        &["COSMOS_TOKENS", "LLM_API_URL", "LLM_API_KEY", "LLM_MODEL"],
        &[
            "SUPABASE_DB_URL",
            "DATABASE_URL",
            "COSMOS_BASE_URL",
            "OFF_BASE_URL",
            "LLM_MODEL",
            "BATCH_SIZE",
            "SLEEP_BETWEEN_BATCHES_SECS",
            "MAX_ENRICH_ATTEMPTS",
        ],
    )?;

    let db_url = env_util::db_url()?;
    let max_conns: u32 = env_util::env_parse("DB_MAX_CONNECTIONS", 5u32);
    let db = Db::connect(&db_url, max_conns).await?;
    db.health_check().await?;

    let before = db.stats_snapshot().await?;
    info!(
        markets = before.markets,
        purchases = before.purchases,
        unique_products = before.unique_products,
        "store snapshot before run"
    );

    let mut sources = LiveSources::from_env()?;
    let cfg = WorkerConfig::from_env();
    let summary = worker::run(&db, &mut sources, &cfg).await?;

    let after = db.stats_snapshot().await?;
    let awaiting_curation = backlog::uncurated_count(&db).await?;
    info!(
        completed = summary.completed,
        backlogged = summary.backlogged,
        failed = summary.failed,
        batches = summary.batches,
        unique_products = after.unique_products,
        awaiting_curation,
        "run summary"
    );
    if summary.rate_limited {
        warn!("run aborted on credential exhaustion; re-run once quotas reset");
    }
    Ok(())
}
