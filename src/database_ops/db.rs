use anyhow::Result;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let use_prepared = crate::util::env::env_flag("USE_PREPARED", false);
        let mut connect_options = PgConnectOptions::from_str(database_url)?;

        // Ensure TLS is enabled when DSN contains sslmode=require
        if database_url.contains("sslmode=require") && !database_url.contains("sslmode=disable") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        if !use_prepared {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await?;
        info!("connected to db");
        Ok(Self { pool })
    }

    /// Cheap liveness probe against the smallest table we own.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, Option<i64>>("SELECT id FROM markets LIMIT 1")
            .persistent(false)
            .fetch_optional(&self.pool)
            .await?;
        Ok(())
    }

    /// Row counts used for worker start/finish log lines.
    #[instrument(skip(self))]
    pub async fn stats_snapshot(&self) -> Result<StoreStats> {
        let markets: i64 = sqlx::query_scalar("SELECT count(*) FROM markets")
            .persistent(false)
            .fetch_one(&self.pool)
            .await?;
        let purchases: i64 = sqlx::query_scalar("SELECT count(*) FROM purchases")
            .persistent(false)
            .fetch_one(&self.pool)
            .await?;
        let unique_products: i64 = sqlx::query_scalar("SELECT count(*) FROM unique_products")
            .persistent(false)
            .fetch_one(&self.pool)
            .await?;
        Ok(StoreStats {
            markets,
            purchases,
            unique_products,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StoreStats {
    pub markets: i64,
    pub purchases: i64,
    pub unique_products: i64,
}
