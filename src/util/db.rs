use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::util::env::ensure_sslmode_require;

/// Handle to the review site's Postgres database.
///
/// Both jobs are one-writer batch runs, so the pool is capped at a single
/// connection and dropped with the handle at the end of the run.
#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let dsn = ensure_sslmode_require(database_url);
        let mut connect_options =
            PgConnectOptions::from_str(&dsn).context("invalid database URL")?;

        // sqlx reads sslmode from the DSN; pin it explicitly so a rustls build
        // never silently downgrades to prefer.
        if dsn.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        // PgBouncer txn mode safe
        connect_options = connect_options.statement_cache_capacity(0);

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(connect_options)
            .await
            .context("failed to connect to database")?;
        info!("connected to db");
        Ok(Self { pool })
    }

    /// Wrap an existing pool (used by integration tests that prepare their own schema).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
