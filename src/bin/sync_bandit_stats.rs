use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use review_jobs::config::SyncConfig;
use review_jobs::database_ops::bandit_stats;
use review_jobs::logging::init_tracing;
use review_jobs::util::env as env_util;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "sync_bandit_stats",
    version,
    about = "Pull hero impression/click counts from Umami into hero_bandit_stats"
)]
struct Cli {
    /// Fetch and prepare rows but do not write them
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    env_util::init_env();
    let _ = init_tracing("info");
    env_util::bootstrap_cli("sync_bandit_stats");

    let config = match SyncConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    config.log_snapshot();

    if let Err(e) = run(&config, cli.dry_run).await {
        error!(error = ?e, "bandit stats sync failed");
        std::process::exit(1);
    }
}

async fn run(config: &SyncConfig, dry_run: bool) -> Result<()> {
    let summary = bandit_stats::sync(config, Utc::now(), dry_run).await?;

    if summary.impressions_degraded || summary.clicks_degraded {
        warn!(
            impressions_degraded = summary.impressions_degraded,
            clicks_degraded = summary.clicks_degraded,
            "analytics server returned totals only for some events"
        );
    }
    info!(
        seen = summary.identifiers_seen,
        unresolved = summary.unresolved.len(),
        prepared = summary.rows_prepared,
        updated = summary.games_updated,
        dry_run = summary.dry_run,
        "done"
    );
    Ok(())
}
