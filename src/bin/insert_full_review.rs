use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use review_jobs::config::SeedConfig;
use review_jobs::database_ops::bandit_stats::initialize_bandit_stats;
use review_jobs::database_ops::review_seed::{
    insert_full_review, seed_review, ReviewSeed, SeededReview,
};
use review_jobs::logging::init_tracing;
use review_jobs::util::{db::Db, env as env_util};
use tracing::{error, info};

const BUNDLED_SEED: &str = include_str!("../../fixtures/hollow_knight.json");

#[derive(Parser, Debug)]
#[command(
    name = "insert_full_review",
    version,
    about = "Insert a game and one full review (platforms, images, pros/cons, tags)"
)]
struct Cli {
    /// Review seed JSON document; defaults to the bundled Hollow Knight example
    #[arg(long)]
    file: Option<PathBuf>,
    /// Optional override for the database URL (otherwise DATABASE_URL)
    #[arg(long)]
    db_url: Option<String>,
    /// Also create the game's hero_bandit_stats row if it does not exist yet
    #[arg(long, default_value_t = false)]
    init_bandit: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    env_util::init_env();
    let _ = init_tracing("info");
    env_util::bootstrap_cli("insert_full_review");

    if let Err(e) = run(cli).await {
        error!(error = ?e, "seeding failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let database_url = match cli.db_url {
        Some(url) => url,
        None => SeedConfig::from_env()?.database_url,
    };

    let raw = match &cli.file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("read seed file {}", path.display()))?,
        None => BUNDLED_SEED.to_string(),
    };
    let seed = ReviewSeed::from_json(&raw)?;

    if !cli.init_bandit {
        let seeded = seed_review(&database_url, &seed).await?;
        report(&seeded);
        return Ok(());
    }

    let db = Db::connect(&database_url).await?;
    let outcome = seed_and_init_bandit(&db, &seed).await;
    db.close().await;
    outcome
}

async fn seed_and_init_bandit(db: &Db, seed: &ReviewSeed) -> Result<()> {
    let seeded = insert_full_review(db, seed).await?;
    report(&seeded);

    let mut conn = db.pool.acquire().await.context("acquire connection")?;
    let created = initialize_bandit_stats(&mut conn, seeded.game_id, seed.score_f64()).await?;
    info!(game_id = %seeded.game_id, created, "bandit stats initialized");
    Ok(())
}

fn report(seeded: &SeededReview) {
    println!(
        "Inserted review {} for game {}",
        seeded.review_id, seeded.game_id
    );
    info!(
        platforms_linked = seeded.platforms_linked,
        images = seeded.images_written,
        pros_cons = seeded.pros_cons_written,
        tags_linked = seeded.tags_linked,
        "seed summary"
    );
}
