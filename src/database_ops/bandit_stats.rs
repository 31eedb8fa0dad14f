//! Hero-carousel bandit statistics: Umami event counts joined with review
//! scores and written to `hero_bandit_stats`.
use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, QueryBuilder};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::database_ops::umami::{EventBreakdown, TimeWindow, UmamiProvider};
use crate::normalization::prior::{convert_score_to_prior, BetaPrior};
use crate::util::db::Db;

pub const IMPRESSION_EVENT: &str = "hero_impression";
pub const CLICK_EVENT: &str = "hero_click";

/// How many of the busiest games to print per event.
const TOP_N: usize = 5;

/// One prepared `hero_bandit_stats` row.
#[derive(Debug, Clone, PartialEq)]
pub struct BanditStatRow {
    pub game_id: Uuid,
    pub slug: String,
    pub impressions: i32,
    pub clicks: i32,
    pub prior: BetaPrior,
    pub updated_at: DateTime<Utc>,
}

/// Impression and click breakdowns for one reporting window.
#[derive(Debug, Clone)]
pub struct HeroEvents {
    pub window: TimeWindow,
    pub impressions: EventBreakdown,
    pub clicks: EventBreakdown,
}

impl HeroEvents {
    /// Distinct game identifiers seen in either breakdown, sorted.
    pub fn game_identifiers(&self) -> BTreeSet<String> {
        self.impressions
            .games()
            .chain(self.clicks.games())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSummary {
    pub window: TimeWindow,
    pub impressions_degraded: bool,
    pub clicks_degraded: bool,
    pub identifiers_seen: usize,
    pub unresolved: Vec<String>,
    pub rows_prepared: usize,
    pub games_updated: u64,
    pub dry_run: bool,
}

/// Full sync: log in to Umami, fetch both events for the trailing window,
/// then resolve games and upsert their stats in one transaction.
pub async fn sync(config: &SyncConfig, now: DateTime<Utc>, dry_run: bool) -> Result<SyncSummary> {
    let window = TimeWindow::trailing_days(config.lookback_days, now);
    info!(
        start = %window.start.to_rfc3339(),
        end = %window.end.to_rfc3339(),
        "syncing bandit stats for last {} days",
        config.lookback_days
    );

    let mut umami = UmamiProvider::new(
        &config.umami.base_url,
        &config.umami.website_id,
        config.umami.timeout,
    )?;
    umami
        .authenticate(&config.umami.username, &config.umami.password)
        .await?;

    let events = fetch_hero_events(&umami, config, window).await?;

    let db = Db::connect(&config.database_url).await?;
    let outcome = write_bandit_stats(&db, &events, now, dry_run).await;
    db.close().await;
    outcome
}

/// Fetch impression and click breakdowns and log the busiest games.
pub async fn fetch_hero_events(
    umami: &UmamiProvider,
    config: &SyncConfig,
    window: TimeWindow,
) -> Result<HeroEvents> {
    info!(event = IMPRESSION_EVENT, property = %config.impression_property, "fetching events");
    let impressions = umami
        .event_values(IMPRESSION_EVENT, &config.impression_property, &window)
        .await?;
    log_breakdown(IMPRESSION_EVENT, &impressions);

    info!(event = CLICK_EVENT, property = %config.click_property, "fetching events");
    let clicks = umami
        .event_values(CLICK_EVENT, &config.click_property, &window)
        .await?;
    log_breakdown(CLICK_EVENT, &clicks);

    Ok(HeroEvents {
        window,
        impressions,
        clicks,
    })
}

fn log_breakdown(event: &str, breakdown: &EventBreakdown) {
    match breakdown {
        EventBreakdown::PerGame(counts) => {
            info!(event, games = counts.len(), top = ?breakdown.top(TOP_N), "found events per game");
        }
        EventBreakdown::TotalOnly { total } => {
            warn!(event, total, "no per-game breakdown; event will not contribute counts");
        }
    }
}

/// Resolve identifiers, derive priors and upsert. With `dry_run` the rows are
/// prepared and logged but nothing is written.
#[instrument(skip(db, events))]
pub async fn write_bandit_stats(
    db: &Db,
    events: &HeroEvents,
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<SyncSummary> {
    let identifiers = events.game_identifiers();
    let mut tx = db.pool.begin().await.context("begin bandit stats transaction")?;

    let slugs: Vec<String> = identifiers.iter().cloned().collect();
    let slug_to_id = resolve_game_ids(&mut tx, &slugs).await?;

    let unresolved: Vec<String> = identifiers
        .iter()
        .filter(|s| !slug_to_id.contains_key(*s))
        .cloned()
        .collect();
    for slug in &unresolved {
        warn!(slug = %slug, "game slug not found in database; skipping");
    }

    let ids: Vec<Uuid> = slug_to_id.values().copied().collect();
    let scores = published_scores(&mut tx, &ids).await?;
    let rows = build_stat_rows(events, &slug_to_id, &scores, now);

    let mut games_updated = 0;
    if rows.is_empty() {
        info!("no stats to update");
    } else if dry_run {
        for row in &rows {
            info!(
                slug = %row.slug,
                impressions = row.impressions,
                clicks = row.clicks,
                alpha = row.prior.alpha,
                beta = row.prior.beta,
                "dry run: would upsert"
            );
        }
    } else {
        games_updated = upsert_bandit_stats(&mut tx, &rows).await?;
    }

    if dry_run {
        tx.rollback().await.context("rollback dry run")?;
    } else {
        tx.commit().await.context("commit bandit stats")?;
        info!(games = games_updated, "updated hero_bandit_stats");
    }

    Ok(SyncSummary {
        window: events.window,
        impressions_degraded: events.impressions.is_degraded(),
        clicks_degraded: events.clicks.is_degraded(),
        identifiers_seen: identifiers.len(),
        unresolved,
        rows_prepared: rows.len(),
        games_updated,
        dry_run,
    })
}

/// Join event counts with resolved ids and scores. Games missing from one of
/// the breakdowns get a count of 0; games without a published score get the
/// neutral prior. Rows come out ordered by slug.
pub fn build_stat_rows(
    events: &HeroEvents,
    slug_to_id: &HashMap<String, Uuid>,
    scores: &HashMap<Uuid, f64>,
    now: DateTime<Utc>,
) -> Vec<BanditStatRow> {
    let mut slugs: Vec<&String> = slug_to_id.keys().collect();
    slugs.sort();

    slugs
        .into_iter()
        .map(|slug| {
            let game_id = slug_to_id[slug];
            BanditStatRow {
                game_id,
                slug: slug.clone(),
                impressions: clamp_count(events.impressions.count_for(slug)),
                clicks: clamp_count(events.clicks.count_for(slug)),
                prior: convert_score_to_prior(scores.get(&game_id).copied()),
                updated_at: now,
            }
        })
        .collect()
}

fn clamp_count(n: i64) -> i32 {
    i32::try_from(n.max(0)).unwrap_or(i32::MAX)
}

/// Map game slugs to ids; unknown slugs are simply absent from the result.
pub async fn resolve_game_ids(
    conn: &mut PgConnection,
    slugs: &[String],
) -> Result<HashMap<String, Uuid>> {
    if slugs.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<(String, Uuid)> =
        sqlx::query_as("SELECT slug, id FROM games WHERE slug = ANY($1)")
            .bind(slugs)
            .fetch_all(&mut *conn)
            .await
            .context("resolve game slugs")?;
    Ok(rows.into_iter().collect())
}

/// Score of the most recently published review per game. Games without a
/// published review are absent.
pub async fn published_scores(
    conn: &mut PgConnection,
    game_ids: &[Uuid],
) -> Result<HashMap<Uuid, f64>> {
    if game_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let rows: Vec<(Uuid, Option<f64>)> = sqlx::query_as(
        "SELECT DISTINCT ON (r.game_id) r.game_id, r.score::float8
         FROM reviews r
         WHERE r.is_published = true AND r.game_id = ANY($1)
         ORDER BY r.game_id, r.published_at DESC NULLS LAST, r.created_at DESC NULLS LAST",
    )
    .bind(game_ids)
    .fetch_all(&mut *conn)
    .await
    .context("load published review scores")?;
    Ok(rows
        .into_iter()
        .filter_map(|(id, score)| score.map(|s| (id, s)))
        .collect())
}

/// Multi-row upsert into `hero_bandit_stats`.
///
/// On conflict only the counts and `updated_at` are refreshed; the prior
/// stored when the row was first inserted is kept.
pub async fn upsert_bandit_stats(conn: &mut PgConnection, rows: &[BanditStatRow]) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
        "INSERT INTO hero_bandit_stats (game_id, impressions_10d, clicks_10d, prior_alpha, prior_beta, updated_at) ",
    );
    qb.push_values(rows, |mut b, r| {
        b.push_bind(r.game_id)
            .push_bind(r.impressions)
            .push_bind(r.clicks)
            .push_bind(r.prior.alpha)
            .push_bind(r.prior.beta)
            .push_bind(r.updated_at);
    });
    // TODO: decide with the carousel owners whether prior_alpha/prior_beta
    // should follow score changes on re-sync.
    qb.push(
        " ON CONFLICT (game_id) DO UPDATE SET
            impressions_10d = EXCLUDED.impressions_10d,
            clicks_10d = EXCLUDED.clicks_10d,
            updated_at = EXCLUDED.updated_at",
    );
    let res = qb
        .build()
        .execute(&mut *conn)
        .await
        .context("upsert hero_bandit_stats")?;
    Ok(res.rows_affected())
}

/// Create a zero-count stats row with the score-derived prior. Existing rows
/// are left untouched; returns whether a row was inserted.
pub async fn initialize_bandit_stats(
    conn: &mut PgConnection,
    game_id: Uuid,
    score: Option<f64>,
) -> Result<bool> {
    let prior = convert_score_to_prior(score);
    let res = sqlx::query(
        "INSERT INTO hero_bandit_stats (game_id, impressions_10d, clicks_10d, prior_alpha, prior_beta)
         VALUES ($1, 0, 0, $2, $3)
         ON CONFLICT (game_id) DO NOTHING",
    )
    .bind(game_id)
    .bind(prior.alpha)
    .bind(prior.beta)
    .execute(&mut *conn)
    .await
    .context("initialize hero_bandit_stats")?;
    Ok(res.rows_affected() > 0)
}
