//! Database behaviour of the seeder, the bandit-stats writer and the full sync.
//!
//! These run against a real Postgres named by `TEST_DATABASE_URL`, each test in
//! its own throwaway schema. Without the variable they return early.
use std::collections::HashMap;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{Duration, TimeZone, Utc};
use review_jobs::config::{SyncConfig, UmamiConfig};
use review_jobs::database_ops::bandit_stats::{
    initialize_bandit_stats, sync, upsert_bandit_stats, write_bandit_stats, BanditStatRow,
    HeroEvents,
};
use review_jobs::database_ops::review_seed::{insert_full_review, LocalizedText, ReviewSeed};
use review_jobs::database_ops::umami::{EventBreakdown, TimeWindow};
use review_jobs::normalization::prior::BetaPrior;
use review_jobs::util::db::Db;
use serde_json::json;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use uuid::Uuid;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SEED: &str = include_str!("../fixtures/hollow_knight.json");

const SCHEMA_SQL: &str = r#"
CREATE TYPE pro_con AS ENUM ('pro', 'con');
CREATE TABLE games (
  id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
  created_at timestamptz DEFAULT now(),
  updated_at timestamptz DEFAULT now(),
  slug text NOT NULL UNIQUE,
  title text NOT NULL,
  summary jsonb,
  developer text,
  publisher text,
  steam_appid integer UNIQUE
);
CREATE TABLE platforms (
  id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
  name text NOT NULL UNIQUE
);
CREATE TABLE game_platforms (
  game_id uuid NOT NULL REFERENCES games(id) ON DELETE CASCADE,
  platform_id uuid NOT NULL REFERENCES platforms(id) ON DELETE CASCADE,
  PRIMARY KEY (game_id, platform_id)
);
CREATE TABLE game_images (
  id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
  game_id uuid NOT NULL REFERENCES games(id) ON DELETE CASCADE,
  url text NOT NULL,
  caption text,
  sort_order integer
);
CREATE TABLE reviews (
  id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
  game_id uuid NOT NULL REFERENCES games(id) ON DELETE CASCADE,
  title jsonb NOT NULL,
  description jsonb NOT NULL,
  introduction jsonb NOT NULL,
  gameplay_features jsonb NOT NULL,
  conclusion jsonb NOT NULL,
  user_opinion jsonb,
  score numeric(3,1) NOT NULL,
  created_at timestamptz DEFAULT now(),
  updated_at timestamptz DEFAULT now(),
  published_at timestamptz DEFAULT now(),
  is_published boolean DEFAULT true
);
CREATE TABLE review_pros_cons (
  id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
  review_id uuid NOT NULL REFERENCES reviews(id) ON DELETE CASCADE,
  text jsonb NOT NULL,
  type pro_con NOT NULL
);
CREATE TABLE tags (
  id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
  name text NOT NULL UNIQUE
);
CREATE TABLE review_tags (
  review_id uuid NOT NULL REFERENCES reviews(id) ON DELETE CASCADE,
  tag_id uuid NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
  PRIMARY KEY (review_id, tag_id)
);
CREATE TABLE hero_bandit_stats (
  game_id uuid PRIMARY KEY REFERENCES games(id) ON DELETE CASCADE,
  impressions_10d integer NOT NULL DEFAULT 0,
  clicks_10d integer NOT NULL DEFAULT 0,
  prior_alpha numeric(5,2) NOT NULL DEFAULT 1.0,
  prior_beta numeric(5,2) NOT NULL DEFAULT 1.0,
  updated_at timestamptz DEFAULT now()
);
"#;

struct TestDb {
    db: Db,
    schema: String,
    admin_url: String,
}

impl TestDb {
    /// DSN that lands in this test's schema when opened through `Db::connect`.
    fn scoped_url(&self) -> String {
        let mut url = self.admin_url.clone();
        let mut sep = if url.contains('?') { '&' } else { '?' };
        if !url.contains("sslmode=") {
            url.push(sep);
            url.push_str("sslmode=disable");
            sep = '&';
        }
        url.push(sep);
        url.push_str(&format!("options=-c%20search_path%3D{}", self.schema));
        url
    }

    async fn drop_schema(self) {
        self.db.close().await;
        if let Ok(pool) = PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.admin_url)
            .await
        {
            let _ = sqlx::raw_sql(&format!("DROP SCHEMA IF EXISTS {} CASCADE", self.schema))
                .execute(&pool)
                .await;
            pool.close().await;
        }
    }
}

async fn test_db() -> Option<TestDb> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let schema = format!("review_jobs_{}", Uuid::new_v4().simple());

    let admin = PgPoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .expect("connect TEST_DATABASE_URL");
    sqlx::raw_sql(&format!("CREATE SCHEMA {schema}"))
        .execute(&admin)
        .await
        .expect("create schema");
    admin.close().await;

    let opts = PgConnectOptions::from_str(&url)
        .expect("parse TEST_DATABASE_URL")
        .options([("search_path", schema.as_str())]);
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await
        .expect("connect with search_path");
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(&pool)
        .await
        .expect("create tables");

    Some(TestDb {
        db: Db::from_pool(pool),
        schema,
        admin_url: url,
    })
}

macro_rules! require_db {
    () => {
        match test_db().await {
            Some(t) => t,
            None => {
                eprintln!("TEST_DATABASE_URL not set; skipping");
                return;
            }
        }
    };
}

async fn count(db: &Db, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(&db.pool).await.unwrap()
}

fn seed() -> ReviewSeed {
    ReviewSeed::from_json(SEED).unwrap()
}

#[tokio::test]
async fn reseeding_same_slug_updates_game_and_appends_review() {
    let t = require_db!();

    let first = insert_full_review(&t.db, &seed()).await.unwrap();

    let mut second_seed = seed();
    second_seed.game.title = "Hollow Knight (Voidheart Edition)".to_string();
    second_seed.game.developer = Some("Team Cherry Pty".to_string());
    let second = insert_full_review(&t.db, &second_seed).await.unwrap();

    assert_eq!(first.game_id, second.game_id);
    assert_ne!(first.review_id, second.review_id);

    assert_eq!(count(&t.db, "SELECT count(*) FROM games").await, 1);
    let (title, developer): (String, Option<String>) =
        sqlx::query_as("SELECT title, developer FROM games WHERE slug = 'hollow-knight'")
            .fetch_one(&t.db.pool)
            .await
            .unwrap();
    assert_eq!(title, "Hollow Knight (Voidheart Edition)");
    assert_eq!(developer.as_deref(), Some("Team Cherry Pty"));

    assert_eq!(count(&t.db, "SELECT count(*) FROM reviews").await, 2);
    assert_eq!(count(&t.db, "SELECT count(*) FROM review_pros_cons").await, 10);

    // Reference rows and links are never duplicated.
    assert_eq!(count(&t.db, "SELECT count(*) FROM platforms").await, 2);
    assert_eq!(count(&t.db, "SELECT count(*) FROM game_platforms").await, 2);
    assert_eq!(count(&t.db, "SELECT count(*) FROM tags").await, 4);
    assert_eq!(count(&t.db, "SELECT count(*) FROM review_tags").await, 8);
    assert_eq!(first.platforms_linked, 2);
    assert_eq!(second.platforms_linked, 0);

    t.drop_schema().await;
}

#[tokio::test]
async fn pros_and_cons_keep_kind_and_text() {
    let t = require_db!();

    let seeded = insert_full_review(&t.db, &seed()).await.unwrap();
    let cons: Vec<serde_json::Value> = sqlx::query_scalar(
        "SELECT text FROM review_pros_cons WHERE review_id = $1 AND type = 'con' ORDER BY text::text",
    )
    .bind(seeded.review_id)
    .fetch_all(&t.db.pool)
    .await
    .unwrap();
    assert_eq!(
        cons,
        vec![
            serde_json::json!("Difficulty spikes in optional content"),
            serde_json::json!("Sparse guidance may frustrate some players"),
        ]
    );

    t.drop_schema().await;
}

#[tokio::test]
async fn supplying_images_replaces_the_whole_set() {
    let t = require_db!();

    let mut s = seed();
    s.images = Some(vec!["https://img/a.jpg".into(), "https://img/b.jpg".into()]);
    let seeded = insert_full_review(&t.db, &s).await.unwrap();
    assert_eq!(seeded.images_written, 2);

    s.images = Some(vec!["https://img/c.jpg".into()]);
    insert_full_review(&t.db, &s).await.unwrap();

    // No list (or an empty one) keeps what is stored.
    s.images = Some(vec![]);
    insert_full_review(&t.db, &s).await.unwrap();
    s.images = None;
    insert_full_review(&t.db, &s).await.unwrap();

    let images: Vec<(String, i32)> =
        sqlx::query_as("SELECT url, sort_order FROM game_images ORDER BY sort_order")
            .fetch_all(&t.db.pool)
            .await
            .unwrap();
    assert_eq!(images, vec![("https://img/c.jpg".to_string(), 0)]);

    t.drop_schema().await;
}

#[tokio::test]
async fn duplicate_tags_in_one_seed_link_once() {
    let t = require_db!();

    let mut s = seed();
    s.tags = vec!["Indie".into(), "Indie".into()];
    let seeded = insert_full_review(&t.db, &s).await.unwrap();

    assert_eq!(seeded.tags_linked, 1);
    assert_eq!(count(&t.db, "SELECT count(*) FROM tags").await, 1);
    assert_eq!(count(&t.db, "SELECT count(*) FROM review_tags").await, 1);

    t.drop_schema().await;
}

#[tokio::test]
async fn failed_seed_leaves_no_partial_rows() {
    let t = require_db!();

    let mut s = seed();
    // Too large for numeric(3,1); fails after the game and platforms were written.
    s.review.score = BigDecimal::from_str("123.4").unwrap();
    s.pros = vec![LocalizedText::from("never stored")];
    assert!(insert_full_review(&t.db, &s).await.is_err());

    assert_eq!(count(&t.db, "SELECT count(*) FROM games").await, 0);
    assert_eq!(count(&t.db, "SELECT count(*) FROM platforms").await, 0);
    assert_eq!(count(&t.db, "SELECT count(*) FROM reviews").await, 0);

    t.drop_schema().await;
}

async fn stored_stats(db: &Db, game_id: Uuid) -> (i32, i32, f64, f64) {
    sqlx::query_as(
        "SELECT impressions_10d, clicks_10d, prior_alpha::float8, prior_beta::float8
         FROM hero_bandit_stats WHERE game_id = $1",
    )
    .bind(game_id)
    .fetch_one(&db.pool)
    .await
    .unwrap()
}

#[tokio::test]
async fn resync_updates_counts_but_keeps_stored_prior() {
    let t = require_db!();
    let seeded = insert_full_review(&t.db, &seed()).await.unwrap();
    let now = Utc.with_ymd_and_hms(2024, 5, 11, 6, 0, 0).unwrap();

    let row = |impressions, clicks, prior, at| BanditStatRow {
        game_id: seeded.game_id,
        slug: "hollow-knight".into(),
        impressions,
        clicks,
        prior,
        updated_at: at,
    };

    let mut conn = t.db.pool.acquire().await.unwrap();
    let first = BetaPrior {
        alpha: 1.45,
        beta: 0.55,
    };
    assert_eq!(
        upsert_bandit_stats(&mut conn, &[row(100, 7, first, now)])
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        upsert_bandit_stats(
            &mut conn,
            &[row(250, 20, BetaPrior::NEUTRAL, now + Duration::days(1))]
        )
        .await
        .unwrap(),
        1
    );
    drop(conn);

    let (impressions, clicks, alpha, beta) = stored_stats(&t.db, seeded.game_id).await;
    assert_eq!((impressions, clicks), (250, 20));
    assert!((alpha - 1.45).abs() < 1e-9);
    assert!((beta - 0.55).abs() < 1e-9);

    t.drop_schema().await;
}

#[tokio::test]
async fn write_skips_unknown_slugs_and_uses_review_score() {
    let t = require_db!();
    let seeded = insert_full_review(&t.db, &seed()).await.unwrap();
    let now = Utc.with_ymd_and_hms(2024, 5, 11, 6, 0, 0).unwrap();

    let impressions: HashMap<String, i64> = [
        ("hollow-knight".to_string(), 40),
        ("not-a-game".to_string(), 12),
    ]
    .into_iter()
    .collect();
    let events = HeroEvents {
        window: TimeWindow::trailing_days(10, now),
        impressions: EventBreakdown::PerGame(impressions),
        clicks: EventBreakdown::TotalOnly { total: 3 },
    };

    let summary = write_bandit_stats(&t.db, &events, now, false).await.unwrap();
    assert_eq!(summary.identifiers_seen, 2);
    assert_eq!(summary.unresolved, vec!["not-a-game".to_string()]);
    assert_eq!(summary.games_updated, 1);
    assert!(summary.clicks_degraded);

    let (impressions, clicks, alpha, beta) = stored_stats(&t.db, seeded.game_id).await;
    assert_eq!((impressions, clicks), (40, 0));
    assert!((alpha - 1.45).abs() < 1e-9);
    assert!((beta - 0.55).abs() < 1e-9);

    t.drop_schema().await;
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let t = require_db!();
    insert_full_review(&t.db, &seed()).await.unwrap();
    let now = Utc::now();

    let events = HeroEvents {
        window: TimeWindow::trailing_days(10, now),
        impressions: EventBreakdown::PerGame([("hollow-knight".to_string(), 5)].into()),
        clicks: EventBreakdown::PerGame(HashMap::new()),
    };
    let summary = write_bandit_stats(&t.db, &events, now, true).await.unwrap();
    assert_eq!(summary.rows_prepared, 1);
    assert_eq!(summary.games_updated, 0);
    assert_eq!(count(&t.db, "SELECT count(*) FROM hero_bandit_stats").await, 0);

    t.drop_schema().await;
}

#[tokio::test]
async fn initialize_only_creates_missing_rows() {
    let t = require_db!();
    let seeded = insert_full_review(&t.db, &seed()).await.unwrap();

    let mut conn = t.db.pool.acquire().await.unwrap();
    assert!(initialize_bandit_stats(&mut conn, seeded.game_id, Some(0.0))
        .await
        .unwrap());
    assert!(!initialize_bandit_stats(&mut conn, seeded.game_id, Some(10.0))
        .await
        .unwrap());
    drop(conn);

    let (impressions, clicks, alpha, beta) = stored_stats(&t.db, seeded.game_id).await;
    assert_eq!((impressions, clicks), (0, 0));
    assert!((alpha - 0.5).abs() < 1e-9);
    assert!((beta - 1.5).abs() < 1e-9);

    t.drop_schema().await;
}

async fn mount_umami(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok"})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/websites/site-1/event-data/values"))
        .and(query_param("event", "hero_impression"))
        .and(query_param("propertyName", "game_id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"value": "hollow-knight", "total": 40},
            {"value": "not-a-game", "total": 12}
        ])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/websites/site-1/event-data/values"))
        .and(query_param("event", "hero_click"))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/websites/site-1/metrics"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"x": "hero_click", "y": 3}])),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn full_sync_writes_stats_and_keeps_prior_on_rerun() {
    let t = require_db!();
    let seeded = insert_full_review(&t.db, &seed()).await.unwrap();

    let server = MockServer::start().await;
    mount_umami(&server).await;

    let config = SyncConfig {
        database_url: t.scoped_url(),
        umami: UmamiConfig {
            base_url: server.uri(),
            username: "admin".into(),
            password: "secret".into(),
            website_id: "site-1".into(),
            timeout: std::time::Duration::from_secs(5),
        },
        impression_property: "game_id".into(),
        click_property: "game".into(),
        lookback_days: 10,
    };

    let first = sync(&config, Utc::now(), false).await.unwrap();
    assert_eq!(first.identifiers_seen, 2);
    assert_eq!(first.unresolved, vec!["not-a-game".to_string()]);
    assert!(!first.impressions_degraded);
    assert!(first.clicks_degraded);
    assert_eq!(first.games_updated, 1);

    // A newer, much lower score must not move the stored prior.
    let mut lower = seed();
    lower.review.score = BigDecimal::from_str("2.0").unwrap();
    insert_full_review(&t.db, &lower).await.unwrap();

    let second = sync(&config, Utc::now(), false).await.unwrap();
    assert_eq!(second.games_updated, 1);

    assert_eq!(count(&t.db, "SELECT count(*) FROM hero_bandit_stats").await, 1);
    let (impressions, clicks, alpha, beta) = stored_stats(&t.db, seeded.game_id).await;
    assert_eq!((impressions, clicks), (40, 0));
    assert!((alpha - 1.45).abs() < 1e-9);
    assert!((beta - 0.55).abs() < 1e-9);

    t.drop_schema().await;
}
