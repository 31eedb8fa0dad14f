//! Seeding of a game together with one full review.
//!
//! Every step runs on the same transaction: the game and the reference rows it
//! points at (platforms, tags) are upserted, while the review and its pros/cons
//! are append-only. Running the same seed twice therefore updates the game in
//! place and leaves two reviews behind.
use std::collections::BTreeMap;

use anyhow::{Context, Result};
use bigdecimal::{BigDecimal, ToPrimitive};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, PgConnection, QueryBuilder};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::normalization::platform::PlatformFlags;
use crate::util::db::Db;

/// Text stored in a localized jsonb column: either a bare string or a
/// locale map such as `{"en": "...", "de": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LocalizedText {
    Plain(String),
    PerLocale(BTreeMap<String, String>),
}

impl LocalizedText {
    /// Text for `locale`, falling back to English and then to the plain form.
    pub fn get(&self, locale: &str) -> Option<&str> {
        match self {
            Self::Plain(s) => Some(s.as_str()),
            Self::PerLocale(map) => map.get(locale).or_else(|| map.get("en")).map(String::as_str),
        }
    }
}

impl From<&str> for LocalizedText {
    fn from(value: &str) -> Self {
        Self::Plain(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameFields {
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub summary: Option<LocalizedText>,
    #[serde(default)]
    pub developer: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    /// Steam catalog id, unique across games when present.
    #[serde(default)]
    pub steam_appid: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewFields {
    pub title: LocalizedText,
    pub description: LocalizedText,
    pub introduction: LocalizedText,
    pub gameplay_features: LocalizedText,
    pub conclusion: LocalizedText,
    /// Fixed-point score with one decimal place (`numeric(3,1)`).
    pub score: BigDecimal,
    #[serde(default)]
    pub user_opinion: Option<LocalizedText>,
    #[serde(default = "default_published")]
    pub is_published: bool,
}

fn default_published() -> bool {
    true
}

/// Everything needed to seed one game and one review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSeed {
    pub game: GameFields,
    #[serde(default)]
    pub platforms: PlatformFlags,
    /// `None` or an empty list leaves the stored images untouched.
    #[serde(default)]
    pub images: Option<Vec<String>>,
    pub review: ReviewFields,
    #[serde(default)]
    pub pros: Vec<LocalizedText>,
    #[serde(default)]
    pub cons: Vec<LocalizedText>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ReviewSeed {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("invalid review seed document")
    }

    pub fn score_f64(&self) -> Option<f64> {
        self.review.score.to_f64()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProCon {
    Pro,
    Con,
}

impl ProCon {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pro => "pro",
            Self::Con => "con",
        }
    }
}

/// Outcome of a seed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeededReview {
    pub review_id: Uuid,
    pub game_id: Uuid,
    pub platforms_linked: usize,
    pub images_written: usize,
    pub pros_cons_written: usize,
    pub tags_linked: usize,
}

/// Insert the game (upsert by slug) and a new review with its pros, cons,
/// platforms, images and tags. All-or-nothing: any failure rolls back.
#[instrument(skip(db, seed), fields(slug = %seed.game.slug))]
pub async fn insert_full_review(db: &Db, seed: &ReviewSeed) -> Result<SeededReview> {
    let mut tx = db.pool.begin().await.context("begin seed transaction")?;

    let game_id = upsert_game(&mut tx, &seed.game).await?;

    let mut platforms_linked = 0;
    for platform in seed.platforms.enabled() {
        let platform_id = ensure_platform(&mut tx, platform.name()).await?;
        if link_game_platform(&mut tx, game_id, platform_id).await? {
            platforms_linked += 1;
        }
    }

    let images_written = match seed.images.as_deref() {
        Some(urls) if !urls.is_empty() => replace_game_images(&mut tx, game_id, urls).await?,
        _ => 0,
    };

    let review_id = insert_review(&mut tx, game_id, &seed.review).await?;
    let pros_cons_written = insert_pros_cons(&mut tx, review_id, &seed.pros, &seed.cons).await?;

    let mut tags_linked = 0;
    for name in &seed.tags {
        let tag_id = ensure_tag(&mut tx, name).await?;
        if link_review_tag(&mut tx, review_id, tag_id).await? {
            tags_linked += 1;
        }
    }

    tx.commit().await.context("commit seed transaction")?;

    info!(
        %review_id,
        %game_id,
        title = seed.review.title.get("en").unwrap_or_default(),
        "inserted review for game"
    );
    Ok(SeededReview {
        review_id,
        game_id,
        platforms_linked,
        images_written,
        pros_cons_written,
        tags_linked,
    })
}

/// Connect to `database_url` (TLS required unless the DSN says otherwise) and seed.
pub async fn seed_review(database_url: &str, seed: &ReviewSeed) -> Result<SeededReview> {
    let db = Db::connect(database_url).await?;
    let result = insert_full_review(&db, seed).await;
    db.close().await;
    result
}

/// Upsert a game by slug, overwriting its descriptive fields. Returns its id.
pub async fn upsert_game(conn: &mut PgConnection, game: &GameFields) -> Result<Uuid> {
    let id: Uuid = sqlx::query_scalar(
        "INSERT INTO games (slug, title, summary, developer, publisher, steam_appid)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (slug) DO UPDATE
           SET title = EXCLUDED.title,
               summary = EXCLUDED.summary,
               developer = EXCLUDED.developer,
               publisher = EXCLUDED.publisher,
               steam_appid = EXCLUDED.steam_appid,
               updated_at = now()
         RETURNING id",
    )
    .bind(&game.slug)
    .bind(&game.title)
    .bind(game.summary.as_ref().map(Json))
    .bind(game.developer.as_deref())
    .bind(game.publisher.as_deref())
    .bind(game.steam_appid)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("upsert game {}", game.slug))?;
    debug!(slug = %game.slug, %id, "game upserted");
    Ok(id)
}

/// Upsert a platform by name. Returns its id.
pub async fn ensure_platform(conn: &mut PgConnection, name: &str) -> Result<Uuid> {
    sqlx::query_scalar(
        "INSERT INTO platforms (name) VALUES ($1)
         ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
         RETURNING id",
    )
    .bind(name)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("upsert platform {name}"))
}

/// Link a game to a platform. Idempotent: an existing link is left alone and
/// `false` is returned.
pub async fn link_game_platform(
    conn: &mut PgConnection,
    game_id: Uuid,
    platform_id: Uuid,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO game_platforms (game_id, platform_id) VALUES ($1, $2)
         ON CONFLICT DO NOTHING",
    )
    .bind(game_id)
    .bind(platform_id)
    .execute(&mut *conn)
    .await
    .context("link game platform")?;
    Ok(res.rows_affected() > 0)
}

/// Replace the whole image set of a game; `sort_order` follows `urls` from 0.
pub async fn replace_game_images(
    conn: &mut PgConnection,
    game_id: Uuid,
    urls: &[String],
) -> Result<usize> {
    sqlx::query("DELETE FROM game_images WHERE game_id = $1")
        .bind(game_id)
        .execute(&mut *conn)
        .await
        .context("delete game images")?;

    if urls.is_empty() {
        return Ok(0);
    }

    let mut qb: QueryBuilder<'_, sqlx::Postgres> =
        QueryBuilder::new("INSERT INTO game_images (game_id, url, sort_order) ");
    qb.push_values(urls.iter().enumerate(), |mut b, (idx, url)| {
        b.push_bind(game_id)
            .push_bind(url)
            .push_bind(idx as i32);
    });
    let res = qb
        .build()
        .execute(&mut *conn)
        .await
        .context("insert game images")?;
    Ok(res.rows_affected() as usize)
}

/// Append a review to a game. Never an upsert.
pub async fn insert_review(
    conn: &mut PgConnection,
    game_id: Uuid,
    review: &ReviewFields,
) -> Result<Uuid> {
    sqlx::query_scalar(
        "INSERT INTO reviews (
           game_id, title, description, introduction, gameplay_features,
           conclusion, score, user_opinion, is_published
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         RETURNING id",
    )
    .bind(game_id)
    .bind(Json(&review.title))
    .bind(Json(&review.description))
    .bind(Json(&review.introduction))
    .bind(Json(&review.gameplay_features))
    .bind(Json(&review.conclusion))
    .bind(&review.score)
    .bind(review.user_opinion.as_ref().map(Json))
    .bind(review.is_published)
    .fetch_one(&mut *conn)
    .await
    .context("insert review")
}

/// Insert pros then cons for a review, keeping input order.
pub async fn insert_pros_cons(
    conn: &mut PgConnection,
    review_id: Uuid,
    pros: &[LocalizedText],
    cons: &[LocalizedText],
) -> Result<usize> {
    let rows: Vec<(ProCon, &LocalizedText)> = pros
        .iter()
        .map(|t| (ProCon::Pro, t))
        .chain(cons.iter().map(|t| (ProCon::Con, t)))
        .collect();
    if rows.is_empty() {
        return Ok(0);
    }

    let mut qb: QueryBuilder<'_, sqlx::Postgres> =
        QueryBuilder::new("INSERT INTO review_pros_cons (review_id, text, type) ");
    qb.push_values(rows, |mut b, (kind, text)| {
        b.push_bind(review_id)
            .push_bind(Json(text))
            .push_bind(kind.as_str())
            .push_unseparated("::pro_con");
    });
    let res = qb
        .build()
        .execute(&mut *conn)
        .await
        .context("insert review pros/cons")?;
    Ok(res.rows_affected() as usize)
}

/// Upsert a tag by name. Returns its id.
pub async fn ensure_tag(conn: &mut PgConnection, name: &str) -> Result<Uuid> {
    sqlx::query_scalar(
        "INSERT INTO tags (name) VALUES ($1)
         ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
         RETURNING id",
    )
    .bind(name)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("upsert tag {name}"))
}

/// Link a review to a tag. Idempotent: an existing link is left alone and
/// `false` is returned.
pub async fn link_review_tag(conn: &mut PgConnection, review_id: Uuid, tag_id: Uuid) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO review_tags (review_id, tag_id) VALUES ($1, $2)
         ON CONFLICT DO NOTHING",
    )
    .bind(review_id)
    .bind(tag_id)
    .execute(&mut *conn)
    .await
    .context("link review tag")?;
    Ok(res.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const SEED: &str = include_str!("../../fixtures/hollow_knight.json");

    #[test]
    fn bundled_seed_parses() {
        let seed = ReviewSeed::from_json(SEED).unwrap();
        assert_eq!(seed.game.slug, "hollow-knight");
        assert_eq!(seed.review.score, BigDecimal::from_str("9.5").unwrap());
        assert_eq!(seed.score_f64(), Some(9.5));
        assert!(seed.platforms.windows && seed.platforms.mac && !seed.platforms.linux);
        assert_eq!(seed.pros.len(), 3);
        assert_eq!(seed.cons.len(), 2);
        assert_eq!(seed.tags, vec!["Metroidvania", "Indie", "Action", "Exploration"]);
        assert!(seed.review.is_published);
    }

    #[test]
    fn localized_text_accepts_plain_and_locale_map() {
        let plain: LocalizedText = serde_json::from_str(r#""Great""#).unwrap();
        assert_eq!(plain, LocalizedText::from("Great"));
        assert_eq!(plain.get("de"), Some("Great"));

        let map: LocalizedText =
            serde_json::from_str(r#"{"en": "Great", "de": "Toll"}"#).unwrap();
        assert_eq!(map.get("de"), Some("Toll"));
        assert_eq!(map.get("fr"), Some("Great"));
        assert_eq!(
            serde_json::to_value(&map).unwrap(),
            serde_json::json!({"en": "Great", "de": "Toll"})
        );
    }

    #[test]
    fn minimal_seed_uses_defaults() {
        let seed = ReviewSeed::from_json(
            r#"{
                "game": {"slug": "celeste", "title": "Celeste"},
                "review": {
                    "title": "Celeste Review",
                    "description": "Tight platforming.",
                    "introduction": "Climb the mountain.",
                    "gameplay_features": "Dash, climb, assist mode",
                    "conclusion": "Essential.",
                    "score": 9.0
                }
            }"#,
        )
        .unwrap();
        assert!(seed.platforms.enabled().is_empty());
        assert!(seed.images.is_none());
        assert!(seed.pros.is_empty() && seed.cons.is_empty() && seed.tags.is_empty());
        assert!(seed.review.is_published);
        assert!(seed.game.steam_appid.is_none());
    }

    #[test]
    fn pro_con_labels_match_enum_values() {
        assert_eq!(ProCon::Pro.as_str(), "pro");
        assert_eq!(ProCon::Con.as_str(), "con");
    }
}
