use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

/// Umami (self-hosted analytics) client used to read hero-carousel events.
///
/// Endpoints:
/// - POST /api/auth/login - exchange username/password for a bearer token
/// - GET /api/websites/:id/event-data/values - counts per event-data value
/// - GET /api/websites/:id/metrics?type=event - totals per event name (no breakdown)
#[derive(Debug, Clone)]
pub struct UmamiProvider {
    base_url: String,
    website_id: String,
    http: Client,
    token: Option<String>,
}

/// Trailing reporting window, sent to Umami as epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn trailing_days(days: i64, end: DateTime<Utc>) -> Self {
        Self {
            start: end - ChronoDuration::days(days),
            end,
        }
    }

    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_ms(&self) -> i64 {
        self.end.timestamp_millis()
    }
}

/// Event counts for one event name.
///
/// `TotalOnly` is the degraded mode used when the server has no event-data
/// endpoint: the aggregate is known but cannot be attributed to games.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventBreakdown {
    PerGame(HashMap<String, i64>),
    TotalOnly { total: i64 },
}

impl EventBreakdown {
    /// Per-game counts, empty for `TotalOnly`.
    pub fn per_game(&self) -> Option<&HashMap<String, i64>> {
        match self {
            Self::PerGame(map) => Some(map),
            Self::TotalOnly { .. } => None,
        }
    }

    pub fn count_for(&self, game: &str) -> i64 {
        self.per_game()
            .and_then(|m| m.get(game).copied())
            .unwrap_or(0)
    }

    pub fn games(&self) -> impl Iterator<Item = &str> {
        self.per_game()
            .into_iter()
            .flat_map(|m| m.keys().map(String::as_str))
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::TotalOnly { .. })
    }

    /// Largest per-game counts first, at most `n` entries.
    pub fn top(&self, n: usize) -> Vec<(&str, i64)> {
        let mut entries: Vec<(&str, i64)> = self
            .per_game()
            .map(|m| m.iter().map(|(k, v)| (k.as_str(), *v)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries.truncate(n);
        entries
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EventValuesResponse {
    List(Vec<EventValue>),
    Paged {
        #[serde(default)]
        data: Vec<EventValue>,
    },
}

#[derive(Debug, Deserialize)]
struct EventValue {
    #[serde(default)]
    value: Value,
    #[serde(default)]
    total: Value,
}

#[derive(Debug, Deserialize)]
struct MetricPoint {
    #[serde(default)]
    x: Option<String>,
    #[serde(default)]
    y: Value,
}

impl UmamiProvider {
    pub fn new(base_url: &str, website_id: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent("review-jobs/bandit-sync")
            .timeout(timeout)
            .build()
            .context("build http client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            website_id: website_id.to_string(),
            http,
            token: None,
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    /// Log in and keep the bearer token for subsequent calls.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        let url = format!("{}/api/auth/login", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "umami authentication failed: HTTP {status}: {}",
                truncate_for_log(body, 200)
            );
        }

        let login: LoginResponse = resp.json().await.context("decode umami login response")?;
        self.token = Some(login.token);
        info!(target = "umami", "authenticated");
        Ok(())
    }

    fn token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| anyhow!("umami client is not authenticated"))
    }

    /// Counts of `event_name` grouped by the event-data property `property_name`.
    ///
    /// Falls back to the totals-only metrics endpoint when the server answers
    /// 404 for event-data values.
    pub async fn event_values(
        &self,
        event_name: &str,
        property_name: &str,
        window: &TimeWindow,
    ) -> Result<EventBreakdown> {
        let url = format!(
            "{}/api/websites/{}/event-data/values",
            self.base_url, self.website_id
        );
        let resp = self
            .http
            .get(&url)
            .bearer_auth(self.token()?)
            .query(&[
                ("startAt", window.start_ms().to_string()),
                ("endAt", window.end_ms().to_string()),
                ("event", event_name.to_string()),
                ("propertyName", property_name.to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        if resp.status() == StatusCode::NOT_FOUND {
            warn!(
                target = "umami",
                event = event_name,
                "event-data/values endpoint not available, using metrics fallback"
            );
            let total = self.event_total(event_name, window).await?;
            warn!(
                target = "umami",
                event = event_name,
                total,
                "total count only, no per-game breakdown available"
            );
            return Ok(EventBreakdown::TotalOnly { total });
        }

        let resp = resp
            .error_for_status()
            .with_context(|| format!("umami event-data values for {event_name}"))?;
        let body: EventValuesResponse = resp
            .json()
            .await
            .with_context(|| format!("decode event-data values for {event_name}"))?;

        let items = match body {
            EventValuesResponse::List(items) => items,
            EventValuesResponse::Paged { data } => data,
        };

        let mut counts = HashMap::new();
        for item in items {
            let Some(key) = value_as_key(&item.value) else {
                continue;
            };
            counts.insert(key, value_as_i64(&item.total).unwrap_or(0));
        }
        debug!(target = "umami", event = event_name, games = counts.len(), "event values");
        Ok(EventBreakdown::PerGame(counts))
    }

    /// Aggregate count for one event name from the metrics endpoint.
    pub async fn event_total(&self, event_name: &str, window: &TimeWindow) -> Result<i64> {
        let url = format!("{}/api/websites/{}/metrics", self.base_url, self.website_id);
        let points: Vec<MetricPoint> = self
            .http
            .get(&url)
            .bearer_auth(self.token()?)
            .query(&[
                ("startAt", window.start_ms().to_string()),
                ("endAt", window.end_ms().to_string()),
                ("type", "event".to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .context("umami metrics")?
            .json()
            .await
            .context("decode umami metrics")?;

        Ok(points
            .iter()
            .find(|p| p.x.as_deref() == Some(event_name))
            .and_then(|p| value_as_i64(&p.y))
            .unwrap_or(0))
    }
}

fn value_as_key(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_as_i64(v: &Value) -> Option<i64> {
    if let Some(n) = v.as_i64() {
        return Some(n);
    }
    if let Some(n) = v.as_f64() {
        return Some(n as i64);
    }
    v.as_str().and_then(|s| s.trim().parse::<i64>().ok())
}
