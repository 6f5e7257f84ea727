//! HTTP fetch utilities and the review storage collaborator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use revcol_core::{Platform, Review};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

/// Browser User-Agents rotated per request so the feed host does not see one fixed client.
pub const DEFAULT_USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Edge/120.0.0.0 Safari/537.36",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// `base * 2^(attempt-1)` for the 1-based attempt that just failed, capped at `max_delay`.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub fn pick_user_agent(pool: &[String]) -> Option<&str> {
    if pool.is_empty() {
        return None;
    }
    Some(pool[fastrand::usize(..pool.len())].as_str())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agents: Vec<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agents: DEFAULT_USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
            global_concurrency: 8,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("invalid fetch target: {0}")]
    InvalidTarget(String),
}

impl FetchError {
    /// Everything except a malformed target is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::InvalidTarget(_))
    }
}

/// Single-attempt HTTP GET with a rotated User-Agent; retries belong to the caller.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    user_agents: Vec<String>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            user_agents: config.user_agents,
        })
    }

    pub async fn get_text(&self, url: &str, accept: &str) -> Result<String, FetchError> {
        let _permit = self.global_limit.acquire().await.expect("semaphore not closed");
        let parsed = reqwest::Url::parse(url).map_err(|e| FetchError::InvalidTarget(format!("{url}: {e}")))?;

        let mut request = self
            .client
            .get(parsed)
            .header(ACCEPT, accept)
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9");
        if let Some(agent) = pick_user_agent(&self.user_agents) {
            request = request.header(USER_AGENT, agent);
        }

        async move {
            let resp = request.send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let body = resp.text().await?;
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(body)
        }
        .instrument(info_span!("http_get", url))
        .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Existing,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("unknown app {app_id} ({platform})")]
    UnknownApp { app_id: String, platform: Platform },
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewQuery {
    pub app_id: String,
    pub platform: Platform,
    pub geo_scope: Option<String>,
    pub published_since: Option<DateTime<Utc>>,
}

/// Persistence contract for collected reviews.
///
/// `upsert_review` is keyed by `(source_id, platform, app_id)` and never
/// overwrites an existing row.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn upsert_app(&self, app_id: &str, platform: Platform) -> Result<(), StoreError>;

    async fn upsert_review(&self, review: &Review) -> Result<UpsertOutcome, StoreError>;

    /// Newest first by `published_at`.
    async fn list_reviews(&self, query: &ReviewQuery) -> Result<Vec<Review>, StoreError>;

    /// When the most recently stored matching review was first written.
    async fn latest_stored_at(
        &self,
        app_id: &str,
        platform: Platform,
        geo_scope: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;
}

type ReviewKey = (String, Platform, String);

#[derive(Debug, Clone)]
struct StoredReview {
    review: Review,
    stored_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct InMemoryReviewStore {
    apps: Mutex<HashMap<(String, Platform), DateTime<Utc>>>,
    reviews: Mutex<HashMap<ReviewKey, StoredReview>>,
}

impl InMemoryReviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn review_count(&self) -> usize {
        self.reviews.lock().await.len()
    }
}

fn matches_query(review: &Review, query: &ReviewQuery) -> bool {
    review.source_app == query.app_id
        && review.source_platform == query.platform
        && query
            .geo_scope
            .as_deref()
            .map_or(true, |scope| review.geo_scope.as_deref() == Some(scope))
        && query
            .published_since
            .map_or(true, |since| review.published_at >= since)
}

#[async_trait]
impl ReviewStore for InMemoryReviewStore {
    async fn upsert_app(&self, app_id: &str, platform: Platform) -> Result<(), StoreError> {
        self.apps
            .lock()
            .await
            .insert((app_id.to_string(), platform), Utc::now());
        Ok(())
    }

    async fn upsert_review(&self, review: &Review) -> Result<UpsertOutcome, StoreError> {
        if !self
            .apps
            .lock()
            .await
            .contains_key(&(review.source_app.clone(), review.source_platform))
        {
            return Err(StoreError::UnknownApp {
                app_id: review.source_app.clone(),
                platform: review.source_platform,
            });
        }

        let key = (
            review.source_id.clone(),
            review.source_platform,
            review.source_app.clone(),
        );
        let mut reviews = self.reviews.lock().await;
        if reviews.contains_key(&key) {
            return Ok(UpsertOutcome::Existing);
        }
        reviews.insert(
            key,
            StoredReview {
                review: review.clone(),
                stored_at: Utc::now(),
            },
        );
        Ok(UpsertOutcome::Created)
    }

    async fn list_reviews(&self, query: &ReviewQuery) -> Result<Vec<Review>, StoreError> {
        let reviews = self.reviews.lock().await;
        let mut out = reviews
            .values()
            .filter(|stored| matches_query(&stored.review, query))
            .map(|stored| stored.review.clone())
            .collect::<Vec<_>>();
        out.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        Ok(out)
    }

    async fn latest_stored_at(
        &self,
        app_id: &str,
        platform: Platform,
        geo_scope: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let query = ReviewQuery {
            app_id: app_id.to_string(),
            platform,
            geo_scope: geo_scope.map(ToString::to_string),
            published_since: None,
        };
        Ok(self
            .reviews
            .lock()
            .await
            .values()
            .filter(|stored| matches_query(&stored.review, &query))
            .map(|stored| stored.stored_at)
            .max())
    }
}

#[derive(Debug, Clone)]
pub struct PgReviewStore {
    pool: PgPool,
}

impl PgReviewStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn review_from_row(row: &PgRow) -> Result<Review, StoreError> {
    let platform: String = row.try_get("platform")?;
    let rating: i16 = row.try_get("rating")?;
    Ok(Review {
        source_id: row.try_get("source_id")?,
        content_fingerprint: row.try_get("content_fingerprint")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        rating: u8::try_from(rating).map_err(|_| StoreError::CorruptRow(format!("rating {rating}")))?,
        author: row.try_get("author")?,
        published_at: row.try_get("published_at")?,
        app_version: row.try_get("app_version")?,
        source_app: row.try_get("app_id")?,
        source_platform: platform
            .parse()
            .map_err(|e: revcol_core::UnknownPlatform| StoreError::CorruptRow(e.to_string()))?,
        geo_scope: row.try_get("geo_scope")?,
        country: row.try_get("country")?,
    })
}

#[async_trait]
impl ReviewStore for PgReviewStore {
    async fn upsert_app(&self, app_id: &str, platform: Platform) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO apps (app_id, platform)
            VALUES ($1, $2)
            ON CONFLICT (app_id, platform) DO UPDATE SET updated_at = NOW()
            "#,
        )
        .bind(app_id)
        .bind(platform.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_review(&self, review: &Review) -> Result<UpsertOutcome, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO reviews (
                id, source_id, platform, app_id, content_fingerprint, title, body,
                rating, author, published_at, app_version, geo_scope, country
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (source_id, platform, app_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&review.source_id)
        .bind(review.source_platform.as_str())
        .bind(&review.source_app)
        .bind(&review.content_fingerprint)
        .bind(&review.title)
        .bind(&review.body)
        .bind(i16::from(review.rating))
        .bind(&review.author)
        .bind(review.published_at)
        .bind(&review.app_version)
        .bind(&review.geo_scope)
        .bind(&review.country)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match inserted {
            Some(_) => UpsertOutcome::Created,
            None => UpsertOutcome::Existing,
        })
    }

    async fn list_reviews(&self, query: &ReviewQuery) -> Result<Vec<Review>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT source_id, platform, app_id, content_fingerprint, title, body, rating,
                   author, published_at, app_version, geo_scope, country
              FROM reviews
             WHERE app_id = $1
               AND platform = $2
               AND ($3::text IS NULL OR geo_scope = $3)
               AND ($4::timestamptz IS NULL OR published_at >= $4)
             ORDER BY published_at DESC
            "#,
        )
        .bind(&query.app_id)
        .bind(query.platform.as_str())
        .bind(&query.geo_scope)
        .bind(query.published_since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(review_from_row).collect()
    }

    async fn latest_stored_at(
        &self,
        app_id: &str,
        platform: Platform,
        geo_scope: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT MAX(created_at) AS latest
              FROM reviews
             WHERE app_id = $1
               AND platform = $2
               AND ($3::text IS NULL OR geo_scope = $3)
            "#,
        )
        .bind(app_id)
        .bind(platform.as_str())
        .bind(geo_scope)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("latest")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use revcol_core::content_fingerprint;

    fn review(source_id: &str, body: &str, scope: Option<&str>, day: u32) -> Review {
        Review {
            source_id: source_id.to_string(),
            content_fingerprint: content_fingerprint(body, "Ann", 4),
            title: "t".into(),
            body: body.to_string(),
            rating: 4,
            author: "Ann".into(),
            published_at: Utc.with_ymd_and_hms(2026, 1, day, 0, 0, 0).single().unwrap(),
            app_version: None,
            source_app: "42".into(),
            source_platform: Platform::AppStore,
            geo_scope: scope.map(ToString::to_string),
            country: Some("us".into()),
        }
    }

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_after_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_millis(350));
        assert_eq!(policy.delay_after_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn user_agent_comes_from_pool() {
        let pool = DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        for _ in 0..20 {
            let agent = pick_user_agent(&pool).unwrap();
            assert!(DEFAULT_USER_AGENTS.contains(&agent));
        }
        assert!(pick_user_agent(&[]).is_none());
    }

    #[test]
    fn only_invalid_targets_are_final() {
        assert!(!FetchError::InvalidTarget("x".into()).is_retryable());
        assert!(FetchError::HttpStatus { status: 503, url: "u".into() }.is_retryable());
        assert!(FetchError::Decode("bad xml".into()).is_retryable());
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_without_network() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = http.get_text("not a url", "application/xml").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidTarget(_)));
    }

    #[tokio::test]
    async fn upsert_is_create_if_absent() {
        let store = InMemoryReviewStore::new();
        store.upsert_app("42", Platform::AppStore).await.unwrap();

        let first = review("a", "Solid app", None, 1);
        assert_eq!(store.upsert_review(&first).await.unwrap(), UpsertOutcome::Created);

        let mut changed = first.clone();
        changed.body = "Edited body".into();
        assert_eq!(store.upsert_review(&changed).await.unwrap(), UpsertOutcome::Existing);

        let stored = store
            .list_reviews(&ReviewQuery {
                app_id: "42".into(),
                platform: Platform::AppStore,
                geo_scope: None,
                published_since: None,
            })
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].body, "Solid app");
    }

    #[tokio::test]
    async fn upsert_requires_app() {
        let store = InMemoryReviewStore::new();
        let err = store.upsert_review(&review("a", "x", None, 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownApp { .. }));
    }

    #[tokio::test]
    async fn list_filters_by_scope_and_date() {
        let store = InMemoryReviewStore::new();
        store.upsert_app("42", Platform::AppStore).await.unwrap();
        store.upsert_review(&review("a", "one", Some("major"), 1)).await.unwrap();
        store.upsert_review(&review("b", "two", Some("major"), 20)).await.unwrap();
        store.upsert_review(&review("c", "three", Some("europe"), 25)).await.unwrap();

        let major = store
            .list_reviews(&ReviewQuery {
                app_id: "42".into(),
                platform: Platform::AppStore,
                geo_scope: Some("major".into()),
                published_since: Some(Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).single().unwrap()),
            })
            .await
            .unwrap();
        assert_eq!(major.len(), 1);
        assert_eq!(major[0].source_id, "b");

        assert!(store
            .latest_stored_at("42", Platform::AppStore, Some("europe"))
            .await
            .unwrap()
            .is_some());
        assert!(store
            .latest_stored_at("42", Platform::GooglePlay, None)
            .await
            .unwrap()
            .is_none());
    }
}
