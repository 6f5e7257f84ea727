//! Review sources (App Store feed, Google Play bridge) and the per-country fetcher.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use revcol_core::{
    validate_draft, CollectionContext, CountryResult, Platform, Review, ReviewDraft,
};
use revcol_storage::{BackoffPolicy, FetchError, HttpFetcher};
use scraper::Html;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const APPSTORE_FEED_URL: &str =
    "https://itunes.apple.com/{country}/rss/customerreviews/page={page}/id={app_id}/sortby=mostrecent/xml";

/// Google Play bridge page size.
pub const GOOGLEPLAY_BATCH_SIZE: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub app_id: String,
    pub country: String,
    /// 1-based.
    pub page: u32,
    /// Continuation token from the previous page, for cursor-paginated sources.
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedPage {
    pub drafts: Vec<ReviewDraft>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Error)]
pub enum FeedParseError {
    #[error("xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<FeedParseError> for FetchError {
    fn from(value: FeedParseError) -> Self {
        FetchError::Decode(value.to_string())
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{country}: {source}")]
    Fatal {
        country: String,
        #[source]
        source: FetchError,
    },
}

/// One paginated review feed for a platform.
#[async_trait]
pub trait ReviewSource: Send + Sync {
    fn platform(&self) -> Platform;

    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage, FetchError>;
}

fn is_country_code(country: &str) -> bool {
    country.len() == 2 && country.chars().all(|c| c.is_ascii_alphabetic())
}

fn is_app_identifier(app_id: &str) -> bool {
    !app_id.is_empty()
        && app_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
}

fn check_target(request: &PageRequest) -> Result<(), FetchError> {
    if !is_country_code(&request.country) {
        return Err(FetchError::InvalidTarget(format!(
            "country code `{}`",
            request.country
        )));
    }
    if !is_app_identifier(&request.app_id) {
        return Err(FetchError::InvalidTarget(format!("app id `{}`", request.app_id)));
    }
    Ok(())
}

pub struct AppStoreFeedSource {
    http: Arc<HttpFetcher>,
    url_template: String,
}

impl AppStoreFeedSource {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self::with_template(http, APPSTORE_FEED_URL)
    }

    pub fn with_template(http: Arc<HttpFetcher>, url_template: impl Into<String>) -> Self {
        Self {
            http,
            url_template: url_template.into(),
        }
    }

    pub fn feed_url(&self, request: &PageRequest) -> Result<String, FetchError> {
        check_target(request)?;
        Ok(self
            .url_template
            .replace("{country}", &request.country.to_ascii_lowercase())
            .replace("{page}", &request.page.to_string())
            .replace("{app_id}", &request.app_id))
    }
}

#[async_trait]
impl ReviewSource for AppStoreFeedSource {
    fn platform(&self) -> Platform {
        Platform::AppStore
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage, FetchError> {
        let url = self.feed_url(request)?;
        let body = self
            .http
            .get_text(&url, "application/xml,text/xml;q=0.9,*/*;q=0.8")
            .await?;
        Ok(appstore_page_from_body(&body)?)
    }
}

/// The feed carries no end-of-feed marker, so an empty page never ends the
/// country on its own; the fetcher's empty-page streak decides.
pub fn appstore_page_from_body(xml: &str) -> Result<FeedPage, FeedParseError> {
    Ok(FeedPage {
        drafts: parse_appstore_feed(xml)?,
        next_cursor: None,
        has_more: true,
    })
}

#[derive(Debug, Default)]
struct RawEntry {
    id: Option<String>,
    title: Option<String>,
    author: Option<String>,
    updated: Option<String>,
    rating: Option<String>,
    version: Option<String>,
    contents: Vec<(Option<String>, String)>,
}

impl RawEntry {
    fn body(&self) -> Option<String> {
        if let Some((_, text)) = self
            .contents
            .iter()
            .find(|(kind, _)| kind.as_deref() == Some("text"))
        {
            return Some(text.clone());
        }
        self.contents.first().map(|(kind, raw)| match kind.as_deref() {
            Some("html") => strip_html(raw),
            _ => raw.clone(),
        })
    }

    fn into_draft(self) -> ReviewDraft {
        let body = self.body();
        ReviewDraft {
            source_id: self.id,
            title: self.title,
            body,
            author: self.author,
            published: self.updated,
            rating: self.rating.and_then(|r| r.trim().parse::<i64>().ok()),
            app_version: self.version,
        }
    }
}

fn qname(start: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(start.name().as_ref()).into_owned()
}

fn attribute(start: &BytesStart<'_>, key: &str) -> Option<String> {
    start
        .try_get_attribute(key)
        .ok()
        .flatten()
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
}

/// Parses an App Store customer-review Atom feed into drafts.
///
/// The first `<entry>` of every page describes the app itself and is skipped.
pub fn parse_appstore_feed(xml: &str) -> Result<Vec<ReviewDraft>, FeedParseError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<RawEntry> = None;
    let mut path: Vec<String> = Vec::new();
    let mut content_kind: Option<String> = None;
    let mut text = String::new();

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                let name = qname(&start);
                if name == "entry" {
                    current = Some(RawEntry::default());
                    path.clear();
                    continue;
                }
                if current.is_some() {
                    if name == "content" {
                        content_kind = attribute(&start, "type");
                    }
                    path.push(name);
                    text.clear();
                }
            }
            Event::Text(chunk) if current.is_some() => match chunk.unescape() {
                Ok(unescaped) => text.push_str(&unescaped),
                Err(_) => text.push_str(&String::from_utf8_lossy(&chunk)),
            },
            Event::CData(chunk) if current.is_some() => {
                text.push_str(&String::from_utf8_lossy(&chunk.into_inner()));
            }
            Event::End(end) => {
                let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                if name == "entry" {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                    continue;
                }
                let Some(entry) = current.as_mut() else {
                    continue;
                };
                let depth = path.len();
                let parent = depth.checked_sub(2).and_then(|i| path.get(i)).map(String::as_str);
                let value = text.trim().to_string();
                match (name.as_str(), depth, parent) {
                    ("id", 1, _) => entry.id = Some(value),
                    ("title", 1, _) => entry.title = Some(value),
                    ("updated", 1, _) => entry.updated = Some(value),
                    ("im:rating", 1, _) => entry.rating = Some(value),
                    ("im:version", 1, _) => entry.version = Some(value),
                    ("content", 1, _) => entry.contents.push((content_kind.take(), value)),
                    ("name", 2, Some("author")) => entry.author = Some(value),
                    _ => {}
                }
                path.pop();
                text.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(entries.into_iter().skip(1).map(RawEntry::into_draft).collect())
}

/// Text of an HTML review body, dropping the trailing metadata table the feed appends.
pub fn strip_html(fragment: &str) -> String {
    let visible = match fragment.find("<table") {
        Some(idx) => &fragment[..idx],
        None => fragment,
    };
    let html = Html::parse_fragment(visible);
    html.root_element()
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GooglePlayBatch {
    #[serde(default)]
    data: Vec<GooglePlayReview>,
    next_pagination_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GooglePlayReview {
    id: Option<String>,
    user_name: Option<String>,
    score: Option<i64>,
    title: Option<String>,
    text: Option<String>,
    date: Option<String>,
    version: Option<String>,
}

fn fallback_title(text: &str) -> String {
    let mut title: String = text.chars().take(50).collect();
    title.push_str("...");
    title
}

/// Parses one Google Play bridge batch into drafts and the continuation token.
pub fn parse_googleplay_batch(
    json: &str,
) -> Result<(Vec<ReviewDraft>, Option<String>), FeedParseError> {
    let batch: GooglePlayBatch = serde_json::from_str(json)?;
    let drafts = batch
        .data
        .into_iter()
        .map(|review| {
            let text = review.text.filter(|t| !t.trim().is_empty());
            let title = review
                .title
                .filter(|t| !t.trim().is_empty())
                .or_else(|| text.as_deref().map(fallback_title));
            ReviewDraft {
                source_id: review.id,
                title,
                body: text,
                author: review.user_name,
                published: review.date,
                rating: review.score,
                app_version: review.version,
            }
        })
        .collect();
    let next = batch.next_pagination_token.filter(|t| !t.is_empty());
    Ok((drafts, next))
}

/// Google Play reviews through a JSON bridge service exposing `GET {endpoint}/reviews`.
pub struct GooglePlaySource {
    http: Arc<HttpFetcher>,
    endpoint: String,
    lang: String,
}

impl GooglePlaySource {
    pub fn new(http: Arc<HttpFetcher>, endpoint: impl Into<String>, lang: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            lang: lang.into(),
        }
    }

    pub fn reviews_url(&self, request: &PageRequest) -> Result<reqwest::Url, FetchError> {
        check_target(request)?;
        let base = format!("{}/reviews", self.endpoint.trim_end_matches('/'));
        let country = request.country.to_ascii_lowercase();
        let num = GOOGLEPLAY_BATCH_SIZE.to_string();
        let mut params: Vec<(&str, &str)> = vec![
            ("appId", request.app_id.as_str()),
            ("country", country.as_str()),
            ("lang", self.lang.as_str()),
            ("num", num.as_str()),
        ];
        if let Some(token) = request.cursor.as_deref() {
            params.push(("paginationToken", token));
        }
        reqwest::Url::parse_with_params(&base, &params)
            .map_err(|e| FetchError::InvalidTarget(format!("{base}: {e}")))
    }
}

#[async_trait]
impl ReviewSource for GooglePlaySource {
    fn platform(&self) -> Platform {
        Platform::GooglePlay
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage, FetchError> {
        if request.page > 1 && request.cursor.is_none() {
            return Ok(FeedPage::default());
        }
        let url = self.reviews_url(request)?;
        let body = self.http.get_text(url.as_str(), "application/json").await?;
        let (drafts, next_cursor) = parse_googleplay_batch(&body)?;
        let has_more = next_cursor.is_some() && !drafts.is_empty();
        Ok(FeedPage {
            drafts,
            next_cursor,
            has_more,
        })
    }
}

/// Pacing and retry knobs for a country fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSettings {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub backoff: BackoffPolicy,
    /// Consecutive pages without a new review before the country is abandoned.
    pub empty_page_limit: u32,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(3000),
            backoff: BackoffPolicy::default(),
            empty_page_limit: 3,
        }
    }
}

pub fn jittered_delay(min: Duration, max: Duration) -> Duration {
    let lo = min.as_millis() as u64;
    let hi = (max.as_millis() as u64).max(lo);
    Duration::from_millis(fastrand::u64(lo..=hi))
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Drops reviews already seen by source id or content fingerprint.
#[derive(Debug, Default)]
pub struct LocalDedup {
    seen_ids: HashSet<String>,
    seen_fingerprints: HashSet<String>,
}

impl LocalDedup {
    /// Returns true when the review is new and records it.
    pub fn admit(&mut self, review: &Review) -> bool {
        if self.seen_ids.contains(&review.source_id)
            || self.seen_fingerprints.contains(&review.content_fingerprint)
        {
            return false;
        }
        self.seen_ids.insert(review.source_id.clone());
        self.seen_fingerprints.insert(review.content_fingerprint.clone());
        true
    }
}

pub fn dedupe_local(reviews: Vec<Review>) -> Vec<Review> {
    let mut dedup = LocalDedup::default();
    reviews.into_iter().filter(|r| dedup.admit(r)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountryRequest {
    pub app_id: String,
    pub country: String,
    pub max_pages: u32,
    pub max_retries_per_page: u32,
    pub geo_scope: Option<String>,
}

/// Walks one country's pages with pacing, retries and the empty-page early stop.
#[derive(Clone)]
pub struct CountryFetcher {
    source: Arc<dyn ReviewSource>,
    settings: FetchSettings,
}

impl CountryFetcher {
    pub fn new(source: Arc<dyn ReviewSource>, settings: FetchSettings) -> Self {
        Self { source, settings }
    }

    pub fn platform(&self) -> Platform {
        self.source.platform()
    }

    pub async fn fetch_country(&self, request: &CountryRequest) -> Result<CountryResult, AdapterError> {
        info!(country = %request.country, app_id = %request.app_id, max_pages = request.max_pages, "fetching country");
        let ctx = CollectionContext {
            app_id: request.app_id.clone(),
            platform: self.source.platform(),
            country: request.country.clone(),
            geo_scope: request.geo_scope.clone(),
            collected_at: Utc::now(),
        };
        let mut result = CountryResult {
            country_code: request.country.clone(),
            ..CountryResult::default()
        };
        let mut dedup = LocalDedup::default();
        let mut empty_streak = 0u32;
        let mut cursor: Option<String> = None;

        for page in 1..=request.max_pages {
            result.pages_processed = page;
            let page_request = PageRequest {
                app_id: request.app_id.clone(),
                country: request.country.clone(),
                page,
                cursor: cursor.clone(),
            };
            let Some(feed_page) = self
                .fetch_page_with_retries(&page_request, request.max_retries_per_page, &mut result.errors)
                .await?
            else {
                continue;
            };

            let mut accepted = 0usize;
            for draft in feed_page.drafts {
                let Ok(valid) = validate_draft(draft) else {
                    continue;
                };
                let review = Review::from_validated(valid, &ctx);
                if dedup.admit(&review) {
                    result.reviews.push(review);
                    accepted += 1;
                }
            }
            debug!(page, accepted, "page processed");

            if accepted == 0 {
                empty_streak += 1;
                if empty_streak >= self.settings.empty_page_limit {
                    info!(page, "no new reviews for {empty_streak} pages, stopping");
                    break;
                }
            } else {
                empty_streak = 0;
            }
            if !feed_page.has_more {
                break;
            }
            cursor = feed_page.next_cursor;
        }

        info!(
            reviews = result.reviews.len(),
            pages = result.pages_processed,
            errors = result.errors.len(),
            "country finished"
        );
        Ok(result)
    }

    /// `None` once every attempt failed; the last error is appended to `errors`.
    async fn fetch_page_with_retries(
        &self,
        request: &PageRequest,
        max_attempts: u32,
        errors: &mut Vec<String>,
    ) -> Result<Option<FeedPage>, AdapterError> {
        let attempts = max_attempts.max(1);
        for attempt in 1..=attempts {
            pause(jittered_delay(self.settings.min_delay, self.settings.max_delay)).await;
            let span = info_span!("fetch_page", country = %request.country, page = request.page, attempt);
            match self.source.fetch_page(request).instrument(span).await {
                Ok(page) => return Ok(Some(page)),
                Err(err) if !err.is_retryable() => {
                    return Err(AdapterError::Fatal {
                        country: request.country.clone(),
                        source: err,
                    });
                }
                Err(err) => {
                    let message = format!(
                        "error fetching {} page {} (attempt {attempt}): {err}",
                        request.country.to_ascii_uppercase(),
                        request.page
                    );
                    warn!("{message}");
                    if attempt < attempts {
                        pause(self.settings.backoff.delay_after_attempt(attempt)).await;
                    } else {
                        errors.push(message);
                    }
                }
            }
        }
        Ok(None)
    }
}
