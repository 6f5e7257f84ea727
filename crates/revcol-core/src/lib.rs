//! Core domain model for the review collector: reviews, fingerprints, jobs and stats.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Normalized review text is cut to this many characters before hashing.
pub const FINGERPRINT_TEXT_CHARS: usize = 200;

pub const ANONYMOUS_AUTHOR: &str = "Anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    AppStore,
    GooglePlay,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::AppStore => "appstore",
            Platform::GooglePlay => "googleplay",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown platform `{0}` (expected appstore or googleplay)")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "appstore" => Ok(Platform::AppStore),
            "googleplay" => Ok(Platform::GooglePlay),
            _ => Err(UnknownPlatform(s.to_string())),
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Lowercase, drop punctuation, collapse whitespace, keep the first 200 chars.
pub fn normalize_review_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(FINGERPRINT_TEXT_CHARS)
        .collect()
}

/// Stable dedup key over normalized text, author and rating.
///
/// Cosmetic differences in the text (case, punctuation, spacing, anything past
/// the first 200 normalized characters) map to the same key, so near-duplicate
/// reposts collapse into one review.
pub fn content_fingerprint(text: &str, author: &str, rating: u8) -> String {
    let normalized = normalize_review_text(text);
    sha256_hex(format!("{normalized}_{author}_{rating}").as_bytes())
}

/// Identifier for entries whose provider did not supply one.
pub fn synthesize_source_id(
    app_id: &str,
    body: &str,
    author: &str,
    published: &str,
    rating: u8,
    country: &str,
) -> String {
    let digest = sha256_hex(format!("{app_id}_{body}_{author}_{published}_{rating}_{country}").as_bytes());
    digest[..16].to_string()
}

/// Parsed, not yet validated feed entry handed from a source parser to the fetcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDraft {
    pub source_id: Option<String>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub author: Option<String>,
    pub published: Option<String>,
    pub rating: Option<i64>,
    pub app_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DraftRejection {
    #[error("entry has no title")]
    MissingTitle,
    #[error("entry has no body")]
    MissingBody,
    #[error("entry has no rating")]
    MissingRating,
    #[error("rating {0} is outside 1..=5")]
    RatingOutOfRange(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedDraft {
    pub source_id: Option<String>,
    pub title: String,
    pub body: String,
    pub author: Option<String>,
    pub published: Option<String>,
    pub rating: u8,
    pub app_version: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Accepts a draft only with a title, a body and a rating in 1..=5.
pub fn validate_draft(draft: ReviewDraft) -> Result<ValidatedDraft, DraftRejection> {
    let title = non_empty(draft.title).ok_or(DraftRejection::MissingTitle)?;
    let body = non_empty(draft.body).ok_or(DraftRejection::MissingBody)?;
    let rating = match draft.rating {
        None | Some(0) => return Err(DraftRejection::MissingRating),
        Some(r @ 1..=5) => r as u8,
        Some(other) => return Err(DraftRejection::RatingOutOfRange(other)),
    };
    Ok(ValidatedDraft {
        source_id: non_empty(draft.source_id),
        title,
        body,
        author: non_empty(draft.author),
        published: non_empty(draft.published),
        rating,
        app_version: non_empty(draft.app_version),
    })
}

/// Where and when a review was collected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionContext {
    pub app_id: String,
    pub platform: Platform,
    pub country: String,
    pub geo_scope: Option<String>,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub source_id: String,
    pub content_fingerprint: String,
    pub title: String,
    pub body: String,
    pub rating: u8,
    pub author: String,
    pub published_at: DateTime<Utc>,
    pub app_version: Option<String>,
    pub source_app: String,
    pub source_platform: Platform,
    pub geo_scope: Option<String>,
    pub country: Option<String>,
}

impl Review {
    pub fn from_validated(draft: ValidatedDraft, ctx: &CollectionContext) -> Self {
        let author = draft.author.unwrap_or_else(|| ANONYMOUS_AUTHOR.to_string());
        let published_at = draft
            .published
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(ctx.collected_at);
        let source_id = draft.source_id.unwrap_or_else(|| {
            synthesize_source_id(
                &ctx.app_id,
                &draft.body,
                &author,
                draft.published.as_deref().unwrap_or_default(),
                draft.rating,
                &ctx.country,
            )
        });
        let content_fingerprint = content_fingerprint(&draft.body, &author, draft.rating);
        Self {
            source_id,
            content_fingerprint,
            title: draft.title,
            body: draft.body,
            rating: draft.rating,
            author,
            published_at,
            app_version: draft.app_version,
            source_app: ctx.app_id.clone(),
            source_platform: ctx.platform,
            geo_scope: ctx.geo_scope.clone(),
            country: Some(ctx.country.clone()),
        }
    }
}

/// Output of one country's fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountryResult {
    pub country_code: String,
    pub reviews: Vec<Review>,
    pub errors: Vec<String>,
    pub pages_processed: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryStats {
    pub reviews: usize,
    pub pages: u32,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStats {
    pub total_countries: usize,
    pub successful_countries: usize,
    pub total_reviews_collected: usize,
    pub unique_reviews: usize,
    /// Percentage of raw reviews dropped by global dedup, rounded.
    pub deduplication_rate: u32,
    pub total_errors: usize,
    pub average_rating: f64,
    pub country_breakdown: BTreeMap<String, CountryStats>,
}

pub fn deduplication_rate(raw: usize, unique: usize) -> u32 {
    if raw == 0 {
        return 0;
    }
    let removed = raw.saturating_sub(unique) as f64;
    (removed / raw as f64 * 100.0).round() as u32
}

/// Mean rating rounded to one decimal; zero for an empty set.
pub fn average_rating(reviews: &[Review]) -> f64 {
    if reviews.is_empty() {
        return 0.0;
    }
    let total: u64 = reviews.iter().map(|r| u64::from(r.rating)).sum();
    (total as f64 / reviews.len() as f64 * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Pending and running jobs block a duplicate submission for the same app.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistSummary {
    pub created: usize,
    pub existing: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionJob {
    pub id: String,
    pub app_id: String,
    pub platform: Platform,
    pub status: JobStatus,
    pub progress: u8,
    pub total_countries: usize,
    pub completed_countries: usize,
    pub reviews_collected: usize,
    pub errors: Vec<String>,
    pub geo_scope: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stats: Option<CollectionStats>,
    pub persisted: Option<PersistSummary>,
}
