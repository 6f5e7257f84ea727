//! Collection engine: configuration, region profiles, batch scheduling, dedup,
//! the corpus read side and exports. Job lifecycle lives in [`jobs`].

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use revcol_adapters::{
    AppStoreFeedSource, CountryFetcher, CountryRequest, FetchSettings, GooglePlaySource, ReviewSource,
};
use revcol_core::{
    average_rating, deduplication_rate, CollectionJob, CollectionStats, CountryStats, Platform, Review,
};
use revcol_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, InMemoryReviewStore, PgReviewStore, ReviewQuery,
    ReviewStore, StoreError,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

mod jobs;
#[cfg(test)]
mod test_support;

pub use jobs::{build_sweep_scheduler, strategy_for_scope, CollectionRequest, JobManager, StartedJob, Strategy};

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("{0}")]
    Validation(String),
    #[error("collection job {0} not found")]
    NotFound(String),
    #[error("collection job {0} cannot be changed in its current state")]
    NotCancellable(String),
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_millis(name: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(name, default_ms))
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub batch_delay: Duration,
    pub error_backoff: Duration,
    pub max_backoff: Duration,
    pub countries_per_batch: usize,
    pub max_pages_per_country: u32,
    pub incremental_max_pages: u32,
    pub max_retries_per_page: u32,
    pub http_timeout: Duration,
    pub job_retention: Duration,
    pub sweep_cron: String,
    pub cache_max_age: Duration,
    pub appstore_feed_url: String,
    pub googleplay_endpoint: Option<String>,
    pub googleplay_lang: String,
    pub reports_dir: Option<PathBuf>,
    pub workspace_root: PathBuf,
    pub database_url: Option<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(3000),
            batch_delay: Duration::from_millis(5000),
            error_backoff: Duration::from_millis(10_000),
            max_backoff: Duration::from_millis(60_000),
            countries_per_batch: 2,
            max_pages_per_country: 20,
            incremental_max_pages: 5,
            max_retries_per_page: 3,
            http_timeout: Duration::from_secs(15),
            job_retention: Duration::from_secs(24 * 60 * 60),
            sweep_cron: "0 0 * * * *".to_string(),
            cache_max_age: Duration::from_secs(120 * 60),
            appstore_feed_url: revcol_adapters::APPSTORE_FEED_URL.to_string(),
            googleplay_endpoint: None,
            googleplay_lang: "en".to_string(),
            reports_dir: None,
            workspace_root: PathBuf::from("."),
            database_url: None,
        }
    }
}

impl CollectorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            min_delay: env_millis("REVCOL_MIN_DELAY_MS", 1000),
            max_delay: env_millis("REVCOL_MAX_DELAY_MS", 3000),
            batch_delay: env_millis("REVCOL_BATCH_DELAY_MS", 5000),
            error_backoff: env_millis("REVCOL_ERROR_BACKOFF_MS", 10_000),
            max_backoff: env_millis("REVCOL_MAX_BACKOFF_MS", 60_000),
            countries_per_batch: env_parse("REVCOL_COUNTRIES_PER_BATCH", defaults.countries_per_batch),
            max_pages_per_country: env_parse("REVCOL_MAX_PAGES_PER_COUNTRY", defaults.max_pages_per_country),
            incremental_max_pages: env_parse("REVCOL_INCREMENTAL_MAX_PAGES", defaults.incremental_max_pages),
            max_retries_per_page: env_parse("REVCOL_MAX_RETRIES_PER_PAGE", defaults.max_retries_per_page),
            http_timeout: Duration::from_secs(env_parse("REVCOL_HTTP_TIMEOUT_SECS", 15)),
            job_retention: Duration::from_secs(env_parse("REVCOL_JOB_RETENTION_HOURS", 24u64) * 60 * 60),
            sweep_cron: std::env::var("REVCOL_SWEEP_CRON").unwrap_or(defaults.sweep_cron),
            cache_max_age: Duration::from_secs(env_parse("REVCOL_CACHE_MAX_AGE_MINS", 120u64) * 60),
            appstore_feed_url: std::env::var("REVCOL_APPSTORE_FEED_URL")
                .unwrap_or(defaults.appstore_feed_url),
            googleplay_endpoint: env_non_empty("REVCOL_GOOGLEPLAY_ENDPOINT"),
            googleplay_lang: std::env::var("REVCOL_GOOGLEPLAY_LANG").unwrap_or(defaults.googleplay_lang),
            reports_dir: env_non_empty("REVCOL_REPORTS_DIR").map(PathBuf::from),
            workspace_root: std::env::var("REVCOL_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            database_url: env_non_empty("DATABASE_URL"),
        }
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            min_delay: self.min_delay,
            max_delay: self.max_delay,
            backoff: BackoffPolicy {
                base_delay: self.error_backoff,
                max_delay: self.max_backoff,
            },
            ..FetchSettings::default()
        }
    }

    pub fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            countries_per_batch: self.countries_per_batch,
            batch_delay: self.batch_delay,
            max_retries_per_page: self.max_retries_per_page,
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            ..HttpClientConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RegionsFile {
    regions: BTreeMap<String, Vec<String>>,
}

/// Named country lists usable as a geo scope or inside a targeted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionRegistry {
    profiles: BTreeMap<String, Vec<String>>,
}

fn is_country_code(entry: &str) -> bool {
    entry.len() == 2 && entry.chars().all(|c| c.is_ascii_alphabetic())
}

impl RegionRegistry {
    pub fn builtin() -> Self {
        let profile = |codes: &[&str]| codes.iter().map(|c| c.to_string()).collect::<Vec<_>>();
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "all".to_string(),
            profile(&[
                "us", "gb", "de", "fr", "jp", "au", "ca", "ru", "br", "in", "kr", "it", "es", "mx", "cn",
            ]),
        );
        profiles.insert("major".to_string(), profile(&["ru", "us", "gb", "de", "fr", "jp"]));
        profiles.insert("incremental".to_string(), profile(&["us", "gb", "de", "fr"]));
        profiles.insert("americas".to_string(), profile(&["us", "ca", "br", "mx"]));
        profiles.insert("europe".to_string(), profile(&["gb", "de", "fr", "it", "es", "ru"]));
        profiles.insert("asia".to_string(), profile(&["jp", "kr", "cn", "in"]));
        profiles.insert("english".to_string(), profile(&["us", "gb", "au", "ca"]));
        Self { profiles }
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let file: RegionsFile = serde_yaml::from_str(raw).context("parsing regions.yaml")?;
        let profiles = file
            .regions
            .into_iter()
            .map(|(name, codes)| {
                let codes = codes.into_iter().map(|c| c.trim().to_ascii_lowercase()).collect();
                (name.trim().to_ascii_lowercase(), codes)
            })
            .collect();
        Ok(Self { profiles })
    }

    /// `regions.yaml` under `root`, or the built-in profiles when the file is absent.
    pub fn load_or_builtin(root: &Path) -> Result<Self> {
        let path = root.join("regions.yaml");
        if !path.exists() {
            return Ok(Self::builtin());
        }
        let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    pub fn profile(&self, name: &str) -> Option<&[String]> {
        self.profiles.get(name).map(Vec::as_slice)
    }

    /// Expands country codes and profile names into an ordered, duplicate-free country list.
    pub fn expand(&self, entries: &[String]) -> Result<Vec<String>, CollectionError> {
        let mut seen = HashSet::new();
        let mut countries = Vec::new();
        for raw in entries {
            let entry = raw.trim().to_ascii_lowercase();
            let codes: Vec<String> = if let Some(codes) = self.profile(&entry) {
                codes.to_vec()
            } else if is_country_code(&entry) {
                vec![entry]
            } else {
                return Err(CollectionError::Validation(format!(
                    "unknown country or region `{}`",
                    raw.trim()
                )));
            };
            for code in codes {
                if seen.insert(code.clone()) {
                    countries.push(code);
                }
            }
        }
        if countries.is_empty() {
            return Err(CollectionError::Validation(
                "at least one country or region is required".to_string(),
            ));
        }
        Ok(countries)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub countries_per_batch: usize,
    pub batch_delay: Duration,
    pub max_retries_per_page: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectPlan {
    pub app_id: String,
    pub countries: Vec<String>,
    pub max_pages: u32,
    pub geo_scope: Option<String>,
}

/// Emitted once per finished country, in completion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountryProgress {
    pub country: String,
    pub reviews: usize,
    pub completed: usize,
    pub total: usize,
    pub percent: u8,
}

#[derive(Debug, Clone, Default)]
pub struct CollectOutcome {
    /// Raw reviews, still carrying cross-country duplicates.
    pub reviews: Vec<Review>,
    pub errors: Vec<String>,
    pub country_stats: BTreeMap<String, CountryStats>,
    pub processed_countries: usize,
    pub successful_countries: usize,
    /// A halt signal stopped the run before every batch was started.
    pub halted: bool,
}

fn percent_complete(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done as f64 / total as f64) * 100.0).round().min(100.0) as u8
}

/// Runs country fetches in fixed-size concurrent batches with a pause between batches.
#[derive(Clone)]
pub struct BatchScheduler {
    fetcher: CountryFetcher,
    settings: BatchSettings,
}

impl BatchScheduler {
    pub fn new(fetcher: CountryFetcher, settings: BatchSettings) -> Self {
        Self { fetcher, settings }
    }

    pub async fn collect(
        &self,
        plan: &CollectPlan,
        progress: Option<&mpsc::UnboundedSender<CountryProgress>>,
        halt: Option<&watch::Receiver<bool>>,
    ) -> Result<CollectOutcome, CollectionError> {
        if plan.countries.is_empty() {
            return Err(CollectionError::Failed("no countries to collect".to_string()));
        }
        let batch_size = self.settings.countries_per_batch.max(1);
        let total = plan.countries.len();
        let batches: Vec<&[String]> = plan.countries.chunks(batch_size).collect();
        let mut outcome = CollectOutcome::default();

        for (index, batch) in batches.iter().enumerate() {
            if halt.is_some_and(|rx| *rx.borrow()) {
                info!(processed = outcome.processed_countries, total, "halt requested, not starting next batch");
                outcome.halted = true;
                break;
            }
            info!(
                batch = index + 1,
                batches = batches.len(),
                countries = %batch.join(",").to_ascii_uppercase(),
                "starting batch"
            );

            let handles: Vec<_> = batch
                .iter()
                .map(|country| {
                    let fetcher = self.fetcher.clone();
                    let request = CountryRequest {
                        app_id: plan.app_id.clone(),
                        country: country.clone(),
                        max_pages: plan.max_pages,
                        max_retries_per_page: self.settings.max_retries_per_page,
                        geo_scope: plan.geo_scope.clone(),
                    };
                    (country.clone(), tokio::spawn(async move { fetcher.fetch_country(&request).await }))
                })
                .collect();

            for (country, handle) in handles {
                let failure = match handle.await {
                    Ok(Ok(result)) => {
                        outcome.successful_countries += 1;
                        outcome.country_stats.insert(
                            country.clone(),
                            CountryStats {
                                reviews: result.reviews.len(),
                                pages: result.pages_processed,
                                errors: result.errors.len(),
                            },
                        );
                        outcome.errors.extend(result.errors);
                        outcome.reviews.extend(result.reviews);
                        None
                    }
                    Ok(Err(err)) => Some(err.to_string()),
                    Err(join_err) => Some(join_err.to_string()),
                };
                if let Some(reason) = failure {
                    let message = format!("failed to process {}: {reason}", country.to_ascii_uppercase());
                    warn!(country = %country, "{message}");
                    outcome.errors.push(message);
                    outcome.country_stats.insert(
                        country.clone(),
                        CountryStats {
                            reviews: 0,
                            pages: 0,
                            errors: 1,
                        },
                    );
                }

                outcome.processed_countries += 1;
                if let Some(tx) = progress {
                    let reviews = outcome.country_stats.get(&country).map_or(0, |s| s.reviews);
                    // The receiver going away only means nobody is watching.
                    let _ = tx.send(CountryProgress {
                        country,
                        reviews,
                        completed: outcome.processed_countries,
                        total,
                        percent: percent_complete(outcome.processed_countries, total),
                    });
                }
            }

            if index + 1 < batches.len() && !self.settings.batch_delay.is_zero() {
                inter_batch_pause(self.settings.batch_delay, halt).await;
            }
        }

        Ok(outcome)
    }
}

/// Sleeps between batches but wakes as soon as a halt is raised.
async fn inter_batch_pause(delay: Duration, halt: Option<&watch::Receiver<bool>>) {
    let Some(rx) = halt else {
        tokio::time::sleep(delay).await;
        return;
    };
    let mut rx = rx.clone();
    let halted = async move {
        if rx.wait_for(|halted| *halted).await.is_err() {
            // sender gone: nothing can raise the halt any more
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = halted => {}
    }
}

/// Cross-country dedup: the first review seen for a fingerprint wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct DedupEngine;

impl DedupEngine {
    pub fn dedupe(&self, reviews: Vec<Review>) -> Vec<Review> {
        let mut seen = HashSet::new();
        reviews
            .into_iter()
            .filter(|review| seen.insert(review.content_fingerprint.clone()))
            .collect()
    }
}

pub fn build_stats(total_countries: usize, outcome: &CollectOutcome, unique: &[Review]) -> CollectionStats {
    CollectionStats {
        total_countries,
        successful_countries: outcome.successful_countries,
        total_reviews_collected: outcome.reviews.len(),
        unique_reviews: unique.len(),
        deduplication_rate: deduplication_rate(outcome.reviews.len(), unique.len()),
        total_errors: outcome.errors.len(),
        average_rating: average_rating(unique),
        country_breakdown: outcome.country_stats.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DateFilter {
    #[default]
    #[serde(rename = "all")]
    All,
    #[serde(rename = "7days")]
    Last7Days,
    #[serde(rename = "30days")]
    Last30Days,
    #[serde(rename = "90days")]
    Last90Days,
}

impl DateFilter {
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let days = match self {
            DateFilter::All => return None,
            DateFilter::Last7Days => 7,
            DateFilter::Last30Days => 30,
            DateFilter::Last90Days => 90,
        };
        Some(now - chrono::Duration::days(days))
    }
}

impl FromStr for DateFilter {
    type Err = CollectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "all" => Ok(DateFilter::All),
            "7days" => Ok(DateFilter::Last7Days),
            "30days" => Ok(DateFilter::Last30Days),
            "90days" => Ok(DateFilter::Last90Days),
            other => Err(CollectionError::Validation(format!(
                "unknown date filter `{other}` (expected all, 7days, 30days or 90days)"
            ))),
        }
    }
}

/// A stored corpus is fresh while its newest review is younger than `max_age`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub max_age: Duration,
}

impl FreshnessPolicy {
    pub fn is_fresh(&self, latest_stored_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(latest) = latest_stored_at else {
            return false;
        };
        let max_age = chrono::Duration::from_std(self.max_age).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        now.signed_duration_since(latest) < max_age
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorpusView {
    pub app_id: String,
    pub platform: Platform,
    pub geo_scope: Option<String>,
    pub reviews: Vec<Review>,
    pub total: usize,
    pub average_rating: f64,
    pub fresh: bool,
    pub last_stored_at: Option<DateTime<Utc>>,
}

/// Read side of the stored corpus, collapsed to logical (fingerprint) uniqueness.
#[derive(Clone)]
pub struct CorpusReader {
    store: Arc<dyn ReviewStore>,
    policy: FreshnessPolicy,
}

impl CorpusReader {
    pub fn new(store: Arc<dyn ReviewStore>, policy: FreshnessPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn load(
        &self,
        app_id: &str,
        platform: Platform,
        geo_scope: Option<&str>,
        filter: DateFilter,
    ) -> Result<CorpusView, StoreError> {
        let now = Utc::now();
        let query = ReviewQuery {
            app_id: app_id.to_string(),
            platform,
            geo_scope: geo_scope.map(ToString::to_string),
            published_since: filter.since(now),
        };
        let stored = self.store.list_reviews(&query).await?;
        let reviews = DedupEngine.dedupe(stored);
        let last_stored_at = self.store.latest_stored_at(app_id, platform, geo_scope).await?;
        Ok(CorpusView {
            app_id: app_id.to_string(),
            platform,
            geo_scope: geo_scope.map(ToString::to_string),
            total: reviews.len(),
            average_rating: average_rating(&reviews),
            fresh: self.policy.is_fresh(last_stored_at, now),
            last_stored_at,
            reviews,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes a finished job's corpus under `<root>/<job id>/`.
#[derive(Debug, Clone)]
pub struct CorpusExporter {
    root: PathBuf,
}

impl CorpusExporter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn export(&self, job: &CollectionJob, reviews: &[Review]) -> Result<PathBuf> {
        let job_dir = self.root.join(&job.id);
        let snapshot_dir = job_dir.join("snapshots");
        fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let reviews_json = serde_json::to_vec_pretty(&serde_json::json!({
            "job": job,
            "reviews": reviews,
        }))
        .context("serializing reviews export")?;
        fs::write(job_dir.join("reviews.json"), reviews_json)
            .await
            .context("writing reviews.json")?;
        fs::write(job_dir.join("collection_summary.md"), summary_markdown(job))
            .await
            .context("writing collection_summary.md")?;

        let reviews_path = snapshot_dir.join("reviews.parquet");
        let stats_path = snapshot_dir.join("country_stats.parquet");
        write_reviews_parquet(&reviews_path, reviews)?;
        let breakdown = job
            .stats
            .as_ref()
            .map(|s| s.country_breakdown.clone())
            .unwrap_or_default();
        write_country_stats_parquet(&stats_path, &breakdown)?;

        let manifest = ParquetManifest {
            schema_version: 1,
            files: vec![
                manifest_entry("reviews", &job_dir, &reviews_path)?,
                manifest_entry("country_stats", &job_dir, &stats_path)?,
            ],
        };
        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;

        info!(job_id = %job.id, dir = %job_dir.display(), "exported corpus");
        Ok(job_dir)
    }
}

fn summary_markdown(job: &CollectionJob) -> String {
    let mut lines = vec![
        format!("# Review Collection `{}`", job.id),
        String::new(),
        format!("- App: `{}` ({})", job.app_id, job.platform),
        format!("- Status: {:?}", job.status),
        format!("- Geo scope: {}", job.geo_scope),
        format!("- Started: {}", job.started_at),
        format!(
            "- Finished: {}",
            job.completed_at.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string())
        ),
        format!("- Countries: {}/{}", job.completed_countries, job.total_countries),
    ];
    if let Some(stats) = &job.stats {
        lines.push(format!(
            "- Reviews: {} raw, {} unique ({}% duplicates)",
            stats.total_reviews_collected, stats.unique_reviews, stats.deduplication_rate
        ));
        lines.push(format!("- Average rating: {:.1}", stats.average_rating));
        lines.push(String::new());
        lines.push("## Countries".to_string());
        for (country, s) in &stats.country_breakdown {
            lines.push(format!(
                "- {}: {} reviews, {} pages, {} errors",
                country.to_ascii_uppercase(),
                s.reviews,
                s.pages,
                s.errors
            ));
        }
    }
    if let Some(persisted) = &job.persisted {
        lines.push(String::new());
        lines.push(format!(
            "Stored: {} new, {} already present, {} failed",
            persisted.created, persisted.existing, persisted.failed
        ));
    }
    if !job.errors.is_empty() {
        lines.push(String::new());
        lines.push("## Errors".to_string());
        lines.extend(job.errors.iter().map(|e| format!("- {e}")));
    }
    lines.push(String::new());
    lines.join("\n")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_reviews_parquet(path: &Path, reviews: &[Review]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("content_fingerprint", DataType::Utf8, false),
        ArrowField::new("country", DataType::Utf8, true),
        ArrowField::new("rating", DataType::UInt32, false),
        ArrowField::new("author", DataType::Utf8, false),
        ArrowField::new("published_at", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("body", DataType::Utf8, false),
        ArrowField::new("app_version", DataType::Utf8, true),
    ]));

    let published: Vec<String> = reviews.iter().map(|r| r.published_at.to_rfc3339()).collect();
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from_iter_values(reviews.iter().map(|r| r.source_id.as_str()))),
            Arc::new(StringArray::from_iter_values(
                reviews.iter().map(|r| r.content_fingerprint.as_str()),
            )),
            Arc::new(StringArray::from(
                reviews.iter().map(|r| r.country.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                reviews.iter().map(|r| u32::from(r.rating)).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from_iter_values(reviews.iter().map(|r| r.author.as_str()))),
            Arc::new(StringArray::from_iter_values(published.iter().map(String::as_str))),
            Arc::new(StringArray::from_iter_values(reviews.iter().map(|r| r.title.as_str()))),
            Arc::new(StringArray::from_iter_values(reviews.iter().map(|r| r.body.as_str()))),
            Arc::new(StringArray::from(
                reviews.iter().map(|r| r.app_version.as_deref()).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building reviews record batch")?;
    write_parquet(path, batch)
}

fn write_country_stats_parquet(path: &Path, breakdown: &BTreeMap<String, CountryStats>) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("country", DataType::Utf8, false),
        ArrowField::new("reviews", DataType::UInt32, false),
        ArrowField::new("pages", DataType::UInt32, false),
        ArrowField::new("errors", DataType::UInt32, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from_iter_values(breakdown.keys().map(String::as_str))),
            Arc::new(UInt32Array::from(
                breakdown.values().map(|s| s.reviews as u32).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(breakdown.values().map(|s| s.pages).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(
                breakdown.values().map(|s| s.errors as u32).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building country stats record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, base: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(base).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Review sources for every platform the configuration enables.
pub fn build_sources(config: &CollectorConfig) -> Result<Vec<Arc<dyn ReviewSource>>> {
    let http = Arc::new(HttpFetcher::new(config.http_config())?);
    let mut sources: Vec<Arc<dyn ReviewSource>> = vec![Arc::new(AppStoreFeedSource::with_template(
        http.clone(),
        config.appstore_feed_url.clone(),
    ))];
    match &config.googleplay_endpoint {
        Some(endpoint) => sources.push(Arc::new(GooglePlaySource::new(
            http,
            endpoint.clone(),
            config.googleplay_lang.clone(),
        ))),
        None => warn!("REVCOL_GOOGLEPLAY_ENDPOINT not set; Google Play collection is disabled"),
    }
    Ok(sources)
}

pub async fn open_store(config: &CollectorConfig) -> Result<Arc<dyn ReviewStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgReviewStore::connect(url).await.context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; reviews are kept in memory only");
            Ok(Arc::new(InMemoryReviewStore::new()))
        }
    }
}

/// Everything a process needs to run collections and serve the corpus.
#[derive(Clone)]
pub struct CollectorRuntime {
    pub config: CollectorConfig,
    pub manager: JobManager,
    pub reader: CorpusReader,
}

impl CollectorRuntime {
    pub async fn from_env() -> Result<Self> {
        Self::from_config(CollectorConfig::from_env()).await
    }

    pub async fn from_config(config: CollectorConfig) -> Result<Self> {
        let regions = RegionRegistry::load_or_builtin(&config.workspace_root)?;
        let store = open_store(&config).await?;
        let sources = build_sources(&config)?;
        let reader = CorpusReader::new(
            store.clone(),
            FreshnessPolicy {
                max_age: config.cache_max_age,
            },
        );
        let mut manager = JobManager::new(config.clone(), regions, store, sources);
        if let Some(dir) = &config.reports_dir {
            manager = manager.with_exporter(CorpusExporter::new(dir));
        }
        Ok(Self {
            config,
            manager,
            reader,
        })
    }
}
