use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use revcol_adapters::{FeedPage, PageRequest, ReviewSource};
use revcol_core::{validate_draft, CollectionContext, Platform, Review, ReviewDraft};
use revcol_storage::FetchError;

use crate::CollectorConfig;

pub fn instant_config() -> CollectorConfig {
    CollectorConfig {
        min_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        batch_delay: Duration::ZERO,
        error_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
        ..CollectorConfig::default()
    }
}

pub fn draft(id: &str, body: &str, rating: i64) -> ReviewDraft {
    ReviewDraft {
        source_id: Some(id.to_string()),
        title: Some(format!("title {id}")),
        body: Some(body.to_string()),
        author: Some("casey".to_string()),
        published: Some(Utc::now().to_rfc3339()),
        rating: Some(rating),
        app_version: None,
    }
}

pub fn review(id: &str, country: &str, body: &str, rating: i64) -> Review {
    let ctx = CollectionContext {
        app_id: "686449807".to_string(),
        platform: Platform::AppStore,
        country: country.to_string(),
        geo_scope: Some("targeted".to_string()),
        collected_at: Utc::now(),
    };
    Review::from_validated(validate_draft(draft(id, body, rating)).expect("valid draft"), &ctx)
}

/// Serves scripted pages per country; pages past the script end the feed.
#[derive(Default)]
pub struct FakeSource {
    pages: HashMap<String, Vec<Vec<ReviewDraft>>>,
    failing: HashSet<String>,
    delay: Duration,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// One page per entry, each holding that many distinct reviews.
    pub fn with_pages(mut self, country: &str, sizes: Vec<usize>) -> Self {
        let pages = sizes
            .into_iter()
            .enumerate()
            .map(|(page, size)| {
                (0..size)
                    .map(|i| {
                        let id = format!("{country}-{page}-{i}");
                        draft(&id, &format!("review {id} text"), 4)
                    })
                    .collect()
            })
            .collect();
        self.pages.insert(country.to_string(), pages);
        self
    }

    pub fn with_drafts(mut self, country: &str, drafts: Vec<ReviewDraft>) -> Self {
        self.pages.entry(country.to_string()).or_default().push(drafts);
        self
    }

    /// Requests for this country fail with a non-retryable error.
    pub fn failing(mut self, country: &str) -> Self {
        self.failing.insert(country.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ReviewSource for FakeSource {
    fn platform(&self) -> Platform {
        Platform::AppStore
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage, FetchError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.contains(&request.country) {
            return Err(FetchError::InvalidTarget(format!(
                "no feed for {}",
                request.country
            )));
        }
        let pages = self.pages.get(&request.country);
        let index = request.page as usize - 1;
        match pages.and_then(|p| p.get(index)) {
            Some(drafts) => Ok(FeedPage {
                drafts: drafts.clone(),
                next_cursor: None,
                has_more: true,
            }),
            None => Ok(FeedPage::default()),
        }
    }
}
