//! Collection job lifecycle: submission, progress, pause/cancel, persistence and sweep.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use revcol_adapters::{CountryFetcher, ReviewSource};
use revcol_core::{CollectionJob, JobStatus, PersistSummary, Platform, Review};
use revcol_storage::{ReviewStore, UpsertOutcome};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};

use crate::{
    build_stats, BatchScheduler, CollectOutcome, CollectPlan, CollectionError, CollectorConfig,
    CorpusExporter, CountryProgress, DedupEngine, RegionRegistry,
};

pub const CANCELLED_BY_USER: &str = "cancelled by user";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Strategy {
    /// Every country in the `all` profile with the full page cap.
    #[default]
    Complete,
    /// The `incremental` profile with a low page cap.
    Incremental,
    Targeted {
        #[serde(default)]
        countries: Vec<String>,
        #[serde(default, rename = "maxPagesPerCountry")]
        max_pages_per_country: Option<u32>,
    },
}

/// Unvalidated submission as it arrives from the API layer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionRequest {
    pub app_id: Option<String>,
    pub platform: Option<String>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedJob {
    pub job_id: String,
    pub status: JobStatus,
    /// True when an in-flight job for the same app was returned instead of a new one.
    pub existing: bool,
}

/// The strategy whose jobs store their reviews under `geo_scope`.
pub fn strategy_for_scope(geo_scope: Option<&str>) -> Strategy {
    let scope = geo_scope.map(|s| s.trim().to_ascii_lowercase()).unwrap_or_default();
    match scope.as_str() {
        "" | "all" => Strategy::Complete,
        "incremental" => Strategy::Incremental,
        _ => Strategy::Targeted {
            countries: vec![scope],
            max_pages_per_country: None,
        },
    }
}

#[derive(Debug, Clone)]
struct JobPlan {
    platform: Platform,
    collect: CollectPlan,
}

struct JobEntry {
    job: CollectionJob,
    halt: watch::Sender<bool>,
}

/// Owns the in-memory job registry and runs collections in background tasks.
#[derive(Clone)]
pub struct JobManager {
    jobs: Arc<RwLock<HashMap<String, JobEntry>>>,
    sources: Arc<HashMap<Platform, Arc<dyn ReviewSource>>>,
    store: Arc<dyn ReviewStore>,
    config: Arc<CollectorConfig>,
    regions: Arc<RegionRegistry>,
    exporter: Option<Arc<CorpusExporter>>,
}

impl JobManager {
    pub fn new(
        config: CollectorConfig,
        regions: RegionRegistry,
        store: Arc<dyn ReviewStore>,
        sources: Vec<Arc<dyn ReviewSource>>,
    ) -> Self {
        let sources = sources.into_iter().map(|s| (s.platform(), s)).collect();
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            sources: Arc::new(sources),
            store,
            config: Arc::new(config),
            regions: Arc::new(regions),
            exporter: None,
        }
    }

    pub fn with_exporter(mut self, exporter: CorpusExporter) -> Self {
        self.exporter = Some(Arc::new(exporter));
        self
    }

    fn plan(&self, app_id: &str, platform: Platform, strategy: &Strategy) -> Result<JobPlan, CollectionError> {
        let (countries, max_pages, geo_scope) = match strategy {
            Strategy::Complete => (
                self.regions.expand(&["all".to_string()])?,
                self.config.max_pages_per_country,
                "all".to_string(),
            ),
            Strategy::Incremental => (
                self.regions.expand(&["incremental".to_string()])?,
                self.config.incremental_max_pages,
                "incremental".to_string(),
            ),
            Strategy::Targeted {
                countries,
                max_pages_per_country,
            } => {
                if countries.is_empty() {
                    return Err(CollectionError::Validation(
                        "targeted strategy needs at least one country or region".to_string(),
                    ));
                }
                if *max_pages_per_country == Some(0) {
                    return Err(CollectionError::Validation(
                        "maxPagesPerCountry must be at least 1".to_string(),
                    ));
                }
                let expanded = self.regions.expand(countries)?;
                let scope = match countries.as_slice() {
                    [single] => single.trim().to_ascii_lowercase(),
                    _ => "targeted".to_string(),
                };
                (
                    expanded,
                    max_pages_per_country.unwrap_or(self.config.max_pages_per_country),
                    scope,
                )
            }
        };
        Ok(JobPlan {
            platform,
            collect: CollectPlan {
                app_id: app_id.to_string(),
                countries,
                max_pages,
                geo_scope: Some(geo_scope),
            },
        })
    }

    /// Registers a pending job and starts it in the background.
    ///
    /// A pending or running job for the same `(app_id, platform)` is returned
    /// instead of starting a second one.
    pub async fn create_job(
        &self,
        app_id: &str,
        platform: Platform,
        strategy: Strategy,
    ) -> Result<StartedJob, CollectionError> {
        let plan = self.plan(app_id, platform, &strategy)?;

        let job_id = {
            let mut jobs = self.jobs.write().await;
            if let Some(existing) = jobs
                .values()
                .map(|entry| &entry.job)
                .find(|job| job.app_id == app_id && job.platform == platform && job.status.is_in_flight())
            {
                info!(job_id = %existing.id, app_id, %platform, "collection already in flight");
                return Ok(StartedJob {
                    job_id: existing.id.clone(),
                    status: existing.status,
                    existing: true,
                });
            }

            let now = Utc::now();
            let base = format!("{platform}_{app_id}_{}", now.timestamp_millis());
            let mut job_id = base.clone();
            let mut bump = 1;
            while jobs.contains_key(&job_id) {
                job_id = format!("{base}_{bump}");
                bump += 1;
            }

            let (halt, _) = watch::channel(false);
            let job = CollectionJob {
                id: job_id.clone(),
                app_id: app_id.to_string(),
                platform,
                status: JobStatus::Pending,
                progress: 0,
                total_countries: plan.collect.countries.len(),
                completed_countries: 0,
                reviews_collected: 0,
                errors: Vec::new(),
                geo_scope: plan.collect.geo_scope.clone().unwrap_or_default(),
                started_at: now,
                completed_at: None,
                stats: None,
                persisted: None,
            };
            jobs.insert(job_id.clone(), JobEntry { job, halt });
            job_id
        };

        info!(job_id = %job_id, app_id, %platform, ?strategy, "collection job created");
        let manager = self.clone();
        let spawned_id = job_id.clone();
        tokio::spawn(async move { manager.run_job(spawned_id, plan).await });

        Ok(StartedJob {
            job_id,
            status: JobStatus::Pending,
            existing: false,
        })
    }

    pub async fn get_status(&self, job_id: &str) -> Option<CollectionJob> {
        self.jobs.read().await.get(job_id).map(|entry| entry.job.clone())
    }

    /// Every tracked job, terminal ones included until swept. Newest first.
    pub async fn list_active(&self) -> Vec<CollectionJob> {
        let mut jobs: Vec<_> = self
            .jobs
            .read()
            .await
            .values()
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs
    }

    /// Marks a non-terminal job failed and stops it from starting further batches.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(entry) = jobs.get_mut(job_id) else {
            return false;
        };
        if entry.job.status.is_terminal() {
            return false;
        }
        entry.job.status = JobStatus::Failed;
        entry.job.errors.push(CANCELLED_BY_USER.to_string());
        entry.job.completed_at = Some(Utc::now());
        entry.halt.send_replace(true);
        info!(job_id, "collection job cancelled");
        true
    }

    /// Pauses a running job at the next batch boundary. Paused jobs are not resumed here.
    pub async fn pause(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(entry) = jobs.get_mut(job_id) else {
            return false;
        };
        if entry.job.status != JobStatus::Running {
            return false;
        }
        entry.job.status = JobStatus::Paused;
        entry.halt.send_replace(true);
        info!(job_id, "collection job paused");
        true
    }

    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Drops terminal jobs that finished more than the retention window before `now`.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.config.job_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let cutoff = now - retention;
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, entry| {
            !(entry.job.status.is_terminal() && entry.job.completed_at.is_some_and(|done| done < cutoff))
        });
        let removed = before - jobs.len();
        if removed > 0 {
            info!(removed, "swept expired collection jobs");
        }
        removed
    }

    /// Validating entry point for the HTTP layer.
    pub async fn start_collection(&self, request: CollectionRequest) -> Result<StartedJob, CollectionError> {
        let app_id = request
            .app_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CollectionError::Validation("appId is required".to_string()))?;
        let platform = request
            .platform
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| CollectionError::Validation("platform is required".to_string()))?
            .parse::<Platform>()
            .map_err(|e| CollectionError::Validation(e.to_string()))?;
        self.create_job(&app_id, platform, request.strategy.unwrap_or_default())
            .await
    }

    /// Recollects the stored corpus for `geo_scope`, landing the new reviews under the same scope.
    pub async fn refresh_corpus(
        &self,
        app_id: &str,
        platform: Platform,
        geo_scope: Option<&str>,
    ) -> Result<StartedJob, CollectionError> {
        let strategy = strategy_for_scope(geo_scope);
        info!(app_id, %platform, geo_scope, "refreshing stored corpus");
        self.create_job(app_id, platform, strategy).await
    }

    pub async fn job_status(&self, job_id: &str) -> Result<CollectionJob, CollectionError> {
        self.get_status(job_id)
            .await
            .ok_or_else(|| CollectionError::NotFound(job_id.to_string()))
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<bool, CollectionError> {
        if self.cancel(job_id).await {
            return Ok(true);
        }
        match self.get_status(job_id).await {
            None => Err(CollectionError::NotFound(job_id.to_string())),
            Some(_) => Err(CollectionError::NotCancellable(job_id.to_string())),
        }
    }

    pub async fn pause_job(&self, job_id: &str) -> Result<bool, CollectionError> {
        if self.pause(job_id).await {
            return Ok(true);
        }
        match self.get_status(job_id).await {
            None => Err(CollectionError::NotFound(job_id.to_string())),
            Some(_) => Err(CollectionError::NotCancellable(job_id.to_string())),
        }
    }

    async fn run_job(self, job_id: String, plan: JobPlan) {
        let span = info_span!(
            "collection_job",
            job_id = %job_id,
            app_id = %plan.collect.app_id,
            platform = %plan.platform
        );
        async move {
            let halt = {
                let mut jobs = self.jobs.write().await;
                let Some(entry) = jobs.get_mut(&job_id) else {
                    return;
                };
                if entry.job.status != JobStatus::Pending {
                    info!(status = ?entry.job.status, "job left pending before it started");
                    return;
                }
                entry.job.status = JobStatus::Running;
                entry.halt.subscribe()
            };

            if let Err(err) = self.execute(&job_id, &plan, halt).await {
                error!(error = %err, "collection job failed");
                self.fail(&job_id, err.to_string()).await;
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        job_id: &str,
        plan: &JobPlan,
        halt: watch::Receiver<bool>,
    ) -> Result<(), CollectionError> {
        let source = self.sources.get(&plan.platform).cloned().ok_or_else(|| {
            CollectionError::Failed(format!("no review source configured for {}", plan.platform))
        })?;
        let scheduler = BatchScheduler::new(
            CountryFetcher::new(source, self.config.fetch_settings()),
            self.config.batch_settings(),
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<CountryProgress>();
        let progress_task = {
            let manager = self.clone();
            let job_id = job_id.to_string();
            tokio::spawn(async move {
                while let Some(update) = rx.recv().await {
                    manager.apply_progress(&job_id, &update).await;
                }
            })
        };

        let outcome = scheduler.collect(&plan.collect, Some(&tx), Some(&halt)).await;
        drop(tx);
        if let Err(err) = progress_task.await {
            warn!(error = %err, "progress consumer ended abnormally");
        }

        self.finish(job_id, plan, outcome?).await;
        Ok(())
    }

    async fn apply_progress(&self, job_id: &str, update: &CountryProgress) {
        let mut jobs = self.jobs.write().await;
        let Some(entry) = jobs.get_mut(job_id) else {
            return;
        };
        let job = &mut entry.job;
        job.progress = job.progress.max(update.percent);
        job.completed_countries = job.completed_countries.max(update.completed);
        job.reviews_collected += update.reviews;
        info!(
            country = %update.country,
            reviews = update.reviews,
            progress = job.progress,
            "country finished"
        );
    }

    async fn fail(&self, job_id: &str, message: String) {
        let mut jobs = self.jobs.write().await;
        if let Some(entry) = jobs.get_mut(job_id) {
            if !entry.job.status.is_terminal() {
                entry.job.status = JobStatus::Failed;
                entry.job.completed_at = Some(Utc::now());
            }
            entry.job.errors.push(message);
        }
    }

    async fn persist(&self, plan: &JobPlan, reviews: &[Review]) -> PersistSummary {
        let mut summary = PersistSummary::default();
        if let Err(err) = self.store.upsert_app(&plan.collect.app_id, plan.platform).await {
            error!(error = %err, "could not register app; skipping persistence");
            summary.failed = reviews.len();
            return summary;
        }
        for review in reviews {
            match self.store.upsert_review(review).await {
                Ok(UpsertOutcome::Created) => summary.created += 1,
                Ok(UpsertOutcome::Existing) => summary.existing += 1,
                Err(err) => {
                    warn!(source_id = %review.source_id, error = %err, "failed to store review");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    async fn finish(&self, job_id: &str, plan: &JobPlan, outcome: CollectOutcome) {
        let total_countries = plan.collect.countries.len();
        let unique = DedupEngine.dedupe(outcome.reviews.clone());
        let stats = build_stats(total_countries, &outcome, &unique);
        let persisted = self.persist(plan, &unique).await;
        info!(
            raw = outcome.reviews.len(),
            unique = unique.len(),
            created = persisted.created,
            existing = persisted.existing,
            failed = persisted.failed,
            halted = outcome.halted,
            "collection finished"
        );

        let snapshot = {
            let mut jobs = self.jobs.write().await;
            let Some(entry) = jobs.get_mut(job_id) else {
                return;
            };
            let job = &mut entry.job;
            job.errors.extend(outcome.errors.iter().cloned());
            job.reviews_collected = unique.len();
            job.completed_countries = outcome.processed_countries;
            job.stats = Some(stats);
            job.persisted = Some(persisted);
            if job.status == JobStatus::Running {
                if outcome.processed_countries > 0 && outcome.successful_countries == 0 {
                    job.status = JobStatus::Failed;
                    job.errors
                        .push(format!("all {} countries failed", outcome.processed_countries));
                } else {
                    job.status = JobStatus::Completed;
                    job.progress = 100;
                }
            }
            if job.status.is_terminal() && job.completed_at.is_none() {
                job.completed_at = Some(Utc::now());
            }
            job.clone()
        };

        if let Some(exporter) = &self.exporter {
            if let Err(err) = exporter.export(&snapshot, &unique).await {
                warn!(error = %err, "corpus export failed");
            }
        }
    }
}

/// Cron job that periodically drops expired terminal jobs from the registry.
pub async fn build_sweep_scheduler(manager: JobManager, cron: &str) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let manager = manager.clone();
        Box::pin(async move {
            manager.sweep_expired().await;
        })
    })
    .with_context(|| format!("creating sweep job for cron {cron}"))?;
    sched.add(job).await.context("adding sweep job")?;
    Ok(sched)
}
