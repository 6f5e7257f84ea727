//! Thin axum JSON surface over the collection job manager and the stored corpus.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use revcol_core::Platform;
use revcol_sync::{
    build_sweep_scheduler, CollectionError, CollectionRequest, CollectorRuntime, CorpusReader, CorpusView,
    DateFilter, JobManager, StartedJob,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub manager: JobManager,
    pub reader: CorpusReader,
}

impl AppState {
    pub fn new(manager: JobManager, reader: CorpusReader) -> Self {
        Self { manager, reader }
    }
}

impl From<&CollectorRuntime> for AppState {
    fn from(runtime: &CollectorRuntime) -> Self {
        Self::new(runtime.manager.clone(), runtime.reader.clone())
    }
}

pub struct ApiError(CollectionError);

impl From<CollectionError> for ApiError {
    fn from(value: CollectionError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CollectionError::Validation(_) => StatusCode::BAD_REQUEST,
            CollectionError::NotFound(_) | CollectionError::NotCancellable(_) => StatusCode::NOT_FOUND,
            CollectionError::Failed(_) | CollectionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/collect", post(start_collection_handler).get(list_jobs_handler))
        .route(
            "/api/collect/{job_id}",
            get(job_status_handler).delete(cancel_job_handler),
        )
        .route("/api/collect/{job_id}/pause", post(pause_job_handler))
        .route("/api/reviews", get(reviews_handler))
        .with_state(state)
}

pub async fn serve(runtime: CollectorRuntime, port: u16) -> anyhow::Result<()> {
    let sweeper = build_sweep_scheduler(runtime.manager.clone(), &runtime.config.sweep_cron).await?;
    sweeper.start().await?;

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::from(&runtime))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("REVCOL_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let runtime = CollectorRuntime::from_env().await?;
    serve(runtime, port).await
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn start_collection_handler(
    State(state): State<AppState>,
    Json(request): Json<CollectionRequest>,
) -> Result<Response, ApiError> {
    let started = state.manager.start_collection(request).await?;
    let status = if started.existing {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(started)).into_response())
}

async fn list_jobs_handler(State(state): State<AppState>) -> Response {
    Json(json!({ "jobs": state.manager.list_active().await })).into_response()
}

async fn job_status_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = state.manager.job_status(&job_id).await?;
    Ok(Json(job).into_response())
}

async fn cancel_job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let cancelled = state.manager.cancel_job(&job_id).await?;
    Ok(Json(json!({ "jobId": job_id, "cancelled": cancelled })).into_response())
}

async fn pause_job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let paused = state.manager.pause_job(&job_id).await?;
    Ok(Json(json!({ "jobId": job_id, "paused": paused })).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviewsQuery {
    app_id: Option<String>,
    platform: Option<String>,
    geo_scope: Option<String>,
    date_filter: Option<String>,
    #[serde(default)]
    force_refresh: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReviewsResponse {
    #[serde(flatten)]
    corpus: CorpusView,
    /// Collection started because the stored corpus was stale or a refresh was forced.
    refresh: Option<StartedJob>,
}

async fn reviews_handler(
    State(state): State<AppState>,
    Query(query): Query<ReviewsQuery>,
) -> Result<Response, ApiError> {
    let app_id = query
        .app_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| CollectionError::Validation("appId is required".to_string()))?;
    let platform: Platform = query
        .platform
        .as_deref()
        .unwrap_or_default()
        .parse()
        .map_err(|e: revcol_core::UnknownPlatform| CollectionError::Validation(e.to_string()))?;
    let filter: DateFilter = query.date_filter.as_deref().unwrap_or("all").parse()?;
    let geo_scope = query.geo_scope.filter(|s| !s.trim().is_empty());

    let app_id = app_id.trim();

    let corpus = state
        .reader
        .load(app_id, platform, geo_scope.as_deref(), filter)
        .await
        .map_err(CollectionError::from)?;

    let refresh = if query.force_refresh || !corpus.fresh {
        match state.manager.refresh_corpus(app_id, platform, geo_scope.as_deref()).await {
            Ok(started) => Some(started),
            // a stale read of a scope no strategy can rebuild still returns what is stored
            Err(CollectionError::Validation(reason)) if !query.force_refresh => {
                warn!(app_id, ?geo_scope, %reason, "stale corpus not refreshed");
                None
            }
            Err(err) => return Err(err.into()),
        }
    } else {
        None
    };
    Ok(Json(ReviewsResponse { corpus, refresh }).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use revcol_adapters::{FeedPage, PageRequest, ReviewSource};
    use revcol_core::ReviewDraft;
    use revcol_storage::{FetchError, InMemoryReviewStore};
    use revcol_sync::{CollectorConfig, FreshnessPolicy, RegionRegistry};
    use tower::ServiceExt;

    struct OnePageSource;

    #[async_trait]
    impl ReviewSource for OnePageSource {
        fn platform(&self) -> Platform {
            Platform::AppStore
        }

        async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage, FetchError> {
            if request.page > 1 {
                return Ok(FeedPage::default());
            }
            let drafts = (0..3)
                .map(|i| ReviewDraft {
                    source_id: Some(format!("{}-{i}", request.country)),
                    title: Some("Solid".to_string()),
                    body: Some(format!("review {i} from {}", request.country)),
                    author: Some("kim".to_string()),
                    published: Some("2026-01-05T12:00:00Z".to_string()),
                    rating: Some(4),
                    app_version: None,
                })
                .collect();
            Ok(FeedPage {
                drafts,
                next_cursor: None,
                has_more: true,
            })
        }
    }

    fn test_state() -> AppState {
        let config = CollectorConfig {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            batch_delay: Duration::ZERO,
            error_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            ..CollectorConfig::default()
        };
        let store = Arc::new(InMemoryReviewStore::new());
        let reader = CorpusReader::new(
            store.clone(),
            FreshnessPolicy {
                max_age: config.cache_max_age,
            },
        );
        let manager = JobManager::new(config, RegionRegistry::builtin(), store, vec![Arc::new(OnePageSource)]);
        AppState::new(manager, reader)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = app(test_state());
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn rejects_unknown_platform() {
        let app = app(test_state());
        let (status, body) = send(
            &app,
            post_json("/api/collect", json!({ "appId": "686449807", "platform": "symbian" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("symbian"));
    }

    #[tokio::test]
    async fn rejects_missing_app_id() {
        let app = app(test_state());
        let (status, _) = send(&app, post_json("/api/collect", json!({ "platform": "appstore" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn collection_round_trip_through_the_api() {
        let app = app(test_state());
        let (status, started) = send(
            &app,
            post_json(
                "/api/collect",
                json!({
                    "appId": "686449807",
                    "platform": "appstore",
                    "strategy": { "type": "targeted", "countries": ["us", "gb"] }
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let job_id = started["jobId"].as_str().unwrap().to_string();

        let mut job = serde_json::Value::Null;
        for _ in 0..200 {
            let (status, body) = send(&app, get(&format!("/api/collect/{job_id}"))).await;
            assert_eq!(status, StatusCode::OK);
            if body["status"] == "completed" {
                job = body;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(job["reviewsCollected"], 6);
        assert_eq!(job["progress"], 100);

        let (status, listed) = send(&app, get("/api/collect")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["jobs"].as_array().unwrap().len(), 1);

        let (status, corpus) = send(&app, get("/api/reviews?appId=686449807&platform=appstore")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(corpus["total"], 6);
        assert_eq!(corpus["fresh"], true);
        assert!(corpus["refresh"].is_null());

        let (status, _) = send(
            &app,
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/collect/{job_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let app = app(test_state());
        let (status, _) = send(&app, get("/api/collect/appstore_1_1")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/api/collect/appstore_1_1/pause")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reviews_need_app_and_valid_filter() {
        let app = app(test_state());
        let (status, _) = send(&app, get("/api/reviews?platform=appstore")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, get("/api/reviews?appId=1&platform=appstore&dateFilter=1year")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, get("/api/reviews?appId=1&platform=googleplay&dateFilter=7days")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 0);
        assert_eq!(body["fresh"], false);
        assert!(body["refresh"]["jobId"].as_str().unwrap().starts_with("googleplay_1_"));
    }

    async fn wait_completed(app: &Router, job_id: &str) {
        for _ in 0..200 {
            let (_, body) = send(app, get(&format!("/api/collect/{job_id}"))).await;
            if body["status"] == "completed" {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never completed");
    }

    #[tokio::test]
    async fn stale_corpus_read_starts_a_collection_for_its_scope() {
        let app = app(test_state());
        let uri = "/api/reviews?appId=686449807&platform=appstore&geoScope=gb";

        let (status, body) = send(&app, get(uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 0);
        assert_eq!(body["fresh"], false);
        let job_id = body["refresh"]["jobId"].as_str().unwrap().to_string();

        let (_, job) = send(&app, get(&format!("/api/collect/{job_id}"))).await;
        assert_eq!(job["geoScope"], "gb");
        assert_eq!(job["totalCountries"], 1);
        wait_completed(&app, &job_id).await;

        let (_, body) = send(&app, get(uri)).await;
        assert_eq!(body["total"], 3);
        assert_eq!(body["fresh"], true);
        assert!(body["refresh"].is_null());

        let (_, forced) = send(&app, get(&format!("{uri}&forceRefresh=true"))).await;
        assert_eq!(forced["total"], 3);
        let forced_id = forced["refresh"]["jobId"].as_str().unwrap();
        assert_ne!(forced_id, job_id);
    }

    #[tokio::test]
    async fn stale_read_of_unrebuildable_scope_only_fails_when_forced() {
        let app = app(test_state());
        let uri = "/api/reviews?appId=686449807&platform=appstore&geoScope=targeted";

        let (status, body) = send(&app, get(uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["refresh"].is_null());

        let (status, _) = send(&app, get(&format!("{uri}&forceRefresh=true"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
