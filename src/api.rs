use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::analyze::cache::CacheStats;
use crate::analyze::ClassificationSource;
use crate::content::{ContentItem, MediaRef};
use crate::engine::{Degradation, SortOptions, SortOutcome, SortingEngine};
use crate::error::SortError;
use crate::folders::CategoryStat;
use crate::history::HistoryEntry;
use crate::sync::{BackupSynchronizer, CycleOutcome};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SortingEngine>,
    pub backup: Option<Arc<BackupSynchronizer>>,
}

impl AppState {
    pub fn new(engine: Arc<SortingEngine>) -> Self {
        Self { engine, backup: None }
    }

    pub fn with_backup(mut self, sync: Arc<BackupSynchronizer>) -> Self {
        self.backup = Some(sync);
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/sort", post(sort))
        .route("/categories", get(categories))
        .route("/folders", get(folders))
        .route("/stats", get(stats))
        .route("/debug/recent", get(debug_recent))
        .route("/debug/rate-limit", get(debug_rate_limit))
        .route("/admin/backup", post(admin_backup))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// --- errors ---

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

struct ApiError(StatusCode, ErrorBody);

impl From<SortError> for ApiError {
    fn from(e: SortError) -> Self {
        let status = match e {
            SortError::InvalidCategory(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(
            status,
            ErrorBody {
                error: e.kind(),
                message: e.to_string(),
            },
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

// --- /sort ---

#[derive(Deserialize)]
struct SortReq {
    #[serde(default)]
    text: String,
    #[serde(default)]
    media: Option<MediaRef>,
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    create_folder: Option<bool>,
    #[serde(default)]
    persist: Option<bool>,
}

#[derive(Serialize)]
struct SortResp {
    fingerprint: String,
    category: String,
    subcategory: Option<String>,
    technology: Option<String>,
    confidence: f32,
    source: ClassificationSource,
    /// Base-relative; `null` when no folder was materialized.
    folder_path: Option<String>,
    folder_created: bool,
    stored_at: Option<String>,
    degraded: Option<Degradation>,
    folder_error: Option<String>,
    store_error: Option<String>,
}

impl From<SortOutcome> for SortResp {
    fn from(o: SortOutcome) -> Self {
        let folder_path = o
            .folder_path
            .as_ref()
            .map(|_| o.relative_path.to_string_lossy().into_owned());
        Self {
            fingerprint: o.fingerprint.to_string(),
            category: o.result.category,
            subcategory: o.result.subcategory,
            technology: o.result.technology,
            confidence: o.result.confidence,
            source: o.result.source,
            folder_path,
            folder_created: o.folder_created,
            stored_at: o.stored_at.map(|p| p.to_string_lossy().into_owned()),
            degraded: o.degraded,
            folder_error: o.folder_error.map(|e| e.to_string()),
            store_error: o.store_error.map(|e| e.to_string()),
        }
    }
}

async fn sort(State(state): State<AppState>, Json(body): Json<SortReq>) -> Result<Json<SortResp>, ApiError> {
    let item = ContentItem {
        text: body.text,
        media: body.media,
        sender: body.sender,
        received_at: body.received_at,
    };
    let opts = SortOptions {
        create_folder: body.create_folder.unwrap_or(true),
        persist: body.persist,
    };
    let outcome = state.engine.sort(&item, opts).await?;
    Ok(Json(outcome.into()))
}

// --- read-only views ---

async fn categories(State(state): State<AppState>) -> Response {
    Json(state.engine.categories()).into_response()
}

async fn folders(State(state): State<AppState>) -> Response {
    let engine = state.engine.clone();
    match tokio::task::spawn_blocking(move || engine.folder_tree()).await {
        Ok(tree) => Json(tree).into_response(),
        Err(e) => {
            tracing::warn!(target: "sorter", error = %e, "folder tree task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Serialize)]
struct StatsOut {
    categories: BTreeMap<String, CategoryStat>,
    cache: CacheStats,
    inference_backends: Vec<&'static str>,
}

async fn stats(State(state): State<AppState>) -> Response {
    let engine = state.engine.clone();
    match tokio::task::spawn_blocking(move || StatsOut {
        categories: engine.category_stats(),
        cache: engine.cache_stats(),
        inference_backends: engine.inference_backends(),
    })
    .await
    {
        Ok(s) => Json(s).into_response(),
        Err(e) => {
            tracing::warn!(target: "sorter", error = %e, "stats task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize)]
struct RecentQuery {
    n: Option<usize>,
}

async fn debug_recent(State(state): State<AppState>, Query(q): Query<RecentQuery>) -> Json<Vec<HistoryEntry>> {
    let n = q.n.unwrap_or(20).min(200);
    Json(state.engine.recent(n))
}

#[derive(Serialize)]
struct RateLimitOut {
    limit: u32,
    window_secs: u64,
    remaining: u32,
}

async fn debug_rate_limit(State(state): State<AppState>) -> Json<RateLimitOut> {
    let rl = state.engine.rate_limiter();
    Json(RateLimitOut {
        limit: rl.limit(),
        window_secs: rl.window().as_secs(),
        remaining: rl.remaining(),
    })
}

// --- admin ---

async fn admin_backup(State(state): State<AppState>) -> Result<Json<CycleOutcome>, ApiError> {
    let Some(sync) = state.backup.clone() else {
        return Err(ApiError(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorBody {
                error: "backup_disabled",
                message: "backups are not enabled".into(),
            },
        ));
    };
    Ok(Json(sync.run_cycle().await))
}
