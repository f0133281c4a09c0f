//! Axum JSON API for the lead dashboard.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use leadm_core::{FailureKind, Lead, LeadBatch, LeadFilter, ResultsOrigin, Session, SessionEvent};
use leadm_storage::StoredExport;
use leadm_sync::{ActionError, Dashboard, FeatureStatus};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;

pub const CRATE_NAME: &str = "leadm-web";
pub const APP_NAME: &str = "Lead Machine";

/// Shared handler state. The session snapshot is replaced wholesale per action.
pub struct AppState {
    pub dashboard: Dashboard,
    session: Mutex<Session>,
}

impl AppState {
    pub fn new(dashboard: Dashboard) -> Self {
        Self {
            dashboard,
            session: Mutex::new(Session::new()),
        }
    }

    async fn apply(&self, event: SessionEvent) {
        let mut session = self.session.lock().await;
        *session = std::mem::take(&mut *session).transition(event);
    }

    async fn visible_leads(&self, filter: &LeadFilter) -> Result<Vec<Lead>, ApiError> {
        self.session
            .lock()
            .await
            .visible_leads(filter)
            .ok_or(ApiError(ActionError::NoResults))
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/search", post(search_handler))
        .route("/history", get(history_handler))
        .route("/history/{dataset_id}/load", post(history_load_handler))
        .route("/leads", get(leads_handler).delete(clear_leads_handler))
        .route("/leads.csv", get(leads_csv_handler))
        .route("/leads/export", post(leads_export_handler))
        .route("/crm", get(crm_handler))
        .route("/crm/export", post(crm_export_handler))
        .route("/crm/drafts", post(crm_drafts_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(dashboard: Dashboard) -> anyhow::Result<()> {
    let port = dashboard.config().web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "dashboard listening");
    axum::serve(listener, app(AppState::new(dashboard))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(Dashboard::from_env()?).await
}

/// Maps action failures onto HTTP statuses with a JSON body.
#[derive(Debug)]
pub struct ApiError(pub ActionError);

impl From<ActionError> for ApiError {
    fn from(err: ActionError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            ActionError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ActionError::NoResults => StatusCode::CONFLICT,
            ActionError::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
            other => match other.kind() {
                Some(FailureKind::NotConfigured) => StatusCode::SERVICE_UNAVAILABLE,
                Some(FailureKind::NotFound) => StatusCode::NOT_FOUND,
                _ => StatusCode::BAD_GATEWAY,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct SessionSummary {
    origin: ResultsOrigin,
    lead_count: usize,
    loaded_at: DateTime<Utc>,
}

fn session_summary(session: &Session) -> Option<SessionSummary> {
    session.results().map(|batch| SessionSummary {
        origin: batch.origin.clone(),
        lead_count: batch.leads.len(),
        loaded_at: batch.loaded_at,
    })
}

#[derive(Debug, Serialize)]
struct IndexBody {
    app: &'static str,
    sheet_name: String,
    features: Vec<FeatureStatus>,
    session: Option<SessionSummary>,
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Json<IndexBody> {
    let session = state.session.lock().await;
    Json(IndexBody {
        app: APP_NAME,
        sheet_name: state.dashboard.config().sheet_name.clone(),
        features: state.dashboard.collaborators().availability(),
        session: session_summary(&session),
    })
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    query: String,
    #[serde(default)]
    max_results: Option<u32>,
}

/// Result of loading a batch. An empty batch leaves the session untouched.
#[derive(Debug, Serialize)]
struct BatchBody {
    origin: ResultsOrigin,
    total: usize,
    leads: Vec<Lead>,
    message: Option<String>,
}

async fn load_batch(state: &AppState, batch: LeadBatch) -> BatchBody {
    let origin = batch.origin.clone();
    let message = batch
        .leads
        .is_empty()
        .then(|| "No results found; previous results were kept.".to_string());
    let leads = batch.leads.clone();
    state.apply(SessionEvent::ResultsLoaded(batch)).await;
    BatchBody {
        origin,
        total: leads.len(),
        leads,
        message,
    }
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SearchBody>,
) -> Result<Json<BatchBody>, ApiError> {
    let batch = state.dashboard.search(&body.query, body.max_results).await?;
    Ok(Json(load_batch(&state, batch).await))
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<leadm_adapters::RunSummary>>, ApiError> {
    Ok(Json(state.dashboard.history().await?))
}

#[derive(Debug, Default, Deserialize)]
struct LoadQuery {
    label: Option<String>,
}

async fn history_load_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(dataset_id): AxumPath<String>,
    Query(query): Query<LoadQuery>,
) -> Result<Json<BatchBody>, ApiError> {
    let batch = state.dashboard.load_run(&dataset_id, query.label).await?;
    Ok(Json(load_batch(&state, batch).await))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FilterQuery {
    no_website: bool,
    low_rating: bool,
}

impl From<FilterQuery> for LeadFilter {
    fn from(q: FilterQuery) -> Self {
        LeadFilter {
            no_website: q.no_website,
            low_rating: q.low_rating,
        }
    }
}

async fn leads_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<FilterQuery>,
) -> Result<Json<Vec<Lead>>, ApiError> {
    Ok(Json(state.visible_leads(&filter.into()).await?))
}

async fn clear_leads_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    state.apply(SessionEvent::ResultsCleared).await;
    StatusCode::NO_CONTENT
}

async fn leads_csv_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<FilterQuery>,
) -> Result<Response, ApiError> {
    let leads = state.visible_leads(&filter.into()).await?;
    let bytes = leadm_storage::leads_to_csv(&leads).map_err(ActionError::from)?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"leads.csv\""),
        ],
        bytes,
    )
        .into_response())
}

/// Saves the visible leads as a CSV file in the export directory.
async fn leads_export_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<FilterQuery>,
) -> Result<(StatusCode, Json<StoredExport>), ApiError> {
    let filter: LeadFilter = filter.into();
    let (label, leads) = {
        let session = state.session.lock().await;
        let batch = session.results().ok_or(ApiError(ActionError::NoResults))?;
        (batch.origin.label().to_string(), filter.apply(&batch.leads))
    };
    let stored = state.dashboard.export_csv(&leads, &label).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

#[derive(Debug, Default, Deserialize)]
struct CrmQuery {
    #[serde(default)]
    q: String,
}

async fn crm_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CrmQuery>,
) -> Result<Json<leadm_sync::CrmView>, ApiError> {
    Ok(Json(state.dashboard.crm_view(&query.q).await?))
}

/// Exports the currently visible (filtered) leads.
async fn crm_export_handler(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<FilterQuery>,
) -> Result<Json<leadm_sync::ExportOutcome>, ApiError> {
    let leads = state.visible_leads(&filter.into()).await?;
    Ok(Json(state.dashboard.export_to_crm(&leads).await?))
}

async fn crm_drafts_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<leadm_sync::DraftPassSummary>, ApiError> {
    let summary = state
        .dashboard
        .generate_drafts(|p| info!(completed = p.completed, total = p.total, "draft progress"))
        .await?;
    Ok(Json(summary))
}
