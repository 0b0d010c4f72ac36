//! HTTP request handlers.

use super::AppState;
use crate::db::{DbError, Site, SiteRepository};
use crate::probe::normalize_url;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};

// ============================================================================
// API: Sites
// ============================================================================

pub async fn handle_get_sites(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.all_sites() {
        Ok(sites) => Json(sites).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_get_site(State(state): State<AppState>, Path(id): Path<i64>) -> impl IntoResponse {
    match state.store.get_site(id) {
        Ok(site) => Json(site).into_response(),
        Err(DbError::NotFound) => (StatusCode::NOT_FOUND, "Site not found").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct SiteRequest {
    pub name: String,
    pub url: String,
    #[serde(default = "default_interval")]
    pub check_interval_minutes: u32,
}

fn default_interval() -> u32 {
    5
}

impl SiteRequest {
    /// Reject empty names and URLs that cannot be probed.
    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty".to_string());
        }
        if self.url.trim().is_empty() {
            return Err("url must not be empty".to_string());
        }
        reqwest::Url::parse(&normalize_url(&self.url))
            .map(|_| ())
            .map_err(|e| format!("invalid url: {}", e))
    }
}

pub async fn handle_create_site(
    State(state): State<AppState>,
    Json(req): Json<SiteRequest>,
) -> impl IntoResponse {
    if let Err(e) = req.validate() {
        return (StatusCode::BAD_REQUEST, e).into_response();
    }

    let mut site = Site {
        name: req.name.trim().to_string(),
        url: req.url.trim().to_string(),
        check_interval_minutes: req.check_interval_minutes,
        ..Default::default()
    };

    match state.store.add_site(&mut site) {
        Ok(_) => (StatusCode::CREATED, Json(site)).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_update_site(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<SiteRequest>,
) -> impl IntoResponse {
    if let Err(e) = req.validate() {
        return (StatusCode::BAD_REQUEST, e).into_response();
    }

    // Get existing site
    let mut site = match state.store.get_site(id) {
        Ok(s) => s,
        Err(DbError::NotFound) => return (StatusCode::NOT_FOUND, "Site not found").into_response(),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    site.name = req.name.trim().to_string();
    site.url = req.url.trim().to_string();
    site.check_interval_minutes = req.check_interval_minutes;

    match state.store.update_site(&site) {
        Ok(_) => Json(site).into_response(),
        Err(DbError::NotFound) => (StatusCode::NOT_FOUND, "Site not found").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_delete_site(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.delete_site(id) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Pipeline status
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub sites: usize,
    pub pending_batches: usize,
    pub dead_batches: usize,
    pub flush_lock_held: bool,
    pub check_period_secs: u64,
    pub flush_period_secs: u64,
}

fn pipeline_status(state: &AppState) -> Result<PipelineStatus, DbError> {
    Ok(PipelineStatus {
        sites: state.store.all_sites()?.len(),
        pending_batches: state.buffer.pending_batches()?,
        dead_batches: state.store.dead_batch_count()?,
        flush_lock_held: state.flush.lock().holder()?.is_some(),
        check_period_secs: state.config.checks.check_period().as_secs(),
        flush_period_secs: state.config.checks.flush_period().as_secs(),
    })
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    match pipeline_status(&state) {
        Ok(s) => Json(s).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_healthz() -> impl IntoResponse {
    "ok"
}
