//! HTTP API
//!
//! - `POST /segment`    run the pipeline for `{"image_url": ...}`
//! - `POST /upload-url` signed PUT URL for a new gzipped volume
//! - `GET  /health`     liveness plus gate and model state
//! - `GET  /metrics`    Prometheus text exposition

use crate::error::{Result, SegmentError};
use crate::gate::InferenceGate;
use crate::inference::Device;
use crate::metrics::{self, Timer, SEGMENT_LATENCY, SEGMENT_REQUESTS};
use crate::pipeline::{Pipeline, SegmentationResult};
use crate::storage::public_url;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Lifetime of URLs handed out by `/upload-url`.
pub const UPLOAD_URL_EXPIRY: Duration = Duration::from_secs(60 * 60);
pub const UPLOAD_CONTENT_TYPE: &str = "application/gzip";

#[derive(Clone)]
pub struct AppState {
    pub gate: InferenceGate,
    pub pipeline: Arc<Pipeline>,
    pub upload_bucket: String,
    pub pipeline_timeout: Option<Duration>,
}

#[derive(Debug, Deserialize)]
pub struct SegmentRequest {
    pub image_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadUrlResponse {
    pub url: String,
    #[serde(rename = "publicUrl")]
    pub public_url: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub busy: bool,
    pub model_loaded: bool,
    pub device: Device,
    /// Requests admitted through the gate since startup.
    pub admitted: u64,
    /// Requests turned away with 429 since startup.
    pub rejected: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/segment", post(segment_handler))
        .route("/upload-url", post(upload_url_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn segment_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<SegmentRequest>, JsonRejection>,
) -> Result<Json<SegmentationResult>> {
    let timer = Timer::new();
    let outcome = run_segment(&state, payload).await;

    match &outcome {
        Ok(_) => {
            SEGMENT_REQUESTS.with_label_values(&["success"]).inc();
            timer.observe_duration_seconds(&SEGMENT_LATENCY);
        }
        Err(SegmentError::Busy) => {
            SEGMENT_REQUESTS.with_label_values(&["busy"]).inc();
            info!("Rejected /segment: inference gate is held");
        }
        Err(e) => {
            SEGMENT_REQUESTS.with_label_values(&[e.kind()]).inc();
            error!(error = %e, kind = e.kind(), latency_ms = timer.elapsed_ms(), "Segmentation failed");
        }
    }

    outcome.map(Json)
}

async fn run_segment(
    state: &AppState,
    payload: std::result::Result<Json<SegmentRequest>, JsonRejection>,
) -> Result<SegmentationResult> {
    let Json(request) = payload.map_err(|e| SegmentError::InvalidRequest(e.body_text()))?;

    let guard = state.gate.try_acquire()?;
    let pipeline = Arc::clone(&state.pipeline);
    let handle = tokio::spawn(async move {
        // The guard lives as long as the pipeline, not the connection.
        let _guard = guard;
        pipeline.run(&request.image_url).await
    });

    let joined = match state.pipeline_timeout {
        Some(limit) => tokio::time::timeout(limit, handle)
            .await
            .map_err(|_| SegmentError::Timeout(limit.as_secs()))?,
        None => handle.await,
    };
    joined?
}

async fn upload_url_handler(State(state): State<AppState>) -> Result<Json<UploadUrlResponse>> {
    let object = format!("{}.gz", uuid::Uuid::new_v4());
    let store = state.pipeline.store();

    let url = store
        .signed_put_url(&state.upload_bucket, &object, UPLOAD_CONTENT_TYPE, UPLOAD_URL_EXPIRY)
        .await
        .map_err(|e| {
            warn!(error = %e, "Failed to issue signed upload URL");
            e
        })?;

    info!(bucket = %state.upload_bucket, object = %object, "Issued signed upload URL");
    Ok(Json(UploadUrlResponse {
        url,
        public_url: public_url(&state.upload_bucket, &object),
    }))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let segmenter = state.pipeline.segmenter();
    let stats = state.gate.get_stats();
    Json(HealthResponse {
        status: "ok".to_string(),
        busy: stats.busy,
        model_loaded: segmenter.is_ready(),
        device: segmenter.device(),
        admitted: stats.admitted,
        rejected: stats.rejected,
    })
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::export_metrics(),
    )
}
