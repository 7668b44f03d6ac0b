//! HTTP API
//!
//! `/predict` runs the full pipeline for one uploaded image:
//! readiness gate → upload validation → normalization → inference → response.
//! Every failure is mapped to a status code by [`ApiError`].

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::InferenceConfig;
use crate::error::ApiError;
use crate::inference::{InferenceExecutor, Prediction, LABELS};
use crate::metrics::{self, Timer};
use crate::model::{LoadError, LoadState, ModelHandle};
use crate::preprocess::{normalize, TargetSize};

/// Largest accepted image upload (20 MiB)
pub const MAX_FILE_SIZE: usize = 20 * 1024 * 1024;

/// Request body cap. Leaves room for multipart framing so an oversized file
/// is still answered with 413 by the upload check.
const BODY_LIMIT: usize = MAX_FILE_SIZE + 1024 * 1024;

/// Shared per-process state: the model handle and its executor
pub struct AppState {
    pub model: Arc<ModelHandle>,
    pub executor: InferenceExecutor,
}

impl AppState {
    pub fn new(model: Arc<ModelHandle>, config: &InferenceConfig) -> Self {
        let executor = InferenceExecutor::new(model.clone(), config);
        Self { model, executor }
    }
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictResponse {
    pub label: String,
    pub index: usize,
    pub probabilities: Vec<f32>,
}

impl From<Prediction> for PredictResponse {
    fn from(p: Prediction) -> Self {
        Self {
            label: p.label.to_string(),
            index: p.index,
            probabilities: p.probabilities,
        }
    }
}

pub fn create_router(state: SharedState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/predict", post(predict_handler))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(allowed_origins))
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_origin = if allowed_origins.iter().any(|o| o == "*") {
        // Credentialed CORS forbids a literal wildcard
        AllowOrigin::mirror_request()
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(origin = %o, error = %e, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_credentials(true)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
}

/// GET /health - Liveness; independent of model state
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// GET /ready - Model readiness. Reports state only, never loads.
async fn ready_handler(State(state): State<SharedState>) -> Response {
    let status = state.model.status().await;
    match status.state {
        LoadState::Loaded => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "input_shape": status.input_shape,
                "output_classes": status.output_classes,
                "labels": LABELS,
            })),
        )
            .into_response(),
        LoadState::Unloaded | LoadState::Failed => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unavailable",
                "detail": status.last_error.unwrap_or_else(|| "Model not loaded".to_string()),
            })),
        )
            .into_response(),
    }
}

/// GET /metrics - Prometheus text format
async fn metrics_handler() -> String {
    metrics::export_metrics()
}

/// POST /predict - Classify one uploaded image
async fn predict_handler(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    if !state.model.is_loaded().await {
        info!("⏳ Attempting to load model on-demand...");
        let outcome = state.model.ensure_loaded().await;
        if !outcome.ok {
            let err = outcome
                .error
                .unwrap_or_else(|| LoadError::Failed("Model not loaded".to_string()));
            return Err(err.into());
        }
        info!("✅ Model loaded on-demand");
    }

    let mut multipart = multipart.map_err(|e| {
        debug!(error = %e, "Request is not a multipart upload");
        ApiError::MissingFile
    })?;
    let upload = read_image_field(&mut multipart).await?;

    info!(
        "📸 Processing image: {} ({:.2} KB)",
        upload.file_name,
        upload.bytes.len() as f64 / 1024.0
    );

    let target = TargetSize::for_model(state.model.input_shape().await.as_ref());
    let timer = Timer::new();
    let bytes = upload.bytes;
    let tensor = tokio::task::spawn_blocking(move || normalize(&bytes, target))
        .await
        .map_err(|e| ApiError::InferenceFailure(format!("Preprocessing task failed: {}", e)))??;
    timer.observe_duration_seconds(&metrics::PREPROCESS_LATENCY);
    info!("   Preprocessed shape: {:?}", tensor.shape());

    info!("🤖 Running prediction...");
    let probabilities = state.executor.predict(tensor).await?;
    let prediction = Prediction::from_probabilities(probabilities)?;

    info!("✅ Prediction complete!");
    info!(
        "   Predicted: {} (index: {})",
        prediction.label, prediction.index
    );
    info!("   Confidence: {:.2}%", prediction.confidence);
    info!("   All probabilities: {:?}", prediction.breakdown());
    metrics::PREDICTIONS_TOTAL
        .with_label_values(&[prediction.label])
        .inc();

    Ok(Json(prediction.into()))
}

struct Upload {
    file_name: String,
    bytes: Vec<u8>,
}

/// Read the `file` part. The content type is checked from the part headers
/// before any of its body is read.
async fn read_image_field(multipart: &mut Multipart) -> Result<Upload, ApiError> {
    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }

        match field.content_type() {
            Some(ct) if ct.starts_with("image/") => {}
            other => {
                return Err(ApiError::InvalidContentType(
                    other.unwrap_or("None").to_string(),
                ))
            }
        }

        let file_name = field.file_name().unwrap_or("upload").to_string();
        let mut bytes = Vec::new();
        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            if bytes.len() + chunk.len() > MAX_FILE_SIZE {
                return Err(ApiError::PayloadTooLarge {
                    limit_bytes: MAX_FILE_SIZE,
                });
            }
            bytes.extend_from_slice(&chunk);
        }

        return Ok(Upload { file_name, bytes });
    }

    Err(ApiError::MissingFile)
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge {
            limit_bytes: MAX_FILE_SIZE,
        }
    } else {
        ApiError::MalformedUpload(err.body_text())
    }
}
