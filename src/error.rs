use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::inference::InferenceError;
use crate::model::LoadError;
use crate::preprocess::DecodeError;

/// Every way a prediction request can end without a prediction
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Model not loaded: {0}")]
    ModelNotFound(String),

    #[error("Model not loaded: {0}")]
    ModelLoadFailed(String),

    #[error("Invalid file type: {0}. Must be an image.")]
    InvalidContentType(String),

    #[error("{0}")]
    Decode(#[from] DecodeError),

    #[error("File too large. Maximum size is {:.1} MB", megabytes(.limit_bytes))]
    PayloadTooLarge { limit_bytes: usize },

    #[error("Invalid upload: {0}")]
    MalformedUpload(String),

    #[error("Field 'file' is required")]
    MissingFile,

    #[error("Prediction failed: {0}")]
    InferenceFailure(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::ModelNotFound(_) | ApiError::ModelLoadFailed(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::InvalidContentType(_)
            | ApiError::Decode(_)
            | ApiError::MalformedUpload(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::MissingFile => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::InferenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::ModelNotFound(_) => "model_not_found",
            ApiError::ModelLoadFailed(_) => "model_load_failed",
            ApiError::InvalidContentType(_) => "invalid_content_type",
            ApiError::Decode(_) => "decode_error",
            ApiError::PayloadTooLarge { .. } => "payload_too_large",
            ApiError::MalformedUpload(_) => "malformed_upload",
            ApiError::MissingFile => "missing_file",
            ApiError::InferenceFailure(_) => "inference_failure",
        }
    }
}

fn megabytes(bytes: &usize) -> f64 {
    *bytes as f64 / (1024.0 * 1024.0)
}

impl From<LoadError> for ApiError {
    fn from(err: LoadError) -> Self {
        match err {
            LoadError::NotFound(_) => ApiError::ModelNotFound(err.to_string()),
            LoadError::Failed(msg) => ApiError::ModelLoadFailed(msg),
        }
    }
}

impl From<InferenceError> for ApiError {
    fn from(err: InferenceError) -> Self {
        match err {
            // The model was unloaded between the readiness gate and the call
            InferenceError::ModelUnavailable => ApiError::ModelLoadFailed(err.to_string()),
            other => ApiError::InferenceFailure(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), "❌ {}", self);
        } else {
            tracing::warn!(kind = self.kind(), "Rejected request: {}", self);
        }
        crate::metrics::REQUEST_ERRORS
            .with_label_values(&[self.kind()])
            .inc();
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}
