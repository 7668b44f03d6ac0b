pub mod api;
pub mod config;
pub mod error;
pub mod inference;
pub mod metrics;
pub mod model;
pub mod preprocess;

// Re-export commonly used types for easier testing
pub use crate::api::{create_router, AppState, PredictResponse, SharedState, MAX_FILE_SIZE};
pub use crate::config::{Config, InferenceConfig};
pub use crate::error::ApiError;
pub use crate::inference::{InferenceError, InferenceExecutor, Prediction, LABELS};
pub use crate::model::{
    Classifier, InputShape, LoadError, LoadOutcome, ModelHandle, ModelLoader, OnnxLoader,
};
pub use crate::preprocess::{normalize, DecodeError, ImageTensor, TargetSize};
