//! Model Loading Module
//!
//! Owns the single process-wide classifier handle. The frozen ONNX artifact
//! is loaded once (at startup, or lazily on the first request if startup
//! failed) and is read-only afterwards.
//!
//! Load failures are recorded as state instead of being returned as errors,
//! so health and readiness can be queried without forcing another load.

use anyhow::anyhow;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::{Tensor, ValueType};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tracing::{debug, error, info};

use crate::inference::LABELS;
use crate::metrics;
use crate::preprocess::ImageTensor;

// ============================================================================
// Shapes and Backends
// ============================================================================

/// Input shape declared by the model. `None` marks a dynamic or absent dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InputShape {
    pub height: Option<u32>,
    pub width: Option<u32>,
    pub channels: Option<u32>,
}

impl InputShape {
    /// Read an NHWC dimension list as reported by the runtime (`-1` = dynamic).
    pub fn from_nhwc(dims: &[i64]) -> Self {
        if dims.len() < 3 {
            return Self::default();
        }
        let dim = |i: usize| {
            dims.get(i)
                .copied()
                .filter(|d| *d > 0)
                .and_then(|d| u32::try_from(d).ok())
        };
        Self {
            height: dim(1),
            width: dim(2),
            channels: dim(3),
        }
    }

    /// `(height, width)` only when both are known
    pub fn spatial(&self) -> Option<(u32, u32)> {
        match (self.height, self.width) {
            (Some(h), Some(w)) => Some((h, w)),
            _ => None,
        }
    }
}

/// A loaded, inference-only model.
///
/// `predict` is blocking and CPU-bound; callers dispatch it to a worker thread.
pub trait Classifier: Send + Sync {
    fn input_shape(&self) -> InputShape;

    fn output_len(&self) -> Option<usize>;

    fn predict(&self, tensor: &ImageTensor) -> anyhow::Result<Vec<f32>>;
}

/// Deserializes a model artifact into a [`Classifier`].
pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path) -> anyhow::Result<Arc<dyn Classifier>>;
}

/// Loads ONNX artifacts through ONNX Runtime
#[derive(Debug, Clone, Default)]
pub struct OnnxLoader {
    intra_threads: usize,
}

impl OnnxLoader {
    pub fn new(intra_threads: usize) -> Self {
        Self { intra_threads }
    }
}

impl ModelLoader for OnnxLoader {
    fn load(&self, path: &Path) -> anyhow::Result<Arc<dyn Classifier>> {
        Ok(Arc::new(OnnxClassifier::from_file(path, self.intra_threads)?))
    }
}

/// ONNX Runtime session for a single-input, single-output NHWC classifier
pub struct OnnxClassifier {
    // Session::run needs `&mut self`
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    input_shape: InputShape,
    output_len: Option<usize>,
}

impl OnnxClassifier {
    pub fn from_file(path: &Path, intra_threads: usize) -> anyhow::Result<Self> {
        let mut builder =
            Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
        if intra_threads > 0 {
            builder = builder.with_intra_threads(intra_threads)?;
        }
        let session = builder.commit_from_file(path)?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| anyhow!("Model declares no inputs"))?;
        let output = session
            .outputs
            .first()
            .ok_or_else(|| anyhow!("Model declares no outputs"))?;

        let input_shape = match &input.input_type {
            ValueType::Tensor { shape, .. } => InputShape::from_nhwc(shape),
            _ => InputShape::default(),
        };
        let output_len = match &output.output_type {
            ValueType::Tensor { shape, .. } => shape
                .last()
                .copied()
                .filter(|d| *d > 0)
                .map(|d| d as usize),
            _ => None,
        };

        let input_name = input.name.clone();
        let output_name = output.name.clone();

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            input_shape,
            output_len,
        })
    }
}

impl Classifier for OnnxClassifier {
    fn input_shape(&self) -> InputShape {
        self.input_shape
    }

    fn output_len(&self) -> Option<usize> {
        self.output_len
    }

    fn predict(&self, tensor: &ImageTensor) -> anyhow::Result<Vec<f32>> {
        let shape = tensor.shape();
        let input = Tensor::from_array((shape.as_slice(), tensor.to_vec()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("ONNX session lock poisoned"))?;
        let outputs = session.run(ort::inputs![self.input_name.as_str() => input])?;

        let output = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| anyhow!("Output '{}' not found", self.output_name))?;
        let (_, data) = output.try_extract_tensor::<f32>()?;

        Ok(data.to_vec())
    }
}

// ============================================================================
// Model Handle
// ============================================================================

/// Why the last load attempt failed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("Model file not found at {}", .0.display())]
    NotFound(PathBuf),

    #[error("{0}")]
    Failed(String),
}

/// Result of [`ModelHandle::ensure_loaded`]
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOutcome {
    pub ok: bool,
    pub error: Option<LoadError>,
}

impl LoadOutcome {
    fn loaded() -> Self {
        Self { ok: true, error: None }
    }

    fn failed(error: LoadError) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}

/// Load state as exposed to readiness checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Unloaded,
    Loaded,
    Failed,
}

/// Point-in-time view of the handle
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub state: LoadState,
    pub last_error: Option<String>,
    pub input_shape: Option<InputShape>,
    pub output_classes: Option<usize>,
}

enum Slot {
    Unloaded,
    Loaded(Arc<dyn Classifier>),
    Failed(LoadError),
}

/// Process-wide classifier handle with check-then-load semantics
pub struct ModelHandle {
    shared: Arc<Shared>,
}

struct Shared {
    path: PathBuf,
    loader: Arc<dyn ModelLoader>,
    slot: RwLock<Slot>,
    // Serializes load attempts so concurrent first requests load at most once
    load_lock: AsyncMutex<()>,
}

impl ModelHandle {
    pub fn new(path: impl Into<PathBuf>, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            shared: Arc::new(Shared {
                path: path.into(),
                loader,
                slot: RwLock::new(Slot::Unloaded),
                load_lock: AsyncMutex::new(()),
            }),
        }
    }

    /// Handle backed by ONNX Runtime
    pub fn onnx(path: impl Into<PathBuf>, intra_threads: usize) -> Self {
        Self::new(path, Arc::new(OnnxLoader::new(intra_threads)))
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Load the model unless it is already loaded.
    ///
    /// Never fails: the outcome carries the error, which is also kept as the
    /// handle's last error until a later attempt succeeds.
    ///
    /// The attempt runs on its own task. Dropping the returned future stops
    /// the wait, not the load: the lock stays held and the slot is still
    /// written when the artifact is ready.
    pub async fn ensure_loaded(&self) -> LoadOutcome {
        if self.is_loaded().await {
            return LoadOutcome::loaded();
        }

        let shared = self.shared.clone();
        match tokio::spawn(async move { shared.load_once().await }).await {
            Ok(outcome) => outcome,
            Err(e) => LoadOutcome::failed(LoadError::Failed(format!(
                "Model load task failed: {}",
                e
            ))),
        }
    }

    pub async fn is_loaded(&self) -> bool {
        self.shared.is_loaded().await
    }

    /// The loaded classifier, if any. Does not attempt a load.
    pub async fn classifier(&self) -> Option<Arc<dyn Classifier>> {
        match &*self.shared.slot.read().await {
            Slot::Loaded(classifier) => Some(classifier.clone()),
            _ => None,
        }
    }

    /// Declared input shape of the loaded model
    pub async fn input_shape(&self) -> Option<InputShape> {
        self.classifier().await.map(|c| c.input_shape())
    }

    pub async fn last_error(&self) -> Option<LoadError> {
        match &*self.shared.slot.read().await {
            Slot::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }

    pub async fn status(&self) -> ModelStatus {
        let slot = self.shared.slot.read().await;
        match &*slot {
            Slot::Unloaded => ModelStatus {
                state: LoadState::Unloaded,
                last_error: None,
                input_shape: None,
                output_classes: None,
            },
            Slot::Loaded(classifier) => ModelStatus {
                state: LoadState::Loaded,
                last_error: None,
                input_shape: Some(classifier.input_shape()),
                output_classes: classifier.output_len(),
            },
            Slot::Failed(e) => {
                debug!(error = %e, "Model status requested while in failed state");
                ModelStatus {
                    state: LoadState::Failed,
                    last_error: Some(e.to_string()),
                    input_shape: None,
                    output_classes: None,
                }
            }
        }
    }
}

impl Shared {
    async fn is_loaded(&self) -> bool {
        matches!(*self.slot.read().await, Slot::Loaded(_))
    }

    async fn load_once(&self) -> LoadOutcome {
        let _guard = self.load_lock.lock().await;
        // Another request may have finished loading while we waited
        if self.is_loaded().await {
            return LoadOutcome::loaded();
        }

        let started = Instant::now();
        let result = self.load_from_disk().await;
        let mut slot = self.slot.write().await;

        match result {
            Ok(classifier) => {
                let shape = classifier.input_shape();
                info!("{}", "=".repeat(60));
                info!("✅ Model loaded successfully in {:?}", started.elapsed());
                info!(
                    "📊 Model input shape: (batch, {}, {}, {})",
                    fmt_dim(shape.height),
                    fmt_dim(shape.width),
                    fmt_dim(shape.channels)
                );
                info!(
                    "📊 Model output shape: (batch, {})",
                    fmt_dim(classifier.output_len())
                );
                info!("🏷️  Labels: {:?}", LABELS);
                info!("{}", "=".repeat(60));

                metrics::MODEL_LOADED.set(1);
                metrics::MODEL_LOAD_ATTEMPTS.with_label_values(&["success"]).inc();
                *slot = Slot::Loaded(classifier);
                LoadOutcome::loaded()
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "❌ Model failed to load");
                metrics::MODEL_LOADED.set(0);
                metrics::MODEL_LOAD_ATTEMPTS.with_label_values(&["failure"]).inc();
                *slot = Slot::Failed(e.clone());
                LoadOutcome::failed(e)
            }
        }
    }

    async fn load_from_disk(&self) -> Result<Arc<dyn Classifier>, LoadError> {
        info!("📁 Looking for model at: {}", self.path.display());

        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(m) if m.is_file() => m,
            _ => return Err(LoadError::NotFound(self.path.clone())),
        };
        info!(
            "📦 Model file found! Size: {:.2} MB",
            metadata.len() as f64 / (1024.0 * 1024.0)
        );
        info!("⏳ Loading model... (this may take a few seconds)");

        let loader = self.loader.clone();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || loader.load(&path))
            .await
            .map_err(|e| LoadError::Failed(format!("Model load task failed: {}", e)))?
            .map_err(|e| LoadError::Failed(format!("{:#}", e)))
    }
}

fn fmt_dim(dim: Option<impl std::fmt::Display>) -> String {
    dim.map(|d| d.to_string()).unwrap_or_else(|| "None".to_string())
}

// ============================================================================
// Tests
// ============================================================================
