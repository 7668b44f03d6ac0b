//! Inference Execution Module
//!
//! Runs the classifier's forward pass on tokio's blocking pool so the
//! request-handling runtime stays responsive, and turns the raw probability
//! vector into a ranked label.
//!
//! Architecture:
//! - One shared model instance, no batching
//! - In-flight forward passes bounded by a semaphore
//! - Optional per-call deadline

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::InferenceConfig;
use crate::metrics;
use crate::model::ModelHandle;
use crate::preprocess::ImageTensor;

/// Class names in model output order. This ordering is fixed by the trained
/// artifact and must not be changed independently of it.
pub const LABELS: [&str; 3] = ["Semilooper", "Spodoptera", "Healthy Leaf"];

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Model is not loaded")]
    ModelUnavailable,

    #[error("Inference execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Inference timed out after {0:?}")]
    Timeout(Duration),

    #[error("Model returned {actual} scores, expected {expected}")]
    OutputMismatch { expected: usize, actual: usize },

    #[error("Inference worker stopped: {0}")]
    WorkerFailed(String),
}

pub type Result<T> = std::result::Result<T, InferenceError>;

// ============================================================================
// Prediction
// ============================================================================

/// Ranked model output
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub label: &'static str,
    pub index: usize,
    pub probabilities: Vec<f32>,
    /// Arg-max probability as a percentage, for diagnostics only
    #[serde(skip)]
    pub confidence: f32,
}

impl Prediction {
    /// Pick the arg-max class. Ties resolve to the lowest index.
    pub fn from_probabilities(probabilities: Vec<f32>) -> Result<Self> {
        if probabilities.len() != LABELS.len() {
            return Err(InferenceError::OutputMismatch {
                expected: LABELS.len(),
                actual: probabilities.len(),
            });
        }

        let mut index = 0;
        for (i, p) in probabilities.iter().enumerate() {
            if *p > probabilities[index] {
                index = i;
            }
        }

        Ok(Self {
            label: LABELS[index],
            index,
            confidence: probabilities[index] * 100.0,
            probabilities,
        })
    }

    /// `Label: 12.34%` for every class, in output order
    pub fn breakdown(&self) -> Vec<String> {
        LABELS
            .iter()
            .zip(&self.probabilities)
            .map(|(label, p)| format!("{}: {:.2}%", label, p * 100.0))
            .collect()
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Dispatches forward passes off the async runtime
pub struct InferenceExecutor {
    model: Arc<ModelHandle>,
    permits: Arc<Semaphore>,
    timeout: Option<Duration>,
}

impl InferenceExecutor {
    pub fn new(model: Arc<ModelHandle>, config: &InferenceConfig) -> Self {
        Self {
            model,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            timeout: config.timeout,
        }
    }

    /// Run the model on `tensor` and return one probability per label.
    ///
    /// The scores are passed through unchanged: the model is expected to end
    /// in a softmax.
    pub async fn predict(&self, tensor: ImageTensor) -> Result<Vec<f32>> {
        let classifier = self
            .model
            .classifier()
            .await
            .ok_or(InferenceError::ModelUnavailable)?;

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| InferenceError::WorkerFailed(e.to_string()))?;

        let start = Instant::now();
        // The permit moves into the worker so it is held until the forward
        // pass really ends, even if the caller stops waiting on a timeout.
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            classifier.predict(&tensor)
        });

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(timeout = ?limit, "Inference exceeded deadline");
                    return Err(InferenceError::Timeout(limit));
                }
            },
            None => task.await,
        };

        let scores = joined
            .map_err(|e| InferenceError::WorkerFailed(e.to_string()))?
            .map_err(|e| InferenceError::ExecutionFailed(format!("{:#}", e)))?;

        let elapsed = start.elapsed();
        metrics::INFERENCE_LATENCY.observe(elapsed.as_secs_f64());
        debug!(latency_ms = elapsed.as_millis() as u64, "Forward pass complete");

        if scores.len() != LABELS.len() {
            return Err(InferenceError::OutputMismatch {
                expected: LABELS.len(),
                actual: scores.len(),
            });
        }

        Ok(scores)
    }

    /// Slots currently free for new forward passes
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Classifier, InputShape, ModelLoader};
    use crate::preprocess::{normalize, TargetSize};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::path::Path;
    use tempfile::NamedTempFile;

    /// Softmax over the mean channel intensities: deterministic, input-dependent
    struct MeanSoftmax {
        delay: Duration,
        outputs: usize,
    }

    impl Classifier for MeanSoftmax {
        fn input_shape(&self) -> InputShape {
            InputShape::from_nhwc(&[-1, 224, 224, 3])
        }

        fn output_len(&self) -> Option<usize> {
            Some(self.outputs)
        }

        fn predict(&self, tensor: &ImageTensor) -> anyhow::Result<Vec<f32>> {
            std::thread::sleep(self.delay);
            let view = tensor.view();
            let pixels = (view.len() / 3) as f32;
            let mut sums = vec![0.0f32; self.outputs];
            for ((_, _, _, c), v) in view.indexed_iter() {
                if c < self.outputs {
                    sums[c] += v;
                }
            }
            let exp: Vec<f32> = sums.iter().map(|s| (s / pixels).exp()).collect();
            let total: f32 = exp.iter().sum();
            Ok(exp.into_iter().map(|e| e / total).collect())
        }
    }

    struct StaticLoader(Arc<MeanSoftmax>);

    impl ModelLoader for StaticLoader {
        fn load(&self, _path: &Path) -> anyhow::Result<Arc<dyn Classifier>> {
            Ok(self.0.clone())
        }
    }

    fn test_tensor(color: [u8; 3]) -> ImageTensor {
        let img = RgbImage::from_pixel(224, 224, Rgb(color));
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        normalize(&buf, TargetSize::default()).unwrap()
    }

    async fn loaded_executor(
        model: MeanSoftmax,
        config: InferenceConfig,
    ) -> (InferenceExecutor, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let handle = Arc::new(ModelHandle::new(
            file.path(),
            Arc::new(StaticLoader(Arc::new(model))),
        ));
        assert!(handle.ensure_loaded().await.ok);
        (InferenceExecutor::new(handle, &config), file)
    }

    #[test]
    fn test_prediction_picks_argmax() {
        let prediction = Prediction::from_probabilities(vec![0.1, 0.7, 0.2]).unwrap();

        assert_eq!(prediction.index, 1);
        assert_eq!(prediction.label, "Spodoptera");
        assert!((prediction.confidence - 70.0).abs() < 1e-4);
        assert_eq!(prediction.breakdown()[2], "Healthy Leaf: 20.00%");
    }

    #[test]
    fn test_prediction_tie_resolves_to_first_class() {
        let prediction = Prediction::from_probabilities(vec![0.4, 0.4, 0.2]).unwrap();
        assert_eq!(prediction.index, 0);
        assert_eq!(prediction.label, "Semilooper");
    }

    #[test]
    fn test_prediction_rejects_wrong_cardinality() {
        let err = Prediction::from_probabilities(vec![0.5, 0.5]).unwrap_err();
        assert!(matches!(
            err,
            InferenceError::OutputMismatch { expected: 3, actual: 2 }
        ));
    }

    #[test]
    fn test_confidence_is_not_serialized() {
        let prediction = Prediction::from_probabilities(vec![0.1, 0.2, 0.7]).unwrap();
        let json = serde_json::to_value(&prediction).unwrap();

        assert_eq!(json["label"], "Healthy Leaf");
        assert_eq!(json["index"], 2);
        assert!(json.get("confidence").is_none());
    }

    #[tokio::test]
    async fn test_predict_returns_distribution_over_labels() {
        let model = MeanSoftmax {
            delay: Duration::ZERO,
            outputs: 3,
        };
        let (executor, _file) = loaded_executor(model, InferenceConfig::default()).await;

        let probs = executor.predict(test_tensor([100, 150, 200])).await.unwrap();

        assert_eq!(probs.len(), 3);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 0.01);
        assert_eq!(executor.available_permits(), 4);
    }

    #[tokio::test]
    async fn test_predict_is_deterministic() {
        let model = MeanSoftmax {
            delay: Duration::ZERO,
            outputs: 3,
        };
        let (executor, _file) = loaded_executor(model, InferenceConfig::default()).await;

        let first = executor.predict(test_tensor([10, 20, 30])).await.unwrap();
        let second = executor.predict(test_tensor([10, 20, 30])).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_predict_without_model_is_unavailable() {
        let handle = Arc::new(ModelHandle::onnx("/nonexistent/model.onnx", 0));
        let executor = InferenceExecutor::new(handle, &InferenceConfig::default());

        let err = executor.predict(test_tensor([0, 0, 0])).await.unwrap_err();
        assert!(matches!(err, InferenceError::ModelUnavailable));
    }

    #[tokio::test]
    async fn test_predict_times_out() {
        let model = MeanSoftmax {
            delay: Duration::from_millis(300),
            outputs: 3,
        };
        let config = InferenceConfig {
            max_concurrent: 1,
            timeout: Some(Duration::from_millis(20)),
            intra_threads: 0,
        };
        let (executor, _file) = loaded_executor(model, config).await;

        let err = executor.predict(test_tensor([1, 2, 3])).await.unwrap_err();
        assert!(matches!(err, InferenceError::Timeout(_)));
        // The abandoned forward pass still owns its slot
        assert_eq!(executor.available_permits(), 0);
    }

    #[tokio::test]
    async fn test_predict_rejects_unexpected_output_length() {
        let model = MeanSoftmax {
            delay: Duration::ZERO,
            outputs: 2,
        };
        let (executor, _file) = loaded_executor(model, InferenceConfig::default()).await;

        let err = executor.predict(test_tensor([5, 5, 5])).await.unwrap_err();
        assert!(matches!(err, InferenceError::OutputMismatch { actual: 2, .. }));
    }
}
