use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Request metrics
    pub static ref PREDICTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("predictions_total", "Total number of successful predictions by label"),
        &["label"]
    ).unwrap();

    pub static ref REQUEST_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("predict_errors_total", "Total number of rejected or failed prediction requests"),
        &["kind"]
    ).unwrap();

    // Latency metrics (in seconds)
    pub static ref PREPROCESS_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "preprocess_duration_seconds",
            "Image decode and normalization latency in seconds"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0])
    ).unwrap();

    pub static ref INFERENCE_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "inference_duration_seconds",
            "Model forward pass latency in seconds"
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
    ).unwrap();

    // Model metrics
    pub static ref MODEL_LOADED: IntGauge = IntGauge::new(
        "model_loaded",
        "1 when the classifier is loaded, 0 otherwise"
    ).unwrap();

    pub static ref MODEL_LOAD_ATTEMPTS: IntCounterVec = IntCounterVec::new(
        Opts::new("model_load_attempts_total", "Model load attempts by outcome"),
        &["outcome"]
    ).unwrap();
}

static INIT: Once = Once::new();

/// Initialize metrics registry. Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY.register(Box::new(PREDICTIONS_TOTAL.clone())).unwrap();
        REGISTRY.register(Box::new(REQUEST_ERRORS.clone())).unwrap();

        REGISTRY.register(Box::new(PREPROCESS_LATENCY.clone())).unwrap();
        REGISTRY.register(Box::new(INFERENCE_LATENCY.clone())).unwrap();

        REGISTRY.register(Box::new(MODEL_LOADED.clone())).unwrap();
        REGISTRY.register(Box::new(MODEL_LOAD_ATTEMPTS.clone())).unwrap();

        tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
    });
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        let duration = self.start.elapsed();
        histogram.observe(duration.as_secs_f64());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_repeatable_and_exports() {
        init_metrics();
        init_metrics();

        PREDICTIONS_TOTAL.with_label_values(&["Spodoptera"]).inc();
        let text = export_metrics();

        assert!(text.contains("predictions_total"));
        assert!(text.contains("label=\"Spodoptera\""));
    }

    #[test]
    fn test_timer_records_observation() {
        let before = PREPROCESS_LATENCY.get_sample_count();
        Timer::new().observe_duration_seconds(&PREPROCESS_LATENCY);
        assert!(PREPROCESS_LATENCY.get_sample_count() > before);
    }
}
