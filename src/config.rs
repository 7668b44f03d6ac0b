use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Origins allowed to call the API when `ALLOWED_ORIGINS` is not set.
pub const DEFAULT_ALLOWED_ORIGINS: &str =
    "https://castor-pest-classifier.onrender.com,http://localhost:5173,http://localhost:3000";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub model_path: PathBuf,
    pub allowed_origins: Vec<String>,
    pub inference_config: InferenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Upper bound on forward passes running at the same time
    pub max_concurrent: usize,
    /// Per-call deadline; `None` waits for the model indefinitely
    pub timeout: Option<Duration>,
    /// ONNX Runtime intra-op threads (0 lets the runtime decide)
    pub intra_threads: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            timeout: Some(Duration::from_secs(30)),
            intra_threads: 0,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let api_host = env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let api_port = env::var("API_PORT")
            .unwrap_or_else(|_| "8000".to_string())
            .parse()
            .unwrap_or(8000);

        let model_path = env::var("MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("model.onnx"));

        let allowed_origins = parse_origins(
            &env::var("ALLOWED_ORIGINS").unwrap_or_else(|_| DEFAULT_ALLOWED_ORIGINS.to_string()),
        );

        let defaults = InferenceConfig::default();

        let max_concurrent = env::var("MAX_CONCURRENT_INFERENCES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_concurrent);

        // 0 disables the deadline
        let timeout = match env::var("INFERENCE_TIMEOUT_SECS") {
            Ok(v) => {
                let secs: u64 = v
                    .trim()
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid INFERENCE_TIMEOUT_SECS '{}': {}", v, e))?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
            Err(_) => defaults.timeout,
        };

        let intra_threads = env::var("INFERENCE_THREADS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.intra_threads);

        Ok(Self {
            api_host,
            api_port,
            model_path,
            allowed_origins,
            inference_config: InferenceConfig {
                max_concurrent,
                timeout,
                intra_threads,
            },
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
