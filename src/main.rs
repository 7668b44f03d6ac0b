use anyhow::Result;
use castor_pest_classifier::{api, config::Config, metrics, model::ModelHandle};
use std::sync::Arc;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with filters
    // ONNX Runtime is chatty at info level during session creation
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,ort=warn,tower_http=info")
            }),
        )
        .init();

    tracing::info!("{}", "=".repeat(60));
    tracing::info!("🚀 Starting Pest Classification API v{}", env!("CARGO_PKG_VERSION"));

    metrics::init_metrics();

    let config = Config::load()?;
    tracing::info!("🌐 Allowed origins: {:?}", config.allowed_origins);
    tracing::info!(
        "🧠 Inference: max {} concurrent, timeout {:?}",
        config.inference_config.max_concurrent,
        config.inference_config.timeout
    );

    // Initialize ONNX Runtime
    if let Err(e) = ort::init()
        .with_name("castor-pest-classifier")
        .with_execution_providers([ort::execution_providers::CPUExecutionProvider::default().build()])
        .commit()
    {
        tracing::warn!("Failed to configure ONNX Runtime environment, using defaults: {}", e);
    }

    let model = Arc::new(ModelHandle::onnx(
        config.model_path.clone(),
        config.inference_config.intra_threads,
    ));
    tracing::info!("📁 Model path: {}", model.path().display());

    // A failed startup load is not fatal: /health stays up and /predict retries
    let outcome = model.ensure_loaded().await;
    if let Some(e) = &outcome.error {
        tracing::error!("❌ ERROR loading model: {}", e);
        tracing::warn!("Serving without a model; it will be loaded on the first prediction request");
    }
    tracing::info!("{}", "=".repeat(60));

    let state = Arc::new(api::AppState::new(model, &config.inference_config));
    let app = api::create_router(state, &config.allowed_origins);

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    tracing::info!("Pest Classification API listening on http://{}", config.bind_addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("{}", "=".repeat(60));
    tracing::info!("👋 Shutting down application...");
    tracing::info!("{}", "=".repeat(60));

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        // Without a signal handler there is nothing to wait for; keep serving
        std::future::pending::<()>().await;
    }
}
