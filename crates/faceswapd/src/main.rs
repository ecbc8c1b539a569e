use anyhow::{Context, Result};
use faceswap_core::OnnxPipeline;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod engine;
mod upload;

use api::AppState;
use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("faceswapd starting");

    let config = Config::from_env();
    config.create_dirs().with_context(|| {
        format!(
            "creating {} and {}",
            config.upload_dir.display(),
            config.output_dir.display()
        )
    })?;

    // Load models synchronously (fail-fast)
    let pipeline = OnnxPipeline::load(&config.model_paths(), config.detection_threshold)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    tracing::info!(model_dir = %config.model_dir.display(), "models loaded");

    let engine = engine::spawn_engine(pipeline)?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("binding {}", config.bind_addr()))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        upload_dir = %config.upload_dir.display(),
        output_dir = %config.output_dir.display(),
        max_upload_bytes = config.max_upload_bytes,
        "faceswapd ready"
    );

    let app = api::router(Arc::new(AppState { engine, config }));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("faceswapd shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
