use anyhow::Result;
use ct_lesion_service::api::{self, AppState};
use ct_lesion_service::config::{Config, StorageBackend};
use ct_lesion_service::gate::InferenceGate;
use ct_lesion_service::gcs::GcsStore;
use ct_lesion_service::inference::{resolve_device, Segmenter, SharedModel};
use ct_lesion_service::metrics;
use ct_lesion_service::pipeline::Pipeline;
use ct_lesion_service::storage::{MemoryStore, ObjectStore};
use std::sync::Arc;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn build_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    let storage = &config.storage_config;
    match storage.backend {
        StorageBackend::Gcs => {
            let store = GcsStore::new(storage)?;
            // Credentials are retried on first upload if they are not mounted yet.
            if let Err(e) = store.credentials() {
                tracing::warn!("Storage credentials unavailable at startup: {}", e);
            }
            Ok(Arc::new(store))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; overlay URLs will not resolve");
            Ok(Arc::new(MemoryStore::new(storage.bucket.clone())))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    // ONNX Runtime is chatty at info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info").add_directive("ort=warn".parse().unwrap())
            }),
        )
        .init();

    tracing::info!("Starting CT lesion segmentation service...");

    metrics::init_metrics();

    let config = Config::load()?;
    tokio::fs::create_dir_all(&config.scratch_dir).await?;

    let device = resolve_device(config.model_config.device);
    tracing::info!("Inference device: {}", device);

    let model = Arc::new(SharedModel::new(config.model_config.clone(), device));
    let warm = Arc::clone(&model);
    match tokio::task::spawn_blocking(move || warm.warm_up()).await? {
        Ok(()) => tracing::info!("Model ready"),
        Err(e) => tracing::warn!("Model not loaded at startup, will retry per request: {}", e),
    }

    let store = build_store(&config)?;
    let segmenter: Arc<dyn Segmenter> = model;
    let pipeline = Pipeline::new(&config, segmenter, store)?;

    let state = AppState {
        gate: InferenceGate::new(),
        pipeline: Arc::new(pipeline),
        upload_bucket: config.storage_config.upload_bucket.clone(),
        pipeline_timeout: config.pipeline_timeout(),
    };

    let addr = format!("{}:{}", config.api_host, config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 HTTP API listening on http://{}", addr);

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}
