mod admission;
mod config;
mod core;
mod engine;
mod languages;
mod sandbox;
mod server;
mod workspace;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::{BackendKind, ServiceConfig};
use crate::engine::{Pipeline, PipelineSettings};
use crate::languages::LanguageRegistry;
use crate::sandbox::{ContainerBackend, IsolationBackend, SubprocessBackend};
use crate::server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("exec_sandbox=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = ServiceConfig::from_env().context("Invalid configuration")?;

    // Load language configurations
    let languages = match &config.languages_path {
        Some(path) => {
            let registry = LanguageRegistry::load(path)?;
            info!("Loaded language configurations from {}", path.display());
            registry
        }
        None => LanguageRegistry::embedded()?,
    };
    info!("Supported languages: {}", languages.supported().join(", "));

    let backend: Arc<dyn IsolationBackend> = match config.backend {
        BackendKind::Container => {
            let backend = ContainerBackend::connect(config.image.clone())
                .context("Failed to connect to Docker")?;
            backend
                .ensure_ready()
                .await
                .with_context(|| format!("Container backend not ready (image {})", config.image))?;
            Arc::new(backend)
        }
        BackendKind::Subprocess => {
            warn!("Using subprocess isolation: OS limits only, no container boundary");
            warn!(
                "Not enforced by the subprocess backend: {}",
                config.unenforced_limits().join(", ")
            );
            let mut backend = SubprocessBackend::new();
            if let Some(path) = &config.subprocess_path {
                backend = backend.with_path_env(path.clone());
            }
            Arc::new(backend)
        }
    };

    let pipeline = Pipeline::new(backend, PipelineSettings::from_config(&config));
    let port = config.port;
    info!(
        backend = pipeline.backend_name(),
        max_concurrent = config.max_concurrent,
        workspace_root = %config.workspace_root.display(),
        "Sandbox configured"
    );

    let app = server::router(AppState::new(config, pipeline, languages));

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    info!("Execution sandbox listening on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, draining in-flight executions");
}
