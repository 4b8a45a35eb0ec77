//! Leaf disease classification server
//!
//! HTTP API in front of the inference pipeline: image upload and
//! classification, health reporting, model reload and optional static UI.

mod error;
mod routes;
mod state;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use leaf_core::cli::setup_logging;
use leaf_core::{LoadPolicy, ServiceConfig};
use leaf_inference::InferenceService;
use tracing::{info, warn};

use crate::state::AppState;

/// Configuration file read when `--config` is not given
const DEFAULT_CONFIG: &str = "leaf.toml";

/// Leaf disease classification server
#[derive(Parser, Debug)]
#[command(name = "leaf-server")]
#[command(version)]
#[command(about = "HTTP API for leaf disease classification")]
struct Cli {
    /// Service configuration file
    #[arg(short, long, env = "LEAF_CONFIG")]
    config: Option<PathBuf>,

    /// Model manifest
    #[arg(long, env = "LEAF_MANIFEST")]
    manifest: Option<PathBuf>,

    /// Host to bind to
    #[arg(long, env = "LEAF_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "LEAF_PORT")]
    port: Option<u16>,

    /// When to load the model: eager or lazy
    #[arg(long, env = "LEAF_LOAD_POLICY")]
    load_policy: Option<LoadPolicy>,

    /// Directory served at `/`
    #[arg(long, env = "LEAF_STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// Log filter, e.g. `info` or `leaf_inference=debug`
    #[arg(long, env = "LEAF_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// File configuration with command line and environment values on top.
    fn into_config(self) -> anyhow::Result<ServiceConfig> {
        let mut config = match &self.config {
            Some(path) => ServiceConfig::load(path)?,
            None if Path::new(DEFAULT_CONFIG).is_file() => {
                ServiceConfig::load(Path::new(DEFAULT_CONFIG))?
            }
            None => ServiceConfig::default(),
        };

        if let Some(manifest) = self.manifest {
            config.manifest = manifest;
        }
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(load_policy) = self.load_policy {
            config.load_policy = load_policy;
        }
        if let Some(static_dir) = self.static_dir {
            config.server.static_dir = Some(static_dir);
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }

        Ok(config.validate()?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;
    let config = cli.into_config()?;

    setup_logging(&config.logging.level, verbose)?;

    info!("Leaf disease server v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Manifest:    {:?}", config.manifest);
    info!("  Load policy: {}", config.load_policy);
    info!(
        "  Calibration: {:?} (threshold {})",
        config.calibration.strategy, config.calibration.threshold
    );
    info!("  Max upload:  {} bytes", config.upload.max_bytes);

    let service = InferenceService::from_config(&config)
        .with_context(|| format!("Failed to initialise service from {:?}", config.manifest))?;

    if config.load_policy == LoadPolicy::Eager {
        service
            .model()
            .load()
            .await
            .context("Failed to load model at startup")?;
    }

    if let Some(dir) = &config.server.static_dir {
        if !dir.is_dir() {
            warn!("Static directory {:?} does not exist", dir);
        }
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let state = Arc::new(AppState::new(service, config));
    let app = routes::build_router(state);

    info!("Starting server on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {err}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
