//! ChunkFlow -- resumable chunked-upload coordination service.
//!
//! Startup wires the three pluggable layers (session store, object-store
//! gateway, metadata store) from config, spawns the orphan-reconciliation
//! sweep, and serves the upload API. SIGTERM/SIGINT handlers stop
//! accepting connections and wait for in-flight requests before exiting.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

/// Command-line arguments for the ChunkFlow server.
#[derive(Parser, Debug)]
#[command(
    name = "chunkflow",
    version,
    about = "Resumable chunked-upload coordination service"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "chunkflow.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = chunkflow::config::load_config(&cli.config)?;

    // Initialize tracing / logging.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    // Initialize Prometheus metrics recorder and register metric descriptions.
    if config.observability.metrics {
        chunkflow::metrics::init_metrics();
        chunkflow::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    // Ephemeral session store.
    let session_ttl = Duration::from_secs(config.session.ttl_seconds);
    let sessions: Arc<dyn chunkflow::session::store::SessionStore> =
        match config.session.backend.as_str() {
            "sqlite" => {
                let path = &config.session.sqlite_path;
                if let Some(parent) = std::path::Path::new(path).parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let store = chunkflow::session::sqlite::SqliteSessionStore::new(
                    path,
                    config.session.ttl_seconds,
                )?;
                info!("SQLite session store initialized at {}", path);
                Arc::new(store)
            }
            "memory" => {
                info!("In-memory session store initialized (ttl={:?})", session_ttl);
                Arc::new(chunkflow::session::memory::MemorySessionStore::new(
                    session_ttl,
                ))
            }
            other => anyhow::bail!("Unknown session backend: {other}"),
        };

    // Object-store gateway.
    let mut public_location = None;
    let gateway: Arc<dyn chunkflow::gateway::backend::ObjectGateway> =
        match config.gateway.backend.as_str() {
            "aws" => {
                let aws = config.gateway.aws.as_ref().ok_or_else(|| {
                    anyhow::anyhow!(
                        "gateway.backend is 'aws' but gateway.aws config section is missing"
                    )
                })?;
                let backend = chunkflow::gateway::aws::AwsGateway::new(
                    aws.bucket.clone(),
                    aws.region.clone(),
                    (!aws.endpoint_url.is_empty()).then(|| aws.endpoint_url.clone()),
                    aws.use_path_style,
                    (!aws.access_key_id.is_empty()).then(|| aws.access_key_id.clone()),
                    (!aws.secret_access_key.is_empty()).then(|| aws.secret_access_key.clone()),
                )
                .await?;
                info!(
                    "AWS gateway initialized: bucket={} region={}",
                    aws.bucket, aws.region
                );
                public_location = Some((aws.bucket.clone(), aws.region.clone()));
                Arc::new(backend)
            }
            "memory" => {
                info!("In-memory object gateway initialized");
                Arc::new(chunkflow::gateway::memory::MemoryGateway::new())
            }
            other => anyhow::bail!("Unknown gateway backend: {other}"),
        };

    // Durable metadata store.
    let metadata: Arc<dyn chunkflow::metadata::store::MetadataStore> =
        match config.metadata.engine.as_str() {
            "sqlite" => {
                let path = &config.metadata.sqlite.path;
                if let Some(parent) = std::path::Path::new(path).parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let store = chunkflow::metadata::sqlite::SqliteMetadataStore::new(path)?;
                info!("SQLite metadata store initialized at {}", path);
                Arc::new(store)
            }
            "memory" => {
                info!("In-memory metadata store initialized");
                Arc::new(chunkflow::metadata::memory::MemoryMetadataStore::new())
            }
            other => anyhow::bail!("Unknown metadata engine: {other}"),
        };

    let mut coordinator = chunkflow::coordinator::UploadCoordinator::new(
        sessions,
        gateway,
        metadata,
        config.upload.max_retries,
        Duration::from_millis(config.upload.retry_delay_ms),
    );
    if let Some((bucket, region)) = public_location {
        coordinator = coordinator.with_public_location(&bucket, &region);
    }
    let coordinator = Arc::new(coordinator);

    // Periodic sweep for sessions abandoned past their TTL.
    let sweep_interval = config.session.sweep_interval_seconds;
    if sweep_interval > 0 {
        let sweeper = coordinator.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(sweep_interval));
            // The first tick fires immediately; skip it so startup stays quiet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match sweeper.reconcile_orphans().await {
                    Ok(0) => {}
                    Ok(reaped) => info!("Reconciliation sweep reaped {} stale sessions", reaped),
                    Err(e) => error!("Reconciliation sweep failed: {}", e),
                }
            }
        });
        info!(
            "Orphan reconciliation sweep scheduled every {}s",
            sweep_interval
        );
    }

    let state = Arc::new(chunkflow::AppState {
        config: config.clone(),
        coordinator,
    });

    let app = chunkflow::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("ChunkFlow listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("ChunkFlow shut down");

    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
