use anyhow::Result;
use axum::Router;
use std::{fs, io::ErrorKind, path::Path};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod client;
mod config;
mod errors;
mod handlers;
mod models;
mod multipart;
mod routes;
mod services;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + subcommand ---
    let (cfg, command) = config::AppConfig::from_env_and_args()?;

    if let Some(config::Command::Upload {
        server,
        owner,
        parent_path,
        path_in_view,
        files,
    }) = command
    {
        return run_upload(&server, &owner, &parent_path, &path_in_view, &files).await;
    }

    tracing::info!("Starting cloud-uploads with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize core services ---
    let state = services::AppState::new(&cfg.storage_dir);
    spawn_sweeper(state.chunks.clone(), &cfg);

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodically remove upload directories abandoned for longer than the retention window.
fn spawn_sweeper(chunks: services::chunk_service::ChunkService, cfg: &config::AppConfig) {
    let retention = cfg.chunk_retention;
    let mut ticker = tokio::time::interval(cfg.sweep_interval);
    tokio::spawn(async move {
        loop {
            ticker.tick().await;
            match chunks.sweep_stale(retention).await {
                Ok(0) => {}
                Ok(removed) => tracing::info!("swept {} abandoned uploads", removed),
                Err(err) => tracing::error!("sweeping abandoned uploads failed: {}", err),
            }
        }
    });
}

async fn run_upload(
    server: &str,
    owner: &str,
    parent_path: &str,
    path_in_view: &str,
    files: &[std::path::PathBuf],
) -> Result<()> {
    let mut orchestrator = client::UploadOrchestrator::new(server, owner);
    let reports = orchestrator
        .upload_batch(files, parent_path, path_in_view)
        .await;

    let failed = reports.iter().filter(|r| !r.is_success()).count();
    for report in &reports {
        match &report.result {
            Ok(mode) => println!("ok      {} ({:?})", report.path.display(), mode),
            Err(err) => println!("failed  {}: {}", report.path.display(), err),
        }
    }
    let listing = orchestrator.listing();
    println!(
        "{} now holds {} files and {} directories",
        path_in_view,
        listing.files.len(),
        listing.directories.len()
    );

    if failed > 0 {
        anyhow::bail!("{} of {} uploads failed", failed, reports.len());
    }
    Ok(())
}
