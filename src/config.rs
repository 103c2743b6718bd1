use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{env, path::PathBuf, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    /// Upload directories untouched for longer than this are swept.
    pub chunk_retention: Duration,
    pub sweep_interval: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked upload and streaming file service")]
pub struct Args {
    /// Host to bind to (overrides CLOUD_UPLOADS_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CLOUD_UPLOADS_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root directory for user files and transient chunks (overrides CLOUD_UPLOADS_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Age in seconds after which abandoned uploads are removed
    /// (overrides CLOUD_UPLOADS_CHUNK_RETENTION_SECS)
    #[arg(long)]
    pub chunk_retention_secs: Option<u64>,

    /// Seconds between sweeps of abandoned uploads
    /// (overrides CLOUD_UPLOADS_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Upload local files to a running server, chunking the large ones.
    Upload {
        /// Base URL of the server, e.g. http://127.0.0.1:8000
        #[arg(long)]
        server: String,

        /// Owner id forwarded in the `x-owner-id` header
        #[arg(long)]
        owner: String,

        /// Destination directory on the server
        #[arg(long, default_value = "/")]
        parent_path: String,

        /// Directory whose listing is returned after each upload
        #[arg(long, default_value = "/")]
        path_in_view: String,

        /// Files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the optional subcommand.
    pub fn from_env_and_args() -> Result<(Self, Option<Command>)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("CLOUD_UPLOADS_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_number("CLOUD_UPLOADS_PORT", 8000u16)?;
        let env_storage =
            env::var("CLOUD_UPLOADS_STORAGE_DIR").unwrap_or_else(|_| "./data/files".into());
        let env_retention = env_number("CLOUD_UPLOADS_CHUNK_RETENTION_SECS", 24 * 60 * 60u64)?;
        let env_sweep = env_number("CLOUD_UPLOADS_SWEEP_INTERVAL_SECS", 60 * 60u64)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            chunk_retention: Duration::from_secs(
                args.chunk_retention_secs.unwrap_or(env_retention),
            ),
            sweep_interval: Duration::from_secs(
                args.sweep_interval_secs.unwrap_or(env_sweep).max(1),
            ),
        };

        Ok((cfg, args.command))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_number<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
