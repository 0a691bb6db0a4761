use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub static_dir: String,
    pub static_url: String,
    pub media_url: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Image field service with thumbnails and static fallbacks")]
pub struct Args {
    /// Host to bind to (overrides IMAGE_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides IMAGE_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where uploads and thumbnails are stored (overrides IMAGE_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides IMAGE_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Directory holding statically-served fallback assets (overrides IMAGE_STORE_STATIC_DIR)
    #[arg(long)]
    pub static_dir: Option<String>,

    /// Public URL prefix of the static assets (overrides IMAGE_STORE_STATIC_URL)
    #[arg(long)]
    pub static_url: Option<String>,

    /// Public URL prefix of uploaded files (overrides IMAGE_STORE_MEDIA_URL)
    #[arg(long)]
    pub media_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("IMAGE_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("IMAGE_STORE_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing IMAGE_STORE_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading IMAGE_STORE_PORT"),
        };
        let env_storage =
            env::var("IMAGE_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/media".into());
        let env_db = env::var("IMAGE_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/image_store.db".into());
        let env_static_dir =
            env::var("IMAGE_STORE_STATIC_DIR").unwrap_or_else(|_| "./static".into());
        let env_static_url =
            env::var("IMAGE_STORE_STATIC_URL").unwrap_or_else(|_| "/static".into());
        let env_media_url = env::var("IMAGE_STORE_MEDIA_URL").unwrap_or_else(|_| "/media".into());

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            static_dir: args.static_dir.unwrap_or(env_static_dir),
            static_url: args.static_url.unwrap_or(env_static_url),
            media_url: args.media_url.unwrap_or(env_media_url),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
