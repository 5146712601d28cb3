use crate::services::image_transcoder::{
    DEFAULT_MAX_DIMENSION, DEFAULT_QUALITY, OutputFormat, TranscodeOptions,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr};

/// Centralized application configuration.
/// CLI flags override `SHOWCASE_*` environment variables, which override defaults.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Base of the public URLs handed out for stored images.
    pub public_url: String,
    pub transcode: TranscodeOptions,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Build-in-public image and project API")]
pub struct Args {
    /// Host to bind to (overrides SHOWCASE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SHOWCASE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where image blobs are stored (overrides SHOWCASE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides SHOWCASE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public base URL (overrides SHOWCASE_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Longest side of stored images in pixels (overrides SHOWCASE_MAX_DIMENSION)
    #[arg(long)]
    pub max_dimension: Option<u32>,

    /// Encoder quality in (0, 1] (overrides SHOWCASE_QUALITY)
    #[arg(long)]
    pub quality: Option<f32>,

    /// `jpeg` (default) or lossless `webp` (overrides SHOWCASE_OUTPUT_FORMAT)
    #[arg(long)]
    pub output_format: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Parsed value of `name`, or `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {name} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {name}")),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<(Self, bool)> {
        // --- Environment fallback ---
        let env_host = env_or("SHOWCASE_HOST", "0.0.0.0".to_string())?;
        let env_port = env_or("SHOWCASE_PORT", 3000u16)?;
        let env_storage = env_or("SHOWCASE_STORAGE_DIR", "./data/objects".to_string())?;
        let env_db = env_or(
            "SHOWCASE_DATABASE_URL",
            "sqlite://./data/meta/showcase.db".to_string(),
        )?;
        let env_public = env_or("SHOWCASE_PUBLIC_URL", "http://localhost:3000".to_string())?;
        let env_max = env_or("SHOWCASE_MAX_DIMENSION", DEFAULT_MAX_DIMENSION)?;
        let env_quality = env_or("SHOWCASE_QUALITY", DEFAULT_QUALITY)?;
        let env_format = env_or("SHOWCASE_OUTPUT_FORMAT", "jpeg".to_string())?;

        let format_name = args.output_format.unwrap_or(env_format);
        let format = OutputFormat::from_str(&format_name)
            .with_context(|| format!("output format `{format_name}`"))?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            public_url: args.public_url.unwrap_or(env_public),
            transcode: TranscodeOptions {
                max_dimension: args.max_dimension.unwrap_or(env_max),
                quality: args.quality.unwrap_or(env_quality),
                format,
            },
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
