use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub store_dir: String,
    pub tmp_dir: String,
    pub database_url: String,
    pub upload_timeout: Duration,
    pub long_poll_timeout: Duration,
    pub max_chunk_bytes: usize,
    pub post_process: bool,
    pub post_process_timeout: Duration,
    pub mime_program: String,
    pub thumbnail_program: Option<String>,
    pub thumbnail_dir: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked upload service with a content-addressed store")]
pub struct Args {
    /// Host to bind to (overrides CHUNK_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHUNK_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Content store root (overrides CHUNK_STORE_STORE_DIR)
    #[arg(long)]
    pub store_dir: Option<String>,

    /// Directory for in-progress uploads; must be on the same filesystem as
    /// the store (overrides CHUNK_STORE_TMP_DIR)
    #[arg(long)]
    pub tmp_dir: Option<String>,

    /// Database URL (overrides CHUNK_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Seconds without a new chunk before an upload is abandoned
    /// (overrides CHUNK_STORE_UPLOAD_TIMEOUT_SECS)
    #[arg(long)]
    pub upload_timeout_secs: Option<u64>,

    /// Seconds a finished/processed long-poll waits
    /// (overrides CHUNK_STORE_LONG_POLL_TIMEOUT_SECS)
    #[arg(long)]
    pub long_poll_timeout_secs: Option<u64>,

    /// Largest accepted chunk body in bytes (overrides CHUNK_STORE_MAX_CHUNK_BYTES)
    #[arg(long)]
    pub max_chunk_bytes: Option<usize>,

    /// Disable mime detection and thumbnailing
    #[arg(long)]
    pub no_post_process: bool,

    /// Seconds post-processing of one file may take before it is abandoned
    /// (overrides CHUNK_STORE_POST_PROCESS_TIMEOUT_SECS)
    #[arg(long)]
    pub post_process_timeout_secs: Option<u64>,

    /// Thumbnailer for images, e.g. `convert` (overrides CHUNK_STORE_THUMBNAIL_PROGRAM)
    #[arg(long)]
    pub thumbnail_program: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read `name` and parse it, falling back to `default` when unset.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
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

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("CHUNK_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("CHUNK_STORE_PORT", 8080u16)?;
        let env_store =
            env::var("CHUNK_STORE_STORE_DIR").unwrap_or_else(|_| "./data/uploads".into());
        let env_tmp = env::var("CHUNK_STORE_TMP_DIR").unwrap_or_else(|_| "./data/tmp".into());
        let env_db = env::var("CHUNK_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/chunk_store.db".into());
        let env_upload_timeout = env_parse("CHUNK_STORE_UPLOAD_TIMEOUT_SECS", 120u64)?;
        let env_long_poll = env_parse("CHUNK_STORE_LONG_POLL_TIMEOUT_SECS", 120u64)?;
        let env_max_chunk = env_parse("CHUNK_STORE_MAX_CHUNK_BYTES", 16 * 1024 * 1024usize)?;
        let env_post_process = env_parse("CHUNK_STORE_POST_PROCESS", true)?;
        let env_post_process_timeout =
            env_parse("CHUNK_STORE_POST_PROCESS_TIMEOUT_SECS", 60u64)?;
        let mime_program =
            env::var("CHUNK_STORE_MIME_PROGRAM").unwrap_or_else(|_| "file".into());
        let env_thumbnail_program = env::var("CHUNK_STORE_THUMBNAIL_PROGRAM").ok();
        let thumbnail_dir = env::var("CHUNK_STORE_THUMBNAIL_DIR")
            .unwrap_or_else(|_| "./data/thumbnails".into());

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            store_dir: args.store_dir.unwrap_or(env_store),
            tmp_dir: args.tmp_dir.unwrap_or(env_tmp),
            database_url: args.database_url.unwrap_or(env_db),
            upload_timeout: Duration::from_secs(
                args.upload_timeout_secs.unwrap_or(env_upload_timeout),
            ),
            long_poll_timeout: Duration::from_secs(
                args.long_poll_timeout_secs.unwrap_or(env_long_poll),
            ),
            max_chunk_bytes: args.max_chunk_bytes.unwrap_or(env_max_chunk),
            post_process: env_post_process && !args.no_post_process,
            post_process_timeout: Duration::from_secs(
                args.post_process_timeout_secs
                    .unwrap_or(env_post_process_timeout),
            ),
            mime_program,
            thumbnail_program: args.thumbnail_program.or(env_thumbnail_program),
            thumbnail_dir,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_when_unset() {
        let value = env_parse("CHUNK_STORE_TEST_SURELY_UNSET_VAR", 42u64).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn args_parse_flags() {
        let args = Args::try_parse_from([
            "chunk-store",
            "--port",
            "9000",
            "--upload-timeout-secs",
            "5",
            "--no-post-process",
            "--post-process-timeout-secs",
            "10",
        ])
        .unwrap();
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.upload_timeout_secs, Some(5));
        assert!(args.no_post_process);
        assert_eq!(args.post_process_timeout_secs, Some(10));
        assert!(!args.migrate);
    }
}
