//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

use recast_core::validate::DEFAULT_MAX_UPLOAD_BYTES;
use recast_core::PipelineConfig;

/// Runtime configuration for recast-server.
///
/// Every field has a default so the server runs without any environment
/// variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:9000"`).
    pub bind_address: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Directory for daily-rolling log files. Logs go to stdout when unset.
    pub log_dir: Option<PathBuf>,

    /// Scratch directory for received uploads.
    pub upload_dir: PathBuf,

    /// Scratch directory for converted outputs.
    pub converted_dir: PathBuf,

    /// Largest accepted upload, in bytes.
    pub max_upload_bytes: u64,

    /// How long a finished job's progress stays pollable.
    pub progress_ttl: Duration,

    /// Comma-separated CORS origins; any origin is allowed when unset.
    pub cors_allowed_origins: Option<String>,

    /// Serve the OpenAPI document at `/api-docs/openapi.json`.
    pub enable_docs: bool,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("RECAST_BIND", "0.0.0.0:9000"),
            log_level: env_or("RECAST_LOG", "info"),
            log_json: parse_flag("RECAST_LOG_JSON", false),
            log_dir: std::env::var("RECAST_LOG_DIR").ok().map(PathBuf::from),
            upload_dir: env_or("RECAST_UPLOAD_DIR", "./uploads").into(),
            converted_dir: env_or("RECAST_CONVERTED_DIR", "./converted").into(),
            max_upload_bytes: parse_env("RECAST_MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES),
            progress_ttl: Duration::from_secs(parse_env("RECAST_PROGRESS_TTL_SECS", 30)),
            cors_allowed_origins: std::env::var("RECAST_CORS_ORIGINS").ok(),
            enable_docs: parse_flag("RECAST_ENABLE_DOCS", true),
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            max_upload_bytes: self.max_upload_bytes,
            progress_ttl: self.progress_ttl,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}
