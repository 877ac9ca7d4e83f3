use std::path::PathBuf;
use std::time::Duration;

use crate::env::ReadEnv;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_CONFIG_DIR: &str = "/etc/trogon-intake";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;
const DEFAULT_PIPELINE_TIMEOUT_SECS: u64 = 600;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Runtime configuration for the intake server.
///
/// Resolved from environment variables:
/// - `INTAKE_PORT`: HTTP listening port (default: 8080)
/// - `INTAKE_CONFIG_DIR`: directory holding `products/*.toml` (default: `/etc/trogon-intake`)
/// - `INTAKE_STAGING_DIR`: parent of per-request staging directories (default: OS temp dir)
/// - `INTAKE_MAX_UPLOAD_BYTES`: request body limit for uploads (default: 512 MiB)
/// - `INTAKE_PIPELINE_TIMEOUT_SECS`: pipeline timeout for products that set none (default: 600)
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    pub port: u16,
    pub config_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub pipeline_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl IntakeConfig {
    pub fn from_env<E: ReadEnv>(env: &E) -> Self {
        Self {
            port: env
                .var("INTAKE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            config_dir: env
                .var("INTAKE_CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR)),
            staging_dir: env
                .var("INTAKE_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir()),
            max_upload_bytes: env
                .var("INTAKE_MAX_UPLOAD_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|bytes| *bytes > 0)
                .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            pipeline_timeout: Duration::from_secs(
                env.var("INTAKE_PIPELINE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .filter(|secs| *secs > 0)
                    .unwrap_or(DEFAULT_PIPELINE_TIMEOUT_SECS),
            ),
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }

    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = dir.into();
        self
    }

    /// Shortens the shutdown grace period. Production always runs with 3s.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}
