//! Runtime configuration, resolved from environment variables.
//!
//! Every knob has an explicit default; nothing is baked into the components
//! themselves. The executor in particular receives its whole child-process
//! contract from here.

mod helpers;

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

use helpers::{optional_env, parse_env, require_env};

const DEFAULT_LIBSQL_PATH: &str = "data/faultline.db";
const DEFAULT_PG_PORT: u16 = 5432;
const DEFAULT_PG_POOL_SIZE: usize = 8;
const DEFAULT_INVESTIGATION_TIMEOUT_SECS: u64 = 600;
const DEFAULT_OUTPUT_FORMAT: &str = "markdown";
const DEFAULT_NETWORK_MODE: &str = "none";
const DEFAULT_WORKSPACE_ROOT: &str = "workspaces";
const DEFAULT_BREAKER_THRESHOLD: i64 = 3;
const DEFAULT_BREAKER_RECENT_REASONS: usize = 10;

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub executor: ExecutorConfig,
    pub breaker: BreakerConfig,
    /// Root directory under which per-incident workspaces are created.
    pub workspace_root: PathBuf,
}

/// Which SQL backend to use, with its connection parameters.
#[derive(Debug, Clone)]
pub enum DatabaseConfig {
    /// Embedded libSQL database (file-based, no server needed).
    LibSql { path: PathBuf },
    /// Client-server PostgreSQL via a connection pool.
    Postgres {
        host: String,
        port: u16,
        user: String,
        password: String,
        dbname: String,
        pool_size: usize,
    },
}

/// Investigator subprocess configuration.
///
/// All of this is forwarded to the child exclusively through environment
/// variables; see `executor::InvestigatorExecutor` for the contract.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Path to the investigator launch script.
    pub script_path: PathBuf,
    /// Investigator CLI selector (e.g. which agent binary the script runs).
    pub cli: String,
    /// Container image for the investigator.
    pub image: String,
    /// Model name passed through to the investigator.
    pub model: String,
    /// Allowed-capability list, comma-joined for the child environment.
    pub allowed_tools: Vec<String>,
    /// Wall-clock investigation timeout (grace buffer is added on top).
    pub timeout: Duration,
    /// Report output format requested from the investigator.
    pub output_format: String,
    /// Container network mode.
    pub network_mode: String,
    /// Persist stdout/stderr/interleaved log files under the workspace.
    pub debug_logs: bool,
    /// Verbose flag forwarded to the investigator.
    pub verbose: bool,
    /// Optional kubeconfig path forwarded to the investigator.
    pub kubeconfig: Option<PathBuf>,
}

/// Circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens. Values <= 0 are
    /// normalized to the default of 3.
    pub failure_threshold: u32,
    /// Capacity of the recent-failure-reasons ring buffer.
    pub recent_reasons: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_BREAKER_THRESHOLD as u32,
            recent_reasons: DEFAULT_BREAKER_RECENT_REASONS,
        }
    }
}

impl BreakerConfig {
    /// Normalize a possibly non-positive threshold the way the engine
    /// expects: anything <= 0 becomes the default of 3.
    pub fn normalized_threshold(raw: i64) -> u32 {
        if raw <= 0 {
            DEFAULT_BREAKER_THRESHOLD as u32
        } else {
            raw as u32
        }
    }
}

impl Config {
    /// Resolve the full configuration from the environment.
    pub fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            database: DatabaseConfig::resolve()?,
            executor: ExecutorConfig::resolve()?,
            breaker: BreakerConfig::resolve()?,
            workspace_root: PathBuf::from(
                optional_env("WORKSPACE_ROOT")
                    .unwrap_or_else(|| DEFAULT_WORKSPACE_ROOT.to_string()),
            ),
        })
    }
}

impl DatabaseConfig {
    /// Resolve just the database section; the maintenance subcommands need
    /// nothing else.
    pub fn resolve() -> Result<Self, ConfigError> {
        let backend =
            optional_env("DATABASE_BACKEND").unwrap_or_else(|| "libsql".to_string());
        match backend.as_str() {
            "libsql" => Ok(Self::LibSql {
                path: PathBuf::from(
                    optional_env("LIBSQL_PATH")
                        .unwrap_or_else(|| DEFAULT_LIBSQL_PATH.to_string()),
                ),
            }),
            "postgres" => Ok(Self::Postgres {
                host: optional_env("PGHOST").unwrap_or_else(|| "localhost".to_string()),
                port: parse_env("PGPORT", DEFAULT_PG_PORT)?,
                user: require_env("PGUSER")?,
                password: require_env("PGPASSWORD")?,
                dbname: require_env("PGDATABASE")?,
                pool_size: parse_env("PG_POOL_SIZE", DEFAULT_PG_POOL_SIZE)?,
            }),
            other => Err(ConfigError::InvalidValue {
                key: "DATABASE_BACKEND".to_string(),
                message: format!("must be 'libsql' or 'postgres', got '{other}'"),
            }),
        }
    }
}

impl ExecutorConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            script_path: PathBuf::from(require_env("INVESTIGATOR_SCRIPT")?),
            cli: optional_env("INVESTIGATOR_CLI").unwrap_or_else(|| "claude".to_string()),
            image: require_env("INVESTIGATOR_IMAGE")?,
            model: require_env("INVESTIGATOR_MODEL")?,
            allowed_tools: optional_env("INVESTIGATOR_ALLOWED_TOOLS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            timeout: Duration::from_secs(parse_env(
                "INVESTIGATION_TIMEOUT_SECS",
                DEFAULT_INVESTIGATION_TIMEOUT_SECS,
            )?),
            output_format: optional_env("INVESTIGATOR_OUTPUT_FORMAT")
                .unwrap_or_else(|| DEFAULT_OUTPUT_FORMAT.to_string()),
            network_mode: optional_env("INVESTIGATOR_NETWORK_MODE")
                .unwrap_or_else(|| DEFAULT_NETWORK_MODE.to_string()),
            debug_logs: parse_env("INVESTIGATOR_DEBUG_LOGS", false)?,
            verbose: parse_env("INVESTIGATOR_VERBOSE", false)?,
            kubeconfig: optional_env("KUBECONFIG_PATH").map(PathBuf::from),
        })
    }
}

impl BreakerConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let raw_threshold: i64 =
            parse_env("BREAKER_FAILURE_THRESHOLD", DEFAULT_BREAKER_THRESHOLD)?;
        Ok(Self {
            failure_threshold: Self::normalized_threshold(raw_threshold),
            recent_reasons: parse_env("BREAKER_RECENT_REASONS", DEFAULT_BREAKER_RECENT_REASONS)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::BreakerConfig;

    #[test]
    fn non_positive_thresholds_normalize_to_default() {
        assert_eq!(BreakerConfig::normalized_threshold(0), 3);
        assert_eq!(BreakerConfig::normalized_threshold(-5), 3);
        assert_eq!(BreakerConfig::normalized_threshold(1), 1);
        assert_eq!(BreakerConfig::normalized_threshold(100), 100);
    }
}
