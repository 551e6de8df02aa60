//! Configuration management
//!
//! Configuration loads from a YAML file, then environment variables
//! override individual fields. Every section validates before the engine
//! starts; a bad config is exit code 2 territory for the CLI.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// Service identity
    pub service: ServiceConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Reconcile loop and dispatch tuning
    pub engine: EngineConfig,
    /// Remote agent auth
    pub security: SecurityConfig,
}

impl AppConfig {
    /// Load from a YAML file, then apply environment overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: AppConfig = serde_yaml::from_str(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn load_from_env() -> EngineResult<Self> {
        let mut config = AppConfig::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Fold environment variables over the current values
    pub fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("MYWANT_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("MYWANT_SNAPSHOT_PATH") {
            self.engine.snapshot_path = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("AGENT_AUTH_TOKEN") {
            if !val.is_empty() {
                self.security.agent_auth_token = Some(val);
            }
        }
    }

    /// Validate every section
    pub fn validate(&self) -> EngineResult<()> {
        self.service.validate()?;
        self.logging.validate()?;
        self.engine.validate()?;
        Ok(())
    }
}

/// Service identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,
    /// Service version
    pub version: String,
}

impl ServiceConfig {
    fn validate(&self) -> EngineResult<()> {
        if self.name.is_empty() {
            return Err(EngineError::Validation(
                "service name cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "mywant".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// Log level: debug, info, warn, error
    pub level: String,
}

impl LoggingConfig {
    fn validate(&self) -> EngineResult<()> {
        let valid = ["trace", "debug", "info", "warn", "error"];
        if !valid.contains(&self.level.as_str()) {
            return Err(EngineError::Validation(format!(
                "invalid log level: {}",
                self.level
            )));
        }
        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Externally reachable base URL, used for monitor callback URLs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
}

impl ServerConfig {
    /// The callback URL remote monitors push deltas to
    pub fn callback_url(&self) -> String {
        let base = self
            .external_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port));
        format!(
            "{}/api/v1/agents/webhook/callback",
            base.trim_end_matches('/')
        )
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            external_url: None,
        }
    }
}

/// Reconcile loop and dispatch tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Bound on concurrent agent workers
    pub worker_pool_size: usize,
    /// Monitor observation interval, seconds
    pub monitor_interval_secs: u64,
    /// Per-attempt remote dispatch timeout, seconds
    pub remote_timeout_secs: u64,
    /// Shutdown drain bound, seconds
    pub shutdown_grace_secs: u64,
    /// Reconcile tick and retrigger debounce window, milliseconds
    pub tick_ms: u64,
    /// Snapshot file; absent disables persistence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
    /// Directory of agent declaration files loaded at startup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents_dir: Option<PathBuf>,
    /// Directory of recipe files loaded at startup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipes_dir: Option<PathBuf>,
}

impl EngineConfig {
    fn validate(&self) -> EngineResult<()> {
        if self.worker_pool_size == 0 {
            return Err(EngineError::Validation(
                "worker pool size must be at least 1".into(),
            ));
        }
        if self.tick_ms == 0 {
            return Err(EngineError::Validation("tick must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 64,
            monitor_interval_secs: 10,
            remote_timeout_secs: 30,
            shutdown_grace_secs: 10,
            tick_ms: 100,
            snapshot_path: None,
            agents_dir: None,
            recipes_dir: None,
        }
    }
}

/// Remote agent auth
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityConfig {
    /// Shared bearer secret for remote agents; absent allows all
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_auth_token: Option<String>,
}
