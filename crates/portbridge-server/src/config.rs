//! Server configuration (YAML file plus CLI/env overrides)

use crate::heartbeat::HeartbeatPolicy;
use portbridge_auth::{JwtValidator, StaticTokenValidator, TokenValidator};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Control-channel listener address
    #[serde(default = "default_control_bind")]
    pub control_bind: String,

    /// Data-channel listener address
    #[serde(default = "default_data_bind")]
    pub data_bind: String,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// How long a public connection waits for the agent's data channel
    #[serde(default = "default_work_conn_timeout_secs")]
    pub work_conn_timeout_secs: u64,

    /// How long a fresh control connection gets to present its Login
    #[serde(default = "default_auth_deadline_secs")]
    pub auth_deadline_secs: u64,

    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            control_bind: default_control_bind(),
            data_bind: default_data_bind(),
            heartbeat: HeartbeatConfig::default(),
            work_conn_timeout_secs: default_work_conn_timeout_secs(),
            auth_deadline_secs: default_auth_deadline_secs(),
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn heartbeat_policy(&self) -> HeartbeatPolicy {
        HeartbeatPolicy::new(
            Duration::from_secs(self.heartbeat.interval_secs),
            self.heartbeat.timeout_multiple,
        )
    }

    pub fn work_conn_timeout(&self) -> Duration {
        Duration::from_secs(self.work_conn_timeout_secs)
    }

    pub fn auth_deadline(&self) -> Duration {
        Duration::from_secs(self.auth_deadline_secs)
    }

    /// Build the login validator this deployment is configured for
    pub fn token_validator(&self) -> Arc<dyn TokenValidator> {
        if let Some(ref secret) = self.auth.jwt_secret {
            Arc::new(JwtValidator::new(secret.as_bytes()))
        } else {
            Arc::new(StaticTokenValidator::new(self.auth.tokens.clone()))
        }
    }
}

/// Heartbeat supervision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping a quiet session after this many seconds
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,

    /// Declare the session dead after interval × multiple seconds of silence
    #[serde(default = "default_timeout_multiple")]
    pub timeout_multiple: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval_secs(),
            timeout_multiple: default_timeout_multiple(),
        }
    }
}

/// Login validation settings
///
/// `jwt_secret` switches the server to HS256 token validation; otherwise
/// logins are checked against the static token list (empty list = open).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
}

fn default_control_bind() -> String {
    "0.0.0.0:7000".to_string()
}

fn default_data_bind() -> String {
    "0.0.0.0:7001".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_timeout_multiple() -> u32 {
    3
}

fn default_work_conn_timeout_secs() -> u64 {
    10
}

fn default_auth_deadline_secs() -> u64 {
    10
}
