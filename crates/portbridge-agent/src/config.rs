//! Agent configuration

use portbridge_connection::ReconnectConfig;
use portbridge_proto::ProxyKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resolved agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Broker control-channel address (host:port)
    pub control_addr: String,

    /// Broker data-channel address (host:port)
    pub data_addr: String,

    /// Login token presented to the broker
    #[serde(default)]
    pub token: String,

    /// Optional identifier of this run, echoed in broker logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    /// Proxies to register (re-submitted in full after every reconnect)
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,

    #[serde(default)]
    pub reconnect: ReconnectSettings,

    /// Declare the broker dead after heartbeat-interval × multiple of silence
    #[serde(default = "default_heartbeat_timeout_multiple")]
    pub heartbeat_timeout_multiple: u32,

    /// Resubmit a failed registration this many extra times before giving
    /// up on that proxy for the rest of the session
    #[serde(default = "default_registration_retries")]
    pub registration_retries: u32,
}

impl AgentConfig {
    pub fn new(control_addr: impl Into<String>, data_addr: impl Into<String>) -> Self {
        Self {
            control_addr: control_addr.into(),
            data_addr: data_addr.into(),
            token: String::new(),
            run_id: None,
            proxies: Vec::new(),
            reconnect: ReconnectSettings::default(),
            heartbeat_timeout_multiple: default_heartbeat_timeout_multiple(),
            registration_retries: default_registration_retries(),
        }
    }
}

/// One proxy to expose through the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Cluster-wide unique proxy name
    pub name: String,

    #[serde(default = "default_kind")]
    pub kind: ProxyKind,

    /// Local service the agent dials, e.g. "127.0.0.1:8080"
    pub local_target: String,

    /// Public port to request on the broker; 0 lets the broker allocate
    #[serde(default)]
    pub remote_port: u16,
}

/// Reconnect backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// None = keep retrying forever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: None,
        }
    }
}

impl ReconnectSettings {
    pub fn to_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            max_attempts: self.max_attempts,
        }
    }
}

fn default_kind() -> ProxyKind {
    ProxyKind::Tcp
}

fn default_heartbeat_timeout_multiple() -> u32 {
    3
}

fn default_registration_retries() -> u32 {
    2
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_yaml_defaults() {
        let yaml = r#"
name: web
local_target: "127.0.0.1:8080"
"#;
        let proxy: ProxyConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(proxy.kind, ProxyKind::Tcp);
        assert_eq!(proxy.remote_port, 0);
    }

    #[test]
    fn test_full_agent_yaml() {
        let yaml = r#"
control_addr: "broker.example.com:7000"
data_addr: "broker.example.com:7001"
token: secret
proxies:
  - name: web
    kind: tcp
    local_target: "127.0.0.1:8080"
    remote_port: 6000
reconnect:
  initial_delay_ms: 500
  max_delay_ms: 10000
"#;
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.proxies.len(), 1);
        assert_eq!(config.proxies[0].remote_port, 6000);
        assert_eq!(config.reconnect.initial_delay_ms, 500);
        assert_eq!(config.reconnect.multiplier, 2.0);
        assert_eq!(config.heartbeat_timeout_multiple, 3);
    }

    #[test]
    fn test_reconnect_settings_conversion() {
        let settings = ReconnectSettings::default();
        let config = settings.to_config();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(60));
        assert_eq!(config.max_attempts, None);
    }
}
