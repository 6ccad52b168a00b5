//! Protocol message types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Main control protocol message enum
///
/// One variant per control operation; data-channel payload bytes never
/// travel inside these messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    /// Agent authenticates and opens a session
    Login {
        token: String,
        /// Optional identifier of a previous run, carried for diagnostics
        run_id: Option<String>,
    },
    /// Server accepts or rejects a login
    LoginResp {
        session_id: String,
        heartbeat_interval_secs: u64,
        error: Option<String>,
    },
    /// Agent registers a tunnel
    NewProxy {
        proxy_name: String,
        kind: ProxyKind,
        public_spec: PublicSpec,
        /// Address the agent dials on its side, e.g. "127.0.0.1:8080"
        local_target: String,
    },
    /// Server answers a registration with the public address or an error
    NewProxyResp {
        proxy_name: String,
        remote_addr: Option<String>,
        error: Option<String>,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    /// Server asks the agent to open one data channel now
    NewWorkConn {
        correlation_id: Uuid,
        proxy_name: String,
    },
    /// Agent voluntarily deregisters a tunnel
    CloseProxy {
        proxy_name: String,
    },
}

/// Proxy kind carried on the wire
///
/// Only `Tcp` is bound by the default server binder; the other kinds are
/// routed through the binder extension point and may be rejected at
/// registration time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Tcp,
    Udp,
    Http,
    Stcp,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Tcp => "tcp",
            ProxyKind::Udp => "udp",
            ProxyKind::Http => "http",
            ProxyKind::Stcp => "stcp",
        }
    }
}

/// Public-facing bind requested by a proxy registration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PublicSpec {
    /// Exclusive TCP port; 0 asks the server to allocate one
    Port(u16),
    /// Virtual-host slot for HTTP-kind proxies
    VHost(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = ControlMessage::Ping { timestamp: 12345 };
        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: ControlMessage = bincode::deserialize(&serialized).unwrap();
        assert_eq!(msg, deserialized);
    }

    #[test]
    fn test_login_round_trip() {
        let msg = ControlMessage::Login {
            token: "secret-token".to_string(),
            run_id: Some("run-42".to_string()),
        };
        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: ControlMessage = bincode::deserialize(&serialized).unwrap();
        assert_eq!(msg, deserialized);
    }

    #[test]
    fn test_new_proxy_round_trip() {
        let msg = ControlMessage::NewProxy {
            proxy_name: "web".to_string(),
            kind: ProxyKind::Tcp,
            public_spec: PublicSpec::Port(6000),
            local_target: "127.0.0.1:8080".to_string(),
        };

        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: ControlMessage = bincode::deserialize(&serialized).unwrap();

        if let ControlMessage::NewProxy {
            proxy_name,
            kind,
            public_spec,
            local_target,
        } = deserialized
        {
            assert_eq!(proxy_name, "web");
            assert_eq!(kind, ProxyKind::Tcp);
            assert_eq!(public_spec, PublicSpec::Port(6000));
            assert_eq!(local_target, "127.0.0.1:8080");
        } else {
            panic!("Expected NewProxy message");
        }
    }

    #[test]
    fn test_new_work_conn_round_trip() {
        let correlation_id = Uuid::new_v4();
        let msg = ControlMessage::NewWorkConn {
            correlation_id,
            proxy_name: "web".to_string(),
        };
        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: ControlMessage = bincode::deserialize(&serialized).unwrap();

        if let ControlMessage::NewWorkConn {
            correlation_id: id, ..
        } = deserialized
        {
            assert_eq!(id, correlation_id);
        } else {
            panic!("Expected NewWorkConn message");
        }
    }

    #[test]
    fn test_vhost_spec_round_trip() {
        let spec = PublicSpec::VHost("app.example.com".to_string());
        let serialized = bincode::serialize(&spec).unwrap();
        let deserialized: PublicSpec = bincode::deserialize(&serialized).unwrap();
        assert_eq!(spec, deserialized);
    }
}
