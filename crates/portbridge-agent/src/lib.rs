//! Portbridge agent
//!
//! Connects out to the broker, keeps the control session alive across
//! outages, and opens one data channel per forwarded connection, dialing
//! the local service on the private side.

pub mod agent;
pub mod config;
pub mod workconn;

pub use agent::{Agent, AgentError};
pub use config::{AgentConfig, ProxyConfig, ReconnectSettings};
