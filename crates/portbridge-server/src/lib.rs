//! Tunnel broker server
//!
//! Owns the control-channel listener, the per-session state machines, the
//! proxy registry, the data-channel multiplexer and the public-side
//! listeners that stitch public clients to agent work connections.

pub mod config;
pub mod heartbeat;
pub mod public;
pub mod server;
pub mod session;
pub mod task_tracker;
pub mod workconn;

pub use config::{AuthConfig, ConfigError, HeartbeatConfig, ServerConfig};
pub use heartbeat::{HeartbeatPolicy, HeartbeatVerdict};
pub use public::{ProxyBinder, TcpProxyBinder};
pub use server::Server;
pub use session::{AgentSession, SessionError, SessionState};
pub use workconn::{WorkConnError, WorkConnMultiplexer};
