//! Connection plumbing shared by the server and the agent
//!
//! Framed control-channel IO, the data-channel correlation preamble, the
//! transparent bidirectional byte relay, and reconnect backoff.

pub mod control;
pub mod datachannel;
pub mod reconnect;
pub mod relay;

pub use control::{ControlChannel, TransportError};
pub use datachannel::{read_preamble, write_preamble};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use relay::{copy_bidirectional, RelayError};
