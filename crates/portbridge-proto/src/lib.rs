//! Control-channel protocol types and wire codec for portbridge.
//!
//! The control channel carries small, bincode-encoded messages with a
//! length-prefix framing; data channels are raw byte pipes identified by a
//! fixed-size correlation preamble and are not handled here.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, ControlCodec, PREAMBLE_LEN};
pub use messages::{ControlMessage, ProxyKind, PublicSpec};
