//! Proxy registry and routing table for the tunnel broker
//!
//! Maps proxy names to their owning agent session and public bind; the
//! single piece of global mutable state in the server.

pub mod registry;

pub use registry::{ProxyRegistration, ProxyRegistry, RegistryError};
