//! Authentication for the tunnel broker
//!
//! The broker core only needs pass/fail plus an optional identity for a
//! presented login token; everything behind that is pluggable through
//! [`TokenValidator`].

pub mod jwt;
pub mod validator;

pub use jwt::{JwtClaims, JwtIssuer, JwtValidator};
pub use validator::{AuthError, Identity, StaticTokenValidator, TokenValidator};

// Re-export useful types
pub use async_trait::async_trait;
