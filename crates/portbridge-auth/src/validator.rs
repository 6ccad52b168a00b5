//! Token validation seam consumed by the control-channel handshake

use async_trait::async_trait;
use thiserror::Error;

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Identity attached to an accepted login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
}

/// Validates login tokens presented on the control channel
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Validator backed by a fixed set of shared-secret tokens
///
/// An empty token list accepts every login; deployments that want open
/// registration (lab setups, integration tests) rely on this.
pub struct StaticTokenValidator {
    tokens: Vec<String>,
}

impl StaticTokenValidator {
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }

    pub fn allow_all() -> Self {
        Self { tokens: Vec::new() }
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        if self.tokens.is_empty() {
            return Ok(Identity {
                subject: "anonymous".to_string(),
            });
        }

        // Compare against every configured token so a mismatch costs the
        // same as a match regardless of position.
        let mut matched = false;
        for candidate in &self.tokens {
            if constant_time_eq(candidate.as_bytes(), token.as_bytes()) {
                matched = true;
            }
        }

        if matched {
            Ok(Identity {
                subject: "token".to_string(),
            })
        } else {
            Err(AuthError::InvalidToken)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allow_all_accepts_anything() {
        let validator = StaticTokenValidator::allow_all();
        let identity = validator.validate("whatever").await.unwrap();
        assert_eq!(identity.subject, "anonymous");
    }

    #[tokio::test]
    async fn test_static_token_match() {
        let validator = StaticTokenValidator::new(vec!["alpha".to_string(), "beta".to_string()]);
        assert!(validator.validate("beta").await.is_ok());
    }

    #[tokio::test]
    async fn test_static_token_mismatch() {
        let validator = StaticTokenValidator::new(vec!["alpha".to_string()]);
        let result = validator.validate("gamma").await;
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
