//! JWT (JSON Web Token) handling
//!
//! Deployments that mint expiring agent credentials use [`JwtIssuer`] on the
//! provisioning side and configure the server with a [`JwtValidator`]
//! instead of a static token list.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::validator::{AuthError, Identity, TokenValidator};

/// JWT claims for agent authentication
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JwtClaims {
    /// Subject (agent identifier)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
}

impl JwtClaims {
    pub fn new(subject: String, validity: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: subject,
            iat: now.timestamp(),
            exp: (now + validity).timestamp(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

/// Issues HS256-signed agent tokens
pub struct JwtIssuer {
    encoding_key: EncodingKey,
}

impl JwtIssuer {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
        }
    }

    pub fn issue(&self, claims: &JwtClaims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| AuthError::ValidationError(e.to_string()))
    }
}

/// Validates HS256-signed agent tokens
///
/// Checks the signature and expiration only; issuer/audience claims are not
/// part of the broker handshake.
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

#[async_trait]
impl TokenValidator for JwtValidator {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken,
            },
        )?;

        Ok(Identity {
            subject: data.claims.sub,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_and_validate() {
        let secret = b"test-secret";
        let issuer = JwtIssuer::new(secret);
        let validator = JwtValidator::new(secret);

        let claims = JwtClaims::new("agent-1".to_string(), Duration::hours(1));
        let token = issuer.issue(&claims).unwrap();

        let identity = validator.validate(&token).await.unwrap();
        assert_eq!(identity.subject, "agent-1");
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let secret = b"test-secret";
        let issuer = JwtIssuer::new(secret);
        let validator = JwtValidator::new(secret);

        let claims = JwtClaims::new("agent-1".to_string(), Duration::hours(-1));
        let token = issuer.issue(&claims).unwrap();

        let result = validator.validate(&token).await;
        assert!(matches!(result, Err(AuthError::TokenExpired)));
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let issuer = JwtIssuer::new(b"secret-a");
        let validator = JwtValidator::new(b"secret-b");

        let claims = JwtClaims::new("agent-1".to_string(), Duration::hours(1));
        let token = issuer.issue(&claims).unwrap();

        let result = validator.validate(&token).await;
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_claims_expiry_check() {
        let fresh = JwtClaims::new("a".to_string(), Duration::minutes(5));
        assert!(!fresh.is_expired());

        let stale = JwtClaims::new("a".to_string(), Duration::minutes(-5));
        assert!(stale.is_expired());
    }
}
