//! Node token authentication.
//!
//! ## Token Format
//!
//! - 8 bytes: issue time (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 over `node_id || issue time`
//!
//! Total: 40 bytes. A token is bound to the node id it was issued for.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use nodesync_protocol::{Clock, Timestamp};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const TIMESTAMP_LEN: usize = 8;
const SIGNATURE_LEN: usize = 32;
const TOKEN_LEN: usize = TIMESTAMP_LEN + SIGNATURE_LEN;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Issues and checks node tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
    clock: Arc<dyn Clock>,
}

impl TokenValidator {
    /// Creates a validator reading time from `clock`.
    pub fn new(config: AuthConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Issues a token for `node_id`, stamped with the current time.
    pub fn create_token(&self, node_id: &str) -> ServerResult<Vec<u8>> {
        let issued = self.clock.now().as_millis().to_be_bytes();
        let signature = self.sign(node_id, &issued)?;

        let mut token = Vec::with_capacity(TOKEN_LEN);
        token.extend_from_slice(&issued);
        token.extend_from_slice(&signature);
        Ok(token)
    }

    /// Checks that `token` was issued for `node_id` and has not expired.
    pub fn validate_token(&self, token: &[u8], node_id: &str) -> ServerResult<()> {
        if token.len() != TOKEN_LEN {
            return Err(ServerError::NotAuthorized(format!(
                "token of {} has length {}",
                node_id,
                token.len()
            )));
        }
        let (issued, signature) = token.split_at(TIMESTAMP_LEN);

        let expected = self.sign(node_id, issued)?;
        if signature != expected.as_slice() {
            return Err(ServerError::NotAuthorized(format!(
                "invalid signature for {}",
                node_id
            )));
        }

        let mut millis = [0u8; TIMESTAMP_LEN];
        millis.copy_from_slice(issued);
        let issued = Timestamp::from_millis(u64::from_be_bytes(millis));
        if self.clock.now().since(issued) > self.config.token_expiry {
            return Err(ServerError::AuthenticationExpired(node_id.to_string()));
        }
        Ok(())
    }

    fn sign(&self, node_id: &str, issued: &[u8]) -> ServerResult<[u8; SIGNATURE_LEN]> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("hmac key: {}", e)))?;
        mac.update(node_id.as_bytes());
        mac.update(issued);
        Ok(mac.finalize().into_bytes().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodesync_protocol::ManualClock;

    fn validator() -> (TokenValidator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000_000)));
        let config = AuthConfig::new(b"test-secret-key-32-bytes-long!!".to_vec())
            .with_expiry(Duration::from_secs(60));
        (TokenValidator::new(config, clock.clone()), clock)
    }

    #[test]
    fn create_and_validate_token() {
        let (validator, _) = validator();
        let token = validator.create_token("N1").unwrap();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(validator.validate_token(&token, "N1").is_ok());
    }

    #[test]
    fn reject_other_node() {
        let (validator, _) = validator();
        let token = validator.create_token("N1").unwrap();
        let result = validator.validate_token(&token, "N2");
        assert!(matches!(result, Err(ServerError::NotAuthorized(_))));
    }

    #[test]
    fn reject_tampered_token() {
        let (validator, _) = validator();
        let mut token = validator.create_token("N1").unwrap();
        token[20] ^= 0xFF;
        assert!(validator.validate_token(&token, "N1").is_err());
        assert!(validator.validate_token(&token[..10], "N1").is_err());
    }

    #[test]
    fn reject_expired_token() {
        let (validator, clock) = validator();
        let token = validator.create_token("N1").unwrap();

        clock.advance(Duration::from_secs(60));
        assert!(validator.validate_token(&token, "N1").is_ok());

        clock.advance(Duration::from_millis(1));
        let result = validator.validate_token(&token, "N1");
        assert!(matches!(result, Err(ServerError::AuthenticationExpired(_))));
    }
}
