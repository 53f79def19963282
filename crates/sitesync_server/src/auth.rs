//! Authentication support for the sync server.
//!
//! Token-based authentication using HMAC-SHA256. Tokens include a
//! timestamp for expiration checking.
//!
//! ## Token format
//!
//! - 16 bytes: site_id
//! - 8 bytes: timestamp (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 over site_id | db_name | timestamp
//!
//! Total: 56 bytes, hex-encoded for transport in the session bootstrap
//! parameters (tokens never travel inside protocol messages).

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sitesync_protocol::SiteId;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Decoded token length in bytes.
const TOKEN_LEN: usize = 16 + 8 + 32;

/// Token validator for incoming connections.
#[derive(Clone)]
pub struct TokenValidator {
    secret: Vec<u8>,
    token_expiry: Duration,
}

impl TokenValidator {
    /// Creates a validator with the given secret.
    pub fn new(secret: Vec<u8>, token_expiry: Duration) -> Self {
        Self {
            secret,
            token_expiry,
        }
    }

    /// Creates a hex-encoded token for a site on a database.
    pub fn create_token(&self, site: SiteId, db_name: &str) -> String {
        let timestamp = now_millis();

        let mut token = Vec::with_capacity(TOKEN_LEN);
        token.extend_from_slice(site.as_bytes());
        token.extend_from_slice(&timestamp.to_be_bytes());
        let signature = self.sign(site, db_name, timestamp);
        token.extend_from_slice(&signature);

        sitesync_codec::to_hex(&token)
    }

    /// Validates a hex-encoded token for a site on a database.
    pub fn validate_token(
        &self,
        token: &str,
        expected_site: SiteId,
        db_name: &str,
    ) -> ServerResult<()> {
        let bytes = sitesync_codec::from_hex(token)
            .map_err(|_| ServerError::AuthenticationFailed("malformed token".into()))?;
        if bytes.len() != TOKEN_LEN {
            return Err(ServerError::AuthenticationFailed(
                "invalid token length".into(),
            ));
        }

        let mut site_bytes = [0u8; 16];
        site_bytes.copy_from_slice(&bytes[0..16]);
        if SiteId::from_bytes(site_bytes) != expected_site {
            return Err(ServerError::AuthenticationFailed("site mismatch".into()));
        }

        let mut timestamp_bytes = [0u8; 8];
        timestamp_bytes.copy_from_slice(&bytes[16..24]);
        let timestamp = u64::from_be_bytes(timestamp_bytes);

        let expected = self.sign(expected_site, db_name, timestamp);
        if !constant_time_eq(&bytes[24..], &expected) {
            return Err(ServerError::AuthenticationFailed(
                "invalid signature".into(),
            ));
        }

        let expiry_millis = self.token_expiry.as_millis() as u64;
        if now_millis() > timestamp.saturating_add(expiry_millis) {
            return Err(ServerError::AuthenticationFailed("token expired".into()));
        }

        Ok(())
    }

    fn sign(&self, site: SiteId, db_name: &str, timestamp: u64) -> [u8; 32] {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(site.as_bytes());
        mac.update(db_name.as_bytes());
        mac.update(&timestamp.to_be_bytes());
        mac.finalize().into_bytes().into()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
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

    fn validator() -> TokenValidator {
        TokenValidator::new(
            b"test-secret-key-32-bytes-long!!".to_vec(),
            Duration::from_secs(3600),
        )
    }

    fn site(byte: u8) -> SiteId {
        SiteId::from_bytes([byte; 16])
    }

    #[test]
    fn create_and_validate_token() {
        let validator = validator();
        let token = validator.create_token(site(1), "dbA");
        assert_eq!(token.len(), TOKEN_LEN * 2);
        assert!(validator.validate_token(&token, site(1), "dbA").is_ok());
    }

    #[test]
    fn reject_wrong_site() {
        let validator = validator();
        let token = validator.create_token(site(1), "dbA");
        assert!(validator.validate_token(&token, site(3), "dbA").is_err());
    }

    #[test]
    fn reject_wrong_database() {
        let validator = validator();
        let token = validator.create_token(site(1), "dbA");
        assert!(validator.validate_token(&token, site(1), "dbB").is_err());
    }

    #[test]
    fn reject_tampered_token() {
        let validator = validator();
        let mut token = validator.create_token(site(1), "dbA");
        let tampered = if token.ends_with('0') { "1" } else { "0" };
        token.replace_range(token.len() - 1.., tampered);
        assert!(validator.validate_token(&token, site(1), "dbA").is_err());
    }

    #[test]
    fn reject_expired_token() {
        let validator = TokenValidator::new(b"secret".to_vec(), Duration::ZERO);
        let token = {
            // Back-date the timestamp well past the zero expiry.
            let timestamp = now_millis() - 10_000;
            let mut bytes = Vec::with_capacity(TOKEN_LEN);
            bytes.extend_from_slice(site(1).as_bytes());
            bytes.extend_from_slice(&timestamp.to_be_bytes());
            bytes.extend_from_slice(&validator.sign(site(1), "dbA", timestamp));
            sitesync_codec::to_hex(&bytes)
        };
        assert!(validator.validate_token(&token, site(1), "dbA").is_err());
    }

    #[test]
    fn reject_garbage() {
        let validator = validator();
        assert!(validator.validate_token("zz", site(1), "dbA").is_err());
        assert!(validator.validate_token("abcd", site(1), "dbA").is_err());
    }
}
