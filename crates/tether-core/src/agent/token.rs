//! Per-task callback tokens.
//!
//! Format: `tether_cb_<task_id>_<hmac_hex>`, with the HMAC-SHA256 computed
//! over `callback:<task_id>`. A token is only good for the task it names.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_PREFIX: &str = "tether_cb_";

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token format: {0}")]
    InvalidFormat(String),

    #[error("token was issued for task {0}")]
    WrongTask(Uuid),

    #[error("token HMAC verification failed")]
    HmacMismatch,

    #[error("invalid token secret: {0}")]
    InvalidSecret(String),
}

/// Issues and checks callback tokens with one shared secret.
#[derive(Clone)]
pub struct CallbackTokens {
    mac: HmacSha256,
}

impl CallbackTokens {
    pub fn new(secret: &[u8]) -> Result<Self, TokenError> {
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| TokenError::InvalidSecret(e.to_string()))?;
        Ok(Self { mac })
    }

    /// From a hex string, as written to the config file by `tether init`.
    pub fn from_hex(secret_hex: &str) -> Result<Self, TokenError> {
        let secret = hex::decode(secret_hex.trim())
            .map_err(|e| TokenError::InvalidSecret(format!("not valid hex: {e}")))?;
        Self::new(&secret)
    }

    pub fn issue(&self, task_id: Uuid) -> String {
        let mut mac = self.mac.clone();
        mac.update(message(task_id).as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());
        format!("{TOKEN_PREFIX}{task_id}_{digest}")
    }

    /// Check that `token` was issued for `task_id`. The digest comparison is
    /// constant-time.
    pub fn verify(&self, token: &str, task_id: Uuid) -> Result<(), TokenError> {
        let rest = token.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
            TokenError::InvalidFormat(format!("token must start with '{TOKEN_PREFIX}'"))
        })?;
        if rest.len() < 37 || !rest.is_char_boundary(36) {
            return Err(TokenError::InvalidFormat(
                "token too short to contain a task id".to_owned(),
            ));
        }
        let (id_str, after) = rest.split_at(36);
        let claimed =
            Uuid::parse_str(id_str).map_err(|e| TokenError::InvalidFormat(e.to_string()))?;
        if claimed != task_id {
            return Err(TokenError::WrongTask(claimed));
        }
        let digest_hex = after.strip_prefix('_').ok_or_else(|| {
            TokenError::InvalidFormat("expected underscore after task id".to_owned())
        })?;
        let digest = hex::decode(digest_hex)
            .map_err(|e| TokenError::InvalidFormat(format!("invalid hex in hmac: {e}")))?;

        let mut mac = self.mac.clone();
        mac.update(message(task_id).as_bytes());
        mac.verify_slice(&digest).map_err(|_| TokenError::HmacMismatch)
    }
}

impl fmt::Debug for CallbackTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CallbackTokens { .. }")
    }
}

fn message(task_id: Uuid) -> String {
    format!("callback:{task_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> CallbackTokens {
        CallbackTokens::new(b"test-secret-for-tether").unwrap()
    }

    #[test]
    fn issued_token_verifies_for_its_task() {
        let tokens = tokens();
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let token = tokens.issue(id);

        assert!(token.starts_with("tether_cb_550e8400-e29b-41d4-a716-446655440000_"));
        assert_eq!(token.len(), TOKEN_PREFIX.len() + 36 + 1 + 64);
        tokens.verify(&token, id).unwrap();
        assert_eq!(token, tokens.issue(id), "tokens are deterministic");
    }

    #[test]
    fn token_for_another_task_is_rejected() {
        let tokens = tokens();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let token = tokens.issue(a);
        assert!(matches!(tokens.verify(&token, b), Err(TokenError::WrongTask(id)) if id == a));

        // Swapping the id in place does not help either.
        let forged = token.replace(&a.to_string(), &b.to_string());
        assert!(matches!(tokens.verify(&forged, b), Err(TokenError::HmacMismatch)));
    }

    #[test]
    fn wrong_secret_or_flipped_bit_is_rejected() {
        let id = Uuid::new_v4();
        let token = tokens().issue(id);

        let other = CallbackTokens::new(b"another-secret").unwrap();
        assert!(matches!(other.verify(&token, id), Err(TokenError::HmacMismatch)));

        let (head, digest) = token.rsplit_once('_').unwrap();
        let mut bytes = hex::decode(digest).unwrap();
        bytes[31] ^= 0x01;
        let near_miss = format!("{head}_{}", hex::encode(bytes));
        assert!(matches!(tokens().verify(&near_miss, id), Err(TokenError::HmacMismatch)));
    }

    #[test]
    fn malformed_tokens_are_format_errors() {
        let tokens = tokens();
        let id = Uuid::new_v4();
        let cases = [
            String::new(),
            "tether_at_whatever".to_owned(),
            "tether_cb_short".to_owned(),
            format!("tether_cb_{id}"),
            format!("tether_cb_{id}_zz-not-hex"),
        ];
        for bad in &cases {
            assert!(
                matches!(tokens.verify(bad, id), Err(TokenError::InvalidFormat(_))),
                "{bad:?} should be a format error"
            );
        }
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert!(CallbackTokens::from_hex("00ff10").is_ok());
        assert!(matches!(
            CallbackTokens::from_hex("not hex"),
            Err(TokenError::InvalidSecret(_))
        ));
    }
}
