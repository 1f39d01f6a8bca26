use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use std::sync::Arc;

use crate::error::MailDripError;

const IV_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Vault for OAuth access/refresh tokens at rest.
///
/// A stored value is base64(IV || ciphertext || tag) with a fresh 96-bit IV
/// per encryption. The key comes from `TOKEN_ENCRYPTION_KEY` (64 hex chars);
/// there is no default-key fallback and no plaintext passthrough on error.
#[derive(Clone)]
pub struct TokenVault {
    cipher: Arc<Aes256Gcm>,
}

impl TokenVault {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Arc::new(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key))),
        }
    }

    /// Builds the vault from `TOKEN_ENCRYPTION_KEY`. An unset variable
    /// yields `Ok(None)` (token storage disabled); a present but malformed
    /// key is a hard error.
    pub fn from_env() -> Result<Option<Self>, MailDripError> {
        let raw = match std::env::var("TOKEN_ENCRYPTION_KEY") {
            Ok(v) if !v.is_empty() => v,
            _ => {
                tracing::warn!(
                    "TOKEN_ENCRYPTION_KEY not set - mailbox connections cannot be stored"
                );
                return Ok(None);
            }
        };

        let decoded = hex::decode(raw.trim()).map_err(|e| {
            MailDripError::Crypto(format!("TOKEN_ENCRYPTION_KEY is not valid hex: {e}"))
        })?;
        let key: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
            MailDripError::Crypto(format!(
                "TOKEN_ENCRYPTION_KEY must decode to {KEY_LEN} bytes, found {}",
                decoded.len()
            ))
        })?;

        Ok(Some(Self::new(&key)))
    }

    pub fn encrypt(&self, token: &str) -> Result<String, MailDripError> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), token.as_bytes())
            .map_err(|e| MailDripError::Crypto(format!("Token encryption failed: {e}")))?;

        let mut blob = Vec::with_capacity(IV_LEN + sealed.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&sealed);
        Ok(BASE64.encode(blob))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, MailDripError> {
        let blob = BASE64.decode(stored).map_err(|e| {
            MailDripError::Crypto(format!("Stored token is not valid base64: {e}"))
        })?;
        // The sealed part carries at least the 16-byte auth tag.
        if blob.len() <= IV_LEN {
            return Err(MailDripError::Crypto("Stored token is truncated".to_string()));
        }

        let (iv, sealed) = blob.split_at(IV_LEN);
        let opened = self
            .cipher
            .decrypt(Nonce::from_slice(iv), sealed)
            .map_err(|e| MailDripError::Crypto(format!("Token decryption failed: {e}")))?;

        String::from_utf8(opened)
            .map_err(|e| MailDripError::Crypto(format!("Decrypted token is not UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault(seed: u8) -> TokenVault {
        TokenVault::new(&[seed; KEY_LEN])
    }

    #[test]
    fn roundtrip_recovers_the_token() {
        let v = vault(0);
        let token = "ya29.a0AfB_byDummyAccessToken";
        assert_eq!(v.decrypt(&v.encrypt(token).unwrap()).unwrap(), token);
    }

    #[test]
    fn roundtrip_preserves_unicode() {
        let v = vault(9);
        let token = "tøken-值-🔑";
        assert_eq!(v.decrypt(&v.encrypt(token).unwrap()).unwrap(), token);
    }

    #[test]
    fn each_encryption_gets_a_fresh_iv() {
        let v = vault(1);
        let first = v.encrypt("same-value").unwrap();
        let second = v.encrypt("same-value").unwrap();
        assert_ne!(first, second);
        assert_eq!(v.decrypt(&first).unwrap(), "same-value");
        assert_eq!(v.decrypt(&second).unwrap(), "same-value");
    }

    #[test]
    fn garbage_and_truncated_blobs_are_rejected() {
        let v = vault(2);
        assert!(v.decrypt("not base64 !!!").is_err());
        // valid base64, but shorter than an IV
        assert!(v.decrypt("c2hvcnQ=").is_err());
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let blob = vault(3).encrypt("secret-data").unwrap();
        assert!(vault(4).decrypt(&blob).is_err());
    }

    #[test]
    fn from_env_rejects_short_key() {
        std::env::set_var("TOKEN_ENCRYPTION_KEY", "abcd1234");
        let result = TokenVault::from_env();
        std::env::remove_var("TOKEN_ENCRYPTION_KEY");
        assert!(result.is_err());
    }
}
