//! AEAD service for user API keys at rest.
//!
//! AES-256-GCM with a fresh 12-byte nonce per encryption; the token format is
//! `base64(nonce || ciphertext || tag)`.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{OrchestratorError, Result};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

pub struct CryptoService {
    cipher: Aes256Gcm,
}

impl CryptoService {
    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64_key(key_b64: &str) -> Result<Self> {
        let key = BASE64
            .decode(key_b64.trim())
            .map_err(|_| OrchestratorError::config("CRYPTO_ENCRYPTION_KEY is not valid base64"))?;
        if key.len() != KEY_LEN {
            return Err(OrchestratorError::config(format!(
                "CRYPTO_ENCRYPTION_KEY must decode to {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| OrchestratorError::Crypto(e.to_string()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| OrchestratorError::Crypto(e.to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(&self, token: &str) -> Result<String> {
        let raw = BASE64
            .decode(token.trim())
            .map_err(|_| OrchestratorError::Crypto("token is not valid base64".to_string()))?;
        if raw.len() <= NONCE_LEN {
            return Err(OrchestratorError::Crypto("token too short".to_string()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| OrchestratorError::Crypto("decryption failed".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|_| OrchestratorError::Crypto("plaintext is not utf-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> CryptoService {
        // 32 zero bytes, base64.
        CryptoService::from_base64_key("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=").unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let crypto = service();
        let token = crypto.encrypt("sk-user-key-1234").unwrap();
        assert_eq!(crypto.decrypt(&token).unwrap(), "sk-user-key-1234");
    }

    #[test]
    fn test_fresh_nonce_each_time() {
        let crypto = service();
        let a = crypto.encrypt("same plaintext").unwrap();
        let b = crypto.encrypt("same plaintext").unwrap();
        assert_ne!(a, b);
        assert_eq!(crypto.decrypt(&a).unwrap(), crypto.decrypt(&b).unwrap());
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let crypto = service();
        let token = crypto.encrypt("secret").unwrap();
        let other =
            CryptoService::from_base64_key("AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=").unwrap();
        assert!(other.decrypt(&token).is_err());
    }

    #[test]
    fn test_bad_key_material_rejected() {
        assert!(CryptoService::from_base64_key("not base64 !!!").is_err());
        // Right encoding, wrong length.
        assert!(CryptoService::from_base64_key("AAAA").is_err());
    }

    #[test]
    fn test_tampered_token_rejected() {
        let crypto = service();
        let token = crypto.encrypt("secret").unwrap();
        let mut raw = BASE64.decode(&token).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(crypto.decrypt(&BASE64.encode(raw)).is_err());
    }

    #[test]
    fn test_truncated_token_rejected() {
        let crypto = service();
        assert!(crypto.decrypt("AAAA").is_err());
    }
}
