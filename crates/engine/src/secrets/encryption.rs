//! AES-256-GCM sealing of secret values.
//!
//! Sealed values are base64 text of `nonce (12 bytes) || ciphertext`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::Rng;

use crate::error::{EngineError, EngineResult};

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// Symmetric cipher for the local secret store.
#[derive(Clone)]
pub struct Encryptor {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Encryptor(..)")
    }
}

impl Encryptor {
    /// Build from a base64-encoded 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns `Encryption` for bad base64 or a key of the wrong length.
    pub fn from_base64(key_base64: &str) -> EngineResult<Self> {
        let key = BASE64
            .decode(key_base64.trim())
            .map_err(|e| EngineError::Encryption(format!("Invalid base64 key: {}", e)))?;
        Self::from_bytes(&key)
    }

    pub fn from_bytes(key: &[u8]) -> EngineResult<Self> {
        if key.len() != KEY_SIZE {
            return Err(EngineError::Encryption(format!(
                "Invalid key length: expected {} bytes, got {}",
                KEY_SIZE,
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| EngineError::Encryption(format!("Failed to create cipher: {}", e)))?;
        Ok(Self { cipher })
    }

    /// Fresh random key, base64-encoded.
    pub fn generate_key_base64() -> String {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill(&mut key[..]);
        BASE64.encode(key)
    }

    /// Seal a plaintext secret.
    pub fn seal(&self, plaintext: &str) -> EngineResult<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| EngineError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    /// Open a value produced by [`seal`](Self::seal).
    pub fn open(&self, sealed: &str) -> EngineResult<String> {
        let bytes = BASE64
            .decode(sealed)
            .map_err(|e| EngineError::Encryption(format!("Invalid sealed value: {}", e)))?;
        if bytes.len() < NONCE_SIZE {
            return Err(EngineError::Encryption(
                "Sealed value too short (missing nonce)".to_string(),
            ));
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| EngineError::Encryption(format!("Decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| EngineError::Encryption(format!("Secret is not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let encryptor = Encryptor::from_base64(&Encryptor::generate_key_base64()).unwrap();
        let sealed = encryptor.seal("hunter2").unwrap();
        assert_ne!(sealed, "hunter2");
        assert_eq!(encryptor.open(&sealed).unwrap(), "hunter2");
    }

    #[test]
    fn test_nonce_differs() {
        let encryptor = Encryptor::from_base64(&Encryptor::generate_key_base64()).unwrap();
        assert_ne!(encryptor.seal("x").unwrap(), encryptor.seal("x").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = Encryptor::from_base64(&Encryptor::generate_key_base64()).unwrap();
        let b = Encryptor::from_base64(&Encryptor::generate_key_base64()).unwrap();
        let sealed = a.seal("token").unwrap();
        assert!(matches!(b.open(&sealed), Err(EngineError::Encryption(_))));
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(Encryptor::from_bytes(&[0u8; 16]).is_err());
        assert!(Encryptor::from_base64("not base64!!").is_err());
    }

    #[test]
    fn test_short_sealed_value() {
        let encryptor = Encryptor::from_base64(&Encryptor::generate_key_base64()).unwrap();
        assert!(encryptor.open(&BASE64.encode([1u8; 4])).is_err());
    }
}
