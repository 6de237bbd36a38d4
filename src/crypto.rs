//! Authenticated symmetric encryption over opaque strings, with a versioned
//! envelope format so a future scheme change never silently misreads an old
//! value.
//!
//! The original used Fernet (AES-128-CBC + HMAC) backed by a key in the
//! Windows Credential Manager. `CryptoBox` keeps the envelope shape
//! (`enc:v{n}:{ciphertext}`) and the single active-key-per-install model, but
//! swaps the cipher for AES-256-GCM, matching the `aes-gcm` + `base64`
//! pairing already used for secret-at-rest handling in this codebase.

use aes_gcm::aead::Aead;
use aes_gcm::aead::KeyInit;
use aes_gcm::aead::OsRng;
use aes_gcm::Aes256Gcm;
use aes_gcm::Key;
use aes_gcm::Nonce;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use secrecy::ExposeSecret;
use secrecy::Secret;

use crate::errors::CoreError;
use crate::vault::KeyVault;

const ENCRYPTION_VERSION: &str = "v1";
const ENCRYPTION_PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;

pub struct CryptoBox<'a> {
    vault: &'a dyn KeyVault,
    service: String,
    cached_key: std::cell::RefCell<Option<[u8; 32]>>,
}

impl<'a> CryptoBox<'a> {
    pub fn new(vault: &'a dyn KeyVault, service: impl Into<String>) -> Self {
        Self { vault, service: service.into(), cached_key: std::cell::RefCell::new(None) }
    }

    fn key_bytes(&self) -> Result<[u8; 32], CoreError> {
        if let Some(cached) = *self.cached_key.borrow() {
            return Ok(cached);
        }
        let secret = self
            .vault
            .get_secret(&self.service, "encryption_key")?
            .ok_or_else(|| CoreError::KeyNotFound("encryption_key not found; call generate_key first".into()))?;
        let raw = BASE64
            .decode(secret.expose_secret().as_bytes())
            .map_err(|e| CoreError::DecryptionError(format!("stored key is not valid base64: {e}")))?;
        let arr: [u8; 32] = raw
            .try_into()
            .map_err(|_| CoreError::DecryptionError("stored key is not 32 bytes".to_string()))?;
        *self.cached_key.borrow_mut() = Some(arr);
        Ok(arr)
    }

    /// Generates and stores a new 256-bit key. Refuses to overwrite an
    /// existing key unless `force` is set, matching the original's
    /// `generate_key(force=False)` guard against silently orphaning
    /// previously-encrypted data.
    pub fn generate_key(&self, force: bool) -> Result<(), CoreError> {
        if !force && self.vault.get_secret(&self.service, "encryption_key")?.is_some() {
            return Err(CoreError::InvalidInput(
                "an encryption key already exists; pass force=true to overwrite".to_string(),
            ));
        }
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        let encoded = BASE64.encode(raw);
        self.vault.set_secret(&self.service, "encryption_key", &Secret::new(encoded))?;
        *self.cached_key.borrow_mut() = None;
        Ok(())
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CoreError> {
        let key_bytes = self.key_bytes()?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CoreError::DecryptionError(format!("encryption failed: {e}")))?;
        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(format!("{ENCRYPTION_PREFIX}{}", BASE64.encode(combined)))
    }

    pub fn decrypt(&self, encrypted_value: &str) -> Result<String, CoreError> {
        if !is_encrypted_value(encrypted_value) {
            return Err(CoreError::DecryptionError(format!(
                "malformed envelope; expected prefix {ENCRYPTION_PREFIX}"
            )));
        }
        let version = encryption_version(encrypted_value)
            .ok_or_else(|| CoreError::DecryptionError("could not parse envelope version".to_string()))?;
        if version != ENCRYPTION_VERSION {
            return Err(CoreError::DecryptionError(format!(
                "unsupported envelope version: expected {ENCRYPTION_VERSION}, got {version}"
            )));
        }
        let raw = BASE64
            .decode(&encrypted_value[ENCRYPTION_PREFIX.len()..])
            .map_err(|e| CoreError::DecryptionError(format!("invalid base64: {e}")))?;
        if raw.len() < NONCE_LEN {
            return Err(CoreError::DecryptionError("ciphertext too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let key_bytes = self.key_bytes()?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CoreError::DecryptionError("decryption failed: wrong key or corrupted data".to_string()))?;
        String::from_utf8(plaintext).map_err(|e| CoreError::DecryptionError(format!("decrypted value is not utf-8: {e}")))
    }
}

pub fn is_encrypted_value(value: &str) -> bool {
    value.starts_with("enc:v") && value.get(5..).is_some_and(|rest| rest.contains(':'))
}

pub fn encryption_version(value: &str) -> Option<&str> {
    let rest = value.strip_prefix("enc:")?;
    rest.split(':').next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::MemoryKeyVault;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let vault = MemoryKeyVault::new();
        let ebox = CryptoBox::new(&vault, "aimitsu");
        ebox.generate_key(false).unwrap();
        let enc = ebox.encrypt("vendor@example.com").unwrap();
        assert!(enc.starts_with("enc:v1:"));
        assert_eq!(ebox.decrypt(&enc).unwrap(), "vendor@example.com");
    }

    #[test]
    fn refuses_to_overwrite_key_without_force() {
        let vault = MemoryKeyVault::new();
        let ebox = CryptoBox::new(&vault, "aimitsu");
        ebox.generate_key(false).unwrap();
        assert!(ebox.generate_key(false).is_err());
        assert!(ebox.generate_key(true).is_ok());
    }

    #[test]
    fn rejects_mismatched_version() {
        assert!(!is_encrypted_value("plain text"));
        assert_eq!(encryption_version("enc:v1:abc"), Some("v1"));
        assert_eq!(encryption_version("enc:v2:abc"), Some("v2"));
    }

    #[test]
    fn decrypt_fails_without_key() {
        let vault = MemoryKeyVault::new();
        let ebox = CryptoBox::new(&vault, "aimitsu");
        assert!(ebox.decrypt("enc:v1:abc").is_err());
    }
}
