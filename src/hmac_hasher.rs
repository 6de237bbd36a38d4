//! Versioned keyed hashing of normalized emails, used for `recipient_hash`
//! and the history log, plus the key-rotation/revocation registry that makes
//! old hashes explainable instead of simply unverifiable.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use hex::ToHex;
use hmac::Hmac;
use hmac::Mac;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde::Serialize;
use sha2::Sha256;

use crate::domain::VerificationStatus;
use crate::errors::CoreError;
use crate::vault::KeyVault;

type HmacSha256 = Hmac<Sha256>;

/// Vault secret name under which the single salt used by `hash_recipient` is
/// stored, scoped by `Settings::credential_target_name`.
pub const RECIPIENT_HASH_SALT_NAME: &str = "recipient_hash_salt_v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEntry {
    pub created_at_utc: DateTime<Utc>,
    pub status: KeyStatus,
}

/// `logs/request_history/hmac_key_registry.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HmacKeyRegistry {
    pub active_version: String,
    pub keys: BTreeMap<String, KeyEntry>,
}

impl Default for HmacKeyRegistry {
    fn default() -> Self { Self { active_version: String::new(), keys: BTreeMap::new() } }
}

pub struct HmacHasher<'a> {
    vault: &'a dyn KeyVault,
    service: String,
    registry_path: PathBuf,
    rotation_days: i64,
}

impl<'a> HmacHasher<'a> {
    pub fn new(vault: &'a dyn KeyVault, service: impl Into<String>, base_dir: &Path, rotation_days: i64) -> Self {
        Self {
            vault,
            service: service.into(),
            registry_path: base_dir.join("logs").join("request_history").join("hmac_key_registry.json"),
            rotation_days,
        }
    }

    fn load_registry(&self) -> Result<HmacKeyRegistry, CoreError> {
        if !self.registry_path.exists() {
            return Ok(HmacKeyRegistry::default());
        }
        let raw = std::fs::read_to_string(&self.registry_path)?;
        Ok(serde_json::from_str(&raw).unwrap_or_default())
    }

    fn save_registry(&self, registry: &HmacKeyRegistry) -> Result<(), CoreError> {
        if let Some(parent) = self.registry_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.registry_path, serde_json::to_string_pretty(registry)?)?;
        Ok(())
    }

    fn secret_name(version: &str) -> String { format!("aimitsu_hmac_key_{version}") }

    fn next_version(registry: &HmacKeyRegistry) -> String {
        let n = registry
            .keys
            .keys()
            .filter_map(|v| v.strip_prefix('v').and_then(|n| n.parse::<u32>().ok()))
            .max()
            .unwrap_or(0);
        format!("v{}", n + 1)
    }

    /// Returns the active version, minting a new one (and secret) if none
    /// exists yet or the active one has exceeded `rotation_days`. Never
    /// revokes the previous version here; `verification_status_for_version`
    /// is what downgrades old digests, not deletion.
    pub fn ensure_active_key(&self, now: DateTime<Utc>) -> Result<String, CoreError> {
        let mut registry = self.load_registry()?;

        let needs_rotation = match registry.keys.get(&registry.active_version) {
            Some(entry) => (now - entry.created_at_utc).num_days() >= self.rotation_days,
            None => true,
        };

        if needs_rotation {
            let new_version = Self::next_version(&registry);
            let mut raw = [0u8; 32];
            rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut raw);
            let secret = Secret::new(raw.encode_hex::<String>());
            self.vault.set_secret(&self.service, &Self::secret_name(&new_version), &secret)?;
            registry.keys.insert(new_version.clone(), KeyEntry { created_at_utc: now, status: KeyStatus::Active });
            registry.active_version = new_version;
            self.save_registry(&registry)?;
        }

        Ok(registry.active_version.clone())
    }

    fn key_secret(&self, version: &str) -> Result<Secret<String>, CoreError> {
        self.vault
            .get_secret(&self.service, &Self::secret_name(version))?
            .ok_or_else(|| CoreError::KeyNotFound(format!("hmac key {version} not found")))
    }

    /// SHA-256 of `salt + ":" + email_norm` using a per-install salt.
    pub fn hash_recipient(&self, email_norm: &str, salt: &Secret<String>) -> String {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(format!("{}:{email_norm}", salt.expose_secret()).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Keyed HMAC-SHA256 digest of `value` under a specific key version.
    pub fn hash_email(&self, value: &str, version: &str) -> Result<String, CoreError> {
        let secret = self.key_secret(version)?;
        let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
            .map_err(|e| CoreError::DecryptionError(format!("invalid hmac key length: {e}")))?;
        mac.update(value.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// `verifiable` unless the version is missing or revoked.
    pub fn verification_status_for_version(&self, version: &str) -> VerificationStatus {
        match self.load_registry() {
            Ok(registry) => match registry.keys.get(version) {
                Some(entry) if entry.status == KeyStatus::Active => VerificationStatus::Verifiable,
                _ => VerificationStatus::LegacyUnverifiable,
            },
            Err(_) => VerificationStatus::LegacyUnverifiable,
        }
    }

    pub fn revoke(&self, version: &str) -> Result<(), CoreError> {
        let mut registry = self.load_registry()?;
        if let Some(entry) = registry.keys.get_mut(version) {
            entry.status = KeyStatus::Revoked;
            self.save_registry(&registry)?;
        }
        Ok(())
    }
}

/// Versioned keyed HMAC of `request_key`, verifiable under the current and
/// immediately previous secret version (invariant 7 in SPEC_FULL.md §8).
pub fn build_idempotency_token(request_key: &str, secret: &Secret<String>) -> Result<String, CoreError> {
    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|e| CoreError::DecryptionError(format!("invalid idempotency secret length: {e}")))?;
    mac.update(request_key.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_idempotency_token(
    request_key: &str,
    token: &str,
    current: &Secret<String>,
    previous: Option<&Secret<String>>,
) -> bool {
    if build_idempotency_token(request_key, current).map(|t| t == token).unwrap_or(false) {
        return true;
    }
    if let Some(prev) = previous {
        if build_idempotency_token(request_key, prev).map(|t| t == token).unwrap_or(false) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::MemoryKeyVault;

    #[test]
    fn rotation_mints_new_version_when_due() {
        let vault = MemoryKeyVault::new();
        let dir = tempfile::tempdir().unwrap();
        let hasher = HmacHasher::new(&vault, "aimitsu", dir.path(), 30);
        let t0 = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let v1 = hasher.ensure_active_key(t0).unwrap();
        assert_eq!(v1, "v1");
        // still within rotation window
        let v1_again = hasher.ensure_active_key(t0 + chrono::Duration::days(10)).unwrap();
        assert_eq!(v1_again, "v1");
        // past rotation window
        let v2 = hasher.ensure_active_key(t0 + chrono::Duration::days(31)).unwrap();
        assert_eq!(v2, "v2");
    }

    #[test]
    fn revoked_version_is_legacy_unverifiable() {
        let vault = MemoryKeyVault::new();
        let dir = tempfile::tempdir().unwrap();
        let hasher = HmacHasher::new(&vault, "aimitsu", dir.path(), 30);
        let v1 = hasher.ensure_active_key(Utc::now()).unwrap();
        assert_eq!(hasher.verification_status_for_version(&v1), VerificationStatus::Verifiable);
        hasher.revoke(&v1).unwrap();
        assert_eq!(hasher.verification_status_for_version(&v1), VerificationStatus::LegacyUnverifiable);
    }

    #[test]
    fn idempotency_token_verifies_under_current_and_previous() {
        let current = Secret::new("secret-v2".to_string());
        let previous = Secret::new("secret-v1".to_string());
        let token = build_idempotency_token("rq:v2:abc", &previous).unwrap();
        assert!(verify_idempotency_token("rq:v2:abc", &token, &current, Some(&previous)));
        let stale = Secret::new("secret-v0".to_string());
        assert!(!verify_idempotency_token("rq:v2:abc", &token, &current, Some(&stale)));
    }
}
