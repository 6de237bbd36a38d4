//! Process-agnostic secret store.
//!
//! The original skill kept secrets in the Windows Credential Manager under a
//! per-skill service name; there is no portable equivalent, so the `KeyVault`
//! trait is the re-architected seam (see SPEC_FULL.md DESIGN NOTES) and
//! `FileKeyVault` is a conforming implementation backed by a single JSON
//! file on disk, scoped by service name the same way the original scoped by
//! credential target.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::CoreError;

pub trait KeyVault: Send + Sync {
    fn get_secret(&self, service: &str, name: &str) -> Result<Option<Secret<String>>, CoreError>;
    fn set_secret(&self, service: &str, name: &str, value: &Secret<String>) -> Result<(), CoreError>;
    fn delete_secret(&self, service: &str, name: &str) -> Result<bool, CoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VaultFile {
    // service -> name -> value. Values are plaintext on disk by design: this
    // file IS the root of trust, the same role the OS credential store plays
    // in the original skill.
    entries: HashMap<String, HashMap<String, String>>,
}

/// A single JSON file scoped to one service namespace per top-level key.
pub struct FileKeyVault {
    path: PathBuf,
}

impl FileKeyVault {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    fn load(&self) -> Result<VaultFile, CoreError> {
        if !self.path.exists() {
            return Ok(VaultFile::default());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(VaultFile::default());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    fn save(&self, file: &VaultFile) -> Result<(), CoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(file)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

impl KeyVault for FileKeyVault {
    fn get_secret(&self, service: &str, name: &str) -> Result<Option<Secret<String>>, CoreError> {
        let file = self.load()?;
        Ok(file.entries.get(service).and_then(|m| m.get(name)).map(|v| Secret::new(v.clone())))
    }

    fn set_secret(&self, service: &str, name: &str, value: &Secret<String>) -> Result<(), CoreError> {
        let mut file = self.load()?;
        file.entries
            .entry(service.to_string())
            .or_default()
            .insert(name.to_string(), value.expose_secret().clone());
        self.save(&file)
    }

    fn delete_secret(&self, service: &str, name: &str) -> Result<bool, CoreError> {
        let mut file = self.load()?;
        let removed = file.entries.get_mut(service).map(|m| m.remove(name).is_some()).unwrap_or(false);
        if removed {
            self.save(&file)?;
        }
        Ok(removed)
    }
}

/// In-memory vault used by tests; avoids touching the filesystem for
/// anything that isn't directly testing `FileKeyVault` itself.
#[cfg(test)]
pub struct MemoryKeyVault {
    entries: std::sync::Mutex<HashMap<(String, String), String>>,
}

#[cfg(test)]
impl MemoryKeyVault {
    pub fn new() -> Self { Self { entries: std::sync::Mutex::new(HashMap::new()) } }
}

#[cfg(test)]
impl KeyVault for MemoryKeyVault {
    fn get_secret(&self, service: &str, name: &str) -> Result<Option<Secret<String>>, CoreError> {
        Ok(self.entries.lock().unwrap().get(&(service.to_string(), name.to_string())).map(|v| Secret::new(v.clone())))
    }

    fn set_secret(&self, service: &str, name: &str, value: &Secret<String>) -> Result<(), CoreError> {
        self.entries.lock().unwrap().insert((service.to_string(), name.to_string()), value.expose_secret().clone());
        Ok(())
    }

    fn delete_secret(&self, service: &str, name: &str) -> Result<bool, CoreError> {
        Ok(self.entries.lock().unwrap().remove(&(service.to_string(), name.to_string())).is_some())
    }
}

pub fn default_vault_path(base_dir: &Path) -> PathBuf { base_dir.join("logs").join("vault.json") }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let vault = FileKeyVault::new(dir.path().join("vault.json"));
        assert!(vault.get_secret("svc", "k").unwrap().is_none());
        vault.set_secret("svc", "k", &Secret::new("shh".to_string())).unwrap();
        assert_eq!(vault.get_secret("svc", "k").unwrap().unwrap().expose_secret(), "shh");
        assert!(vault.delete_secret("svc", "k").unwrap());
        assert!(vault.get_secret("svc", "k").unwrap().is_none());
    }
}
