//! Composition root: loads configuration, opens the on-disk vault and
//! ledger, and wires the orchestrator's collaborators together. `main.rs`
//! is the only caller; every other module only ever sees the trait objects
//! and structs this produces, never the filesystem paths behind them.

use std::path::Path;
use std::path::PathBuf;

use crate::configuration::get_configuration;
use crate::configuration::Settings;
use crate::crypto::CryptoBox;
use crate::errors::CoreError;
use crate::hmac_hasher::HmacHasher;
use crate::ledger::SendLedger;
use crate::transport::smtp::SmtpTransport;
use crate::vault::default_vault_path;
use crate::vault::FileKeyVault;

pub struct Application {
    pub settings: Settings,
    pub base_dir: PathBuf,
    pub vault: FileKeyVault,
    pub ledger: SendLedger,
}

impl Application {
    pub async fn build(config_path: &Path, base_dir: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let base_dir = base_dir.into();
        let settings = get_configuration(config_path)?;
        let vault = FileKeyVault::new(default_vault_path(&base_dir));
        let ledger_path = settings.ledger_path(&base_dir);
        let ledger = SendLedger::connect(&ledger_path, settings.dedupe_busy_timeout_ms, settings.dedupe_retry_attempts).await?;
        Ok(Self { settings, base_dir, vault, ledger })
    }

    pub fn hmac(&self) -> HmacHasher<'_> {
        HmacHasher::new(&self.vault, self.settings.hmac_credential_service.clone(), &self.base_dir, self.settings.hmac_rotation_days)
    }

    pub fn crypto(&self) -> CryptoBox<'_> {
        CryptoBox::new(&self.vault, self.settings.credential_target_name.clone())
    }

    pub async fn transport(&self, dry_run: bool) -> Result<SmtpTransport, CoreError> {
        SmtpTransport::connect(&self.vault, &self.settings, &self.base_dir, dry_run).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_creates_ledger_and_vault_under_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let app = Application::build(&dir.path().join("config.json"), dir.path()).await.unwrap();
        assert!(dir.path().join("logs").join("send_ledger.sqlite3").exists());
        app.crypto().generate_key(false).unwrap();
        assert!(dir.path().join("logs").join("vault.json").exists());
    }
}
