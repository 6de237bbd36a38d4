use std::path::Path;
use std::path::PathBuf;

use config::Config;
use config::ConfigError;
use config::FileFormat;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RerunPolicy {
    AutoSkip,
    Confirm,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RerunScope {
    Global,
    SameRun,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum WorkflowMode {
    Enhanced,
    Legacy,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum SendMode {
    Auto,
    Manual,
    DraftOnly,
}

fn default_dedupe_key_version() -> String { "v2".to_string() }
fn default_rerun_window_hours() -> i64 { 24 }
fn default_in_progress_ttl_sec() -> i64 { 300 }
fn default_heartbeat_sec() -> i64 { 60 }
fn default_unknown_sent_hold_sec() -> i64 { 1800 }
fn default_idempotency_secret_version() -> String { "v1".to_string() }
fn default_busy_timeout_ms() -> u64 { 1000 }
fn default_retry_attempts() -> u32 { 5 }
fn default_log_retention_days() -> i64 { 90 }
fn default_max_recipients() -> usize { 50 }
fn default_confirmation_threshold() -> usize { 5 }
fn default_send_interval_sec() -> f64 { 1.0 }
fn default_hmac_rotation_days() -> i64 { 90 }
fn default_hmac_credential_service() -> String { "aimitsu-dispatch".to_string() }
fn default_request_history_retention_days() -> i64 { 365 }
fn default_credential_target_name() -> String { "aimitsu-dispatch".to_string() }

/// Mirrors the recognized keys of `config.json`. Only non-secret policy
/// knobs live here; secrets (vault-backed values, HMAC keys) never appear in
/// this file or its environment-variable overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_credential_target_name")]
    pub credential_target_name: String,

    #[serde(default = "default_dedupe_key_version")]
    pub dedupe_key_version: String,

    #[serde(default = "default_rerun_policy")]
    pub rerun_policy_default: RerunPolicy,

    #[serde(default = "default_rerun_scope")]
    pub rerun_scope: RerunScope,

    #[serde(default = "default_rerun_window_hours", deserialize_with = "deserialize_number_from_string")]
    pub rerun_window_hours: i64,

    #[serde(default = "default_in_progress_ttl_sec", deserialize_with = "deserialize_number_from_string")]
    pub dedupe_in_progress_ttl_sec: i64,

    #[serde(default = "default_heartbeat_sec", deserialize_with = "deserialize_number_from_string")]
    pub dedupe_heartbeat_sec: i64,

    #[serde(default = "default_unknown_sent_hold_sec", deserialize_with = "deserialize_number_from_string")]
    pub unknown_sent_hold_sec: i64,

    #[serde(default = "default_idempotency_secret_version")]
    pub idempotency_secret_version: String,

    #[serde(default = "default_busy_timeout_ms", deserialize_with = "deserialize_number_from_string")]
    pub dedupe_busy_timeout_ms: u64,

    #[serde(default = "default_retry_attempts", deserialize_with = "deserialize_number_from_string")]
    pub dedupe_retry_attempts: u32,

    #[serde(default = "default_log_retention_days", deserialize_with = "deserialize_number_from_string")]
    pub log_retention_days: i64,

    #[serde(default = "default_max_recipients", deserialize_with = "deserialize_number_from_string")]
    pub max_recipients: usize,

    #[serde(default = "default_confirmation_threshold", deserialize_with = "deserialize_number_from_string")]
    pub confirmation_threshold: usize,

    #[serde(default = "default_send_interval_sec")]
    pub send_interval_sec: f64,

    #[serde(default = "default_workflow_mode")]
    pub workflow_mode_default: WorkflowMode,

    #[serde(default = "default_send_mode")]
    pub send_mode_default: SendMode,

    #[serde(default = "default_hmac_rotation_days", deserialize_with = "deserialize_number_from_string")]
    pub hmac_rotation_days: i64,

    #[serde(default = "default_hmac_credential_service")]
    pub hmac_credential_service: String,

    #[serde(default = "default_request_history_retention_days", deserialize_with = "deserialize_number_from_string")]
    pub request_history_retention_days: i64,

    #[serde(default)]
    pub domain_whitelist: Vec<String>,

    #[serde(default)]
    pub domain_blacklist: Vec<String>,
}

fn default_rerun_policy() -> RerunPolicy { RerunPolicy::AutoSkip }
fn default_rerun_scope() -> RerunScope { RerunScope::Global }
fn default_workflow_mode() -> WorkflowMode { WorkflowMode::Legacy }
fn default_send_mode() -> SendMode { SendMode::DraftOnly }

impl Settings {
    pub fn ledger_path(&self, base_dir: &Path) -> PathBuf { base_dir.join("logs").join("send_ledger.sqlite3") }
}

/// Loads `config.json` (falling back to built-in defaults for every field if
/// the file is absent), layered with `APP_`-prefixed environment overrides
/// using `__` as the nesting separator.
pub fn get_configuration(config_path: &Path) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();
    if config_path.exists() {
        builder = builder.add_source(config::File::from(config_path).format(FileFormat::Json));
    } else {
        // An absent config.json is not an error: every field above has a
        // default matching the documented external-interfaces contract.
        builder = builder.add_source(config::File::from_str("{}", FileFormat::Json));
    }
    let settings = builder
        .add_source(config::Environment::with_prefix("APP").separator("__"))
        .build()?;
    settings.try_deserialize()
}
