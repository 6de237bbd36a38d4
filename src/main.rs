use std::collections::HashSet;
use std::path::PathBuf;

use aimitsu_dispatch::configuration::SendMode;
use aimitsu_dispatch::configuration::WorkflowMode;
use aimitsu_dispatch::domain::BatchResult;
use aimitsu_dispatch::domain::OverrideKind;
use aimitsu_dispatch::domain::ProductRequest;
use aimitsu_dispatch::errors::CoreError;
use aimitsu_dispatch::hmac_hasher::RECIPIENT_HASH_SALT_NAME;
use aimitsu_dispatch::ledger::OverrideRecord;
use aimitsu_dispatch::normalize;
use aimitsu_dispatch::orchestrator::BatchRequest;
use aimitsu_dispatch::orchestrator::SendOrchestrator;
use aimitsu_dispatch::startup::Application;
use aimitsu_dispatch::telemetry::get_subscriber;
use aimitsu_dispatch::telemetry::init_subscriber;
use aimitsu_dispatch::template::PlaceholderRenderer;
use aimitsu_dispatch::vault::KeyVault;
use aimitsu_dispatch::workflow::HearingInput;
use aimitsu_dispatch::workflow::WorkflowArbiter;
use aimitsu_dispatch::workflow::WorkflowRequest;
use clap::Parser;
use clap::Subcommand;

#[derive(Parser)]
#[command(name = "aimitsu-dispatch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs one orchestrator batch end to end and writes the audit/CSV outputs.
    Send {
        #[arg(long, default_value = "./config.json")]
        config: PathBuf,
        #[arg(long, default_value = ".")]
        base_dir: PathBuf,
        #[arg(long)]
        contacts: PathBuf,
        #[arg(long = "maker-code")]
        maker_code: String,
        #[arg(long = "product-url")]
        product_url: String,
        #[arg(long)]
        quantity: String,
        #[arg(long)]
        subject: String,
        #[arg(long = "run-id")]
        run_id: String,
        #[arg(long = "dry-run")]
        dry_run: bool,
    },
    /// Administers `rerun_overrides` directly.
    RerunOverride {
        #[arg(long, default_value = "./config.json")]
        config: PathBuf,
        #[arg(long, default_value = ".")]
        base_dir: PathBuf,
        #[arg(long = "allow-key")]
        allow_key: Option<String>,
        #[arg(long = "allow-recipient")]
        allow_recipient: Option<String>,
        #[arg(long = "ttl-min", default_value_t = 30)]
        ttl_min: i64,
        #[arg(long, default_value = "")]
        reason: String,
        #[arg(long, default_value = "")]
        operator: String,
        #[arg(long)]
        status: bool,
        #[arg(long)]
        clear: bool,
    },
    /// Drives the `WorkflowArbiter`.
    RunWorkflow {
        #[arg(long, default_value = "./config.json")]
        config: PathBuf,
        #[arg(long, default_value = ".")]
        base_dir: PathBuf,
        #[arg(long = "workflow-mode")]
        workflow_mode: WorkflowMode,
        #[arg(long = "send-mode")]
        send_mode: SendMode,
        #[arg(long = "hearing-input")]
        hearing_input: Option<PathBuf>,
        #[arg(long = "request-id")]
        request_id: String,
        #[arg(long = "rerun-of-run-id")]
        rerun_of_run_id: Option<String>,
        #[arg(long = "user-approved")]
        user_approved: bool,
    },
}

#[tokio::main]
async fn main() {
    let subscriber = get_subscriber("aimitsu-dispatch", "info", std::io::stdout);
    init_subscriber(subscriber);

    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Send { config, base_dir, contacts, maker_code, product_url, quantity, subject, run_id, dry_run } => {
            run_send(config, base_dir, contacts, maker_code, product_url, quantity, subject, run_id, dry_run).await
        }
        Commands::RerunOverride { config, base_dir, allow_key, allow_recipient, ttl_min, reason, operator, status, clear } => {
            run_rerun_override(config, base_dir, allow_key, allow_recipient, ttl_min, reason, operator, status, clear).await
        }
        Commands::RunWorkflow { config, base_dir, workflow_mode, send_mode, hearing_input, request_id, rerun_of_run_id, user_approved } => {
            run_workflow(config, base_dir, workflow_mode, send_mode, hearing_input, request_id, rerun_of_run_id, user_approved).await
        }
    };

    match outcome {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(error.message = %e, "command failed");
            std::process::exit(e.exit_code());
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_send(
    config: PathBuf,
    base_dir: PathBuf,
    contacts: PathBuf,
    maker_code: String,
    product_url: String,
    quantity: String,
    subject: String,
    run_id: String,
    dry_run: bool,
) -> Result<(), CoreError> {
    let app = Application::build(&config, base_dir.as_path()).await?;
    let hmac = app.hmac();
    let crypto = app.crypto();
    let transport = app.transport(dry_run).await?;
    let renderer = PlaceholderRenderer;

    let recipients = aimitsu_dispatch::contacts::load_recipients(&contacts, Some(&crypto))?;
    if recipients.len() > app.settings.max_recipients {
        return Err(CoreError::InvalidInput(format!(
            "batch of {} recipients exceeds max_recipients={}",
            recipients.len(),
            app.settings.max_recipients
        )));
    }

    let product = ProductRequest { maker_code, product_url, quantity, subject, body_template: String::new() };
    let orchestrator = SendOrchestrator::new(&app.ledger, &transport, &app.vault, &hmac, &renderer, &app.settings);
    let request = BatchRequest {
        run_id: run_id.clone(),
        product: product.clone(),
        recipients,
        confirm_bulk: false,
        confirm_rerun: HashSet::new(),
        confirm_unknown_sent: HashSet::new(),
    };

    let started_at = chrono::Utc::now();
    let result: BatchResult = orchestrator.run_batch(&request).await?;
    let finished_at = chrono::Utc::now();

    let audit = aimitsu_dispatch::audit::AuditWriter::new(base_dir.as_path(), Some(&crypto));
    let execution_id = uuid::Uuid::new_v4().to_string();
    let record = audit.build_record(
        &result,
        &product,
        &app.settings.dedupe_key_version,
        &execution_id,
        "cli",
        &contacts.display().to_string(),
        started_at,
        finished_at,
    );
    audit.write_audit_json(&record)?;
    let sent_at: Vec<(String, Option<String>)> =
        result.outcomes.iter().map(|o| (o.request_key.clone(), Some(finished_at.to_rfc3339()))).collect();
    audit.write_sent_list(&record, &sent_at)?;
    audit.write_unsent_list(&record)?;

    if result.confirmation_required_count > 0 {
        return Err(CoreError::ConfirmationRequired {
            reason: format!("{} recipient(s) require confirmation", result.confirmation_required_count),
        });
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_rerun_override(
    config: PathBuf,
    base_dir: PathBuf,
    allow_key: Option<String>,
    allow_recipient: Option<String>,
    ttl_min: i64,
    reason: String,
    operator: String,
    status: bool,
    clear: bool,
) -> Result<(), CoreError> {
    let app = Application::build(&config, base_dir.as_path()).await?;
    let hmac = app.hmac();

    let (kind, kind_tag, target_hash) = match (&allow_key, &allow_recipient) {
        (Some(key), None) => (OverrideKind::RequestKey, "request_key", key.clone()),
        (None, Some(email)) => {
            let salt = app
                .vault
                .get_secret(&app.settings.credential_target_name, RECIPIENT_HASH_SALT_NAME)?
                .ok_or_else(|| CoreError::KeyNotFound(RECIPIENT_HASH_SALT_NAME.to_string()))?;
            let hash = hmac.hash_recipient(&normalize::email_norm(email), &salt);
            (OverrideKind::Recipient, "recipient", hash)
        }
        _ => return Err(CoreError::InvalidInput("exactly one of --allow-key or --allow-recipient is required".to_string())),
    };

    if status {
        let active = app.ledger.override_status(kind_tag, &target_hash).await?;
        println!("{kind_tag}:{target_hash} => {}", match active {
            Some(true) => "active",
            Some(false) => "expired",
            None => "not_found",
        });
        return Ok(());
    }

    if clear {
        let removed = app.ledger.clear_overrides(kind_tag, &target_hash).await?;
        println!("cleared {removed} override row(s) for {kind_tag}:{target_hash}");
        return Ok(());
    }

    let record = OverrideRecord {
        kind,
        target_hash,
        ttl_minutes: ttl_min,
        reason,
        operator,
        host: hostname(),
        command_summary_redacted: "rerun-override (recipient redacted)".to_string(),
    };
    app.ledger.add_override(&record).await?;
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

#[allow(clippy::too_many_arguments)]
async fn run_workflow(
    config: PathBuf,
    base_dir: PathBuf,
    workflow_mode: WorkflowMode,
    send_mode: SendMode,
    hearing_input_path: Option<PathBuf>,
    request_id: String,
    rerun_of_run_id: Option<String>,
    user_approved: bool,
) -> Result<(), CoreError> {
    let app = Application::build(&config, base_dir.as_path()).await?;
    let hmac = app.hmac();

    let hearing_input: Option<HearingInput> = match hearing_input_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Some(serde_json::from_str(&raw)?)
        }
        None => None,
    };

    let run_id = rerun_of_run_id.unwrap_or_else(|| request_id.clone());
    let recipients = hearing_input.as_ref().map(|h| h.final_recipients.clone()).unwrap_or_default();
    let product_name = request_id.clone();

    // run-workflow's CLI surface carries no maker-code/product-url/quantity
    // flags (it finalizes a run_id a prior `send` already dispatched), so
    // there is no product identity to thread through here; the safety-gate
    // lock lookup for this call degrades to an empty-product request_key.
    let arbiter = WorkflowArbiter::new(&app.ledger, &hmac, &app.vault, &app.settings, base_dir.as_path());
    let request = WorkflowRequest {
        request_id,
        run_id,
        workflow_mode,
        send_mode,
        hearing_input,
        user_approved,
        product_name,
        maker_code: String::new(),
        product_url: String::new(),
        quantity: String::new(),
        recipients,
        operator: "cli".to_string(),
    };

    let draft_body = format!("# {}\n\nrecipients: {}\n", request.product_name, request.recipients.len());
    let outcome = arbiter.finalize(&request, &draft_body).await?;
    println!("workflow state: {}", outcome.state);
    if !outcome.blocked_reasons.is_empty() {
        println!("blocked reasons: {}", outcome.blocked_reasons.join(", "));
    }
    Ok(())
}
