//! Thin CSV ingestion for recipient rows. Recognizes `{field}_enc` columns
//! holding `enc:v{n}:...` envelopes and decrypts them eagerly. A column whose
//! name and value shape disagree (one says encrypted, the other doesn't) is
//! treated as a corrupted file, not a recoverable one, matching the
//! original's `validate_encrypted_column` check.

use std::path::Path;

use crate::crypto::is_encrypted_value;
use crate::crypto::CryptoBox;
use crate::domain::RecipientRecord;
use crate::errors::CoreError;

const ENC_SUFFIX: &str = "_enc";

fn canonical_field(header: &str) -> (&str, bool) {
    match header.strip_suffix(ENC_SUFFIX) {
        Some(base) => (base, true),
        None => (header, false),
    }
}

fn resolve_value(header: &str, value: &str, crypto: Option<&CryptoBox>) -> Result<String, CoreError> {
    let (_, name_says_encrypted) = canonical_field(header);
    let value_is_encrypted = is_encrypted_value(value);
    match (name_says_encrypted, value_is_encrypted) {
        (true, true) => match crypto {
            Some(c) => c.decrypt(value),
            None => Err(CoreError::KeyNotFound(format!("column {header} is encrypted but no encryption key is configured"))),
        },
        (false, false) => Ok(value.to_string()),
        (true, false) => {
            Err(CoreError::InvalidInput(format!("column {header} is named as encrypted but its value is not in enc:v{{n}}: form")))
        }
        (false, true) => {
            Err(CoreError::InvalidInput(format!("column {header} is not named as encrypted but its value is in enc:v{{n}}: form")))
        }
    }
}

/// Reads a contacts CSV into `RecipientRecord`s. `email`/`email_enc` is
/// required; `company_name`/`company_name_enc` is optional and defaults to
/// an empty string when absent. Every other column is still shape-checked
/// against its name but otherwise discarded.
pub fn load_recipients(path: &Path, crypto: Option<&CryptoBox>) -> Result<Vec<RecipientRecord>, CoreError> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let email_idx = headers
        .iter()
        .position(|h| canonical_field(h).0 == "email")
        .ok_or_else(|| CoreError::InvalidInput("contacts CSV is missing an email/email_enc column".to_string()))?;
    let company_idx = headers.iter().position(|h| canonical_field(h).0 == "company_name");

    let mut records = Vec::new();
    for result in reader.records() {
        let row = result?;
        let mut email = None;
        let mut company_name = String::new();
        for (idx, header) in headers.iter().enumerate() {
            let value = row.get(idx).unwrap_or("");
            if value.is_empty() {
                continue;
            }
            let resolved = resolve_value(header, value, crypto)?;
            if idx == email_idx {
                email = Some(resolved);
            } else if Some(idx) == company_idx {
                company_name = resolved;
            }
        }
        let email = email.ok_or_else(|| CoreError::InvalidInput("row is missing an email value".to_string()))?;
        records.push(RecipientRecord { email, company_name });
    }
    Ok(records)
}
