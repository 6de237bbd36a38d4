//! Small free functions shared by the audit writer and the workflow arbiter:
//! PII masking and filesystem-safe name sanitization.

use regex::Regex;

/// Conservative email-token pattern; intentionally the same shape used by
/// `email_norm`'s extraction so masking and normalization never disagree
/// about what counts as "an email" inside a larger string.
fn email_pattern() -> Regex {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("static pattern is valid")
}

/// Screen format: `first3_or_less + "***@domain"`. The domain is preserved
/// so operators can still tell which vendor a masked row belongs to.
pub fn mask_email_for_screen(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let visible: String = local.chars().take(3).collect();
            format!("{visible}***@{domain}")
        }
        None => "***".to_string(),
    }
}

/// Audit/error format: the local part is never shown, regardless of length.
pub fn mask_email_for_error(email: &str) -> String {
    match email.split_once('@') {
        Some((_, domain)) => format!("***@{domain}"),
        None => "***".to_string(),
    }
}

/// Replaces every email-shaped substring of `text` with its error-masked
/// form. Used to scrub free-text error messages that might echo a
/// recipient's address back verbatim.
pub fn mask_emails_in_text(text: &str) -> String {
    let pattern = email_pattern();
    pattern
        .replace_all(text, |caps: &regex::Captures| mask_email_for_error(&caps[0]))
        .into_owned()
}

/// Replaces Windows-invalid filename characters with `_` and strips
/// trailing spaces/dots, matching the constraint the original draft
/// filenames were written under (so drafts stay portable to a Windows
/// desktop even though this binary need not run there).
pub fn sanitize_filename_component(input: &str) -> String {
    const INVALID: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];
    let replaced: String = input.chars().map(|c| if INVALID.contains(&c) { '_' } else { c }).collect();
    replaced.trim_end_matches([' ', '.']).to_string()
}

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;

    use super::*;

    #[test]
    fn screen_mask_preserves_domain() {
        assert_eq!(mask_email_for_screen("john.doe@example.com"), "joh***@example.com");
        assert_eq!(mask_email_for_screen("ab@example.com"), "ab***@example.com");
    }

    #[test]
    fn error_mask_hides_local_part_entirely() {
        assert_eq!(mask_email_for_error("john.doe@example.com"), "***@example.com");
    }

    #[test]
    fn masks_recursively_inside_free_text() {
        let text = "failed to deliver to john@example.com: SMTP 550 (cc jane@example.com)";
        let masked = mask_emails_in_text(text);
        assert!(!masked.contains("john@"));
        assert!(!masked.contains("jane@"));
        assert!(masked.contains("***@example.com"));
    }

    #[test]
    fn sanitizes_windows_invalid_characters() {
        assert_eq!(sanitize_filename_component(r#"a/b:c*d?e"f<g>h|i"#), "a_b_c_d_e_f_g_h_i");
        assert_eq!(sanitize_filename_component("trailing dot. "), "trailing dot");
    }

    // Invariant 8: screen masking never reveals more than the first 3
    // local-part characters, regardless of input.
    #[quickcheck]
    fn invariant_mask_laws(local: String, domain: String) -> bool {
        if local.is_empty() || domain.is_empty() || local.contains('@') || domain.contains('@') {
            return true;
        }
        let email = format!("{local}@{domain}");
        let screen = mask_email_for_screen(&email);
        let error = mask_email_for_error(&email);
        error == format!("***@{domain}") && screen.ends_with(&format!("***@{domain}"))
    }
}
