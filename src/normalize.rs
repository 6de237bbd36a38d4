//! Deterministic normalizers and identity-key derivation.
//!
//! Every identity comparison in the ledger flows through the functions here
//! rather than comparing raw operator input directly, so that cosmetic
//! differences (casing, tracking query params, stray whitespace) never
//! produce two distinct keys for what is semantically one request.

use percent_encoding::percent_decode_str;
use percent_encoding::utf8_percent_encode;
use percent_encoding::AsciiSet;
use percent_encoding::CONTROLS;
use sha2::Digest;
use sha2::Sha256;
use unicode_normalization::UnicodeNormalization;
use url::Url;

/// Query-param keys stripped from `canonical_input_url` because they carry
/// no request identity, only marketing attribution.
const TRACKING_PARAMS: &[&str] = &["gclid", "fbclid", "msclkid", "mc_cid", "mc_eid", "_ga", "_gl", "yclid"];

/// Same safe set `url` itself uses for path segments; re-used here so that
/// decode-then-encode is idempotent.
const PATH_SAFE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'{')
    .add(b'}');

fn nfkc(s: &str) -> String { s.nfkc().collect::<String>() }

fn sha256_hex(s: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

/// NFKC-fold, lowercase, then extract the first `local@domain` token.
/// Falls back to the folded/lowercased string if no token is found, so the
/// function is total: every input produces *some* stable normal form.
pub fn email_norm(input: &str) -> String {
    let folded = nfkc(input).to_lowercase();
    match folded.split_whitespace().find(|tok| tok.contains('@')) {
        Some(tok) => tok.trim_matches(|c: char| !c.is_alphanumeric() && c != '@' && c != '.' && c != '+' && c != '-' && c != '_').to_string(),
        None => folded,
    }
}

pub fn maker_code_norm(input: &str) -> String { nfkc(input.trim()).to_lowercase() }

pub fn subject_norm(input: &str) -> String {
    let folded = nfkc(input.trim());
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonicalizes a quantity: integers collapse to their digit string,
/// fractional values drop trailing zeroes, anything non-numeric is folded
/// and lowercased like any other free-text token.
pub fn quantity_norm(input: &str) -> String {
    let folded = nfkc(input.trim());
    match folded.parse::<f64>() {
        Ok(n) if n.fract() == 0.0 => format!("{}", n as i64),
        Ok(n) => {
            let s = format!("{n}");
            s.trim_end_matches('0').trim_end_matches('.').to_string()
        }
        Err(_) => folded.to_lowercase(),
    }
}

pub fn body_fingerprint(body: &str) -> String { sha256_hex(&nfkc(body)) }

/// Scheme/host lowercasing, default-port stripping, path percent
/// re-normalization, tracking-query removal, and deterministic
/// `(key, value)` query ordering. Fragment is dropped entirely.
///
/// Returns the original (trimmed) input unchanged if it does not parse as a
/// URL at all, so callers never have to special-case malformed input before
/// deriving a `request_key` from it.
pub fn canonical_input_url(input: &str) -> String {
    let Ok(mut url) = Url::parse(input.trim()) else {
        return input.trim().to_string();
    };

    let scheme = url.scheme().to_lowercase();
    let _ = url.set_scheme(&scheme);

    if let Some(host) = url.host_str() {
        let host = host.to_lowercase();
        let _ = url.set_host(Some(&host));
    }

    let default_port = match scheme.as_str() {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    };
    if url.port() == default_port {
        let _ = url.set_port(None);
    }

    let decoded_path = percent_decode_str(url.path()).decode_utf8_lossy().into_owned();
    let renormalized_path = decoded_path
        .split('/')
        .map(|seg| utf8_percent_encode(seg, PATH_SAFE).to_string())
        .collect::<Vec<_>>()
        .join("/");
    url.set_path(&renormalized_path);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &pairs {
            serializer.append_pair(k, v);
        }
        url.set_query(Some(&serializer.finish()));
    }

    url.set_fragment(None);
    url.to_string()
}

fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key)
}

/// `"rq:" + key_version + ":" + sha256(email_norm \n maker_code_norm \n canonical_input_url \n quantity_norm)`
pub fn request_key(key_version: &str, email: &str, maker_code: &str, url: &str, quantity: &str) -> String {
    let material = format!(
        "{}\n{}\n{}\n{}",
        email_norm(email),
        maker_code_norm(maker_code),
        canonical_input_url(url),
        quantity_norm(quantity)
    );
    format!("rq:{key_version}:{}", sha256_hex(&material))
}

/// `"mk:v2:" + sha256(email_norm \n subject_norm \n body_fingerprint)`
pub fn mail_key(email: &str, subject: &str, body: &str) -> String {
    let material = format!("{}\n{}\n{}", email_norm(email), subject_norm(subject), body_fingerprint(body));
    format!("mk:v2:{}", sha256_hex(&material))
}

/// Legacy equivalence key, recognized only when reading past sends: a
/// `v1_key` match still blocks a fresh `v2` send for the same recipient.
pub fn v1_key(email: &str, subject: &str, template_content: &str) -> String {
    let digest = sha256_hex(&format!("{subject}\n{template_content}"));
    format!("{}:{digest}", email_norm(email))
}

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;

    use super::*;

    #[test]
    fn email_norm_extracts_token() {
        assert_eq!(email_norm("  John.Doe@Example.COM  "), "john.doe@example.com");
        assert_eq!(email_norm("Contact: jane@example.com for quotes"), "jane@example.com");
    }

    #[test]
    fn email_norm_falls_back_when_no_token() {
        assert_eq!(email_norm("NO EMAIL HERE"), "no email here");
    }

    #[test]
    fn subject_norm_collapses_whitespace() {
        assert_eq!(subject_norm("  hello   world\t\n"), "hello world");
    }

    #[test]
    fn quantity_norm_integer_and_fraction() {
        assert_eq!(quantity_norm("3.0"), "3");
        assert_eq!(quantity_norm("3.50"), "3.5");
        assert_eq!(quantity_norm("three"), "three");
    }

    #[test]
    fn canonical_url_strips_tracking_and_sorts() {
        let a = canonical_input_url("https://Example.com:443/item?utm_source=a&b=2&a=1");
        let b = canonical_input_url("http://example.com/item?a=1&b=2");
        assert_eq!(a, "https://example.com/item?a=1&b=2");
        assert_ne!(a, b); // scheme differs on purpose; port-stripping covered above
    }

    #[test]
    fn canonical_url_sku_change_changes_key() {
        let a = canonical_input_url("https://example.com/item?sku=1");
        let b = canonical_input_url("https://example.com/item?sku=2");
        assert_ne!(a, b);
    }

    // Invariant 3: URLs differing only in tracking params / ordering / casing
    // of scheme+host produce the same request_key.
    #[quickcheck]
    fn invariant_key_stability_under_url_noise(sku: u32) -> bool {
        let a = format!("https://Example.com/item?sku={sku}&utm_source=newsletter");
        let b = format!("https://example.com/item?utm_campaign=x&sku={sku}");
        request_key("v2", "a@x.test", "CODE-1", &a, "1") == request_key("v2", "a@x.test", "CODE-1", &b, "1")
    }

    // Invariant 4: changing a non-tracking query value changes request_key.
    #[quickcheck]
    fn invariant_key_changes_under_sku_change(sku_a: u32, sku_b: u32) -> bool {
        if sku_a == sku_b {
            return true;
        }
        let a = format!("https://example.com/item?sku={sku_a}");
        let b = format!("https://example.com/item?sku={sku_b}");
        request_key("v2", "a@x.test", "CODE-1", &a, "1") != request_key("v2", "a@x.test", "CODE-1", &b, "1")
    }

    #[test]
    fn v1_key_matches_legacy_format() {
        let k = v1_key("User@Example.com", "Subject", "template body");
        assert!(k.starts_with("user@example.com:"));
    }
}
