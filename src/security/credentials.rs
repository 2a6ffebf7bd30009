//! Masking of storage credentials for safe logging
//!
//! Profile secrets are held in `SecretString`; these helpers make sure neither
//! the access key nor the secret key reaches a log line or a report verbatim.

use secrecy::ExposeSecret;

use crate::core::config::StorageProfile;

/// Masks a credential for safe logging
///
/// Shows only the first 3 and last 3 characters for identification purposes.
/// Values shorter than 10 characters are fully masked as "****".
///
/// # Examples
///
/// ```
/// use bucket_publisher::security::mask_secret;
///
/// assert_eq!(mask_secret("AKIAEXAMPLE123456"), "AKI...456");
/// assert_eq!(mask_secret("short"), "****");
/// ```
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() < 10 {
        return "****".to_string();
    }

    let prefix: String = chars[..3].iter().collect();
    let suffix: String = chars[chars.len() - 3..].iter().collect();
    format!("{}...{}", prefix, suffix)
}

/// Replace any credential of `profile` found in `text` with its masked form
///
/// Storage services sometimes echo the request back in error messages; run
/// those through here before they are logged or stored in a report.
pub fn redact_profile(text: &str, profile: &StorageProfile) -> String {
    let mut redacted = text.to_string();

    let secret = profile.secret_key().expose_secret();
    if !secret.is_empty() {
        redacted = redacted.replace(secret, &mask_secret(secret));
    }

    let access_key = profile.access_key();
    if !access_key.is_empty() {
        redacted = redacted.replace(access_key, &mask_secret(access_key));
    }

    redacted
}
