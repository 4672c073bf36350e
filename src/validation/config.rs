use anyhow::{bail, Result};

/// The minimum length of the credential cache passphrase.
pub const MIN_SECRET_LENGTH: usize = 8;

/// Validates that a numeric setting meets its lower bound.
///
/// # Arguments
///
/// * `name` - The environment variable, used in the error message.
/// * `value` - The parsed value.
/// * `min` - The smallest accepted value.
pub fn at_least(name: &str, value: u64, min: u64) -> Result<()> {
    if value < min {
        bail!("{} must be at least {} (got {})", name, min, value);
    }
    Ok(())
}

/// Validates the credential cache passphrase.
///
/// # Arguments
///
/// * `secret` - The passphrase. Never included in the error.
pub fn cache_secret(secret: &str) -> Result<()> {
    if secret.chars().count() < MIN_SECRET_LENGTH {
        bail!(
            "CACHE_SECRET must be at least {} characters long",
            MIN_SECRET_LENGTH
        );
    }
    Ok(())
}

/// Validates that a setting is an http(s) URL.
pub fn http_url(name: &str, value: &str) -> Result<()> {
    let value = value.trim();
    if !(value.starts_with("http://") || value.starts_with("https://")) {
        bail!("{} must start with http:// or https://", name);
    }
    let host = value
        .split_once("://")
        .map(|(_, rest)| rest.trim_matches('/'))
        .unwrap_or_default();
    if host.is_empty() {
        bail!("{} must include a host", name);
    }
    Ok(())
}
