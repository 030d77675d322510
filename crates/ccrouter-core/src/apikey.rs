//! Gemini API key resolution: environment, then macOS keychain, then the
//! provider config. Placeholder values never count as a key.

use std::sync::OnceLock;

use tracing::warn;

use crate::config::ConfigError;

pub const KEYCHAIN_SERVICE: &str = "claude-code-router";
pub const KEYCHAIN_ACCOUNT: &str = "gemini-api-key";

/// Write-once, read-many: the keychain prompt is expensive and the stored
/// value does not change while the router runs.
static KEYCHAIN_KEY: OnceLock<Option<String>> = OnceLock::new();

pub fn resolve_gemini_api_key(config_key: Option<&str>) -> Result<String, ConfigError> {
    if let Some(key) = std::env::var("GEMINI_API_KEY").ok().filter(|key| is_usable(key)) {
        return Ok(key);
    }
    if let Some(key) = keychain_key().filter(|key| is_usable(key)) {
        return Ok(key);
    }
    if let Some(key) = config_key.filter(|key| is_usable(key)) {
        return Ok(key.to_string());
    }
    Err(ConfigError::MissingGeminiApiKey)
}

fn is_usable(key: &str) -> bool {
    !key.is_empty() && key != "FROM_KEYCHAIN" && !key.starts_with("YOUR_")
}

fn keychain_key() -> Option<String> {
    KEYCHAIN_KEY.get_or_init(lookup_keychain).clone()
}

#[cfg(target_os = "macos")]
fn lookup_keychain() -> Option<String> {
    let output = std::process::Command::new("security")
        .args([
            "find-generic-password",
            "-s",
            KEYCHAIN_SERVICE,
            "-a",
            KEYCHAIN_ACCOUNT,
            "-w",
        ])
        .output();
    match output {
        Ok(output) if output.status.success() => {
            let key = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if key.is_empty() { None } else { Some(key) }
        }
        Ok(_) => None,
        Err(error) => {
            warn!(event = "keychain_lookup_failed", error = %error);
            None
        }
    }
}

#[cfg(not(target_os = "macos"))]
fn lookup_keychain() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_rejected() {
        assert!(!is_usable(""));
        assert!(!is_usable("FROM_KEYCHAIN"));
        assert!(!is_usable("YOUR_API_KEY_HERE"));
        assert!(is_usable("AIzaSyExample"));
    }

    #[test]
    fn missing_key_error_names_both_sources() {
        let message = ConfigError::MissingGeminiApiKey.to_string();
        assert!(message.contains("GEMINI_API_KEY"));
        assert!(message.contains("security add-generic-password"));
        assert!(message.contains(KEYCHAIN_SERVICE));
    }
}
