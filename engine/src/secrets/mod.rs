pub mod string;

pub use string::SecretString;

use courier_sdk::errors::DispatchError;
use keyring::Entry;
use regex::Regex;
use std::sync::OnceLock;

/// Keychain service name under which Courier secrets are stored
pub const SERVICE_NAME: &str = "courier";

/// SecretManager resolves credentials named in the configuration.
///
/// A secret named `TELEGRAM_BOT_TOKEN` is looked up as:
/// 1. the environment variable `TELEGRAM_BOT_TOKEN`
/// 2. the OS keychain entry (service `courier`, user `TELEGRAM_BOT_TOKEN`)
///
/// Keychain backends:
/// - macOS: Keychain
/// - Windows: Credential Manager
/// - Linux: Secret Service (libsecret)
///
/// The SecretManager also provides secret scrubbing for text that leaves the
/// process: failure reasons placed on the bus and conversation replies.
pub struct SecretManager {
    service_name: String,
}

/// Regex patterns for detecting common secret formats.
/// These are compiled once and reused.
static SECRET_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

/// Initializes and returns the secret detection patterns.
///
/// Patterns match:
/// - Telegram bot tokens, also inside Bot API urls: `<8-10 digits>:<35 chars>`
/// - Google API keys: AIza[0-9A-Za-z-_]{35}
/// - OpenAI style keys: sk-[a-zA-Z0-9]{20,}
/// - Bearer tokens: Bearer\s+[^\s]{20,}
fn get_secret_patterns() -> &'static Vec<Regex> {
    SECRET_PATTERNS.get_or_init(|| {
        [
            r"[0-9]{8,10}:[a-zA-Z0-9\-_]{35}",
            r"AIza[0-9A-Za-z\-_]{35}",
            r"sk-[a-zA-Z0-9\-_]{20,}",
            r"Bearer\s+[^\s]{20,}",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Scrubs secrets from text by replacing them with [REDACTED].
///
/// # Examples
/// ```
/// use courier_engine::secrets::scrub;
///
/// let scrubbed = scrub("download failed: https://api.telegram.org/file/bot123456789:ABCDEFGHIJKLMNOPQRSTUVWXYZ123456789/doc.pdf");
/// assert_eq!(scrubbed, "download failed: https://api.telegram.org/file/bot[REDACTED]/doc.pdf");
/// ```
pub fn scrub(text: &str) -> String {
    let mut result = text.to_string();

    for pattern in get_secret_patterns() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }

    result
}

impl SecretManager {
    /// Creates a new SecretManager with the given service name.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Resolves a required secret.
    ///
    /// # Arguments
    /// * `key` - The secret name from the configuration (e.g., "GEMINI_API_KEY")
    ///
    /// # Errors
    /// Returns `DispatchError::Secret` if the secret is missing everywhere or
    /// the keychain cannot be read
    pub fn resolve(&self, key: &str) -> Result<SecretString, DispatchError> {
        self.resolve_optional(key)?.ok_or_else(|| {
            DispatchError::Secret(format!(
                "Secret '{}' not found in environment or keychain",
                key
            ))
        })
    }

    /// Resolves a secret that may legitimately be absent (e.g. the bus token).
    pub fn resolve_optional(&self, key: &str) -> Result<Option<SecretString>, DispatchError> {
        if key.is_empty() {
            return Ok(None);
        }

        if let Ok(value) = std::env::var(key) {
            if !value.trim().is_empty() {
                tracing::debug!("Resolved secret '{}' from environment", key);
                return Ok(Some(SecretString::new(value.trim())));
            }
        }

        let entry = Entry::new(&self.service_name, key)
            .map_err(|e| DispatchError::Secret(format!("Failed to create keyring entry: {}", e)))?;

        match entry.get_password() {
            Ok(secret) => {
                tracing::debug!("Resolved secret '{}' from keychain", key);
                Ok(Some(SecretString::new(secret)))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            // No keychain backend on this host behaves like a missing entry
            Err(keyring::Error::PlatformFailure(e)) | Err(keyring::Error::NoStorageAccess(e)) => {
                tracing::debug!("Keychain unavailable while resolving '{}': {}", key, e);
                Ok(None)
            }
            Err(e) => Err(DispatchError::Secret(format!(
                "Failed to retrieve secret '{}': {}",
                key, e
            ))),
        }
    }

    /// Stores a secret in the OS keychain.
    ///
    /// # Errors
    /// Returns `DispatchError::Secret` if keychain access fails
    pub fn set_secret(&self, key: &str, value: &str) -> Result<(), DispatchError> {
        let entry = Entry::new(&self.service_name, key)
            .map_err(|e| DispatchError::Secret(format!("Failed to create keyring entry: {}", e)))?;

        entry
            .set_password(value)
            .map_err(|e| DispatchError::Secret(format!("Failed to store secret '{}': {}", key, e)))?;

        tracing::info!("Stored secret '{}' in keychain", key);
        Ok(())
    }

    /// Deletes a secret from the OS keychain.
    pub fn delete_secret(&self, key: &str) -> Result<(), DispatchError> {
        let entry = Entry::new(&self.service_name, key)
            .map_err(|e| DispatchError::Secret(format!("Failed to create keyring entry: {}", e)))?;

        entry.delete_password().map_err(|e| {
            DispatchError::Secret(format!("Failed to delete secret '{}': {}", key, e))
        })?;

        tracing::info!("Deleted secret '{}' from keychain", key);
        Ok(())
    }

    /// Scrubs secrets from text. See [`scrub`].
    pub fn scrub(&self, text: &str) -> String {
        scrub(text)
    }
}

impl Default for SecretManager {
    fn default() -> Self {
        Self::new(SERVICE_NAME)
    }
}
