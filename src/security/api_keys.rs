use serde::{Deserialize, Deserializer};
use std::env;
use std::fmt;

/// Minimum length accepted for API keys and secrets
pub const MIN_KEY_LENGTH: usize = 16;

/// Secret string that never prints in clear
#[derive(Clone, PartialEq, Eq)]
pub struct SecureApiKey {
    key: String,
}

impl SecureApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// Get the raw key (use with caution)
    pub fn expose(&self) -> &str {
        &self.key
    }

    /// Load a key from an environment variable; unset and empty are both errors
    pub fn from_env(var_name: &str) -> Result<Self, ApiKeyError> {
        let key = env::var(var_name).map_err(|_| ApiKeyError::Missing(var_name.to_string()))?;
        if key.trim().is_empty() {
            return Err(ApiKeyError::Empty(var_name.to_string()));
        }
        Ok(Self::new(key))
    }

    /// Check the key is plausibly well-formed without contacting anyone
    pub fn validate(&self, field: &str) -> Result<(), ApiKeyError> {
        if self.key.is_empty() {
            return Err(ApiKeyError::Empty(field.to_string()));
        }
        if self.key.chars().any(char::is_whitespace) {
            return Err(ApiKeyError::Malformed(field.to_string()));
        }
        if self.key.len() < MIN_KEY_LENGTH {
            return Err(ApiKeyError::TooShort(field.to_string()));
        }
        Ok(())
    }

    /// Mask the key for logging (first and last 4 characters only)
    pub fn mask(&self) -> String {
        if self.key.len() <= 8 {
            "****".to_string()
        } else {
            format!("{}...{}", &self.key[..4], &self.key[self.key.len() - 4..])
        }
    }
}

impl fmt::Debug for SecureApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureApiKey")
            .field("key", &self.mask())
            .finish()
    }
}

impl fmt::Display for SecureApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mask())
    }
}

impl<'de> Deserialize<'de> for SecureApiKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(SecureApiKey::new)
    }
}

/// Credential set for one exchange account
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: Option<SecureApiKey>,
    pub api_secret: Option<SecureApiKey>,
    pub passphrase: Option<SecureApiKey>,
}

impl Credentials {
    pub fn new(api_key: &str, api_secret: &str) -> Self {
        Self {
            api_key: Some(SecureApiKey::new(api_key)),
            api_secret: Some(SecureApiKey::new(api_secret)),
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: &str) -> Self {
        self.passphrase = Some(SecureApiKey::new(passphrase));
        self
    }

    /// Validate every required field. Passphrases are only length-checked
    /// for emptiness because exchanges let users pick short ones.
    pub fn validate(&self, requires_passphrase: bool) -> Result<(), ApiKeyError> {
        let key = self
            .api_key
            .as_ref()
            .ok_or_else(|| ApiKeyError::Missing("apiKey".to_string()))?;
        key.validate("apiKey")?;

        let secret = self
            .api_secret
            .as_ref()
            .ok_or_else(|| ApiKeyError::Missing("apiSecret".to_string()))?;
        secret.validate("apiSecret")?;

        if requires_passphrase {
            match &self.passphrase {
                None => return Err(ApiKeyError::Missing("passphrase".to_string())),
                Some(p) if p.expose().trim().is_empty() => {
                    return Err(ApiKeyError::Empty("passphrase".to_string()))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Key and secret as plain strings; empty when absent
    pub fn pair(&self) -> (String, String) {
        (
            self.api_key
                .as_ref()
                .map(|k| k.expose().to_string())
                .unwrap_or_default(),
            self.api_secret
                .as_ref()
                .map(|k| k.expose().to_string())
                .unwrap_or_default(),
        )
    }

    pub fn passphrase(&self) -> String {
        self.passphrase
            .as_ref()
            .map(|p| p.expose().to_string())
            .unwrap_or_default()
    }
}

/// Credential format problems, detected locally
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiKeyError {
    #[error("credential '{0}' is not set")]
    Missing(String),
    #[error("credential '{0}' is empty")]
    Empty(String),
    #[error("credential '{0}' contains whitespace")]
    Malformed(String),
    #[error("credential '{0}' is too short (minimum {min} characters)", min = MIN_KEY_LENGTH)]
    TooShort(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_api_key_masking() {
        let key = SecureApiKey::new("abcdefghijklmnopqrstuvwxyz");
        assert_eq!(key.mask(), "abcd...wxyz");
        assert_eq!(format!("{:?}", key), "SecureApiKey { key: \"abcd...wxyz\" }");
        assert_eq!(SecureApiKey::new("short").mask(), "****");
    }

    #[test]
    fn test_credentials_validation() {
        let good = Credentials::new(&"k".repeat(20), &"s".repeat(32));
        assert!(good.validate(false).is_ok());
        assert_eq!(
            good.validate(true),
            Err(ApiKeyError::Missing("passphrase".to_string()))
        );
        assert!(good.clone().with_passphrase("pw").validate(true).is_ok());

        let short = Credentials::new("abc", &"s".repeat(32));
        assert_eq!(
            short.validate(false),
            Err(ApiKeyError::TooShort("apiKey".to_string()))
        );

        let spaced = Credentials::new(&"k".repeat(20), "secret with spaces inside");
        assert_eq!(
            spaced.validate(false),
            Err(ApiKeyError::Malformed("apiSecret".to_string()))
        );

        assert_eq!(
            Credentials::default().validate(false),
            Err(ApiKeyError::Missing("apiKey".to_string()))
        );
    }
}
