/// Credential handling: masking and local format validation
pub mod api_keys;

pub use api_keys::{ApiKeyError, Credentials, SecureApiKey};
