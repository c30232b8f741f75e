// ============================================================================
// Logging Configuration
// ============================================================================

const DEFAULT_HASH_SALT: &str = "messaging-substrate-log-salt";

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    /// Log raw user ids instead of salted hashes
    pub enable_user_identifiers: bool,
    /// Salt mixed into hashed identifiers
    pub hash_salt: String,
}

impl LoggingConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            enable_user_identifiers: super::env_parse("LOG_USER_IDENTIFIERS", false),
            hash_salt: std::env::var("LOG_HASH_SALT")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_HASH_SALT.to_string()),
        }
    }

    /// Identifier as it may appear in logs
    pub fn user_id(&self, id: &str) -> String {
        if self.enable_user_identifiers {
            id.to_string()
        } else {
            crate::utils::log_safe_id(id, &self.hash_salt)
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_user_identifiers: false,
            hash_salt: DEFAULT_HASH_SALT.to_string(),
        }
    }
}
