//! Bus-wide limits and their configuration file.
//!
//! The limits are fixed policy values: a [`crate::Bus`] copies them at
//! construction and never renegotiates them. Defaults match the classic
//! kernel bus.
//!
//! | Limit | Default | Purpose |
//! |-------|---------|---------|
//! | `max_queued_messages` | 256 | hard cap on one mailbox |
//! | `unaccounted_messages` | 16 | leading messages exempt from per-user quota |
//! | `max_messages_per_user` | 16 | per-user share once past the exempt window |
//! | `max_pending_requests` | 128 | open reply-expected requests per sender |
//! | `pool_size` | 16 MiB | byte arena per connection |
//! | `max_payload_size` | 2 MiB | largest single payload |
//!
//! # Example
//!
//! ```rust
//! use kbus_core::config::BusConfig;
//!
//! let config = BusConfig::from_toml(
//!     r#"
//!     [limits]
//!     max_queued_messages = 64
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.limits.max_queued_messages, 64);
//! assert_eq!(config.limits.unaccounted_messages, 16);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum queued messages in one mailbox.
pub const MAX_QUEUED_MESSAGES: usize = 256;

/// Queued messages not charged to any user.
pub const UNACCOUNTED_MESSAGES: usize = 16;

/// Queued messages one user may hold past the unaccounted window.
pub const MAX_MESSAGES_PER_USER: usize = 16;

/// Outstanding reply-expected requests per sending connection.
pub const MAX_PENDING_REQUESTS: usize = 128;

/// Per-connection pool capacity in bytes (16 MiB).
pub const POOL_SIZE: usize = 16 * 1024 * 1024;

/// Largest single payload in bytes (2 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 2 * 1024 * 1024;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be serialized.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The limits are inconsistent.
    #[error("invalid limits: {0}")]
    Validation(String),
}

/// Bus-wide limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusLimits {
    /// Maximum queued messages in one mailbox.
    pub max_queued_messages: usize,
    /// Leading messages in a mailbox that are not charged to any user.
    pub unaccounted_messages: usize,
    /// Messages one user may hold in a mailbox past the unaccounted window.
    pub max_messages_per_user: usize,
    /// Outstanding reply-expected requests per sending connection.
    pub max_pending_requests: usize,
    /// Per-connection pool capacity in bytes.
    pub pool_size: usize,
    /// Largest single payload in bytes.
    pub max_payload_size: usize,
}

impl Default for BusLimits {
    fn default() -> Self {
        Self {
            max_queued_messages: MAX_QUEUED_MESSAGES,
            unaccounted_messages: UNACCOUNTED_MESSAGES,
            max_messages_per_user: MAX_MESSAGES_PER_USER,
            max_pending_requests: MAX_PENDING_REQUESTS,
            pool_size: POOL_SIZE,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl BusLimits {
    /// Small limits for tests: same shape, cheaper pools.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            max_queued_messages: 32,
            unaccounted_messages: 4,
            max_messages_per_user: 4,
            max_pending_requests: 8,
            pool_size: 64 * 1024,
            max_payload_size: 8 * 1024,
        }
    }

    /// Checks that the limits describe a usable bus.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if a cap is zero, if the
    /// unaccounted window plus one user's share exceeds the queue cap, or if
    /// a maximal payload cannot fit in a pool.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queued_messages == 0 {
            return Err(ConfigError::Validation(
                "max_queued_messages must be non-zero".to_string(),
            ));
        }
        if self.max_messages_per_user == 0 {
            return Err(ConfigError::Validation(
                "max_messages_per_user must be non-zero".to_string(),
            ));
        }
        if self.unaccounted_messages.saturating_add(self.max_messages_per_user)
            > self.max_queued_messages
        {
            return Err(ConfigError::Validation(format!(
                "unaccounted_messages ({}) + max_messages_per_user ({}) exceeds max_queued_messages ({})",
                self.unaccounted_messages, self.max_messages_per_user, self.max_queued_messages
            )));
        }
        if self.max_pending_requests == 0 {
            return Err(ConfigError::Validation(
                "max_pending_requests must be non-zero".to_string(),
            ));
        }
        let largest_slice = crate::pool::slice_size(self.max_payload_size);
        if largest_slice > self.pool_size {
            return Err(ConfigError::Validation(format!(
                "a {}-byte payload needs a {largest_slice}-byte slice but pool_size is {}",
                self.max_payload_size, self.pool_size
            )));
        }
        Ok(())
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    /// Bus-wide limits.
    #[serde(default)]
    pub limits: BusLimits,
}

impl BusConfig {
    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates a TOML configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or the limits are
    /// inconsistent.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.limits.validate()?;
        Ok(config)
    }

    /// Serializes the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
