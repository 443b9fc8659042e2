//! Configuration for the authentication core.
//!
//! [`AuthConfig`] is built either through its validating builder or by
//! deserializing a config file section. Durations use `humantime` notation
//! (`"5m"`, `"250ms"`).
//!
//! ```
//! use std::time::Duration;
//! use tokengate_authn::config::AuthConfig;
//!
//! let config = AuthConfig::builder()
//!     .issuer("accounts.example")
//!     .nonce_window(Duration::from_secs(120))
//!     .build()?;
//! assert_eq!(config.token_ttl(), Duration::from_secs(15 * 60));
//! # Ok::<(), tokengate_authn::config::ConfigError>(())
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default issuer claim for minted tokens.
pub const DEFAULT_ISSUER: &str = "tokengate";

/// Default session token lifetime (15 minutes).
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

/// Default nonce freshness window (5 minutes).
pub const DEFAULT_NONCE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Default maximum number of entries (outstanding plus consumed) held by the
/// nonce ledger.
pub const DEFAULT_LEDGER_CAPACITY: usize = 100_000;

/// Default number of challenges a single subject may have outstanding.
pub const DEFAULT_MAX_OUTSTANDING_PER_SUBJECT: usize = 4;

/// Default key cache TTL (60 seconds).
///
/// Bounds how long a revocation can go unnoticed when the cache is not
/// explicitly invalidated.
pub const DEFAULT_KEY_CACHE_TTL: Duration = Duration::from_secs(60);

/// Default key cache capacity (subjects).
pub const DEFAULT_KEY_CACHE_CAPACITY: u64 = 10_000;

/// Default bound on a single key store call (2 seconds).
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default interval between background ledger purges (30 seconds).
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(30);

/// Shortest accepted nonce window. Anything shorter cannot survive a round
/// trip to the client.
const MIN_NONCE_WINDOW: Duration = Duration::from_secs(1);

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric or duration field is below its minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the offending field.
        field: &'static str,
        /// Rendered configured value.
        value: String,
        /// Rendered minimum.
        min: String,
    },

    /// A field holds a value that is not allowed.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was refused.
        reason: String,
    },
}

/// Retry policy for transient key store failures.
///
/// Delays grow as `initial_backoff * 2^attempt`, capped at `max_backoff`,
/// plus up to 50% random jitter.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicyConfig {
    /// Retries after the first attempt. Zero disables retrying.
    #[serde(default = "default_max_retries")]
    #[builder(default = default_max_retries())]
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(with = "humantime_serde", default = "default_initial_backoff")]
    #[builder(default = default_initial_backoff())]
    pub initial_backoff: Duration,

    /// Upper bound on any single delay (before jitter).
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    #[builder(default = default_max_backoff())]
    pub max_backoff: Duration,
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(50)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(1)
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

/// Authentication core configuration.
///
/// Construct through [`AuthConfig::builder`] (validated) or deserialize and
/// then call [`AuthConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// `iss` claim of minted tokens.
    #[serde(default = "default_issuer")]
    issuer: String,

    /// Lifetime of minted tokens.
    #[serde(with = "humantime_serde", default = "default_token_ttl")]
    token_ttl: Duration,

    /// How long an issued nonce stays consumable.
    #[serde(with = "humantime_serde", default = "default_nonce_window")]
    nonce_window: Duration,

    /// Maximum ledger entries.
    #[serde(default = "default_ledger_capacity")]
    ledger_capacity: usize,

    /// Maximum outstanding challenges per subject.
    #[serde(default = "default_max_outstanding_per_subject")]
    max_outstanding_per_subject: usize,

    /// TTL of cached key histories.
    #[serde(with = "humantime_serde", default = "default_key_cache_ttl")]
    key_cache_ttl: Duration,

    /// Maximum cached subjects.
    #[serde(default = "default_key_cache_capacity")]
    key_cache_capacity: u64,

    /// Bound on a single key store call.
    #[serde(with = "humantime_serde", default = "default_store_timeout")]
    store_timeout: Duration,

    /// Retry policy for transient key store failures.
    #[serde(default)]
    retry_policy: RetryPolicyConfig,

    /// Interval of the background ledger purge.
    #[serde(with = "humantime_serde", default = "default_purge_interval")]
    purge_interval: Duration,
}

fn default_issuer() -> String {
    DEFAULT_ISSUER.to_owned()
}

fn default_token_ttl() -> Duration {
    DEFAULT_TOKEN_TTL
}

fn default_nonce_window() -> Duration {
    DEFAULT_NONCE_WINDOW
}

fn default_ledger_capacity() -> usize {
    DEFAULT_LEDGER_CAPACITY
}

fn default_max_outstanding_per_subject() -> usize {
    DEFAULT_MAX_OUTSTANDING_PER_SUBJECT
}

fn default_key_cache_ttl() -> Duration {
    DEFAULT_KEY_CACHE_TTL
}

fn default_key_cache_capacity() -> u64 {
    DEFAULT_KEY_CACHE_CAPACITY
}

fn default_store_timeout() -> Duration {
    DEFAULT_STORE_TIMEOUT
}

fn default_purge_interval() -> Duration {
    DEFAULT_PURGE_INTERVAL
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            token_ttl: DEFAULT_TOKEN_TTL,
            nonce_window: DEFAULT_NONCE_WINDOW,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            max_outstanding_per_subject: DEFAULT_MAX_OUTSTANDING_PER_SUBJECT,
            key_cache_ttl: DEFAULT_KEY_CACHE_TTL,
            key_cache_capacity: DEFAULT_KEY_CACHE_CAPACITY,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            retry_policy: RetryPolicyConfig::default(),
            purge_interval: DEFAULT_PURGE_INTERVAL,
        }
    }
}

#[bon::bon]
impl AuthConfig {
    /// Creates a new configuration, validating every field.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if:
    /// - `issuer` is empty
    /// - `token_ttl` or `store_timeout` is zero
    /// - `nonce_window` is shorter than one second
    /// - `ledger_capacity`, `max_outstanding_per_subject` or `key_cache_capacity` is zero
    /// - `max_outstanding_per_subject` exceeds `ledger_capacity`
    /// - the retry policy's `initial_backoff` exceeds its `max_backoff`
    #[builder]
    pub fn new(
        #[builder(into, default = DEFAULT_ISSUER.to_owned())] issuer: String,
        #[builder(default = DEFAULT_TOKEN_TTL)] token_ttl: Duration,
        #[builder(default = DEFAULT_NONCE_WINDOW)] nonce_window: Duration,
        #[builder(default = DEFAULT_LEDGER_CAPACITY)] ledger_capacity: usize,
        #[builder(default = DEFAULT_MAX_OUTSTANDING_PER_SUBJECT)] max_outstanding_per_subject: usize,
        #[builder(default = DEFAULT_KEY_CACHE_TTL)] key_cache_ttl: Duration,
        #[builder(default = DEFAULT_KEY_CACHE_CAPACITY)] key_cache_capacity: u64,
        #[builder(default = DEFAULT_STORE_TIMEOUT)] store_timeout: Duration,
        #[builder(default)] retry_policy: RetryPolicyConfig,
        #[builder(default = DEFAULT_PURGE_INTERVAL)] purge_interval: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            issuer,
            token_ttl,
            nonce_window,
            ledger_capacity,
            max_outstanding_per_subject,
            key_cache_ttl,
            key_cache_capacity,
            store_timeout,
            retry_policy,
            purge_interval,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants enforced by the builder. Call this after
    /// deserializing.
    ///
    /// # Errors
    ///
    /// See [`AuthConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "issuer", reason: "must not be empty".into() });
        }
        non_zero_duration("token_ttl", self.token_ttl)?;
        non_zero_duration("store_timeout", self.store_timeout)?;
        non_zero_duration("purge_interval", self.purge_interval)?;
        if self.nonce_window < MIN_NONCE_WINDOW {
            return Err(ConfigError::BelowMinimum {
                field: "nonce_window",
                value: format!("{}ms", self.nonce_window.as_millis()),
                min: "1s".to_owned(),
            });
        }
        non_zero_count("ledger_capacity", self.ledger_capacity as u64)?;
        non_zero_count("max_outstanding_per_subject", self.max_outstanding_per_subject as u64)?;
        non_zero_count("key_cache_capacity", self.key_cache_capacity)?;
        if self.max_outstanding_per_subject > self.ledger_capacity {
            return Err(ConfigError::Invalid {
                field: "max_outstanding_per_subject",
                reason: format!(
                    "{} exceeds ledger_capacity {}",
                    self.max_outstanding_per_subject, self.ledger_capacity
                ),
            });
        }
        if self.retry_policy.initial_backoff > self.retry_policy.max_backoff {
            return Err(ConfigError::Invalid {
                field: "retry_policy.initial_backoff",
                reason: "must not exceed max_backoff".into(),
            });
        }
        Ok(())
    }

    /// Returns the `iss` claim of minted tokens.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Returns the lifetime of minted tokens.
    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        self.token_ttl
    }

    /// Returns the nonce freshness window.
    #[must_use]
    pub fn nonce_window(&self) -> Duration {
        self.nonce_window
    }

    /// Returns the ledger capacity.
    #[must_use]
    pub fn ledger_capacity(&self) -> usize {
        self.ledger_capacity
    }

    /// Returns the per-subject outstanding challenge cap.
    #[must_use]
    pub fn max_outstanding_per_subject(&self) -> usize {
        self.max_outstanding_per_subject
    }

    /// Returns the key cache TTL.
    #[must_use]
    pub fn key_cache_ttl(&self) -> Duration {
        self.key_cache_ttl
    }

    /// Returns the key cache capacity.
    #[must_use]
    pub fn key_cache_capacity(&self) -> u64 {
        self.key_cache_capacity
    }

    /// Returns the key store call bound.
    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicyConfig {
        &self.retry_policy
    }

    /// Returns the background purge interval.
    #[must_use]
    pub fn purge_interval(&self) -> Duration {
        self.purge_interval
    }
}

fn non_zero_duration(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::BelowMinimum { field, value: "0ms".into(), min: "1ms".into() });
    }
    Ok(())
}

fn non_zero_count(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::BelowMinimum { field, value: "0".into(), min: "1".into() });
    }
    Ok(())
}
