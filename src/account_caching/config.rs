//! Configuration consumed by the account cache.
//!
//! A [`CacheConfig`] names the program whose accounts are mirrored, the
//! universe to track, the delisting policy and the transport strategy. It can
//! be built in code or loaded from JSON:
//!
//! ```json
//! {
//!   "program_id": "11111111111111111111111111111111",
//!   "universe": { "kind": "explicit", "market_indexes": [0, 1] },
//!   "delist_policy": "discard",
//!   "strategy": { "kind": "polled", "polling_interval_ms": 250 }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use solana_pubkey::Pubkey;

use crate::account_caching::types::OracleDescriptor;
use crate::error::{ConfigError, ErrorInfo};

pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 100;
pub const DEFAULT_ACTIVATION_ATTEMPTS: u32 = 5;
pub const DEFAULT_ACTIVATION_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// What to do with a market or vault once its status is `Delisted`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelistPolicy {
    /// Keep tracking it.
    #[default]
    Subscribe,
    /// Release the transport registration but keep the last record readable.
    Unsubscribe,
    /// Release the registration and drop the record.
    Discard,
}

/// The set of accounts tracked at activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Universe {
    Explicit {
        #[serde(default)]
        market_indexes: Vec<u16>,
        #[serde(default)]
        vault_indexes: Vec<u16>,
        #[serde(default)]
        oracles: Vec<OracleDescriptor>,
    },
    /// Scan the program's accounts for every market and vault.
    Discover,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    Pushed {
        #[serde(default)]
        resubscribe_timeout_ms: Option<u64>,
        #[serde(default = "default_activation_timeout_ms")]
        activation_timeout_ms: u64,
    },
    Polled {
        #[serde(default = "default_polling_interval_ms")]
        polling_interval_ms: u64,
        #[serde(default = "default_activation_attempts")]
        activation_attempts: u32,
    },
}

impl StrategyConfig {
    pub fn pushed() -> Self {
        StrategyConfig::Pushed {
            resubscribe_timeout_ms: None,
            activation_timeout_ms: DEFAULT_ACTIVATION_TIMEOUT_MS,
        }
    }

    pub fn polled(polling_interval: Duration) -> Self {
        StrategyConfig::Polled {
            polling_interval_ms: polling_interval.as_millis() as u64,
            activation_attempts: DEFAULT_ACTIVATION_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(with = "pubkey_string")]
    pub program_id: Pubkey,
    pub universe: Universe,
    #[serde(default)]
    pub delist_policy: DelistPolicy,
    pub strategy: StrategyConfig,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl CacheConfig {
    pub fn new(program_id: Pubkey, universe: Universe, strategy: StrategyConfig) -> Self {
        Self {
            program_id,
            universe,
            delist_policy: DelistPolicy::default(),
            strategy,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn with_delist_policy(mut self, delist_policy: DelistPolicy) -> Self {
        self.delist_policy = delist_policy;
        self
    }

    pub fn with_event_capacity(mut self, event_capacity: usize) -> Self {
        self.event_capacity = event_capacity;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(ErrorInfo::StaticStr(
                "event_capacity must be greater than zero",
            )));
        }

        if let StrategyConfig::Polled {
            polling_interval_ms,
            activation_attempts,
        } = self.strategy
        {
            if polling_interval_ms == 0 {
                return Err(ConfigError::Invalid(ErrorInfo::StaticStr(
                    "polling_interval_ms must be greater than zero",
                )));
            }
            if activation_attempts == 0 {
                return Err(ConfigError::Invalid(ErrorInfo::StaticStr(
                    "activation_attempts must be greater than zero",
                )));
            }
        }

        Ok(())
    }
}

fn default_polling_interval_ms() -> u64 {
    DEFAULT_POLLING_INTERVAL_MS
}

fn default_activation_attempts() -> u32 {
    DEFAULT_ACTIVATION_ATTEMPTS
}

fn default_activation_timeout_ms() -> u64 {
    DEFAULT_ACTIVATION_TIMEOUT_MS
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

/// Base58 string (de)serialization for addresses in config files.
pub(crate) mod pubkey_string {
    use std::str::FromStr;

    use serde::{Deserialize, Deserializer, Serializer};
    use solana_pubkey::Pubkey;

    pub fn serialize<S: Serializer>(pubkey: &Pubkey, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&pubkey.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Pubkey, D::Error> {
        let value = String::deserialize(deserializer)?;
        Pubkey::from_str(&value).map_err(serde::de::Error::custom)
    }
}
