//! Slot-versioned local mirror of a Solana program's state, market, vault and
//! oracle accounts.
//!
//! - [`account_caching`] — the [`AccountCache`] contract and its pushed and
//!   polled strategies.
//! - [`state`] — on-chain record types and decoders.
//! - [`transport`] — the transport seams the cache is written against, with
//!   RPC and websocket implementations.

pub mod account_caching;
pub mod error;
pub mod state;
pub mod transport;

pub use account_caching::{
    AccountCache, CacheConfig, CacheEvent, DelistPolicy, StrategyConfig, Transports, Universe,
    VersionedRecord, build_account_cache, build_account_cache_from_rpc,
};
pub use error::{AccountCacheError, ConfigError, DecodeError, TransportError};
