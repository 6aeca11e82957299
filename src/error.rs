//! Error types for the account synchronization layer.
//!
//! Failures fall into three groups: the transport could not deliver bytes
//! (`TransportError`), the bytes could not be turned into a typed record
//! (`DecodeError`), or the cache was used incorrectly or could not complete a
//! registration (`AccountCacheError`). Configuration problems are reported
//! separately through `ConfigError` since they happen before any cache exists.
//!
//! `ErrorInfo` is a lightweight container for attaching context (usually the
//! address involved) without forcing an allocation for static messages.

use std::fmt::Display;

use solana_pubkey::Pubkey;
use thiserror::Error;

/// Wrapper type for attaching additional context to an error.
///
/// Variants:
/// - `Pubkey` — attach a specific account address
/// - `String` — arbitrary owned string describing the error
/// - `StaticStr` — lightweight static string reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorInfo {
    Pubkey(Pubkey),
    String(String),
    StaticStr(&'static str),
}

impl From<Pubkey> for ErrorInfo {
    fn from(pubkey: Pubkey) -> Self {
        ErrorInfo::Pubkey(pubkey)
    }
}

impl From<&Pubkey> for ErrorInfo {
    fn from(pubkey: &Pubkey) -> Self {
        ErrorInfo::Pubkey(*pubkey)
    }
}

impl From<String> for ErrorInfo {
    fn from(string: String) -> Self {
        ErrorInfo::String(string)
    }
}

impl From<&'static str> for ErrorInfo {
    fn from(string: &'static str) -> Self {
        ErrorInfo::StaticStr(string)
    }
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorInfo::Pubkey(pubkey) => write!(f, "{}", pubkey),
            ErrorInfo::String(string) => write!(f, "{}", string),
            ErrorInfo::StaticStr(string) => write!(f, "{}", string),
        }
    }
}

/// Errors raised by a transport collaborator (RPC reader, batch loader,
/// websocket channel).
#[derive(Debug, Error)]
pub enum TransportError {
    /// RPC client failed to fetch account data.
    #[error("RPC request failed: {0}")]
    Rpc(#[from] solana_client::client_error::ClientError),

    /// The websocket subscription could not be opened or was dropped.
    #[error("Pubsub subscription failed: {0}")]
    Pubsub(ErrorInfo),

    /// A direct read found no account at the address.
    #[error("No account found for pubkey: {0}")]
    AccountNotFound(ErrorInfo),

    /// The transport has been shut down.
    #[error("Transport closed")]
    Closed,
}

/// Errors raised while turning raw account bytes into a typed record.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Account data too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("Account discriminator mismatch for {0}")]
    DiscriminatorMismatch(&'static str),

    #[error("Failed to deserialize account data: {0}")]
    Borsh(#[from] std::io::Error),

    #[error("Oracle source {0} cannot be decoded from account data")]
    UnsupportedOracle(ErrorInfo),
}

/// Errors produced by the account cache itself.
#[derive(Debug, Error)]
pub enum AccountCacheError {
    /// A read was attempted before `activate()` succeeded (or after
    /// `deactivate()`). This is a programming error, not a data gap.
    #[error("Account cache is not active; call activate() first")]
    NotActive,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The transport refused to register an address.
    #[error("Failed to register account: {0}")]
    RegistrationFailed(ErrorInfo),

    /// The selected strategy needs a transport that was not supplied.
    #[error("Missing transport: {0}")]
    MissingTransport(&'static str),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(ErrorInfo),
}

/// Ensures every error type satisfies `Send + Sync` at compile time.
const _: fn() = || {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<TransportError>();
    assert_send_sync::<DecodeError>();
    assert_send_sync::<AccountCacheError>();
    assert_send_sync::<ConfigError>();
};
