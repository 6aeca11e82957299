use serde::{Deserialize, Serialize};
use solana_pubkey::Pubkey;

use crate::account_caching::events::EventKind;
use crate::state::OracleSource;

/// A decoded record together with the slot it was observed at.
///
/// Records are replaced wholesale on every update, never mutated in place.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRecord<T> {
    pub data: T,
    pub slot: u64,
}

impl<T> VersionedRecord<T> {
    pub fn new(data: T, slot: u64) -> Self {
        Self { data, slot }
    }
}

/// The kinds of program account the cache tracks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AccountKind {
    State,
    Market,
    Vault,
}

impl AccountKind {
    pub fn event_kind(&self) -> EventKind {
        match self {
            AccountKind::State => EventKind::StateUpdate,
            AccountKind::Market => EventKind::MarketUpdate,
            AccountKind::Vault => EventKind::VaultUpdate,
        }
    }
}

impl std::fmt::Display for AccountKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AccountKind::State => "state",
            AccountKind::Market => "market",
            AccountKind::Vault => "vault",
        };
        write!(f, "{}", label)
    }
}

/// A state/market/vault account the cache is responsible for.
///
/// `map_index` is set for markets and vaults and absent for the singleton
/// state record. `handle` is the transport registration; it is `None` while a
/// registration is pending or after it has been released.
#[derive(Debug, Clone)]
pub struct TrackedAccount<H> {
    pub kind: AccountKind,
    pub address: Pubkey,
    pub event: EventKind,
    pub map_index: Option<u16>,
    pub handle: Option<H>,
}

impl<H> TrackedAccount<H> {
    pub fn new(kind: AccountKind, address: Pubkey, map_index: Option<u16>) -> Self {
        Self {
            kind,
            address,
            event: kind.event_kind(),
            map_index,
            handle: None,
        }
    }
}

/// An oracle relied upon by at least one tracked market or vault.
#[derive(Debug, Clone)]
pub struct TrackedOracle<H> {
    pub address: Pubkey,
    pub source: OracleSource,
    pub handle: Option<H>,
}

impl<H> TrackedOracle<H> {
    pub fn new(address: Pubkey, source: OracleSource) -> Self {
        Self {
            address,
            source,
            handle: None,
        }
    }
}

/// An oracle address and how to decode it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OracleDescriptor {
    #[serde(with = "crate::account_caching::config::pubkey_string")]
    pub address: Pubkey,
    pub source: OracleSource,
}

impl OracleDescriptor {
    pub fn new(address: Pubkey, source: OracleSource) -> Self {
        Self { address, source }
    }
}
