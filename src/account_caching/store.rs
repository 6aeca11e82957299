//! The decoded, slot-versioned mirror shared by both strategies.
//!
//! Writes go through `store_*`, which decode raw bytes, refuse to replace a
//! record with one observed at an older slot, and publish a [`CacheEvent`]
//! for every accepted change. Public reads fail with
//! [`AccountCacheError::NotActive`] until the owning cache has activated.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::warn;
use parking_lot::RwLock;
use solana_pubkey::Pubkey;
use tokio::sync::broadcast;

use crate::account_caching::events::{CacheEvent, EventBus};
use crate::account_caching::types::{AccountKind, VersionedRecord};
use crate::error::{AccountCacheError, DecodeError};
use crate::state::{
    AccountDecoder, MarketAccount, OracleLinked, OraclePrice, OracleSource, StateAccount,
    VaultAccount, is_sentinel,
};

pub type RecordResult<T> = Result<Option<VersionedRecord<T>>, AccountCacheError>;

/// Outcome of resolving a market's or vault's oracle through the dependency map.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleLookup {
    pub record: Option<VersionedRecord<OraclePrice>>,
    /// The map entry disagrees with the linked record's current oracle.
    pub drifted: bool,
}

pub struct RecordStore {
    active: AtomicBool,
    decoder: Arc<dyn AccountDecoder>,
    events: EventBus,
    state: RwLock<Option<VersionedRecord<StateAccount>>>,
    markets: DashMap<u16, VersionedRecord<MarketAccount>>,
    vaults: DashMap<u16, VersionedRecord<VaultAccount>>,
    oracles: DashMap<Pubkey, VersionedRecord<OraclePrice>>,
    market_oracles: DashMap<u16, Pubkey>,
    vault_oracles: DashMap<u16, Pubkey>,
}

/// Insert `record` unless the stored one is newer, or identical at the same slot.
fn replace_if_newer<K, T>(
    map: &DashMap<K, VersionedRecord<T>>,
    key: K,
    record: VersionedRecord<T>,
) -> bool
where
    K: Eq + std::hash::Hash,
    T: PartialEq,
{
    match map.entry(key) {
        Entry::Occupied(mut entry) => {
            let current = entry.get();
            let unchanged = record.slot == current.slot && record.data == current.data;
            if record.slot < current.slot || unchanged {
                return false;
            }
            entry.insert(record);
            true
        }
        Entry::Vacant(entry) => {
            entry.insert(record);
            true
        }
    }
}

impl RecordStore {
    pub fn new(decoder: Arc<dyn AccountDecoder>, event_capacity: usize) -> Self {
        Self {
            active: AtomicBool::new(false),
            decoder,
            events: EventBus::new(event_capacity),
            state: RwLock::new(None),
            markets: DashMap::new(),
            vaults: DashMap::new(),
            oracles: DashMap::new(),
            market_oracles: DashMap::new(),
            vault_oracles: DashMap::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub(crate) fn ensure_active(&self) -> Result<(), AccountCacheError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(AccountCacheError::NotActive)
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: CacheEvent) {
        self.events.emit(event);
    }

    pub(crate) fn emit_error(&self, message: String) {
        self.events.emit(CacheEvent::Error { message });
    }

    pub fn state_and_slot(&self) -> RecordResult<StateAccount> {
        self.ensure_active()?;
        Ok(self.state.read().clone())
    }

    pub fn market_and_slot(&self, index: u16) -> RecordResult<MarketAccount> {
        self.ensure_active()?;
        Ok(self.market(index))
    }

    /// Every market record, ordered by index.
    pub fn markets_and_slots(
        &self,
    ) -> Result<Vec<VersionedRecord<MarketAccount>>, AccountCacheError> {
        self.ensure_active()?;
        let mut markets: Vec<_> = self.markets.iter().map(|entry| entry.value().clone()).collect();
        markets.sort_by_key(|record| record.data.market_index);
        Ok(markets)
    }

    pub fn vault_and_slot(&self, index: u16) -> RecordResult<VaultAccount> {
        self.ensure_active()?;
        Ok(self.vault(index))
    }

    /// Every vault record, ordered by index.
    pub fn vaults_and_slots(
        &self,
    ) -> Result<Vec<VersionedRecord<VaultAccount>>, AccountCacheError> {
        self.ensure_active()?;
        let mut vaults: Vec<_> = self.vaults.iter().map(|entry| entry.value().clone()).collect();
        vaults.sort_by_key(|record| record.data.vault_index);
        Ok(vaults)
    }

    /// The sentinel address always resolves to the quote price at slot 0.
    pub fn oracle_and_slot(&self, address: &Pubkey) -> RecordResult<OraclePrice> {
        self.ensure_active()?;
        Ok(self.oracle(address))
    }

    /// Resolve the oracle for a market or vault through the dependency map.
    ///
    /// The answer is computed from the map entry even when the linked record
    /// now points elsewhere; `drifted` tells the caller to rebuild the entry.
    /// A linked record without a map entry resolves through its own oracle
    /// and is also reported as drifted.
    pub fn oracle_for(
        &self,
        kind: AccountKind,
        index: u16,
    ) -> Result<OracleLookup, AccountCacheError> {
        self.ensure_active()?;

        let mapped = self.oracle_link(kind, index);
        let current = self.linked_oracle(kind, index).map(|(oracle, _)| oracle);

        let lookup = match (mapped, current) {
            (Some(mapped), current) => OracleLookup {
                record: self.oracle(&mapped),
                drifted: current.is_some_and(|current| current != mapped),
            },
            (None, Some(current)) => OracleLookup {
                record: self.oracle(&current),
                drifted: true,
            },
            (None, None) => OracleLookup {
                record: None,
                drifted: false,
            },
        };
        Ok(lookup)
    }

    pub(crate) fn has_state(&self) -> bool {
        self.state.read().is_some()
    }

    pub(crate) fn market(&self, index: u16) -> Option<VersionedRecord<MarketAccount>> {
        self.markets.get(&index).map(|record| record.clone())
    }

    pub(crate) fn vault(&self, index: u16) -> Option<VersionedRecord<VaultAccount>> {
        self.vaults.get(&index).map(|record| record.clone())
    }

    pub(crate) fn oracle(&self, address: &Pubkey) -> Option<VersionedRecord<OraclePrice>> {
        if is_sentinel(address) {
            return Some(VersionedRecord::new(OraclePrice::quote(), 0));
        }
        self.oracles.get(address).map(|record| record.clone())
    }

    pub(crate) fn has_record(&self, kind: AccountKind, index: Option<u16>) -> bool {
        match (kind, index) {
            (AccountKind::State, _) => self.has_state(),
            (AccountKind::Market, Some(index)) => self.markets.contains_key(&index),
            (AccountKind::Vault, Some(index)) => self.vaults.contains_key(&index),
            _ => false,
        }
    }

    pub(crate) fn has_oracle(&self, address: &Pubkey) -> bool {
        self.oracles.contains_key(address)
    }

    pub(crate) fn market_indexes(&self) -> Vec<u16> {
        let mut indexes: Vec<u16> = self.markets.iter().map(|entry| *entry.key()).collect();
        indexes.sort_unstable();
        indexes
    }

    pub(crate) fn vault_indexes(&self) -> Vec<u16> {
        let mut indexes: Vec<u16> = self.vaults.iter().map(|entry| *entry.key()).collect();
        indexes.sort_unstable();
        indexes
    }

    /// The oracle the stored market or vault record currently points at.
    pub(crate) fn linked_oracle(
        &self,
        kind: AccountKind,
        index: u16,
    ) -> Option<(Pubkey, OracleSource)> {
        match kind {
            AccountKind::Market => self
                .markets
                .get(&index)
                .map(|record| (record.data.oracle(), record.data.oracle_source())),
            AccountKind::Vault => self
                .vaults
                .get(&index)
                .map(|record| (record.data.oracle(), record.data.oracle_source())),
            AccountKind::State => None,
        }
    }

    pub(crate) fn is_delisted(&self, kind: AccountKind, index: u16) -> bool {
        match kind {
            AccountKind::Market => self
                .markets
                .get(&index)
                .is_some_and(|record| record.data.is_delisted()),
            AccountKind::Vault => self
                .vaults
                .get(&index)
                .is_some_and(|record| record.data.is_delisted()),
            AccountKind::State => false,
        }
    }

    fn links(&self, kind: AccountKind) -> Option<&DashMap<u16, Pubkey>> {
        match kind {
            AccountKind::Market => Some(&self.market_oracles),
            AccountKind::Vault => Some(&self.vault_oracles),
            AccountKind::State => None,
        }
    }

    pub(crate) fn oracle_link(&self, kind: AccountKind, index: u16) -> Option<Pubkey> {
        self.links(kind)?.get(&index).map(|oracle| *oracle)
    }

    pub(crate) fn set_oracle_link(&self, kind: AccountKind, index: u16, oracle: Pubkey) {
        if let Some(links) = self.links(kind) {
            links.insert(index, oracle);
        }
    }

    pub(crate) fn remove_oracle_link(&self, kind: AccountKind, index: u16) {
        if let Some(links) = self.links(kind) {
            links.remove(&index);
        }
    }

    /// Drop a market or vault record together with its map entry.
    pub(crate) fn remove_record(&self, kind: AccountKind, index: u16) {
        match kind {
            AccountKind::Market => {
                self.markets.remove(&index);
            }
            AccountKind::Vault => {
                self.vaults.remove(&index);
            }
            AccountKind::State => return,
        }
        self.remove_oracle_link(kind, index);
    }

    pub(crate) fn remove_oracle(&self, address: &Pubkey) {
        self.oracles.remove(address);
    }

    fn decode_failed(&self, what: &str, err: DecodeError) {
        warn!("Failed to decode {} update: {}", what, err);
        self.emit_error(format!("failed to decode {}: {}", what, err));
    }

    pub(crate) fn store_state(&self, data: &[u8], slot: u64) -> bool {
        let state = match self.decoder.decode_state(data) {
            Ok(state) => state,
            Err(err) => {
                self.decode_failed("state", err);
                return false;
            }
        };

        {
            let mut current = self.state.write();
            if let Some(existing) = current.as_ref() {
                if slot < existing.slot || (slot == existing.slot && existing.data == state) {
                    return false;
                }
            }
            *current = Some(VersionedRecord::new(state, slot));
        }
        self.emit(CacheEvent::StateUpdated { slot });
        true
    }

    /// Returns the stored record when it was accepted.
    pub(crate) fn store_market(&self, data: &[u8], slot: u64) -> Option<MarketAccount> {
        let market = match self.decoder.decode_market(data) {
            Ok(market) => market,
            Err(err) => {
                self.decode_failed("market", err);
                return None;
            }
        };

        let index = market.market_index;
        if !replace_if_newer(&self.markets, index, VersionedRecord::new(market.clone(), slot)) {
            return None;
        }
        self.emit(CacheEvent::MarketUpdated { index, slot });
        Some(market)
    }

    /// Returns the stored record when it was accepted.
    pub(crate) fn store_vault(&self, data: &[u8], slot: u64) -> Option<VaultAccount> {
        let vault = match self.decoder.decode_vault(data) {
            Ok(vault) => vault,
            Err(err) => {
                self.decode_failed("vault", err);
                return None;
            }
        };

        let index = vault.vault_index;
        if !replace_if_newer(&self.vaults, index, VersionedRecord::new(vault.clone(), slot)) {
            return None;
        }
        self.emit(CacheEvent::VaultUpdated { index, slot });
        Some(vault)
    }

    pub(crate) fn store_oracle(
        &self,
        address: Pubkey,
        source: OracleSource,
        data: &[u8],
        slot: u64,
    ) -> bool {
        let price = match self.decoder.decode_oracle(source, data) {
            Ok(price) => price,
            Err(err) => {
                self.decode_failed(&format!("oracle {}", address), err);
                return false;
            }
        };

        if !replace_if_newer(&self.oracles, address, VersionedRecord::new(price, slot)) {
            return false;
        }
        self.emit(CacheEvent::OracleUpdated { address, source, slot });
        true
    }
}
