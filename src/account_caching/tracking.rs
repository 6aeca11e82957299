//! Bookkeeping shared by both strategies: what is tracked, what is being
//! registered right now, and what the delisting policy would release.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use dashmap::{DashMap, DashSet};
use solana_pubkey::Pubkey;

use crate::account_caching::config::{DelistPolicy, Universe};
use crate::account_caching::single_flight::SingleFlight;
use crate::account_caching::store::RecordStore;
use crate::account_caching::types::{AccountKind, OracleDescriptor, TrackedAccount, TrackedOracle};
use crate::state::{AccountDecoder, is_sentinel};

pub(crate) struct CacheCore<H> {
    pub program_id: Pubkey,
    pub universe: Universe,
    pub policy: DelistPolicy,
    pub decoder: Arc<dyn AccountDecoder>,
    pub store: RecordStore,
    pub accounts: DashMap<Pubkey, TrackedAccount<H>>,
    pub oracles: DashMap<Pubkey, TrackedOracle<H>>,
    /// Addresses with a registration in flight.
    pub pending: DashSet<Pubkey>,
    /// Markets/vaults with an oracle-map heal in flight.
    pub healing: DashSet<(AccountKind, u16)>,
    pub delisting_scheduled: AtomicBool,
    pub activation: SingleFlight<bool>,
}

/// One oracle reference held by a market or vault.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct OracleReference {
    pub oracle: Pubkey,
    pub delisted: bool,
}

/// Oracles referenced by delisted entries and by nothing else.
pub(crate) fn orphan_oracles(references: &[OracleReference]) -> Vec<Pubkey> {
    let live: BTreeSet<Pubkey> = references
        .iter()
        .filter(|reference| !reference.delisted)
        .map(|reference| reference.oracle)
        .collect();

    references
        .iter()
        .filter(|reference| reference.delisted)
        .map(|reference| reference.oracle)
        .filter(|oracle| !is_sentinel(oracle) && !live.contains(oracle))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// What a delisting pass acts on.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct DelistPlan {
    pub accounts: Vec<(AccountKind, u16)>,
    pub oracles: Vec<Pubkey>,
}

impl DelistPlan {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.oracles.is_empty()
    }
}

impl<H: Clone> CacheCore<H> {
    pub fn new(
        program_id: Pubkey,
        universe: Universe,
        policy: DelistPolicy,
        decoder: Arc<dyn AccountDecoder>,
        event_capacity: usize,
    ) -> Self {
        Self {
            program_id,
            universe,
            policy,
            decoder: decoder.clone(),
            store: RecordStore::new(decoder, event_capacity),
            accounts: DashMap::new(),
            oracles: DashMap::new(),
            pending: DashSet::new(),
            healing: DashSet::new(),
            delisting_scheduled: AtomicBool::new(false),
            activation: SingleFlight::new(false),
        }
    }

    /// Whether the market or vault at `index` still holds a transport registration.
    pub fn is_registered(&self, kind: AccountKind, index: u16) -> bool {
        self.accounts.iter().any(|entry| {
            entry.kind == kind && entry.map_index == Some(index) && entry.handle.is_some()
        })
    }

    pub fn tracked_address(&self, kind: AccountKind, index: u16) -> Option<Pubkey> {
        self.accounts
            .iter()
            .find(|entry| entry.kind == kind && entry.map_index == Some(index))
            .map(|entry| *entry.key())
    }

    pub fn tracked_accounts(&self) -> Vec<(AccountKind, Pubkey)> {
        let mut accounts: Vec<_> = self
            .accounts
            .iter()
            .map(|entry| (entry.kind, entry.address))
            .collect();
        accounts.sort_by_key(|(_, address)| *address);
        accounts
    }

    pub fn tracked_oracles(&self) -> Vec<OracleDescriptor> {
        let mut oracles: Vec<_> = self
            .oracles
            .iter()
            .map(|entry| OracleDescriptor::new(entry.address, entry.source))
            .collect();
        oracles.sort_by_key(|descriptor| descriptor.address);
        oracles
    }

    pub fn take_account_handle(&self, address: &Pubkey) -> Option<H> {
        self.accounts
            .get_mut(address)
            .and_then(|mut entry| entry.handle.take())
    }

    pub fn take_oracle_handle(&self, address: &Pubkey) -> Option<H> {
        self.oracles
            .get_mut(address)
            .and_then(|mut entry| entry.handle.take())
    }

    /// Every oracle referenced by a stored market or vault, both through its
    /// current record and through its dependency-map entry.
    fn oracle_references(&self) -> Vec<OracleReference> {
        let mut references = Vec::new();
        for kind in [AccountKind::Market, AccountKind::Vault] {
            let indexes = match kind {
                AccountKind::Market => self.store.market_indexes(),
                _ => self.store.vault_indexes(),
            };
            for index in indexes {
                let delisted = self.store.is_delisted(kind, index);
                let current = self.store.linked_oracle(kind, index).map(|(oracle, _)| oracle);
                let mapped = self.store.oracle_link(kind, index);
                for oracle in current.into_iter().chain(mapped) {
                    references.push(OracleReference { oracle, delisted });
                }
            }
        }
        references
    }

    pub fn delist_plan(&self) -> DelistPlan {
        let mut plan = DelistPlan::default();
        for kind in [AccountKind::Market, AccountKind::Vault] {
            let indexes = match kind {
                AccountKind::Market => self.store.market_indexes(),
                _ => self.store.vault_indexes(),
            };
            plan.accounts.extend(
                indexes
                    .into_iter()
                    .filter(|index| self.store.is_delisted(kind, *index))
                    .map(|index| (kind, index)),
            );
        }
        plan.oracles = orphan_oracles(&self.oracle_references());
        plan
    }

    pub fn clear_tracking(&self) {
        self.accounts.clear();
        self.oracles.clear();
        self.pending.clear();
        self.healing.clear();
    }
}
