//! Registration lifecycle shared by the pushed and polled strategies.
//!
//! Each strategy implements [`Registrar`] to say how one address is
//! registered with (and released from) its transport. Everything else here is
//! strategy-independent: deduplicated adds, dependency-map maintenance, the
//! read-time self-heal, the delisting pass and teardown.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use futures_util::future::join_all;
use log::{debug, warn};
use solana_pubkey::Pubkey;

use crate::account_caching::config::DelistPolicy;
use crate::account_caching::tracking::CacheCore;
use crate::account_caching::types::{AccountKind, TrackedAccount, TrackedOracle};
use crate::error::AccountCacheError;
use crate::state::pda::{market_address, vault_address};
use crate::state::{OracleSource, is_sentinel};
use crate::transport::AccountUpdateFn;

#[async_trait]
pub(crate) trait Registrar: Send + Sync + Sized + 'static {
    type Handle: Clone + Send + Sync + 'static;

    fn core(&self) -> &CacheCore<Self::Handle>;

    async fn register_account(
        self: Arc<Self>,
        account: &TrackedAccount<Self::Handle>,
    ) -> Result<Self::Handle, AccountCacheError>;

    async fn register_oracle(
        self: Arc<Self>,
        oracle: &TrackedOracle<Self::Handle>,
    ) -> Result<Self::Handle, AccountCacheError>;

    async fn release(&self, address: &Pubkey, handle: Self::Handle);
}

/// Callback that stores state/market/vault bytes for `kind`.
pub(crate) fn account_sink<R: Registrar>(registrar: &Arc<R>, kind: AccountKind) -> AccountUpdateFn {
    let weak = Arc::downgrade(registrar);
    Arc::new(move |data: &[u8], slot: u64| {
        if let Some(registrar) = weak.upgrade() {
            on_account_data(&registrar, kind, data, slot);
        }
    })
}

/// Callback that stores oracle bytes for `address`.
pub(crate) fn oracle_sink<R: Registrar>(
    registrar: &Arc<R>,
    address: Pubkey,
    source: OracleSource,
) -> AccountUpdateFn {
    let weak = Arc::downgrade(registrar);
    Arc::new(move |data: &[u8], slot: u64| {
        if let Some(registrar) = weak.upgrade() {
            registrar.core().store.store_oracle(address, source, data, slot);
        }
    })
}

/// Decode and store one account update, then react to what changed.
///
/// Once the cache is active, a market or vault that turned delisted schedules
/// a delisting pass, and one whose oracle no longer matches its map entry
/// schedules a heal.
pub(crate) fn on_account_data<R: Registrar>(
    registrar: &Arc<R>,
    kind: AccountKind,
    data: &[u8],
    slot: u64,
) {
    let core = registrar.core();
    let index = match kind {
        AccountKind::State => {
            core.store.store_state(data, slot);
            return;
        }
        AccountKind::Market => core
            .store
            .store_market(data, slot)
            .map(|market| market.market_index),
        AccountKind::Vault => core.store.store_vault(data, slot).map(|vault| vault.vault_index),
    };

    let Some(index) = index else {
        return;
    };
    if !core.store.is_active() {
        return;
    }

    if core.store.is_delisted(kind, index) && core.policy != DelistPolicy::Subscribe {
        if core.is_registered(kind, index) {
            schedule_delisting(registrar);
        }
        return;
    }

    let current = core.store.linked_oracle(kind, index).map(|(oracle, _)| oracle);
    if current != core.store.oracle_link(kind, index) {
        schedule_heal(registrar, kind, index);
    }
}

/// Track and register an oracle. The sentinel address and already tracked or
/// in-flight addresses succeed without registering again.
pub(crate) async fn add_oracle<R: Registrar>(
    registrar: &Arc<R>,
    address: Pubkey,
    source: OracleSource,
) -> bool {
    if is_sentinel(&address) {
        return true;
    }
    let core = registrar.core();
    if core.oracles.contains_key(&address) {
        return true;
    }
    if !core.pending.insert(address) {
        debug!("Oracle {} registration already in flight", address);
        return true;
    }
    if core.oracles.contains_key(&address) {
        core.pending.remove(&address);
        return true;
    }

    let mut tracked = TrackedOracle::new(address, source);
    let registered = match registrar.clone().register_oracle(&tracked).await {
        Ok(handle) => {
            debug!("Registered oracle {} ({})", address, source);
            tracked.handle = Some(handle);
            core.oracles.insert(address, tracked);
            true
        }
        Err(err) => {
            warn!("Failed to register oracle {}: {}", address, err);
            core.store.emit_error(format!("failed to register oracle {}: {}", address, err));
            false
        }
    };
    core.pending.remove(&address);
    registered
}

/// Track and register a state/market/vault account.
pub(crate) async fn add_account<R: Registrar>(
    registrar: &Arc<R>,
    kind: AccountKind,
    address: Pubkey,
    map_index: Option<u16>,
) -> bool {
    let core = registrar.core();
    if core.accounts.contains_key(&address) {
        return true;
    }
    if !core.pending.insert(address) {
        debug!("{} {} registration already in flight", kind, address);
        return true;
    }
    if core.accounts.contains_key(&address) {
        core.pending.remove(&address);
        return true;
    }

    let mut tracked = TrackedAccount::new(kind, address, map_index);
    let registered = match registrar.clone().register_account(&tracked).await {
        Ok(handle) => {
            debug!("Registered {} {}", kind, address);
            tracked.handle = Some(handle);
            core.accounts.insert(address, tracked);
            true
        }
        Err(err) => {
            warn!("Failed to register {} {}: {}", kind, address, err);
            core.store.emit_error(format!("failed to register {} {}: {}", kind, address, err));
            false
        }
    };
    core.pending.remove(&address);
    registered
}

/// Track the market or vault at `index` and link its oracle.
pub(crate) async fn add_indexed<R: Registrar>(
    registrar: &Arc<R>,
    kind: AccountKind,
    index: u16,
) -> bool {
    let program_id = registrar.core().program_id;
    let address = match kind {
        AccountKind::Market => market_address(&program_id, index),
        AccountKind::Vault => vault_address(&program_id, index),
        AccountKind::State => return false,
    };

    if !add_account(registrar, kind, address, Some(index)).await {
        return false;
    }
    sync_oracle_link(registrar, kind, index).await;
    true
}

/// Point the dependency-map entry for one market or vault at the oracle its
/// record currently names, registering that oracle first if needed.
///
/// A delisted record under `Unsubscribe` or `Discard` only gets its map entry;
/// its oracle is left to the delisting pass and never registered from here.
pub(crate) async fn sync_oracle_link<R: Registrar>(
    registrar: &Arc<R>,
    kind: AccountKind,
    index: u16,
) {
    let core = registrar.core();
    let Some((oracle, source)) = core.store.linked_oracle(kind, index) else {
        core.store.remove_oracle_link(kind, index);
        return;
    };
    if core.policy != DelistPolicy::Subscribe && core.store.is_delisted(kind, index) {
        core.store.set_oracle_link(kind, index, oracle);
        return;
    }

    let linked = core.store.oracle_link(kind, index) == Some(oracle);
    if linked && (is_sentinel(&oracle) || core.oracles.contains_key(&oracle)) {
        return;
    }

    if add_oracle(registrar, oracle, source).await {
        core.store.set_oracle_link(kind, index, oracle);
    }
}

/// Rebuild both dependency maps from the stored records.
pub(crate) async fn sync_oracle_maps<R: Registrar>(registrar: &Arc<R>) {
    let core = registrar.core();
    for index in core.store.market_indexes() {
        sync_oracle_link(registrar, AccountKind::Market, index).await;
    }
    for index in core.store.vault_indexes() {
        sync_oracle_link(registrar, AccountKind::Vault, index).await;
    }
}

/// Fire-and-forget rebuild of one dependency-map entry. At most one heal per
/// market/vault runs at a time.
pub(crate) fn schedule_heal<R: Registrar>(registrar: &Arc<R>, kind: AccountKind, index: u16) {
    let core = registrar.core();
    if !core.healing.insert((kind, index)) {
        return;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        debug!("No tokio runtime; skipping oracle map heal for {} {}", kind, index);
        core.healing.remove(&(kind, index));
        return;
    };

    debug!("Healing oracle map entry for {} {}", kind, index);
    let registrar = registrar.clone();
    runtime.spawn(async move {
        sync_oracle_link(&registrar, kind, index).await;
        registrar.core().healing.remove(&(kind, index));
    });
}

/// Fire-and-forget delisting pass. Passes requested while one is queued
/// collapse into it.
pub(crate) fn schedule_delisting<R: Registrar>(registrar: &Arc<R>) {
    let core = registrar.core();
    if core.delisting_scheduled.swap(true, Ordering::AcqRel) {
        return;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        debug!("No tokio runtime; skipping scheduled delisting pass");
        core.delisting_scheduled.store(false, Ordering::Release);
        return;
    };

    let registrar = registrar.clone();
    runtime.spawn(async move {
        registrar.core().delisting_scheduled.store(false, Ordering::Release);
        handle_delisted(&registrar).await;
    });
}

/// Apply the configured delisting policy to every delisted market and vault
/// and to the oracles only they reference.
///
/// A second pass over an unchanged set does nothing: released handles are
/// already gone and discarded records no longer appear in the plan.
pub(crate) async fn handle_delisted<R: Registrar>(registrar: &Arc<R>) {
    let core = registrar.core();
    if core.policy == DelistPolicy::Subscribe {
        return;
    }

    let plan = core.delist_plan();
    if plan.is_empty() {
        return;
    }

    for (kind, index) in plan.accounts {
        let address = core.tracked_address(kind, index);
        if let Some(address) = address {
            let handle = core.take_account_handle(&address);
            if let Some(handle) = handle {
                debug!("Releasing delisted {} {}", kind, index);
                registrar.release(&address, handle).await;
            }
            if core.policy == DelistPolicy::Discard {
                core.accounts.remove(&address);
            }
        }
        if core.policy == DelistPolicy::Discard {
            debug!("Discarding delisted {} {}", kind, index);
            core.store.remove_record(kind, index);
        }
    }

    for oracle in plan.oracles {
        let handle = core.take_oracle_handle(&oracle);
        if let Some(handle) = handle {
            debug!("Releasing orphaned oracle {}", oracle);
            registrar.release(&oracle, handle).await;
        }
        if core.policy == DelistPolicy::Discard {
            core.oracles.remove(&oracle);
            core.store.remove_oracle(&oracle);
        }
    }
}

/// Release every registration and forget what was tracked. Stored records
/// are kept.
pub(crate) async fn release_all<R: Registrar>(registrar: &Arc<R>) {
    let core = registrar.core();

    let accounts: Vec<Pubkey> = core.accounts.iter().map(|entry| *entry.key()).collect();
    let oracles: Vec<Pubkey> = core.oracles.iter().map(|entry| *entry.key()).collect();

    let mut releases = Vec::new();
    for address in accounts {
        if let Some(handle) = core.take_account_handle(&address) {
            releases.push((address, handle));
        }
    }
    for address in oracles {
        if let Some(handle) = core.take_oracle_handle(&address) {
            releases.push((address, handle));
        }
    }

    join_all(
        releases
            .into_iter()
            .map(|(address, handle)| async move { registrar.release(&address, handle).await }),
    )
    .await;

    core.clear_tracking();
}
