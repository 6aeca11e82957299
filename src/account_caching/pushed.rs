//! Account cache backed by one push subscription per account.
//!
//! Activation reads every address once in bulk, stores what it gets and seeds
//! each channel with it before subscribing, so channels only report changes
//! from then on. Accounts the bulk read missed get one direct fetch when their
//! channel opens.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use log::{debug, info, warn};
use solana_pubkey::Pubkey;
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;

use crate::account_caching::config::{CacheConfig, DEFAULT_ACTIVATION_TIMEOUT_MS, StrategyConfig};
use crate::account_caching::discovery::{AccountTarget, resolve_universe};
use crate::account_caching::events::CacheEvent;
use crate::account_caching::lifecycle::{
    Registrar, account_sink, add_account, add_indexed, add_oracle, handle_delisted, on_account_data,
    oracle_sink, release_all, schedule_heal, sync_oracle_maps,
};
use crate::account_caching::store::RecordStore;
use crate::account_caching::tracking::CacheCore;
use crate::account_caching::types::{AccountKind, OracleDescriptor, TrackedAccount, TrackedOracle};
use crate::account_caching::AccountCache;
use crate::error::{AccountCacheError, ErrorInfo, TransportError};
use crate::state::{AccountDecoder, OracleSource};
use crate::transport::{
    AccountChannel, AccountSnapshot, AccountSource, AccountUpdateFn, ChannelFactory,
};

type ChannelHandle = Arc<dyn AccountChannel>;

pub struct PushedAccountCache {
    inner: Arc<PushedInner>,
}

struct PushedInner {
    core: CacheCore<ChannelHandle>,
    source: Arc<dyn AccountSource>,
    channels: Arc<dyn ChannelFactory>,
    activation_timeout: Duration,
    /// Bulk-read snapshots waiting to seed their channel.
    seeds: DashMap<Pubkey, AccountSnapshot>,
}

enum SeedTarget {
    Account(AccountKind),
    Oracle(OracleSource),
}

impl PushedAccountCache {
    pub fn new(
        config: &CacheConfig,
        source: Arc<dyn AccountSource>,
        channels: Arc<dyn ChannelFactory>,
        decoder: Arc<dyn AccountDecoder>,
    ) -> Self {
        let activation_timeout_ms = match config.strategy {
            StrategyConfig::Pushed {
                activation_timeout_ms,
                ..
            } => activation_timeout_ms,
            StrategyConfig::Polled { .. } => DEFAULT_ACTIVATION_TIMEOUT_MS,
        };

        Self {
            inner: Arc::new(PushedInner {
                core: CacheCore::new(
                    config.program_id,
                    config.universe.clone(),
                    config.delist_policy,
                    decoder,
                    config.event_capacity,
                ),
                source,
                channels,
                activation_timeout: Duration::from_millis(activation_timeout_ms),
                seeds: DashMap::new(),
            }),
        }
    }
}

impl PushedInner {
    async fn run_activation(self: Arc<Self>) -> bool {
        info!("Activating pushed account cache for program {}", self.core.program_id);

        let resolved = match resolve_universe(
            &self.core.program_id,
            &self.core.universe,
            self.source.as_ref(),
            self.core.decoder.as_ref(),
        )
        .await
        {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!("Failed to resolve tracked accounts: {}", err);
                self.core.store.emit_error(format!("failed to resolve tracked accounts: {}", err));
                return false;
            }
        };

        let targets = resolved.account_targets(&self.core.program_id);
        let oracles: Vec<OracleDescriptor> = resolved.live_oracles().copied().collect();
        self.seed_from_bulk_read(&targets, &oracles).await;

        let mut events = self.core.store.subscribe_events();
        join_all(
            targets
                .iter()
                .map(|target| add_account(&self, target.kind, target.address, target.map_index)),
        )
        .await;
        join_all(
            oracles
                .iter()
                .map(|oracle| add_oracle(&self, oracle.address, oracle.source)),
        )
        .await;

        let has_state = self.wait_for_state(&mut events).await;
        self.seeds.clear();
        if !has_state {
            warn!(
                "State account not observed within {:?}; activation failed",
                self.activation_timeout
            );
            return false;
        }

        self.core.store.set_active(true);
        handle_delisted(&self).await;
        sync_oracle_maps(&self).await;

        info!(
            "Pushed account cache active: {} accounts, {} oracles",
            self.core.accounts.len(),
            self.core.oracles.len()
        );
        true
    }

    /// One bulk read across every address. Records are stored right away and
    /// snapshots kept to seed the channels.
    async fn seed_from_bulk_read(
        self: &Arc<Self>,
        targets: &[AccountTarget],
        oracles: &[OracleDescriptor],
    ) {
        let entries: Vec<(Pubkey, SeedTarget)> = targets
            .iter()
            .map(|target| (target.address, SeedTarget::Account(target.kind)))
            .chain(
                oracles
                    .iter()
                    .map(|oracle| (oracle.address, SeedTarget::Oracle(oracle.source))),
            )
            .collect();
        let addresses: Vec<Pubkey> = entries.iter().map(|(address, _)| *address).collect();

        let snapshots = match self.source.get_multiple_accounts(&addresses).await {
            Ok(snapshots) => snapshots,
            Err(err) => {
                warn!("Bulk snapshot failed, channels will fetch individually: {}", err);
                return;
            }
        };

        for ((address, target), snapshot) in entries.into_iter().zip(snapshots) {
            let Some(snapshot) = snapshot else {
                continue;
            };
            match target {
                SeedTarget::Account(kind) => {
                    on_account_data(self, kind, &snapshot.data, snapshot.slot)
                }
                SeedTarget::Oracle(source) => {
                    self.core
                        .store
                        .store_oracle(address, source, &snapshot.data, snapshot.slot);
                }
            }
            self.seeds.insert(address, snapshot);
        }
    }

    async fn wait_for_state(&self, events: &mut Receiver<CacheEvent>) -> bool {
        let store = &self.core.store;
        if store.has_state() {
            return true;
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(CacheEvent::StateUpdated { .. }) => return true,
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        if store.has_state() {
                            return true;
                        }
                    }
                    Err(RecvError::Closed) => return store.has_state(),
                }
            }
        };

        timeout(self.activation_timeout, wait).await.unwrap_or(false) || store.has_state()
    }

    async fn open_channel(
        &self,
        address: Pubkey,
        on_data: AccountUpdateFn,
        needs_fetch: bool,
    ) -> Result<ChannelHandle, AccountCacheError> {
        let channel = self.channels.create(address);
        if let Some((_, seed)) = self.seeds.remove(&address) {
            channel.set_initial_data(seed);
        }
        channel.subscribe(on_data).await.map_err(|err| {
            AccountCacheError::RegistrationFailed(ErrorInfo::String(format!(
                "subscription to {} failed: {}",
                address, err
            )))
        })?;

        if needs_fetch {
            if let Err(err) = channel.fetch().await {
                debug!("Initial fetch for {} failed: {}", address, err);
            }
        }
        Ok(channel)
    }

    fn channel_handles(&self) -> Vec<ChannelHandle> {
        let accounts: Vec<ChannelHandle> = self
            .core
            .accounts
            .iter()
            .filter_map(|entry| entry.handle.clone())
            .collect();
        let oracles: Vec<ChannelHandle> = self
            .core
            .oracles
            .iter()
            .filter_map(|entry| entry.handle.clone())
            .collect();
        accounts.into_iter().chain(oracles).collect()
    }
}

#[async_trait]
impl Registrar for PushedInner {
    type Handle = ChannelHandle;

    fn core(&self) -> &CacheCore<ChannelHandle> {
        &self.core
    }

    async fn register_account(
        self: Arc<Self>,
        account: &TrackedAccount<ChannelHandle>,
    ) -> Result<ChannelHandle, AccountCacheError> {
        let on_data = account_sink(&self, account.kind);
        let needs_fetch = !self.core.store.has_record(account.kind, account.map_index);
        self.open_channel(account.address, on_data, needs_fetch).await
    }

    async fn register_oracle(
        self: Arc<Self>,
        oracle: &TrackedOracle<ChannelHandle>,
    ) -> Result<ChannelHandle, AccountCacheError> {
        let on_data = oracle_sink(&self, oracle.address, oracle.source);
        let needs_fetch = !self.core.store.has_oracle(&oracle.address);
        self.open_channel(oracle.address, on_data, needs_fetch).await
    }

    async fn release(&self, address: &Pubkey, handle: ChannelHandle) {
        debug!("Unsubscribing {}", address);
        handle.unsubscribe().await;
    }
}

#[async_trait]
impl AccountCache for PushedAccountCache {
    async fn activate(&self) -> bool {
        if self.inner.core.store.is_active() {
            return true;
        }
        let inner = self.inner.clone();
        self.inner
            .core
            .activation
            .run(move || inner.run_activation())
            .await
    }

    /// Re-read every tracked account directly. Every channel is fetched even
    /// when some fail; the first failure is returned.
    async fn refresh(&self) -> Result<(), AccountCacheError> {
        self.inner.core.store.ensure_active()?;

        let channels = self.inner.channel_handles();
        let results = join_all(channels.iter().map(|channel| channel.fetch())).await;

        let mut first_error: Option<TransportError> = None;
        for (channel, result) in channels.iter().zip(results) {
            if let Err(err) = result {
                warn!("Refresh of {} failed: {}", channel.address(), err);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    async fn deactivate(&self) {
        release_all(&self.inner).await;
        self.inner.seeds.clear();
        self.inner.core.store.set_active(false);
        info!("Pushed account cache deactivated");
    }

    async fn add_market(&self, index: u16) -> bool {
        add_indexed(&self.inner, AccountKind::Market, index).await
    }

    async fn add_vault(&self, index: u16) -> bool {
        add_indexed(&self.inner, AccountKind::Vault, index).await
    }

    async fn add_oracle(&self, address: Pubkey, source: OracleSource) -> bool {
        add_oracle(&self.inner, address, source).await
    }

    async fn apply_delist_policy(&self) {
        handle_delisted(&self.inner).await;
    }

    fn store(&self) -> &RecordStore {
        &self.inner.core.store
    }

    fn request_oracle_heal(&self, kind: AccountKind, index: u16) {
        schedule_heal(&self.inner, kind, index);
    }

    fn tracked_accounts(&self) -> Vec<(AccountKind, Pubkey)> {
        self.inner.core.tracked_accounts()
    }

    fn tracked_oracles(&self) -> Vec<OracleDescriptor> {
        self.inner.core.tracked_oracles()
    }
}
