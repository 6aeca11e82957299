//! Account cache backed by one shared [`BatchAccountLoader`].
//!
//! Every tracked address is registered with the loader, whose timer drives
//! the bulk reads. The cache's own fetch is a pull of the loader's buffered
//! bytes, so staleness is bounded by the polling interval.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use log::{debug, info, warn};
use parking_lot::Mutex;
use solana_pubkey::Pubkey;

use crate::account_caching::AccountCache;
use crate::account_caching::config::{CacheConfig, DEFAULT_ACTIVATION_ATTEMPTS, StrategyConfig};
use crate::account_caching::discovery::resolve_universe;
use crate::account_caching::lifecycle::{
    Registrar, account_sink, add_account, add_indexed, add_oracle, handle_delisted, on_account_data,
    oracle_sink, release_all, schedule_heal, sync_oracle_maps,
};
use crate::account_caching::store::RecordStore;
use crate::account_caching::tracking::CacheCore;
use crate::account_caching::types::{AccountKind, OracleDescriptor, TrackedAccount, TrackedOracle};
use crate::error::{AccountCacheError, TransportError};
use crate::state::{AccountDecoder, OracleSource};
use crate::transport::{AccountSource, BatchAccountLoader, CallbackId};

pub struct PolledAccountCache {
    inner: Arc<PolledInner>,
}

struct PolledInner {
    core: CacheCore<CallbackId>,
    source: Arc<dyn AccountSource>,
    loader: Arc<dyn BatchAccountLoader>,
    activation_attempts: u32,
    error_callback: Mutex<Option<CallbackId>>,
}

impl PolledAccountCache {
    pub fn new(
        config: &CacheConfig,
        source: Arc<dyn AccountSource>,
        loader: Arc<dyn BatchAccountLoader>,
        decoder: Arc<dyn AccountDecoder>,
    ) -> Self {
        let activation_attempts = match config.strategy {
            StrategyConfig::Polled {
                activation_attempts,
                ..
            } => activation_attempts.max(1),
            StrategyConfig::Pushed { .. } => DEFAULT_ACTIVATION_ATTEMPTS,
        };

        Self {
            inner: Arc::new(PolledInner {
                core: CacheCore::new(
                    config.program_id,
                    config.universe.clone(),
                    config.delist_policy,
                    decoder,
                    config.event_capacity,
                ),
                source,
                loader,
                activation_attempts,
                error_callback: Mutex::new(None),
            }),
        }
    }

    /// Change how often the loader polls. Registrations are kept.
    pub fn set_polling_interval(&self, interval: Duration) {
        self.inner.loader.set_polling_interval(interval);
    }
}

impl PolledInner {
    async fn run_activation(self: Arc<Self>) -> bool {
        info!("Activating polled account cache for program {}", self.core.program_id);

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

        self.bridge_loader_errors();

        let targets = resolved.account_targets(&self.core.program_id);
        join_all(
            targets
                .iter()
                .map(|target| add_account(&self, target.kind, target.address, target.map_index)),
        )
        .await;
        join_all(
            resolved
                .live_oracles()
                .map(|oracle| add_oracle(&self, oracle.address, oracle.source)),
        )
        .await;

        let mut attempt = 0;
        while !self.core.store.has_state() && attempt < self.activation_attempts {
            attempt += 1;
            if let Err(err) = self.fetch().await {
                debug!("Activation fetch {}/{} failed: {}", attempt, self.activation_attempts, err);
            }
        }
        if !self.core.store.has_state() {
            warn!(
                "State account not observed after {} fetch attempts; activation failed",
                self.activation_attempts
            );
            return false;
        }

        self.core.store.set_active(true);
        handle_delisted(&self).await;
        sync_oracle_maps(&self).await;

        info!(
            "Polled account cache active: {} accounts, {} oracles",
            self.core.accounts.len(),
            self.core.oracles.len()
        );
        true
    }

    /// Publish loader failures on the event bus.
    fn bridge_loader_errors(self: &Arc<Self>) {
        let mut error_callback = self.error_callback.lock();
        if error_callback.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        *error_callback = Some(self.loader.on_error(Arc::new(move |err: &TransportError| {
            if let Some(inner) = weak.upgrade() {
                inner.core.store.emit_error(format!("account load failed: {}", err));
            }
        })));
    }

    /// One batch cycle, then pull every buffered value into the store.
    async fn fetch(self: &Arc<Self>) -> Result<(), TransportError> {
        let loaded = self.loader.load().await;
        self.pull_buffers();
        loaded
    }

    fn pull_buffers(self: &Arc<Self>) {
        let accounts: Vec<(Pubkey, AccountKind)> = self
            .core
            .accounts
            .iter()
            .filter(|entry| entry.handle.is_some())
            .map(|entry| (entry.address, entry.kind))
            .collect();
        for (address, kind) in accounts {
            if let Some(snapshot) = self.loader.buffer_and_slot(&address) {
                on_account_data(self, kind, &snapshot.data, snapshot.slot);
            }
        }

        let oracles: Vec<(Pubkey, OracleSource)> = self
            .core
            .oracles
            .iter()
            .filter(|entry| entry.handle.is_some())
            .map(|entry| (entry.address, entry.source))
            .collect();
        for (address, source) in oracles {
            if let Some(snapshot) = self.loader.buffer_and_slot(&address) {
                self.core
                    .store
                    .store_oracle(address, source, &snapshot.data, snapshot.slot);
            }
        }
    }
}

#[async_trait]
impl Registrar for PolledInner {
    type Handle = CallbackId;

    fn core(&self) -> &CacheCore<CallbackId> {
        &self.core
    }

    async fn register_account(
        self: Arc<Self>,
        account: &TrackedAccount<CallbackId>,
    ) -> Result<CallbackId, AccountCacheError> {
        let id = self
            .loader
            .add_account(account.address, account_sink(&self, account.kind));
        if let Some(snapshot) = self.loader.buffer_and_slot(&account.address) {
            on_account_data(&self, account.kind, &snapshot.data, snapshot.slot);
        }
        Ok(id)
    }

    async fn register_oracle(
        self: Arc<Self>,
        oracle: &TrackedOracle<CallbackId>,
    ) -> Result<CallbackId, AccountCacheError> {
        let id = self.loader.add_account(
            oracle.address,
            oracle_sink(&self, oracle.address, oracle.source),
        );
        if let Some(snapshot) = self.loader.buffer_and_slot(&oracle.address) {
            self.core
                .store
                .store_oracle(oracle.address, oracle.source, &snapshot.data, snapshot.slot);
        }
        Ok(id)
    }

    async fn release(&self, address: &Pubkey, handle: CallbackId) {
        debug!("Removing {} from the loader", address);
        self.loader.remove_account(address, handle);
    }
}

#[async_trait]
impl AccountCache for PolledAccountCache {
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

    async fn refresh(&self) -> Result<(), AccountCacheError> {
        self.inner.core.store.ensure_active()?;
        self.inner.fetch().await?;
        Ok(())
    }

    async fn deactivate(&self) {
        release_all(&self.inner).await;
        let error_callback = self.inner.error_callback.lock().take();
        if let Some(id) = error_callback {
            self.inner.loader.remove_error_callback(id);
        }
        self.inner.core.store.set_active(false);
        info!("Polled account cache deactivated");
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
