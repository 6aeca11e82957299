pub mod config;
pub mod discovery;
pub mod events;
pub(crate) mod lifecycle;
pub mod polled;
pub mod pushed;
pub mod single_flight;
pub mod store;
pub(crate) mod tracking;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use solana_pubkey::Pubkey;
use solana_rpc_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;
use tokio::sync::broadcast;

use crate::error::AccountCacheError;
use crate::state::{
    AccountDecoder, AnchorAccountDecoder, MarketAccount, OraclePrice, OracleSource, StateAccount,
    VaultAccount,
};
use crate::transport::{
    AccountSource, BatchAccountLoader, ChannelFactory, PollingAccountLoader, PubsubChannelFactory,
    RpcAccountSource,
};

pub use config::{CacheConfig, DelistPolicy, StrategyConfig, Universe};
pub use events::{CacheEvent, EventBus, EventKind};
pub use polled::PolledAccountCache;
pub use pushed::PushedAccountCache;
pub use store::{OracleLookup, RecordResult, RecordStore};
pub use types::{AccountKind, OracleDescriptor, TrackedAccount, TrackedOracle, VersionedRecord};

/// A slot-versioned local mirror of the program's state, market, vault and
/// oracle accounts.
///
/// Two strategies implement this contract: [`PushedAccountCache`] keeps one
/// push subscription per account, [`PolledAccountCache`] shares one batch
/// poller across all of them. Callers pick one through [`build_account_cache`]
/// and otherwise do not care which they hold.
///
/// Implementers must satisfy the following:
///
/// - **Single-flight activation:** concurrent `activate()` calls share one
///   activation and all observe its result.
/// - **Monotonic slots:** a stored record is never replaced by one observed at
///   an older slot.
/// - **Dependency completeness:** once active, every non-sentinel oracle named
///   by a stored market or vault is tracked.
/// - **Guarded reads:** every getter returns [`AccountCacheError::NotActive`]
///   until activation succeeds; `Ok(None)` only ever means "not observed".
#[async_trait]
pub trait AccountCache: Send + Sync {
    /// Resolve the universe, register it with the transport and wait for the
    /// state record. Returns whether the state record was observed.
    async fn activate(&self) -> bool;

    /// Force one refresh cycle across every tracked account.
    async fn refresh(&self) -> Result<(), AccountCacheError>;

    /// Release every transport registration. Safe to call at any time.
    async fn deactivate(&self);

    async fn add_market(&self, index: u16) -> bool;

    async fn add_vault(&self, index: u16) -> bool;

    /// Track an oracle. The sentinel address is accepted without registering.
    async fn add_oracle(&self, address: Pubkey, source: OracleSource) -> bool;

    /// Run the configured delisting policy over the current records.
    async fn apply_delist_policy(&self);

    fn store(&self) -> &RecordStore;

    /// Rebuild the dependency-map entry for one market or vault in the
    /// background.
    fn request_oracle_heal(&self, kind: AccountKind, index: u16);

    fn tracked_accounts(&self) -> Vec<(AccountKind, Pubkey)>;

    fn tracked_oracles(&self) -> Vec<OracleDescriptor>;

    fn is_active(&self) -> bool {
        self.store().is_active()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<CacheEvent> {
        self.store().subscribe_events()
    }

    fn state_and_slot(&self) -> RecordResult<StateAccount> {
        self.store().state_and_slot()
    }

    fn market_and_slot(&self, index: u16) -> RecordResult<MarketAccount> {
        self.store().market_and_slot(index)
    }

    fn markets_and_slots(&self) -> Result<Vec<VersionedRecord<MarketAccount>>, AccountCacheError> {
        self.store().markets_and_slots()
    }

    fn vault_and_slot(&self, index: u16) -> RecordResult<VaultAccount> {
        self.store().vault_and_slot(index)
    }

    fn vaults_and_slots(&self) -> Result<Vec<VersionedRecord<VaultAccount>>, AccountCacheError> {
        self.store().vaults_and_slots()
    }

    fn oracle_and_slot(&self, address: &Pubkey) -> RecordResult<OraclePrice> {
        self.store().oracle_and_slot(address)
    }

    /// Oracle price for a market, resolved through the dependency map.
    ///
    /// If the market now names a different oracle than its map entry, this
    /// call still answers from the map entry and schedules a rebuild; later
    /// calls see the new oracle once it completes.
    fn oracle_for_market(&self, index: u16) -> RecordResult<OraclePrice> {
        let lookup = self.store().oracle_for(AccountKind::Market, index)?;
        if lookup.drifted {
            self.request_oracle_heal(AccountKind::Market, index);
        }
        Ok(lookup.record)
    }

    /// Vault counterpart of [`AccountCache::oracle_for_market`].
    fn oracle_for_vault(&self, index: u16) -> RecordResult<OraclePrice> {
        let lookup = self.store().oracle_for(AccountKind::Vault, index)?;
        if lookup.drifted {
            self.request_oracle_heal(AccountKind::Vault, index);
        }
        Ok(lookup.record)
    }
}

/// Transport collaborators a cache is built on.
///
/// `source` serves bulk reads and discovery for both strategies. The pushed
/// strategy requires `channels`; the polled strategy creates a
/// [`PollingAccountLoader`] over `source` when no `loader` is given.
#[derive(Clone)]
pub struct Transports {
    pub source: Arc<dyn AccountSource>,
    pub channels: Option<Arc<dyn ChannelFactory>>,
    pub loader: Option<Arc<dyn BatchAccountLoader>>,
    pub decoder: Arc<dyn AccountDecoder>,
}

impl Transports {
    pub fn new(source: Arc<dyn AccountSource>) -> Self {
        Self {
            source,
            channels: None,
            loader: None,
            decoder: Arc::new(AnchorAccountDecoder),
        }
    }

    pub fn with_channels(mut self, channels: Arc<dyn ChannelFactory>) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn BatchAccountLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn AccountDecoder>) -> Self {
        self.decoder = decoder;
        self
    }
}

/// Build the cache variant selected by `config.strategy`.
pub fn build_account_cache(
    config: &CacheConfig,
    transports: Transports,
) -> Result<Arc<dyn AccountCache>, AccountCacheError> {
    config.validate()?;

    match config.strategy {
        StrategyConfig::Pushed { .. } => {
            let channels = transports
                .channels
                .ok_or(AccountCacheError::MissingTransport("channel factory"))?;
            Ok(Arc::new(PushedAccountCache::new(
                config,
                transports.source,
                channels,
                transports.decoder,
            )))
        }
        StrategyConfig::Polled {
            polling_interval_ms,
            ..
        } => {
            let loader: Arc<dyn BatchAccountLoader> = match transports.loader {
                Some(loader) => loader,
                None => Arc::new(PollingAccountLoader::new(
                    transports.source.clone(),
                    Duration::from_millis(polling_interval_ms),
                )),
            };
            Ok(Arc::new(PolledAccountCache::new(
                config,
                transports.source,
                loader,
                transports.decoder,
            )))
        }
    }
}

/// Build a cache over a live cluster: JSON-RPC for bulk reads and polling,
/// websocket subscriptions for the pushed strategy.
pub fn build_account_cache_from_rpc(
    config: &CacheConfig,
    rpc_url: &str,
    ws_url: &str,
    commitment: CommitmentConfig,
) -> Result<Arc<dyn AccountCache>, AccountCacheError> {
    let source = Arc::new(RpcAccountSource::new(
        RpcClient::new_with_commitment(rpc_url.to_string(), commitment),
        commitment,
    ));
    let mut transports = Transports::new(source);

    if let StrategyConfig::Pushed {
        resubscribe_timeout_ms,
        ..
    } = config.strategy
    {
        let rpc_client = Arc::new(RpcClient::new_with_commitment(rpc_url.to_string(), commitment));
        transports = transports.with_channels(Arc::new(PubsubChannelFactory::new(
            ws_url.to_string(),
            rpc_client,
            commitment,
            resubscribe_timeout_ms.map(Duration::from_millis),
        )));
    }

    build_account_cache(config, transports)
}
