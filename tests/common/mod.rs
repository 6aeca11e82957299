#![allow(dead_code)]

//! In-memory transports and record builders shared by the integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use borsh::BorshSerialize;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use solana_pubkey::Pubkey;

use market_account_sync::account_caching::{
    AccountCache, AccountKind, CacheConfig, OracleDescriptor, StrategyConfig, Universe,
};
use market_account_sync::error::{ErrorInfo, TransportError};
use market_account_sync::state::pda::{market_address, state_address, vault_address};
use market_account_sync::state::price_update_v2::{
    PriceFeedMessage, PriceUpdateV2, VerificationLevel,
};
use market_account_sync::state::{
    ANCHOR_DISCRIMINATOR_LEN, AccountData, MarketAccount, MarketStatus, OracleSource,
    PRICE_PRECISION, StateAccount, VaultAccount,
};
use market_account_sync::transport::{
    AccountChannel, AccountSnapshot, AccountSource, AccountUpdateFn, BatchAccountLoader, CallbackId,
    ChannelFactory, ErrorFn, PollingAccountLoader,
};

pub fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The on-chain world as far as the tests are concerned.
#[derive(Default)]
pub struct Ledger {
    accounts: DashMap<Pubkey, AccountSnapshot>,
    /// Address -> number of bulk reads that must pass before it is visible.
    hidden_for: DashMap<Pubkey, usize>,
    bulk_calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl Ledger {
    pub fn put(&self, address: Pubkey, data: Vec<u8>, slot: u64) {
        self.accounts.insert(address, AccountSnapshot { data, slot });
    }

    pub fn get(&self, address: &Pubkey) -> Option<AccountSnapshot> {
        self.accounts.get(address).map(|snapshot| snapshot.clone())
    }

    pub fn remove(&self, address: &Pubkey) {
        self.accounts.remove(address);
    }

    /// Keep `address` out of the first `calls` bulk reads.
    pub fn hide_for(&self, address: Pubkey, calls: usize) {
        self.hidden_for.insert(address, calls);
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountSource for Ledger {
    async fn get_multiple_accounts(
        &self,
        addresses: &[Pubkey],
    ) -> Result<Vec<Option<AccountSnapshot>>, TransportError> {
        let call = self.bulk_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        Ok(addresses
            .iter()
            .map(|address| {
                let visible = self
                    .hidden_for
                    .get(address)
                    .is_none_or(|hidden| call > *hidden);
                if visible { self.get(address) } else { None }
            })
            .collect())
    }

    async fn get_program_accounts(
        &self,
        _program_id: &Pubkey,
        discriminator: [u8; 8],
    ) -> Result<Vec<(Pubkey, Vec<u8>)>, TransportError> {
        Ok(self
            .accounts
            .iter()
            .filter(|entry| entry.data.starts_with(&discriminator))
            .map(|entry| (*entry.key(), entry.data.clone()))
            .collect())
    }
}

/// A push channel driven by the test. Deliveries skip any slot filtering so
/// out-of-order data reaches the cache as-is.
pub struct MockChannel {
    address: Pubkey,
    ledger: Arc<Ledger>,
    on_data: Mutex<Option<AccountUpdateFn>>,
    seeded: Mutex<Option<AccountSnapshot>>,
    refuse_subscribe: bool,
    pub fetches: AtomicUsize,
    pub unsubscribes: AtomicUsize,
}

impl MockChannel {
    pub fn emit(&self, data: &[u8], slot: u64) {
        let callback = self.on_data.lock().clone();
        if let Some(callback) = callback {
            callback(data, slot);
        }
    }

    pub fn seeded(&self) -> Option<AccountSnapshot> {
        self.seeded.lock().clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.on_data.lock().is_some()
    }
}

#[async_trait]
impl AccountChannel for MockChannel {
    fn address(&self) -> Pubkey {
        self.address
    }

    fn set_initial_data(&self, snapshot: AccountSnapshot) {
        *self.seeded.lock() = Some(snapshot);
    }

    async fn subscribe(&self, on_data: AccountUpdateFn) -> Result<(), TransportError> {
        tokio::task::yield_now().await;
        if self.refuse_subscribe {
            return Err(TransportError::Pubsub(ErrorInfo::StaticStr("subscription refused")));
        }
        *self.on_data.lock() = Some(on_data);
        Ok(())
    }

    async fn fetch(&self) -> Result<(), TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let snapshot = self
            .ledger
            .get(&self.address)
            .ok_or(TransportError::AccountNotFound(ErrorInfo::Pubkey(self.address)))?;
        self.emit(&snapshot.data, snapshot.slot);
        Ok(())
    }

    async fn unsubscribe(&self) {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        self.on_data.lock().take();
    }
}

pub struct MockChannelFactory {
    ledger: Arc<Ledger>,
    channels: DashMap<Pubkey, Arc<MockChannel>>,
    created: DashMap<Pubkey, usize>,
    refused: DashSet<Pubkey>,
}

impl MockChannelFactory {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            channels: DashMap::new(),
            created: DashMap::new(),
            refused: DashSet::new(),
        }
    }

    /// Channels created for `address` from now on fail to subscribe.
    pub fn refuse(&self, address: Pubkey) {
        self.refused.insert(address);
    }

    pub fn allow(&self, address: &Pubkey) {
        self.refused.remove(address);
    }

    /// The most recently created channel for `address`.
    pub fn channel(&self, address: &Pubkey) -> Arc<MockChannel> {
        self.channels
            .get(address)
            .map(|channel| channel.clone())
            .unwrap_or_else(|| panic!("no channel created for {}", address))
    }

    pub fn created_for(&self, address: &Pubkey) -> usize {
        self.created.get(address).map(|count| *count).unwrap_or(0)
    }

    pub fn created_total(&self) -> usize {
        self.created.iter().map(|entry| *entry.value()).sum()
    }

    pub fn fetches_total(&self) -> usize {
        self.channels
            .iter()
            .map(|channel| channel.fetches.load(Ordering::SeqCst))
            .sum()
    }
}

impl ChannelFactory for MockChannelFactory {
    fn create(&self, address: Pubkey) -> Arc<dyn AccountChannel> {
        *self.created.entry(address).or_insert(0) += 1;
        let channel = Arc::new(MockChannel {
            address,
            ledger: self.ledger.clone(),
            on_data: Mutex::new(None),
            seeded: Mutex::new(None),
            refuse_subscribe: self.refused.contains(&address),
            fetches: AtomicUsize::new(0),
            unsubscribes: AtomicUsize::new(0),
        });
        self.channels.insert(address, channel.clone());
        channel
    }
}

/// Wraps a [`PollingAccountLoader`] and counts registrations.
pub struct CountingLoader {
    pub inner: PollingAccountLoader,
    pub adds: AtomicUsize,
    pub removes: AtomicUsize,
}

impl CountingLoader {
    pub fn new(source: Arc<dyn AccountSource>, interval: Duration) -> Self {
        Self {
            inner: PollingAccountLoader::new(source, interval),
            adds: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BatchAccountLoader for CountingLoader {
    fn add_account(&self, address: Pubkey, on_data: AccountUpdateFn) -> CallbackId {
        self.adds.fetch_add(1, Ordering::SeqCst);
        self.inner.add_account(address, on_data)
    }

    fn remove_account(&self, address: &Pubkey, id: CallbackId) {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove_account(address, id)
    }

    async fn load(&self) -> Result<(), TransportError> {
        self.inner.load().await
    }

    fn buffer_and_slot(&self, address: &Pubkey) -> Option<AccountSnapshot> {
        self.inner.buffer_and_slot(address)
    }

    fn set_polling_interval(&self, interval: Duration) {
        self.inner.set_polling_interval(interval)
    }

    fn on_error(&self, callback: ErrorFn) -> CallbackId {
        self.inner.on_error(callback)
    }

    fn remove_error_callback(&self, id: CallbackId) {
        self.inner.remove_error_callback(id)
    }
}

/// Whole-unit price in `PRICE_PRECISION` fixed point.
pub fn price_of(units: i64) -> i64 {
    units * PRICE_PRECISION
}

/// A Pyth pull account posting `units` with eight decimals.
pub fn pyth_bytes(units: i64) -> Vec<u8> {
    let update = PriceUpdateV2 {
        write_authority: Pubkey::new_unique(),
        verification_level: VerificationLevel::Full,
        price_message: PriceFeedMessage {
            feed_id: [3; 32],
            price: units * 100_000_000,
            conf: 1_000,
            exponent: -8,
            publish_time: 1_700_000_000,
            prev_publish_time: 1_699_999_999,
            ema_price: units * 100_000_000,
            ema_conf: 1_000,
        },
        posted_slot: 1,
    };
    let mut data = vec![0u8; ANCHOR_DISCRIMINATOR_LEN];
    update.serialize(&mut data).unwrap();
    data
}

/// A program with a state account, two markets and two oracles.
///
/// Market 0 reads `oracle_a` (price 100), market 1 reads `oracle_b`
/// (price 200). Everything sits at slot 10.
pub struct Fixture {
    pub program_id: Pubkey,
    pub ledger: Arc<Ledger>,
    pub oracle_a: Pubkey,
    pub oracle_b: Pubkey,
}

impl Fixture {
    pub fn new() -> Self {
        let fixture = Self {
            program_id: Pubkey::new_unique(),
            ledger: Arc::new(Ledger::default()),
            oracle_a: Pubkey::new_unique(),
            oracle_b: Pubkey::new_unique(),
        };
        fixture.put_state(10);
        fixture.put_market(0, fixture.oracle_a, MarketStatus::Active, 10);
        fixture.put_market(1, fixture.oracle_b, MarketStatus::Active, 10);
        fixture.put_oracle(fixture.oracle_a, 100, 10);
        fixture.put_oracle(fixture.oracle_b, 200, 10);
        fixture
    }

    pub fn state_address(&self) -> Pubkey {
        state_address(&self.program_id)
    }

    pub fn market_address(&self, index: u16) -> Pubkey {
        market_address(&self.program_id, index)
    }

    pub fn vault_address(&self, index: u16) -> Pubkey {
        vault_address(&self.program_id, index)
    }

    pub fn put_state(&self, slot: u64) {
        let state = StateAccount {
            admin: Pubkey::new_unique(),
            number_of_markets: 2,
            number_of_vaults: 0,
            exchange_paused: false,
        };
        self.ledger
            .put(self.state_address(), state.try_to_account_data().unwrap(), slot);
    }

    pub fn market_bytes(&self, index: u16, oracle: Pubkey, status: MarketStatus) -> Vec<u8> {
        let market = MarketAccount {
            pubkey: self.market_address(index),
            market_index: index,
            oracle,
            oracle_source: OracleSource::PythPull,
            status,
            name: [b'm'; 32],
        };
        market.try_to_account_data().unwrap()
    }

    pub fn vault_bytes(&self, index: u16, oracle: Pubkey, status: MarketStatus) -> Vec<u8> {
        let vault = VaultAccount {
            pubkey: self.vault_address(index),
            vault_index: index,
            mint: Pubkey::new_unique(),
            oracle,
            oracle_source: if oracle == Pubkey::default() {
                OracleSource::QuoteAsset
            } else {
                OracleSource::PythPull
            },
            status,
            decimals: 6,
        };
        vault.try_to_account_data().unwrap()
    }

    pub fn put_market(&self, index: u16, oracle: Pubkey, status: MarketStatus, slot: u64) {
        self.ledger
            .put(self.market_address(index), self.market_bytes(index, oracle, status), slot);
    }

    pub fn put_vault(&self, index: u16, oracle: Pubkey, status: MarketStatus, slot: u64) {
        self.ledger
            .put(self.vault_address(index), self.vault_bytes(index, oracle, status), slot);
    }

    pub fn put_oracle(&self, address: Pubkey, units: i64, slot: u64) {
        self.ledger.put(address, pyth_bytes(units), slot);
    }

    pub fn account_address(&self, kind: AccountKind, index: u16) -> Pubkey {
        match kind {
            AccountKind::Vault => self.vault_address(index),
            _ => self.market_address(index),
        }
    }

    /// Market or vault bytes for `kind`.
    pub fn linked_bytes(
        &self,
        kind: AccountKind,
        index: u16,
        oracle: Pubkey,
        status: MarketStatus,
    ) -> Vec<u8> {
        match kind {
            AccountKind::Vault => self.vault_bytes(index, oracle, status),
            _ => self.market_bytes(index, oracle, status),
        }
    }

    pub fn put_linked(
        &self,
        kind: AccountKind,
        index: u16,
        oracle: Pubkey,
        status: MarketStatus,
        slot: u64,
    ) {
        self.ledger.put(
            self.account_address(kind, index),
            self.linked_bytes(kind, index, oracle, status),
            slot,
        );
    }

    /// Markets 0 and 1, the given vaults, and only the listed oracles.
    pub fn universe(&self, vault_indexes: Vec<u16>, oracles: &[Pubkey]) -> Universe {
        Universe::Explicit {
            market_indexes: vec![0, 1],
            vault_indexes,
            oracles: oracles
                .iter()
                .map(|oracle| OracleDescriptor::new(*oracle, OracleSource::PythPull))
                .collect(),
        }
    }

    /// Markets 0 and 1 with both oracles listed.
    pub fn explicit_universe(&self) -> Universe {
        self.universe(vec![], &[self.oracle_a, self.oracle_b])
    }

    pub fn pushed_config(&self, universe: Universe) -> CacheConfig {
        CacheConfig::new(
            self.program_id,
            universe,
            StrategyConfig::Pushed {
                resubscribe_timeout_ms: None,
                activation_timeout_ms: 300,
            },
        )
    }

    pub fn polled_config(&self, universe: Universe) -> CacheConfig {
        CacheConfig::new(
            self.program_id,
            universe,
            StrategyConfig::polled(Duration::from_millis(100)),
        )
    }
}

/// Oracle price a market or vault resolves to through the cache.
pub fn linked_price(cache: &dyn AccountCache, kind: AccountKind, index: u16) -> Option<i64> {
    let record = match kind {
        AccountKind::Vault => cache.oracle_for_vault(index),
        _ => cache.oracle_for_market(index),
    };
    record.unwrap().map(|record| record.data.price)
}

/// Oracle named by the stored market or vault record.
pub fn record_oracle(cache: &dyn AccountCache, kind: AccountKind, index: u16) -> Option<Pubkey> {
    match kind {
        AccountKind::Vault => cache.vault_and_slot(index).unwrap().map(|record| record.data.oracle),
        _ => cache.market_and_slot(index).unwrap().map(|record| record.data.oracle),
    }
}

/// Poll `check` until it holds, yielding to background tasks in between.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
