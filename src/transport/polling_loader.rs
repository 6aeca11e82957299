//! A [`BatchAccountLoader`] that polls an [`AccountSource`] on a timer.
//!
//! Every registered address is coalesced into chunked `getMultipleAccounts`
//! calls once per polling interval. The last observed bytes and slot per
//! address are buffered so callers can pull them back without another round
//! trip.
//!
//! The timer starts with the first registration and stops when the last
//! address is removed. Only one batch cycle runs at a time: a `load()` issued
//! while another is in flight waits for it and then runs its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, warn};
use parking_lot::Mutex;
use solana_pubkey::Pubkey;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::TransportError;
use crate::transport::rpc_source::MAX_ACCOUNTS_PER_REQUEST;
use crate::transport::{
    AccountSnapshot, AccountSource, AccountUpdateFn, BatchAccountLoader, CallbackId, ErrorFn,
    should_deliver,
};

type Callbacks = AHashMap<CallbackId, AccountUpdateFn>;

pub struct PollingAccountLoader {
    inner: Arc<LoaderInner>,
}

struct LoaderInner {
    source: Arc<dyn AccountSource>,
    accounts: DashMap<Pubkey, Callbacks>,
    buffers: DashMap<Pubkey, AccountSnapshot>,
    error_callbacks: DashMap<CallbackId, ErrorFn>,
    next_callback_id: AtomicU64,
    polling_interval: Mutex<Duration>,
    poller: Mutex<Option<JoinHandle<()>>>,
    load_lock: tokio::sync::Mutex<()>,
}

impl PollingAccountLoader {
    pub fn new(source: Arc<dyn AccountSource>, polling_interval: Duration) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                source,
                accounts: DashMap::new(),
                buffers: DashMap::new(),
                error_callbacks: DashMap::new(),
                next_callback_id: AtomicU64::new(0),
                polling_interval: Mutex::new(polling_interval),
                poller: Mutex::new(None),
                load_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn polling_interval(&self) -> Duration {
        *self.inner.polling_interval.lock()
    }

    pub fn is_polling(&self) -> bool {
        self.inner.poller.lock().is_some()
    }

    /// Number of distinct addresses currently registered.
    pub fn account_count(&self) -> usize {
        self.inner.accounts.len()
    }
}

impl Drop for PollingAccountLoader {
    fn drop(&mut self) {
        self.inner.stop_polling();
    }
}

impl LoaderInner {
    fn next_id(&self) -> CallbackId {
        CallbackId(self.next_callback_id.fetch_add(1, Ordering::Relaxed))
    }

    fn start_polling(self: &Arc<Self>) {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime available; accounts will only refresh on explicit load()");
            return;
        };

        let interval = *self.polling_interval.lock();
        let weak: Weak<Self> = Arc::downgrade(self);
        debug!("Starting account polling every {:?}", interval);

        *poller = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Err(err) = inner.load().await {
                    debug!("Polling cycle failed: {}", err);
                }
            }
        }));
    }

    fn stop_polling(&self) {
        if let Some(handle) = self.poller.lock().take() {
            debug!("Stopping account polling");
            handle.abort();
        }
    }

    async fn load(&self) -> Result<(), TransportError> {
        let _guard = self.load_lock.lock().await;

        let addresses: Vec<Pubkey> = self.accounts.iter().map(|entry| *entry.key()).collect();
        if addresses.is_empty() {
            return Ok(());
        }

        for chunk in addresses.chunks(MAX_ACCOUNTS_PER_REQUEST) {
            let snapshots = match self.source.get_multiple_accounts(chunk).await {
                Ok(snapshots) => snapshots,
                Err(err) => {
                    self.notify_error(&err);
                    return Err(err);
                }
            };

            for (address, snapshot) in chunk.iter().zip(snapshots) {
                // Accounts that do not exist never notify.
                if let Some(snapshot) = snapshot {
                    self.accept(address, snapshot);
                }
            }
        }

        Ok(())
    }

    fn accept(&self, address: &Pubkey, snapshot: AccountSnapshot) {
        let changed = match self.buffers.entry(*address) {
            Entry::Occupied(mut entry) => {
                if should_deliver(Some(entry.get()), &snapshot.data, snapshot.slot) {
                    entry.insert(snapshot.clone());
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(snapshot.clone());
                true
            }
        };
        if !changed {
            return;
        }

        let callbacks: Vec<AccountUpdateFn> = self
            .accounts
            .get(address)
            .map(|callbacks| callbacks.values().cloned().collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(&snapshot.data, snapshot.slot);
        }
    }

    fn notify_error(&self, err: &TransportError) {
        let callbacks: Vec<ErrorFn> = self
            .error_callbacks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for callback in callbacks {
            callback(err);
        }
    }
}

#[async_trait]
impl BatchAccountLoader for PollingAccountLoader {
    fn add_account(&self, address: Pubkey, on_data: AccountUpdateFn) -> CallbackId {
        let id = self.inner.next_id();
        self.inner
            .accounts
            .entry(address)
            .or_default()
            .insert(id, on_data);
        self.inner.start_polling();
        id
    }

    fn remove_account(&self, address: &Pubkey, id: CallbackId) {
        let now_empty = match self.inner.accounts.get_mut(address) {
            Some(mut callbacks) => {
                callbacks.remove(&id);
                callbacks.is_empty()
            }
            None => false,
        };

        if now_empty {
            self.inner
                .accounts
                .remove_if(address, |_, callbacks| callbacks.is_empty());
            self.inner.buffers.remove(address);
        }

        if self.inner.accounts.is_empty() {
            self.inner.stop_polling();
        }
    }

    async fn load(&self) -> Result<(), TransportError> {
        self.inner.load().await
    }

    fn buffer_and_slot(&self, address: &Pubkey) -> Option<AccountSnapshot> {
        self.inner
            .buffers
            .get(address)
            .map(|snapshot| snapshot.clone())
    }

    fn set_polling_interval(&self, interval: Duration) {
        *self.inner.polling_interval.lock() = interval;
        if self.is_polling() {
            self.inner.stop_polling();
            self.inner.start_polling();
        }
    }

    fn on_error(&self, callback: ErrorFn) -> CallbackId {
        let id = self.inner.next_id();
        self.inner.error_callbacks.insert(id, callback);
        id
    }

    fn remove_error_callback(&self, id: CallbackId) {
        self.inner.error_callbacks.remove(&id);
    }
}
