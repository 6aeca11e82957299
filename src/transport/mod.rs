//! Transport contracts the account cache is written against, plus concrete
//! RPC/websocket implementations of them.
//!
//! The cache never talks to the network directly. It sees three seams:
//!
//! - [`AccountSource`] — one-shot bulk reads (`getMultipleAccounts`) and
//!   program scans (`getProgramAccounts`).
//! - [`AccountChannel`] — a per-address push subscription, created through a
//!   [`ChannelFactory`].
//! - [`BatchAccountLoader`] — a shared poller that coalesces every registered
//!   address into periodic bulk reads.
//!
//! Implementers must satisfy the following:
//!
//! - **Thread-safety:** trait objects must be `Send + Sync`.
//! - **Ordering:** `AccountSource::get_multiple_accounts` returns one entry per
//!   input address, in input order.
//! - **Slot gating:** callbacks must never deliver a slot older than the last
//!   delivered one for the same address (see [`should_deliver`]).

pub mod polling_loader;
pub mod pubsub_channel;
pub mod rpc_source;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use solana_pubkey::Pubkey;

use crate::error::TransportError;

pub use polling_loader::PollingAccountLoader;
pub use pubsub_channel::{PubsubAccountChannel, PubsubChannelFactory};
pub use rpc_source::RpcAccountSource;

/// Invoked with `(account_data, slot)` each time new bytes are observed.
pub type AccountUpdateFn = Arc<dyn Fn(&[u8], u64) + Send + Sync>;

/// Invoked when a batch load fails.
pub type ErrorFn = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Identifies a callback registered with a [`BatchAccountLoader`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(pub u64);

/// Raw account bytes together with the slot they were observed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub data: Vec<u8>,
    pub slot: u64,
}

/// Bulk, stateless account reads.
#[async_trait]
pub trait AccountSource: Send + Sync {
    /// Read many accounts at once. Missing accounts are `None`.
    ///
    /// The returned vector must have the same length and ordering as
    /// `addresses`.
    async fn get_multiple_accounts(
        &self,
        addresses: &[Pubkey],
    ) -> Result<Vec<Option<AccountSnapshot>>, TransportError>;

    /// Every account owned by `program_id` whose data starts with
    /// `discriminator`.
    async fn get_program_accounts(
        &self,
        program_id: &Pubkey,
        discriminator: [u8; 8],
    ) -> Result<Vec<(Pubkey, Vec<u8>)>, TransportError>;
}

/// A push subscription to a single account.
///
/// Reconnecting after transport-level disconnects is the channel's own
/// responsibility; the cache only reacts to delivered data.
#[async_trait]
pub trait AccountChannel: Send + Sync {
    fn address(&self) -> Pubkey;

    /// Seed the last-known value before the first network round trip, so the
    /// subscription only delivers changes from here on.
    fn set_initial_data(&self, snapshot: AccountSnapshot);

    async fn subscribe(&self, on_data: AccountUpdateFn) -> Result<(), TransportError>;

    /// Force one direct read, delivered through the subscribed callback.
    async fn fetch(&self) -> Result<(), TransportError>;

    async fn unsubscribe(&self);
}

/// Creates one [`AccountChannel`] per address.
pub trait ChannelFactory: Send + Sync {
    fn create(&self, address: Pubkey) -> Arc<dyn AccountChannel>;
}

/// A shared, address-keyed poller.
#[async_trait]
pub trait BatchAccountLoader: Send + Sync {
    fn add_account(&self, address: Pubkey, on_data: AccountUpdateFn) -> CallbackId;

    fn remove_account(&self, address: &Pubkey, id: CallbackId);

    /// Run one batch cycle across every registered address.
    async fn load(&self) -> Result<(), TransportError>;

    /// Last observed bytes and slot for `address`, if any.
    fn buffer_and_slot(&self, address: &Pubkey) -> Option<AccountSnapshot>;

    fn set_polling_interval(&self, interval: Duration);

    fn on_error(&self, callback: ErrorFn) -> CallbackId;

    fn remove_error_callback(&self, id: CallbackId);
}

/// Whether `(data, slot)` should replace `previous`: never go back in slots,
/// and do not re-notify identical bytes.
pub fn should_deliver(previous: Option<&AccountSnapshot>, data: &[u8], slot: u64) -> bool {
    match previous {
        Some(previous) if slot < previous.slot => false,
        Some(previous) => previous.data != data,
        None => true,
    }
}

/// Per-address last-value holder applying [`should_deliver`].
#[derive(Debug, Default)]
pub struct SlotGate {
    last: Mutex<Option<AccountSnapshot>>,
}

impl SlotGate {
    pub fn seed(&self, snapshot: AccountSnapshot) {
        let mut last = self.last.lock();
        if last.as_ref().is_none_or(|previous| snapshot.slot >= previous.slot) {
            *last = Some(snapshot);
        }
    }

    /// Record `(data, slot)` and report whether it should be delivered.
    pub fn admit(&self, data: &[u8], slot: u64) -> bool {
        let mut last = self.last.lock();
        if !should_deliver(last.as_ref(), data, slot) {
            return false;
        }
        *last = Some(AccountSnapshot {
            data: data.to_vec(),
            slot,
        });
        true
    }

    pub fn last(&self) -> Option<AccountSnapshot> {
        self.last.lock().clone()
    }
}
