//! Websocket `accountSubscribe` channels.
//!
//! Each [`PubsubAccountChannel`] owns a background task holding one websocket
//! subscription. The task reconnects after socket failures, and when a
//! resubscribe timeout is configured it tears the subscription down and opens
//! a fresh one after that much silence. Direct reads (`fetch`) go through the
//! RPC client and share the same [`SlotGate`] as streamed updates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, warn};
use parking_lot::Mutex;
use solana_account::Account;
use solana_account_decoder::UiAccountEncoding;
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::rpc_config::RpcAccountInfoConfig;
use solana_pubkey::Pubkey;
use solana_rpc_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::error::{ErrorInfo, TransportError};
use crate::transport::{AccountChannel, AccountSnapshot, AccountUpdateFn, ChannelFactory, SlotGate};

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

type SharedCallback = Arc<Mutex<Option<AccountUpdateFn>>>;

/// Settings shared by every channel a [`PubsubChannelFactory`] creates.
#[derive(Clone)]
struct ChannelSettings {
    ws_url: String,
    rpc_client: Arc<RpcClient>,
    commitment: CommitmentConfig,
    resubscribe_timeout: Option<Duration>,
    reconnect_delay: Duration,
}

pub struct PubsubAccountChannel {
    address: Pubkey,
    settings: ChannelSettings,
    gate: Arc<SlotGate>,
    on_data: SharedCallback,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PubsubAccountChannel {
    pub fn new(
        address: Pubkey,
        ws_url: String,
        rpc_client: Arc<RpcClient>,
        commitment: CommitmentConfig,
        resubscribe_timeout: Option<Duration>,
    ) -> Self {
        Self::with_settings(
            address,
            ChannelSettings {
                ws_url,
                rpc_client,
                commitment,
                resubscribe_timeout,
                reconnect_delay: DEFAULT_RECONNECT_DELAY,
            },
        )
    }

    fn with_settings(address: Pubkey, settings: ChannelSettings) -> Self {
        Self {
            address,
            settings,
            gate: Arc::new(SlotGate::default()),
            on_data: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.task.lock().is_some()
    }
}

impl Drop for PubsubAccountChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

fn deliver(gate: &SlotGate, on_data: &SharedCallback, data: &[u8], slot: u64) {
    if !gate.admit(data, slot) {
        return;
    }
    let callback = on_data.lock().clone();
    if let Some(callback) = callback {
        callback(data, slot);
    }
}

async fn run_subscription(
    address: Pubkey,
    settings: ChannelSettings,
    gate: Arc<SlotGate>,
    on_data: SharedCallback,
) {
    let config = RpcAccountInfoConfig {
        encoding: Some(UiAccountEncoding::Base64),
        commitment: Some(settings.commitment),
        ..RpcAccountInfoConfig::default()
    };

    loop {
        let client = match PubsubClient::new(&settings.ws_url).await {
            Ok(client) => client,
            Err(err) => {
                warn!("Websocket connect for {} failed: {}", address, err);
                sleep(settings.reconnect_delay).await;
                continue;
            }
        };

        let mut failed = false;
        match client.account_subscribe(&address, Some(config.clone())).await {
            Ok((mut stream, unsubscribe)) => {
                loop {
                    let next = match settings.resubscribe_timeout {
                        Some(limit) => match timeout(limit, stream.next()).await {
                            Ok(next) => next,
                            Err(_) => {
                                debug!("No data for {} in {:?}, resubscribing", address, limit);
                                break;
                            }
                        },
                        None => stream.next().await,
                    };

                    let Some(response) = next else {
                        debug!("Subscription stream for {} ended", address);
                        failed = true;
                        break;
                    };

                    let slot = response.context.slot;
                    match response.value.decode::<Account>() {
                        Some(account) => deliver(&gate, &on_data, &account.data, slot),
                        None => warn!("Undecodable account notification for {}", address),
                    }
                }
                drop(stream);
                unsubscribe().await;
            }
            Err(err) => {
                warn!("accountSubscribe for {} failed: {}", address, err);
                failed = true;
            }
        }

        if let Err(err) = client.shutdown().await {
            debug!("Websocket shutdown for {} failed: {}", address, err);
        }
        if failed {
            sleep(settings.reconnect_delay).await;
        }
    }
}

#[async_trait]
impl AccountChannel for PubsubAccountChannel {
    fn address(&self) -> Pubkey {
        self.address
    }

    fn set_initial_data(&self, snapshot: AccountSnapshot) {
        self.gate.seed(snapshot);
    }

    async fn subscribe(&self, on_data: AccountUpdateFn) -> Result<(), TransportError> {
        *self.on_data.lock() = Some(on_data);

        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            TransportError::Pubsub(ErrorInfo::StaticStr("no tokio runtime for subscription task"))
        })?;

        *task = Some(runtime.spawn(run_subscription(
            self.address,
            self.settings.clone(),
            self.gate.clone(),
            self.on_data.clone(),
        )));
        Ok(())
    }

    async fn fetch(&self) -> Result<(), TransportError> {
        let response = self
            .settings
            .rpc_client
            .get_account_with_commitment(&self.address, self.settings.commitment)
            .await?;

        let account = response
            .value
            .ok_or(TransportError::AccountNotFound(ErrorInfo::Pubkey(self.address)))?;
        deliver(&self.gate, &self.on_data, &account.data, response.context.slot);
        Ok(())
    }

    async fn unsubscribe(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.on_data.lock().take();
    }
}

/// Creates [`PubsubAccountChannel`]s sharing one RPC client and websocket URL.
pub struct PubsubChannelFactory {
    settings: ChannelSettings,
}

impl PubsubChannelFactory {
    pub fn new(
        ws_url: String,
        rpc_client: Arc<RpcClient>,
        commitment: CommitmentConfig,
        resubscribe_timeout: Option<Duration>,
    ) -> Self {
        Self {
            settings: ChannelSettings {
                ws_url,
                rpc_client,
                commitment,
                resubscribe_timeout,
                reconnect_delay: DEFAULT_RECONNECT_DELAY,
            },
        }
    }

    pub fn with_reconnect_delay(mut self, reconnect_delay: Duration) -> Self {
        self.settings.reconnect_delay = reconnect_delay;
        self
    }
}

impl ChannelFactory for PubsubChannelFactory {
    fn create(&self, address: Pubkey) -> Arc<dyn AccountChannel> {
        Arc::new(PubsubAccountChannel::with_settings(
            address,
            self.settings.clone(),
        ))
    }
}
