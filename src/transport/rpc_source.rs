//! An RPC-backed [`AccountSource`].
//!
//! `RpcAccountSource` wraps a nonblocking `RpcClient` and provides the two bulk
//! reads the cache needs:
//! - `getMultipleAccounts`, chunked so no single request exceeds the RPC limit
//! - `getProgramAccounts` filtered by an account discriminator
//!
//! Unlike a read-through cache it keeps no state of its own; slot gating and
//! buffering belong to the loader and channels built on top of it.

use async_trait::async_trait;
use solana_account_decoder::UiAccountEncoding;
use solana_client::rpc_config::{RpcAccountInfoConfig, RpcProgramAccountsConfig};
use solana_client::rpc_filter::{Memcmp, RpcFilterType};
use solana_pubkey::Pubkey;
use solana_rpc_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;

use crate::error::TransportError;
use crate::transport::{AccountSnapshot, AccountSource};

/// `getMultipleAccounts` accepts at most this many keys per request.
pub const MAX_ACCOUNTS_PER_REQUEST: usize = 100;

pub struct RpcAccountSource {
    rpc_client: RpcClient,
    commitment: CommitmentConfig,
}

impl RpcAccountSource {
    /// Construct a new source from an existing `RpcClient`.
    pub fn new(rpc_client: RpcClient, commitment: CommitmentConfig) -> Self {
        Self {
            rpc_client,
            commitment,
        }
    }
}

#[async_trait]
impl AccountSource for RpcAccountSource {
    /// Fetch accounts in chunks of `MAX_ACCOUNTS_PER_REQUEST`.
    ///
    /// Each chunk carries its own context slot; accounts in that chunk are
    /// stamped with it.
    async fn get_multiple_accounts(
        &self,
        addresses: &[Pubkey],
    ) -> Result<Vec<Option<AccountSnapshot>>, TransportError> {
        let mut result = Vec::with_capacity(addresses.len());

        for chunk in addresses.chunks(MAX_ACCOUNTS_PER_REQUEST) {
            let response = self
                .rpc_client
                .get_multiple_accounts_with_commitment(chunk, self.commitment)
                .await?;
            let slot = response.context.slot;

            result.extend(response.value.into_iter().map(|account| {
                account.map(|account| AccountSnapshot {
                    data: account.data,
                    slot,
                })
            }));
        }

        Ok(result)
    }

    async fn get_program_accounts(
        &self,
        program_id: &Pubkey,
        discriminator: [u8; 8],
    ) -> Result<Vec<(Pubkey, Vec<u8>)>, TransportError> {
        let config = RpcProgramAccountsConfig {
            filters: Some(vec![RpcFilterType::Memcmp(Memcmp::new_raw_bytes(
                0,
                discriminator.to_vec(),
            ))]),
            account_config: RpcAccountInfoConfig {
                encoding: Some(UiAccountEncoding::Base64),
                commitment: Some(self.commitment),
                ..RpcAccountInfoConfig::default()
            },
            ..RpcProgramAccountsConfig::default()
        };

        let accounts = self
            .rpc_client
            .get_program_accounts_with_config(program_id, config)
            .await?;

        Ok(accounts
            .into_iter()
            .map(|(pubkey, account)| (pubkey, account.data))
            .collect())
    }
}
