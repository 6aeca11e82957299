//! Resolving the tracked universe, either from configuration or by scanning
//! the program's accounts.

use std::collections::BTreeMap;

use log::{info, warn};
use solana_pubkey::Pubkey;

use crate::account_caching::config::Universe;
use crate::account_caching::types::{AccountKind, OracleDescriptor};
use crate::error::AccountCacheError;
use crate::state::pda::{market_address, state_address, vault_address};
use crate::state::{
    AccountData, AccountDecoder, MarketAccount, OracleLinked, VaultAccount, is_sentinel,
};
use crate::transport::AccountSource;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ResolvedUniverse {
    pub market_indexes: Vec<u16>,
    pub vault_indexes: Vec<u16>,
    pub oracles: Vec<OracleDescriptor>,
}

/// One program account to track.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AccountTarget {
    pub kind: AccountKind,
    pub address: Pubkey,
    pub map_index: Option<u16>,
}

impl ResolvedUniverse {
    /// The state account followed by every market and vault.
    pub fn account_targets(&self, program_id: &Pubkey) -> Vec<AccountTarget> {
        let state = AccountTarget {
            kind: AccountKind::State,
            address: state_address(program_id),
            map_index: None,
        };
        let markets = self.market_indexes.iter().map(|index| AccountTarget {
            kind: AccountKind::Market,
            address: market_address(program_id, *index),
            map_index: Some(*index),
        });
        let vaults = self.vault_indexes.iter().map(|index| AccountTarget {
            kind: AccountKind::Vault,
            address: vault_address(program_id, *index),
            map_index: Some(*index),
        });
        std::iter::once(state).chain(markets).chain(vaults).collect()
    }

    /// Oracles that need a live registration.
    pub fn live_oracles(&self) -> impl Iterator<Item = &OracleDescriptor> {
        self.oracles.iter().filter(|oracle| !is_sentinel(&oracle.address))
    }
}

pub(crate) async fn resolve_universe(
    program_id: &Pubkey,
    universe: &Universe,
    source: &dyn AccountSource,
    decoder: &dyn AccountDecoder,
) -> Result<ResolvedUniverse, AccountCacheError> {
    match universe {
        Universe::Explicit {
            market_indexes,
            vault_indexes,
            oracles,
        } => Ok(ResolvedUniverse {
            market_indexes: market_indexes.clone(),
            vault_indexes: vault_indexes.clone(),
            oracles: dedupe_oracles(oracles.iter().copied()),
        }),
        Universe::Discover => discover(program_id, source, decoder).await,
    }
}

/// Scan the program for market and vault accounts and collect the oracles
/// they reference.
async fn discover(
    program_id: &Pubkey,
    source: &dyn AccountSource,
    decoder: &dyn AccountDecoder,
) -> Result<ResolvedUniverse, AccountCacheError> {
    let market_accounts = source
        .get_program_accounts(program_id, MarketAccount::DISCRIMINATOR)
        .await?;
    let vault_accounts = source
        .get_program_accounts(program_id, VaultAccount::DISCRIMINATOR)
        .await?;

    let mut resolved = ResolvedUniverse::default();
    let mut oracles = Vec::new();

    for (address, data) in market_accounts {
        match decoder.decode_market(&data) {
            Ok(market) => {
                resolved.market_indexes.push(market.index());
                oracles.push(OracleDescriptor::new(market.oracle(), market.oracle_source()));
            }
            Err(err) => warn!("Skipping undecodable market {}: {}", address, err),
        }
    }
    for (address, data) in vault_accounts {
        match decoder.decode_vault(&data) {
            Ok(vault) => {
                resolved.vault_indexes.push(vault.index());
                oracles.push(OracleDescriptor::new(vault.oracle(), vault.oracle_source()));
            }
            Err(err) => warn!("Skipping undecodable vault {}: {}", address, err),
        }
    }

    resolved.market_indexes.sort_unstable();
    resolved.market_indexes.dedup();
    resolved.vault_indexes.sort_unstable();
    resolved.vault_indexes.dedup();
    resolved.oracles = dedupe_oracles(
        oracles
            .into_iter()
            .filter(|oracle| !is_sentinel(&oracle.address)),
    );

    info!(
        "Discovered {} markets, {} vaults, {} oracles",
        resolved.market_indexes.len(),
        resolved.vault_indexes.len(),
        resolved.oracles.len()
    );
    Ok(resolved)
}

/// First descriptor per address wins.
fn dedupe_oracles(oracles: impl Iterator<Item = OracleDescriptor>) -> Vec<OracleDescriptor> {
    let mut unique = BTreeMap::new();
    for oracle in oracles {
        unique.entry(oracle.address).or_insert(oracle);
    }
    unique.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{OracleSource, ORACLE_SENTINEL};

    #[test]
    fn test_dedupe_keeps_first_source() {
        let address = Pubkey::new_unique();
        let oracles = dedupe_oracles(
            vec![
                OracleDescriptor::new(address, OracleSource::PythStableCoinPull),
                OracleDescriptor::new(address, OracleSource::PythPull),
            ]
            .into_iter(),
        );
        assert_eq!(oracles, vec![OracleDescriptor::new(address, OracleSource::PythStableCoinPull)]);
    }

    #[test]
    fn test_account_targets_start_with_state() {
        let program_id = Pubkey::new_unique();
        let resolved = ResolvedUniverse {
            market_indexes: vec![0, 1],
            vault_indexes: vec![4],
            oracles: vec![OracleDescriptor::new(ORACLE_SENTINEL, OracleSource::QuoteAsset)],
        };

        let targets = resolved.account_targets(&program_id);
        assert_eq!(targets.len(), 4);
        assert_eq!(targets[0].kind, AccountKind::State);
        assert_eq!(targets[0].address, state_address(&program_id));
        assert_eq!(targets[2].address, market_address(&program_id, 1));
        assert_eq!(targets[3].map_index, Some(4));
        assert_eq!(resolved.live_oracles().count(), 0);
    }
}
