//! On-chain record types mirrored by the cache, and the decoder contract that
//! turns raw account bytes into them.
//!
//! Every program-owned account starts with an 8-byte discriminator followed by
//! the borsh encoding of the record. Oracle accounts are decoded according to
//! their `OracleSource` instead.

pub mod oracle;
pub mod pda;
pub mod price_update_v2;

use borsh::{BorshDeserialize, BorshSerialize};
use solana_pubkey::Pubkey;

use crate::error::DecodeError;
pub use oracle::{
    ORACLE_SENTINEL, OraclePrice, OracleSource, PRICE_PRECISION, decode_oracle_price, is_sentinel,
};

pub const ANCHOR_DISCRIMINATOR_LEN: usize = 8;

/// Trading status of a market or vault.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub enum MarketStatus {
    #[default]
    Initialized,
    Active,
    ReduceOnly,
    Settlement,
    Delisted,
}

/// Global program state. Its presence is what makes the cache "ready".
#[derive(Clone, Debug, PartialEq, Default, BorshSerialize, BorshDeserialize)]
pub struct StateAccount {
    pub admin: Pubkey,
    pub number_of_markets: u16,
    pub number_of_vaults: u16,
    pub exchange_paused: bool,
}

#[derive(Clone, Debug, PartialEq, Default, BorshSerialize, BorshDeserialize)]
pub struct MarketAccount {
    pub pubkey: Pubkey,
    pub market_index: u16,
    pub oracle: Pubkey,
    pub oracle_source: OracleSource,
    pub status: MarketStatus,
    pub name: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Default, BorshSerialize, BorshDeserialize)]
pub struct VaultAccount {
    pub pubkey: Pubkey,
    pub vault_index: u16,
    pub mint: Pubkey,
    pub oracle: Pubkey,
    pub oracle_source: OracleSource,
    pub status: MarketStatus,
    pub decimals: u8,
}

/// A discriminated, borsh-encoded program account.
pub trait AccountData: BorshSerialize + BorshDeserialize + Sized {
    const NAME: &'static str;
    const DISCRIMINATOR: [u8; ANCHOR_DISCRIMINATOR_LEN];

    fn try_from_account_data(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < ANCHOR_DISCRIMINATOR_LEN {
            return Err(DecodeError::TooShort {
                expected: ANCHOR_DISCRIMINATOR_LEN,
                actual: data.len(),
            });
        }
        if data[..ANCHOR_DISCRIMINATOR_LEN] != Self::DISCRIMINATOR {
            return Err(DecodeError::DiscriminatorMismatch(Self::NAME));
        }
        let mut body = &data[ANCHOR_DISCRIMINATOR_LEN..];
        Ok(Self::deserialize(&mut body)?)
    }

    fn try_to_account_data(&self) -> Result<Vec<u8>, DecodeError> {
        let mut data = Self::DISCRIMINATOR.to_vec();
        self.serialize(&mut data)?;
        Ok(data)
    }
}

impl AccountData for StateAccount {
    const NAME: &'static str = "State";
    const DISCRIMINATOR: [u8; ANCHOR_DISCRIMINATOR_LEN] = [216, 146, 107, 94, 104, 75, 182, 177];
}

impl AccountData for MarketAccount {
    const NAME: &'static str = "Market";
    const DISCRIMINATOR: [u8; ANCHOR_DISCRIMINATOR_LEN] = [219, 190, 213, 55, 0, 227, 198, 154];
}

impl AccountData for VaultAccount {
    const NAME: &'static str = "Vault";
    const DISCRIMINATOR: [u8; ANCHOR_DISCRIMINATOR_LEN] = [211, 8, 232, 43, 2, 152, 117, 119];
}

/// Records that depend on a price oracle and can be delisted.
pub trait OracleLinked {
    fn index(&self) -> u16;
    fn oracle(&self) -> Pubkey;
    fn oracle_source(&self) -> OracleSource;
    fn status(&self) -> MarketStatus;

    fn is_delisted(&self) -> bool {
        self.status() == MarketStatus::Delisted
    }
}

impl OracleLinked for MarketAccount {
    fn index(&self) -> u16 {
        self.market_index
    }

    fn oracle(&self) -> Pubkey {
        self.oracle
    }

    fn oracle_source(&self) -> OracleSource {
        self.oracle_source
    }

    fn status(&self) -> MarketStatus {
        self.status
    }
}

impl OracleLinked for VaultAccount {
    fn index(&self) -> u16 {
        self.vault_index
    }

    fn oracle(&self) -> Pubkey {
        self.oracle
    }

    fn oracle_source(&self) -> OracleSource {
        self.oracle_source
    }

    fn status(&self) -> MarketStatus {
        self.status
    }
}

/// Turns raw account bytes into typed records.
///
/// The cache never interprets bytes itself; swapping the decoder is how a
/// different on-chain layout is supported.
pub trait AccountDecoder: Send + Sync {
    fn decode_state(&self, data: &[u8]) -> Result<StateAccount, DecodeError>;
    fn decode_market(&self, data: &[u8]) -> Result<MarketAccount, DecodeError>;
    fn decode_vault(&self, data: &[u8]) -> Result<VaultAccount, DecodeError>;
    fn decode_oracle(&self, source: OracleSource, data: &[u8]) -> Result<OraclePrice, DecodeError>;
}

/// Default decoder for discriminator-prefixed borsh accounts.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnchorAccountDecoder;

impl AccountDecoder for AnchorAccountDecoder {
    fn decode_state(&self, data: &[u8]) -> Result<StateAccount, DecodeError> {
        StateAccount::try_from_account_data(data)
    }

    fn decode_market(&self, data: &[u8]) -> Result<MarketAccount, DecodeError> {
        MarketAccount::try_from_account_data(data)
    }

    fn decode_vault(&self, data: &[u8]) -> Result<VaultAccount, DecodeError> {
        VaultAccount::try_from_account_data(data)
    }

    fn decode_oracle(&self, source: OracleSource, data: &[u8]) -> Result<OraclePrice, DecodeError> {
        decode_oracle_price(source, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_account_data_round_trip() {
        let market = MarketAccount {
            pubkey: Pubkey::new_unique(),
            market_index: 3,
            oracle: Pubkey::new_unique(),
            oracle_source: OracleSource::PythPull,
            status: MarketStatus::Active,
            name: [b'x'; 32],
        };
        let data = market.try_to_account_data().unwrap();
        assert_eq!(&data[..ANCHOR_DISCRIMINATOR_LEN], &MarketAccount::DISCRIMINATOR);
        assert_eq!(AnchorAccountDecoder.decode_market(&data).unwrap(), market);
    }

    #[test]
    fn test_wrong_discriminator_is_rejected() {
        let data = StateAccount::default().try_to_account_data().unwrap();
        let err = AnchorAccountDecoder.decode_vault(&data).unwrap_err();
        assert!(matches!(err, DecodeError::DiscriminatorMismatch("Vault")));
    }
}
