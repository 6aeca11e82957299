//! Normalized oracle prices and the sources they are decoded from.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use solana_pubkey::Pubkey;

use crate::error::DecodeError;
use crate::state::price_update_v2::PriceUpdateV2;

/// Fixed-point precision of every `OraclePrice::price`.
pub const PRICE_PRECISION: i64 = 1_000_000;

/// Reserved address meaning "no live oracle": reads resolve to the synthetic
/// quote-asset price instead of a subscription.
pub const ORACLE_SENTINEL: Pubkey = Pubkey::new_from_array([0; 32]);

/// Stable-coin feeds within this many basis points of 1.0 are snapped to 1.0.
const STABLE_COIN_BAND_BPS: i64 = 10;

#[inline]
pub fn is_sentinel(address: &Pubkey) -> bool {
    *address == ORACLE_SENTINEL
}

/// How the bytes of an oracle account are interpreted.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Default,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum OracleSource {
    #[default]
    PythPull,
    PythStableCoinPull,
    QuoteAsset,
}

impl std::fmt::Display for OracleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            OracleSource::PythPull => "PythPull",
            OracleSource::PythStableCoinPull => "PythStableCoinPull",
            OracleSource::QuoteAsset => "QuoteAsset",
        };
        write!(f, "{}", label)
    }
}

/// A decoded oracle reading in `PRICE_PRECISION` units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OraclePrice {
    pub price: i64,
    pub confidence: u64,
    pub publish_time: i64,
    pub has_sufficient_data: bool,
}

impl OraclePrice {
    /// The fixed price used for the quote asset and the sentinel address.
    pub fn quote() -> Self {
        Self {
            price: PRICE_PRECISION,
            confidence: 1,
            publish_time: 0,
            has_sufficient_data: true,
        }
    }
}

/// Decode an oracle account according to its source.
pub fn decode_oracle_price(source: OracleSource, data: &[u8]) -> Result<OraclePrice, DecodeError> {
    match source {
        OracleSource::QuoteAsset => Ok(OraclePrice::quote()),
        OracleSource::PythPull => Ok(PriceUpdateV2::try_from_account_data(data)?.to_oracle_price()),
        OracleSource::PythStableCoinPull => {
            let mut price = PriceUpdateV2::try_from_account_data(data)?.to_oracle_price();
            let band = PRICE_PRECISION * STABLE_COIN_BAND_BPS / 10_000;
            if (price.price - PRICE_PRECISION).abs() <= band {
                price.price = PRICE_PRECISION;
            }
            Ok(price)
        }
    }
}
