use borsh::{BorshDeserialize, BorshSerialize};
use solana_pubkey::Pubkey;

use crate::error::DecodeError;
use crate::state::ANCHOR_DISCRIMINATOR_LEN;
use crate::state::oracle::{OraclePrice, PRICE_PRECISION};

#[derive(Clone, Debug, PartialEq, BorshDeserialize, BorshSerialize)]
pub struct PriceFeedMessage {
    pub feed_id: [u8; 32],
    pub price: i64,
    pub conf: u64,
    pub exponent: i32,
    pub publish_time: i64,
    pub prev_publish_time: i64,
    pub ema_price: i64,
    pub ema_conf: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, BorshDeserialize, BorshSerialize)]
pub enum VerificationLevel {
    Partial { num_signatures: u8 },
    Full,
}

/// Pyth pull-oracle price account.
#[derive(Clone, Debug, PartialEq, BorshDeserialize, BorshSerialize)]
pub struct PriceUpdateV2 {
    pub write_authority: Pubkey,
    pub verification_level: VerificationLevel,
    pub price_message: PriceFeedMessage,
    pub posted_slot: u64,
}

impl PriceUpdateV2 {
    /// Smallest encoding: `VerificationLevel::Full` takes a single byte.
    pub const MIN_LEN: usize = 32 + 1 + (32 + 8 + 8 + 4 + 8 + 8 + 8 + 8) + 8;

    pub fn try_from_account_data(data: &[u8]) -> Result<Self, DecodeError> {
        let expected = ANCHOR_DISCRIMINATOR_LEN + Self::MIN_LEN;
        if data.len() < expected {
            return Err(DecodeError::TooShort {
                expected,
                actual: data.len(),
            });
        }
        let mut data = &data[ANCHOR_DISCRIMINATOR_LEN..];
        Ok(Self::deserialize(&mut data)?)
    }

    /// Normalizes the posted price to `PRICE_PRECISION` fixed point.
    pub fn to_oracle_price(&self) -> OraclePrice {
        let message = &self.price_message;
        OraclePrice {
            price: scale_to_precision(message.price as i128, message.exponent),
            confidence: scale_to_precision(message.conf as i128, message.exponent).unsigned_abs(),
            publish_time: message.publish_time,
            has_sufficient_data: matches!(self.verification_level, VerificationLevel::Full),
        }
    }
}

/// Rescales `value * 10^exponent` into `PRICE_PRECISION` units, saturating at
/// the `i64` bounds.
pub(crate) fn scale_to_precision(value: i128, exponent: i32) -> i64 {
    let precision_exponent = PRICE_PRECISION.ilog10() as i32;
    let shift = exponent + precision_exponent;
    let scaled = if shift >= 0 {
        10i128
            .checked_pow(shift as u32)
            .and_then(|factor| value.checked_mul(factor))
            .unwrap_or(if value < 0 { i128::MIN } else { i128::MAX })
    } else {
        match 10i128.checked_pow(shift.unsigned_abs()) {
            Some(divisor) => value / divisor,
            None => 0,
        }
    };
    scaled.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(price: i64, exponent: i32, level: VerificationLevel) -> PriceUpdateV2 {
        PriceUpdateV2 {
            write_authority: Pubkey::new_unique(),
            verification_level: level,
            price_message: PriceFeedMessage {
                feed_id: [7; 32],
                price,
                conf: 5_000,
                exponent,
                publish_time: 1_700_000_000,
                prev_publish_time: 1_699_999_999,
                ema_price: price,
                ema_conf: 5_000,
            },
            posted_slot: 42,
        }
    }

    #[test]
    fn test_scale_to_precision() {
        assert_eq!(scale_to_precision(15_025_000_000, -8), 150_250_000);
        assert_eq!(scale_to_precision(3, 0), 3_000_000);
        assert_eq!(scale_to_precision(-250, -2), -2_500_000);
        assert_eq!(scale_to_precision(i64::MAX as i128, 10), i64::MAX);
    }

    #[test]
    fn test_decode_skips_discriminator() {
        let update = sample(15_025_000_000, -8, VerificationLevel::Full);
        let mut data = vec![0u8; ANCHOR_DISCRIMINATOR_LEN];
        update.serialize(&mut data).unwrap();

        let decoded = PriceUpdateV2::try_from_account_data(&data).unwrap();
        assert_eq!(decoded, update);

        let price = decoded.to_oracle_price();
        assert_eq!(price.price, 150_250_000);
        assert_eq!(price.confidence, 50);
        assert!(price.has_sufficient_data);
    }

    #[test]
    fn test_decode_rejects_short_data() {
        let err = PriceUpdateV2::try_from_account_data(&[0u8; 20]).unwrap_err();
        assert!(matches!(err, DecodeError::TooShort { actual: 20, .. }));
    }

    #[test]
    fn test_partial_verification_is_flagged() {
        let update = sample(100_000_000, -8, VerificationLevel::Partial { num_signatures: 3 });
        assert!(!update.to_oracle_price().has_sufficient_data);
    }
}
