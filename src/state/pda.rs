//! Deterministic program addresses for the records the cache mirrors.

use solana_pubkey::Pubkey;

pub const STATE_SEED: &str = "state";
pub const MARKET_SEED: &str = "market";
pub const VAULT_SEED: &str = "vault";

pub fn state_address(program_id: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[STATE_SEED.as_bytes()], program_id).0
}

pub fn market_address(program_id: &Pubkey, market_index: u16) -> Pubkey {
    Pubkey::find_program_address(
        &[MARKET_SEED.as_bytes(), &market_index.to_le_bytes()],
        program_id,
    )
    .0
}

pub fn vault_address(program_id: &Pubkey, vault_index: u16) -> Pubkey {
    Pubkey::find_program_address(
        &[VAULT_SEED.as_bytes(), &vault_index.to_le_bytes()],
        program_id,
    )
    .0
}
