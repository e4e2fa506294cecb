use rand::rngs::StdRng;
use rand::SeedableRng;
use sha2::{Digest, Sha256};

use crate::model::entity::Entity;

/// 2^31 - 1; keeps derived seeds in the positive `i32` range.
pub const SEED_MODULUS: u64 = (1 << 31) - 1;

/// Seed from the first 32 bits of `sha256("{entity_id}_{base_seed}")`.
pub fn derive_seed(entity_id: &str, base_seed: u64) -> u64 {
    let digest = Sha256::digest(format!("{entity_id}_{base_seed}").as_bytes());
    let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    u64::from(head) % SEED_MODULUS
}

/// A seed pinned in configuration wins over the derived one.
pub fn entity_seed(entity: &Entity, base_seed: u64) -> u64 {
    entity
        .seed
        .unwrap_or_else(|| derive_seed(&entity.id, base_seed))
}

/// The only source of randomness in a training run.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}
