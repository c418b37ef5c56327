//! Deterministic random test data
//!
//! Seeded generators for multihashes and CIDs, used by tests and fixtures.

use cid::Cid;
use multihash::Multihash;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::schema::{DAG_CBOR, SHA2_256};

/// A reproducible RNG for fixture generation.
pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Generates `n` sha2-256 multihashes of random payloads.
pub fn multihashes(rng: &mut StdRng, n: usize) -> Vec<Multihash> {
    (0..n)
        .map(|_| {
            let payload: [u8; 32] = rng.gen();
            let digest = Sha256::digest(payload);
            Multihash::wrap(SHA2_256, &digest).expect("sha2-256 digest length is valid")
        })
        .collect()
}

/// Generates `n` DAG-CBOR CIDs of random payloads.
pub fn cids(rng: &mut StdRng, n: usize) -> Vec<Cid> {
    multihashes(rng, n)
        .into_iter()
        .map(|mh| Cid::new_v1(DAG_CBOR, mh))
        .collect()
}
