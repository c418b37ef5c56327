//! Multihash sampling
//!
//! A sampler decides, per candidate multihash, whether it is included in a
//! verification run.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

pub type Sampler = Box<dyn FnMut() -> bool + Send>;

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("sampling probability must be in (0, 1]; got {0}")]
    InvalidProbability(f64),
}

/// Includes every candidate.
pub fn always() -> Sampler {
    Box::new(|| true)
}

/// Includes each candidate with probability `p`.
///
/// With a fixed `seed` the selection is reproducible across runs; without
/// one the clock seeds the generator.
pub fn bernoulli(p: f64, seed: Option<u64>) -> Result<Sampler, SamplerError> {
    if !(p > 0.0 && p <= 1.0) {
        return Err(SamplerError::InvalidProbability(p));
    }
    if p == 1.0 {
        return Ok(always());
    }
    let seed = seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64 ^ d.as_secs())
            .unwrap_or(1)
    });
    let mut rng = StdRng::seed_from_u64(seed);
    Ok(Box::new(move || rng.gen::<f64>() <= p))
}
