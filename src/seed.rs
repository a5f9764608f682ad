//! Process-wide seed lifecycle.
//!
//! The seed is set once, before any stochastic component exists. After that every component
//! draws its own `ChaCha8Rng` on a dedicated stream, so adding draws in one place never shifts
//! the randomness of another.

use std::sync::OnceLock;

use burn_core::tensor::backend::Backend;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::{Error, Result};

static GLOBAL_SEED: OnceLock<u64> = OnceLock::new();

/// Independent random streams derived from one seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedStream {
    /// Synthetic domain generation and train/val splits.
    Data,
    /// Batch order.
    Loader,
    /// DefRec deformations.
    Deformation,
    /// PCM mixing.
    Mixup,
}

impl SeedStream {
    fn id(self) -> u64 {
        match self {
            SeedStream::Data => 1,
            SeedStream::Loader => 2,
            SeedStream::Deformation => 3,
            SeedStream::Mixup => 4,
        }
    }
}

/// Set the process-wide seed and seed the backend's generator.
///
/// Idempotent for the same value; a second call with a different value is a configuration
/// error (the first seed already shaped whatever was built). The backend is seeded on the
/// first call only.
pub fn init_global_seed<B: Backend>(seed: u64, device: &B::Device) -> Result<u64> {
    let mut fresh = false;
    let stored = *GLOBAL_SEED.get_or_init(|| {
        fresh = true;
        seed
    });
    if stored != seed {
        return Err(Error::Config(format!(
            "global seed already set to {stored}, refusing {seed}"
        )));
    }
    if fresh {
        B::seed(device, seed);
        tracing::debug!(seed, "global seed initialised");
    }
    Ok(seed)
}

/// The seed set by [`init_global_seed`], if any.
pub fn global_seed() -> Option<u64> {
    GLOBAL_SEED.get().copied()
}

/// RNG for one component, derived from the global seed.
pub fn component_rng(stream: SeedStream) -> Result<ChaCha8Rng> {
    let seed = global_seed().ok_or_else(|| {
        Error::Config("component_rng called before init_global_seed".to_string())
    })?;
    Ok(seeded_rng(seed, stream))
}

/// RNG for one component from an explicit seed.
pub fn seeded_rng(seed: u64, stream: SeedStream) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(stream.id());
    rng
}
