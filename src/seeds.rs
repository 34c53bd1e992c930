//! Reproducible seeds for every rank and epoch.

use comms::{Collective, CollectiveExt};
use log::debug;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::Result;

/// The seeds of a run, identical on every rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedPlan {
    pub master_seed: u64,
    /// One per process of the world, indexed by local rank.
    pub worker_seeds: Vec<u64>,
    /// One per epoch.
    pub shuffling_seeds: Vec<u64>,
}

impl SeedPlan {
    /// Expands `master_seed` into the seeds of a run.
    ///
    /// The expansion only depends on its arguments, every seed is in
    /// `[0, 2^32 - 1]`.
    ///
    /// # Arguments
    /// * `master_seed` - The root of the sequence.
    /// * `world_size` - How many worker seeds to draw.
    /// * `epochs` - How many shuffling seeds to draw.
    pub fn expand(master_seed: u64, world_size: usize, epochs: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(master_seed);
        let mut draw = |n: usize| -> Vec<u64> {
            (0..n).map(|_| u64::from(rng.random::<u32>())).collect()
        };

        let worker_seeds = draw(world_size);
        let shuffling_seeds = draw(epochs);

        Self {
            master_seed,
            worker_seeds,
            shuffling_seeds,
        }
    }

    /// The seed of the worker with `local_rank`.
    pub fn worker_seed(&self, local_rank: usize) -> Option<u64> {
        self.worker_seeds.get(local_rank).copied()
    }

    /// The seed data shuffling starts from.
    pub fn shuffling_seed(&self) -> Option<u64> {
        self.shuffling_seeds.first().copied()
    }
}

/// Builds the seed plan on rank 0 and hands it to every rank.
///
/// # Arguments
/// * `comm` - The process group.
/// * `master_seed` - The configured seed, a random one is drawn when unset.
/// * `epochs` - The amount of epochs of the run.
///
/// # Returns
/// The same plan on every rank.
pub fn setup_seeds<C: Collective + ?Sized>(
    comm: &mut C,
    master_seed: Option<u64>,
    epochs: usize,
) -> Result<SeedPlan> {
    let size = comm.size();
    let plan = (comm.rank() == 0).then(|| {
        let master_seed = master_seed
            .unwrap_or_else(|| u64::from(StdRng::from_os_rng().random::<u32>()));
        SeedPlan::expand(master_seed, size, epochs)
    });

    let plan: SeedPlan = comm.broadcast(plan.as_ref(), 0)?;
    debug!(master_seed = plan.master_seed; "seeds distributed");
    Ok(plan)
}

/// A source of randomness that can be reseeded.
pub trait SeedSink {
    fn reseed(&mut self, seed: u64);
}

/// Reseeds every sink with `seed`.
///
/// # Returns
/// The host generator of this process, seeded with `seed` as well.
pub fn seed_everything(seed: u64, sinks: &mut [&mut dyn SeedSink]) -> StdRng {
    for sink in sinks.iter_mut() {
        sink.reseed(seed);
    }

    StdRng::seed_from_u64(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_is_deterministic() {
        let a = SeedPlan::expand(42, 4, 3);
        let b = SeedPlan::expand(42, 4, 3);

        assert_eq!(a, b);
        assert_eq!(a.worker_seeds.len(), 4);
        assert_eq!(a.shuffling_seeds.len(), 3);
        assert_ne!(a, SeedPlan::expand(43, 4, 3));
    }

    #[test]
    fn seeds_fit_in_32_bits() {
        let plan = SeedPlan::expand(u64::MAX, 64, 64);
        let max = u64::from(u32::MAX);
        assert!(plan.worker_seeds.iter().chain(&plan.shuffling_seeds).all(|&s| s <= max));
    }

    struct Recorder(Option<u64>);

    impl SeedSink for Recorder {
        fn reseed(&mut self, seed: u64) {
            self.0 = Some(seed);
        }
    }

    #[test]
    fn seed_everything_reaches_every_sink() {
        let mut model = Recorder(None);
        let mut data = Recorder(None);

        let mut a = seed_everything(7, &mut [&mut model, &mut data]);
        let mut b = StdRng::seed_from_u64(7);

        assert_eq!(model.0, Some(7));
        assert_eq!(data.0, Some(7));
        assert_eq!(a.random::<u64>(), b.random::<u64>());
    }
}
