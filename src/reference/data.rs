use std::{ops::Range, sync::Arc};

use ndarray::{Array2, Axis};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use rand_distr::{Bernoulli, Distribution, Normal};

use crate::{
    config::{ConfigErr, DataConfig},
    training::{DataLoader, Device, ToDevice},
    Result,
};

/// Synthetic labelled volumes, one row per volume and one column per voxel.
///
/// Foreground voxels carry a positive signal and background voxels a negative
/// one, both blurred by gaussian noise.
#[derive(Debug, Clone)]
pub struct VolumeDataset {
    images: Array2<f64>,
    labels: Array2<f64>,
}

impl VolumeDataset {
    /// Generates `samples` volumes, the same ones for the same `seed`.
    ///
    /// # Arguments
    /// * `samples` - The amount of volumes.
    /// * `data` - The shape and noise of each volume.
    /// * `seed` - The generator seed.
    pub fn synthetic(samples: usize, data: &DataConfig, seed: u64) -> Result<Self> {
        let noise = Normal::new(0.0, data.noise).map_err(|e| ConfigErr::Invalid {
            field: "data.noise",
            reason: e.to_string(),
        })?;

        let mut rng = StdRng::seed_from_u64(seed);
        let mut images = Array2::zeros((samples, data.voxels));
        let mut labels = Array2::zeros((samples, data.voxels));

        for (mut image, mut label) in images.rows_mut().into_iter().zip(labels.rows_mut()) {
            // Each volume gets its own foreground share.
            let share: f64 = rng.random_range(0.2..0.8);
            let foreground = Bernoulli::new(share).map_err(|e| ConfigErr::Invalid {
                field: "data",
                reason: e.to_string(),
            })?;

            for (x, y) in image.iter_mut().zip(label.iter_mut()) {
                let is_fg = foreground.sample(&mut rng);
                *y = if is_fg { 1.0 } else { 0.0 };
                *x = if is_fg { 1.0 } else { -1.0 } + noise.sample(&mut rng);
            }
        }

        Ok(Self { images, labels })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.images.nrows()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn voxels(&self) -> usize {
        self.images.ncols()
    }

    /// The volumes and masks at `indices`, stacked as a batch.
    pub fn select(&self, indices: &[usize]) -> (Array2<f64>, Array2<f64>) {
        (
            self.images.select(Axis(0), indices),
            self.labels.select(Axis(0), indices),
        )
    }
}

/// Splits `total` samples among `num_workers` and returns the shard for `worker_id`.
///
/// Ranges are contiguous, disjoint and cover `[0..total)`, sizes differ by at
/// most 1.
pub fn shard_range(total: usize, worker_id: usize, num_workers: usize) -> Range<usize> {
    assert!(num_workers > 0);
    assert!(worker_id < num_workers);

    let base = total / num_workers;
    let rem = total % num_workers;

    let start = worker_id * base + worker_id.min(rem);
    let extra = usize::from(worker_id < rem);
    start..start + base + extra
}

/// Picks the samples of one rank for every epoch.
///
/// The index list is padded by wrapping around until it splits evenly, so
/// every rank runs the same amount of steps. When shuffling, the permutation
/// only depends on the seed and the epoch, so every rank agrees on it.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    rank: usize,
    world_size: usize,
    shuffle: bool,
    seed: u64,
    epoch: usize,
}

impl DistributedSampler {
    pub fn new(len: usize, rank: usize, world_size: usize, shuffle: bool, seed: u64) -> Self {
        assert!(world_size > 0, "world_size must be > 0");
        assert!(rank < world_size, "rank out of range");

        Self {
            len,
            rank,
            world_size,
            shuffle,
            seed,
            epoch: 0,
        }
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    /// How many samples each rank gets per epoch.
    pub fn num_samples(&self) -> usize {
        self.len.div_ceil(self.world_size)
    }

    /// The indices of this rank for the current epoch.
    pub fn indices(&self) -> Vec<usize> {
        if self.len == 0 {
            return Vec::new();
        }

        let mut order: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
            order.shuffle(&mut rng);
        }

        let total = self.num_samples() * self.world_size;
        let padded: Vec<usize> = order.iter().copied().cycle().take(total).collect();

        padded[shard_range(total, self.rank, self.world_size)].to_vec()
    }
}

/// Batches of one rank's share of a [`VolumeDataset`].
#[derive(Debug, Clone)]
pub struct VolumeLoader {
    dataset: Arc<VolumeDataset>,
    sampler: DistributedSampler,
    batch_size: usize,
    jitter: Option<(StdRng, Normal<f64>)>,
}

impl VolumeLoader {
    pub fn new(dataset: Arc<VolumeDataset>, sampler: DistributedSampler, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch_size must be > 0");

        Self {
            dataset,
            sampler,
            batch_size,
            jitter: None,
        }
    }

    /// Adds fresh gaussian noise to every image this loader yields.
    ///
    /// # Arguments
    /// * `rng` - Draws the noise, usually this process's host generator.
    /// * `std` - The standard deviation of the noise, zero disables it.
    pub fn with_jitter(mut self, rng: StdRng, std: f64) -> Result<Self> {
        if std == 0.0 {
            return Ok(self);
        }

        let noise = Normal::new(0.0, std).map_err(|e| ConfigErr::Invalid {
            field: "data.jitter",
            reason: e.to_string(),
        })?;
        self.jitter = Some((rng, noise));
        Ok(self)
    }
}

impl DataLoader for VolumeLoader {
    type Image = Array2<f64>;
    type Label = Array2<f64>;

    fn len(&self) -> usize {
        self.sampler.num_samples().div_ceil(self.batch_size)
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.sampler.set_epoch(epoch);
    }

    fn batches(&mut self) -> Box<dyn Iterator<Item = (Array2<f64>, Array2<f64>)> + '_> {
        let indices = self.sampler.indices();
        let dataset = Arc::clone(&self.dataset);
        let batch_size = self.batch_size;

        let mut batches: Vec<_> = indices
            .chunks(batch_size)
            .map(|chunk| dataset.select(chunk))
            .collect();

        if let Some((rng, noise)) = self.jitter.as_mut() {
            for (images, _) in &mut batches {
                images.mapv_inplace(|x| x + noise.sample(rng));
            }
        }

        Box::new(batches.into_iter())
    }
}

/// Host arrays stay where they are.
impl ToDevice for Array2<f64> {
    fn to_device(self, _device: &Device) -> Self {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(voxels: usize) -> DataConfig {
        DataConfig {
            val_size: 4,
            voxels,
            noise: 0.1,
            jitter: 0.0,
        }
    }

    #[test]
    fn shard_range_balanced() {
        // total 10, workers 3 => sizes 4,3,3
        assert_eq!(shard_range(10, 0, 3), 0..4);
        assert_eq!(shard_range(10, 1, 3), 4..7);
        assert_eq!(shard_range(10, 2, 3), 7..10);
    }

    #[test]
    fn synthetic_data_is_reproducible() {
        let a = VolumeDataset::synthetic(6, &data(8), 3).unwrap();
        let b = VolumeDataset::synthetic(6, &data(8), 3).unwrap();

        assert_eq!(a.len(), 6);
        assert_eq!(a.voxels(), 8);
        assert_eq!(a.select(&[0, 5]), b.select(&[0, 5]));
    }

    #[test]
    fn ranks_get_equal_disjoint_shares() {
        let world = 3;
        let shares: Vec<Vec<usize>> = (0..world)
            .map(|rank| {
                let mut sampler = DistributedSampler::new(10, rank, world, true, 11);
                sampler.set_epoch(2);
                sampler.indices()
            })
            .collect();

        assert!(shares.iter().all(|s| s.len() == 4));

        let mut seen: Vec<usize> = shares.concat();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn shuffling_depends_on_the_epoch() {
        let mut sampler = DistributedSampler::new(32, 0, 1, true, 5);
        sampler.set_epoch(1);
        let first = sampler.indices();
        assert_eq!(first, sampler.indices());

        sampler.set_epoch(2);
        assert_ne!(first, sampler.indices());
    }

    #[test]
    fn loader_batches_respect_batch_size() {
        let dataset = Arc::new(VolumeDataset::synthetic(7, &data(4), 1).unwrap());
        let sampler = DistributedSampler::new(7, 1, 2, false, 0);
        let mut loader = VolumeLoader::new(dataset, sampler, 3);

        assert_eq!(loader.len(), 2);
        let sizes: Vec<usize> = loader.batches().map(|(x, _)| x.nrows()).collect();
        assert_eq!(sizes, [3, 1]);
    }

    #[test]
    fn jitter_perturbs_images_but_not_labels() {
        let dataset = Arc::new(VolumeDataset::synthetic(4, &data(6), 2).unwrap());
        let sampler = DistributedSampler::new(4, 0, 1, false, 0);
        let clean: Vec<_> = VolumeLoader::new(Arc::clone(&dataset), sampler, 2)
            .batches()
            .collect();

        let jittered = |seed| -> Vec<(Array2<f64>, Array2<f64>)> {
            let sampler = DistributedSampler::new(4, 0, 1, false, 0);
            let mut loader = VolumeLoader::new(Arc::clone(&dataset), sampler, 2)
                .with_jitter(StdRng::seed_from_u64(seed), 0.05)
                .unwrap();
            let batches = loader.batches().collect();
            batches
        };

        let a = jittered(9);
        assert_eq!(a, jittered(9));
        for ((x, y), (clean_x, clean_y)) in a.iter().zip(&clean) {
            assert_eq!(y, clean_y);
            assert_ne!(x, clean_x);
            assert!(x.iter().zip(clean_x).all(|(noisy, plain)| (noisy - plain).abs() < 1.0));
        }
    }

    #[test]
    fn negative_jitter_is_a_config_error() {
        let dataset = Arc::new(VolumeDataset::synthetic(2, &data(2), 0).unwrap());
        let loader = VolumeLoader::new(dataset, DistributedSampler::new(2, 0, 1, false, 0), 1);

        assert!(loader.with_jitter(StdRng::seed_from_u64(0), -1.0).is_err());
    }
}
