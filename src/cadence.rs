//! When evaluation starts and how often it repeats.

use crate::{config::ConfigErr, Result};

/// Epochs between evaluations per dataset pass, before scaling.
const EVALUATE_EVERY_PASSES: usize = 20;
/// Dataset passes before the first evaluation, before scaling.
const START_EVAL_PASSES: usize = 1000;

/// How much data one epoch consumes across the whole group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochSizing {
    pub world_size: usize,
    pub steps_per_epoch: usize,
    pub batch_size: usize,
}

impl EpochSizing {
    pub fn samples_per_epoch(&self) -> usize {
        self.world_size
            .saturating_mul(self.steps_per_epoch)
            .saturating_mul(self.batch_size)
    }
}

/// The resolved evaluation schedule, in epochs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalCadence {
    pub evaluate_every: usize,
    pub start_eval_at: usize,
}

impl EvalCadence {
    /// Resolves the evaluation schedule.
    ///
    /// Explicit values always win, zero included. Missing ones are scaled to
    /// the amount of samples an epoch consumes.
    ///
    /// # Arguments
    /// * `dataset_size` - The reference dataset size the defaults scale from.
    /// * `sizing` - The measured epoch size.
    /// * `evaluate_every` - The configured interval, if any.
    /// * `start_eval_at` - The configured first evaluation epoch, if any.
    ///
    /// # Returns
    /// The schedule, or a configuration error if a default is needed but an
    /// epoch holds no samples or the dataset is too large to scale.
    pub fn resolve(
        dataset_size: usize,
        sizing: EpochSizing,
        evaluate_every: Option<usize>,
        start_eval_at: Option<usize>,
    ) -> Result<Self> {
        let samples = sizing.samples_per_epoch();
        let scaled = |passes: usize| -> Result<usize> {
            if samples == 0 {
                return Err(ConfigErr::Invalid {
                    field: "evaluate_every",
                    reason: "an epoch holds no samples, set the evaluation cadence explicitly"
                        .into(),
                }
                .into());
            }
            passes
                .checked_mul(dataset_size)
                .map(|total| total.div_ceil(samples))
                .ok_or_else(|| {
                    ConfigErr::Invalid {
                        field: "dataset_size",
                        reason: "too large to derive an evaluation cadence from".into(),
                    }
                    .into()
                })
        };

        let evaluate_every = match evaluate_every {
            Some(every) => every,
            None => scaled(EVALUATE_EVERY_PASSES)?,
        };

        let start_eval_at = match start_eval_at {
            Some(start) => start,
            None => scaled(START_EVAL_PASSES)?,
        };

        Ok(Self {
            evaluate_every,
            start_eval_at,
        })
    }
}
