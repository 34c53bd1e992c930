//! The training loop and the interfaces it drives.

mod collaborators;
mod engine;
mod events;
mod optim;
mod scaler;
mod schedule;
mod state;

use std::collections::BTreeMap;

pub use collaborators::{
    DataLoader, Device, Differentiable, EvalRequest, Evaluator, KernelFlags, LossFn, Model,
    Optimizer, ToDevice,
};
pub use engine::{FitReport, SKIPPED_REDUCE_TRAIN_LOSS, Trainer};
pub use events::{
    Checkpoint, CheckpointListener, Listener, Listeners, METRICS_LOG_NAME, MetricsLogger,
    TrainingEvent,
};
pub use optim::{MultiStepDecay, warmup_lr};
pub use scaler::LossScaler;
pub use schedule::AccumulationSchedule;
pub use state::{DIVERGENCE_THRESHOLD, Outcome, TrainingState};

/// Named scalar results, ordered by name.
pub type Metrics = BTreeMap<String, f64>;

/// The metric the quality and divergence thresholds apply to.
pub const PRIMARY_METRIC: &str = "mean_dice";

/// The mean reduced training loss, attached to every evaluation.
pub const TRAIN_LOSS_METRIC: &str = "train_loss";
