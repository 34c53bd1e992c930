//! Small CPU collaborators for the training loop: synthetic volumes, a
//! per-voxel segmentation model and its optimizers.
//!
//! They stand in for a real UNet3D so the driver can be run and tested end to
//! end without an accelerator.

mod data;
mod eval;
mod model;
mod optim;

pub use data::{DistributedSampler, VolumeDataset, VolumeLoader, shard_range};
pub use eval::{DiceEvaluator, EVAL_LOSS_METRIC};
pub use model::{
    BceLoss, BceValue, ParamHandle, Parameters, Prediction, VoxelClassifier, dice_score,
};
pub use optim::{Adam, Lamb, ParamOptimizer, Sgd, UpdateRule, build_optimizer};
