//! Distributed training driver for 3D segmentation models.
//!
//! A run forms a process group through [`comms`], agrees on an endpoint and on
//! the seeds, and then drives the training loop of [`training::Trainer`] on
//! every rank, evaluating on a resolved cadence until the quality threshold is
//! reached, the model diverges or the epochs run out.

pub mod cadence;
pub mod config;
mod error;
pub mod logging;
pub mod progress;
pub mod reference;
pub mod runner;
pub mod seeds;
pub mod topology;
pub mod training;

pub use config::{ConfigErr, ExecMode, OptimizerKind, TrainingConfig};
pub use error::{OrchestraErr, Result};
pub use runner::{RunSummary, run};
