//! The seams between the training loop and the numeric code it drives.

use comms::Collective;

use super::Metrics;
use crate::Result;

/// Backend switches forwarded to the model before training.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelFlags {
    /// Let the backend benchmark and pick the fastest kernels.
    pub benchmark: bool,
    /// Restrict the backend to deterministic kernels.
    pub deterministic: bool,
}

/// Where a rank computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Accelerator(usize),
}

impl Device {
    /// The device a rank uses: one accelerator per local rank when there are
    /// `accelerators`, the CPU otherwise.
    pub fn for_local_rank(local_rank: usize, accelerators: usize) -> Self {
        match accelerators {
            0 => Self::Cpu,
            n => Self::Accelerator(local_rank % n),
        }
    }
}

/// Moves a batch part onto a device.
pub trait ToDevice: Sized {
    fn to_device(self, device: &Device) -> Self;
}

pub trait Model {
    type Input;
    type Output;

    fn forward(&mut self, input: &Self::Input) -> Self::Output;

    /// Switches between training and evaluation behaviour.
    fn set_training(&mut self, training: bool);

    fn configure_kernels(&mut self, _flags: KernelFlags) {}

    fn set_mixed_precision(&mut self, _enabled: bool) {}

    /// Averages the accumulated gradients across the group.
    ///
    /// Called before every optimizer step of a distributed run. Models that
    /// keep their replicas in sync some other way can leave it as is.
    fn reduce_gradients(&mut self, _comm: &mut dyn Collective) -> Result<()> {
        Ok(())
    }
}

/// A scalar loss that can propagate its gradient back into the model.
pub trait Differentiable: Sized {
    fn value(&self) -> f64;

    /// The same loss multiplied by `factor`, gradients included.
    fn scaled(self, factor: f64) -> Self;

    /// Accumulates the gradient of this loss into the model.
    fn backward(self);
}

pub trait LossFn<O, T> {
    type Loss: Differentiable;

    fn loss(&self, output: &O, target: &T) -> Self::Loss;
}

pub trait Optimizer {
    /// Applies the accumulated gradients.
    fn step(&mut self);

    fn zero_grad(&mut self);

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Divides every gradient by `factor`.
    ///
    /// # Returns
    /// Whether every gradient is still finite.
    fn unscale_grads(&mut self, factor: f64) -> bool;
}

/// The training data of a rank.
pub trait DataLoader {
    type Image: ToDevice;
    type Label: ToDevice;

    /// The amount of batches an epoch yields.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reshuffles for `epoch`, every rank must call it with the same epoch.
    fn set_epoch(&mut self, epoch: usize);

    fn batches(&mut self) -> Box<dyn Iterator<Item = (Self::Image, Self::Label)> + '_>;
}

/// Everything an evaluation pass may need besides the model.
pub struct EvalRequest<'a> {
    /// The epoch evaluated, `None` outside of training.
    pub epoch: Option<usize>,
    pub comm: &'a mut dyn Collective,
    pub device: &'a Device,
}

pub trait Evaluator<M> {
    /// Scores `model`, the returned metrics must include `mean_dice`.
    fn evaluate(&mut self, request: EvalRequest<'_>, model: &mut M) -> Result<Metrics>;
}
