use std::{
    cell::RefCell,
    fs::File,
    io::{self, BufWriter},
    path::Path,
    rc::Rc,
};

use comms::Collective;
use log::debug;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;
use serde::Serialize;

use crate::{
    seeds::SeedSink,
    training::{Checkpoint, Differentiable, LossFn, Model},
    OrchestraErr, Result,
};

const INIT_STD: f64 = 0.01;

/// A flat parameter buffer and the gradients accumulated for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    pub values: Vec<f64>,
    pub grads: Vec<f64>,
}

impl Parameters {
    pub fn zeros(len: usize) -> Self {
        Self {
            values: vec![0.0; len],
            grads: vec![0.0; len],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Shared between the model, its losses and its optimizer.
pub type ParamHandle = Rc<RefCell<Parameters>>;

/// Segments every voxel independently with its own logistic unit.
///
/// The buffer holds the weights of every voxel followed by their biases.
pub struct VoxelClassifier {
    params: ParamHandle,
    voxels: usize,
    training: bool,
    mixed_precision: bool,
}

impl VoxelClassifier {
    /// Creates a new `VoxelClassifier`.
    ///
    /// # Arguments
    /// * `voxels` - The amount of voxels of every volume.
    /// * `seed` - Drives the weight initialization.
    pub fn new(voxels: usize, seed: u64) -> Self {
        let mut model = Self {
            params: Rc::new(RefCell::new(Parameters::zeros(2 * voxels))),
            voxels,
            training: true,
            mixed_precision: false,
        };

        model.reseed(seed);
        model
    }

    pub fn params(&self) -> ParamHandle {
        Rc::clone(&self.params)
    }

    pub fn voxels(&self) -> usize {
        self.voxels
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Overwrites the parameters of every rank with rank 0's.
    pub fn sync_from_root(&mut self, comm: &mut dyn Collective) -> Result<()> {
        let mut params = self.params.borrow_mut();
        let bytes = bytemuck::cast_slice(&params.values).to_vec();
        let bytes = comm.broadcast_bytes(bytes, 0)?;

        let values: Vec<f64> = bytemuck::pod_collect_to_vec(&bytes);
        if values.len() != params.len() {
            return Err(OrchestraErr::Topology(format!(
                "rank 0 holds {} parameters, this rank {}",
                values.len(),
                params.len()
            )));
        }
        params.values = values;

        debug!(params = params.len(); "parameters synced from rank 0");
        Ok(())
    }

    fn weights_and_biases(&self) -> (Array1<f64>, Array1<f64>) {
        let params = self.params.borrow();
        let (w, b) = params.values.split_at(self.voxels);
        (Array1::from_vec(w.to_vec()), Array1::from_vec(b.to_vec()))
    }
}

impl SeedSink for VoxelClassifier {
    fn reseed(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);

        let mut params = self.params.borrow_mut();
        let (weights, biases) = params.values.split_at_mut(self.voxels);
        weights
            .iter_mut()
            .for_each(|w| *w = INIT_STD * rng.sample::<f64, _>(StandardNormal));
        biases.fill(0.0);
        params.grads.fill(0.0);
    }
}

/// The per-voxel foreground probabilities of a batch.
pub struct Prediction {
    pub probs: Array2<f64>,
    inputs: Array2<f64>,
    params: ParamHandle,
}

impl Model for VoxelClassifier {
    type Input = Array2<f64>;
    type Output = Prediction;

    fn forward(&mut self, input: &Array2<f64>) -> Prediction {
        let (w, b) = self.weights_and_biases();
        let logits = input * &w + &b;

        let mut probs = logits.mapv(sigmoid);
        if self.mixed_precision {
            probs.mapv_inplace(|p| p as f32 as f64);
        }

        Prediction {
            probs,
            inputs: input.clone(),
            params: Rc::clone(&self.params),
        }
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn set_mixed_precision(&mut self, enabled: bool) {
        self.mixed_precision = enabled;
    }

    fn reduce_gradients(&mut self, comm: &mut dyn Collective) -> Result<()> {
        let mut params = self.params.borrow_mut();
        comm.all_reduce_mean(&mut params.grads)?;
        Ok(())
    }
}

#[derive(Serialize)]
struct SavedModel<'a> {
    voxels: usize,
    values: &'a [f64],
}

impl Checkpoint for VoxelClassifier {
    fn save(&self, path: &Path) -> io::Result<()> {
        let params = self.params.borrow();
        let saved = SavedModel {
            voxels: self.voxels,
            values: &params.values,
        };

        let out = BufWriter::new(File::create(path)?);
        serde_json::to_writer(out, &saved)?;
        Ok(())
    }
}

#[inline]
fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

const EPS: f64 = 1e-7;

/// Binary cross entropy averaged over every voxel of the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BceLoss;

/// A batch loss that remembers how to reach the parameters.
pub struct BceValue {
    value: f64,
    /// d(loss)/d(logits), already averaged.
    grad_logits: Array2<f64>,
    inputs: Array2<f64>,
    params: ParamHandle,
    scale: f64,
}

impl LossFn<Prediction, Array2<f64>> for BceLoss {
    type Loss = BceValue;

    fn loss(&self, output: &Prediction, target: &Array2<f64>) -> BceValue {
        let n = output.probs.len().max(1) as f64;

        let value = output
            .probs
            .iter()
            .zip(target.iter())
            .map(|(&p, &y)| {
                let p = p.clamp(EPS, 1.0 - EPS);
                -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
            })
            .sum::<f64>()
            / n;

        BceValue {
            value,
            grad_logits: (&output.probs - target) / n,
            inputs: output.inputs.clone(),
            params: Rc::clone(&output.params),
            scale: 1.0,
        }
    }
}

impl Differentiable for BceValue {
    fn value(&self) -> f64 {
        self.value * self.scale
    }

    fn scaled(mut self, factor: f64) -> Self {
        self.scale *= factor;
        self
    }

    fn backward(self) {
        let grad = self.grad_logits * self.scale;
        let grad_w = (&grad * &self.inputs).sum_axis(Axis(0));
        let grad_b = grad.sum_axis(Axis(0));

        let mut params = self.params.borrow_mut();
        let voxels = grad_w.len();
        let (gw, gb) = params.grads.split_at_mut(voxels);

        gw.iter_mut().zip(grad_w.iter()).for_each(|(g, d)| *g += d);
        gb.iter_mut().zip(grad_b.iter()).for_each(|(g, d)| *g += d);
    }
}

/// The dice coefficient of one thresholded prediction against its mask.
///
/// An empty prediction of an empty mask scores 1.
pub fn dice_score(probs: ArrayView1<'_, f64>, labels: ArrayView1<'_, f64>) -> f64 {
    const SMOOTH: f64 = 1e-6;

    let (mut intersection, mut predicted, mut actual) = (0.0, 0.0, 0.0);
    for (&p, &y) in probs.iter().zip(labels.iter()) {
        let p = if p > 0.5 { 1.0 } else { 0.0 };
        intersection += p * y;
        predicted += p;
        actual += y;
    }

    (2.0 * intersection + SMOOTH) / (predicted + actual + SMOOTH)
}
