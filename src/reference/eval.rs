use comms::Collective;
use log::debug;

use super::{
    data::VolumeLoader,
    model::{BceLoss, VoxelClassifier, dice_score},
};
use crate::{
    training::{
        DataLoader, Differentiable, EvalRequest, Evaluator, LossFn, Metrics, Model, ToDevice,
        PRIMARY_METRIC,
    },
    Result,
};

/// Name of the mean validation loss metric.
pub const EVAL_LOSS_METRIC: &str = "eval_loss";

/// Scores a [`VoxelClassifier`] on every rank's share of the validation set
/// and averages the result over the whole group.
pub struct DiceEvaluator {
    loader: VolumeLoader,
    loss_fn: BceLoss,
}

impl DiceEvaluator {
    pub fn new(loader: VolumeLoader) -> Self {
        Self {
            loader,
            loss_fn: BceLoss,
        }
    }
}

impl Evaluator<VoxelClassifier> for DiceEvaluator {
    fn evaluate(
        &mut self,
        request: EvalRequest<'_>,
        model: &mut VoxelClassifier,
    ) -> Result<Metrics> {
        model.set_training(false);

        // dice sum, loss sum, volumes
        let mut totals = [0.0; 3];
        for (image, label) in self.loader.batches() {
            let image = image.to_device(request.device);
            let label = label.to_device(request.device);
            let volumes = image.nrows() as f64;

            let output = model.forward(&image);
            totals[1] += self.loss_fn.loss(&output, &label).value() * volumes;
            totals[0] += output
                .probs
                .rows()
                .into_iter()
                .zip(label.rows())
                .map(|(p, y)| dice_score(p, y))
                .sum::<f64>();
            totals[2] += volumes;
        }

        request.comm.all_reduce_sum(&mut totals)?;
        let [dice, loss, volumes] = totals;
        let mean = |sum: f64| if volumes > 0.0 { sum / volumes } else { 0.0 };

        debug!(volumes = volumes; "evaluation of epoch {:?} done", request.epoch);
        Ok(Metrics::from([
            (PRIMARY_METRIC.to_string(), mean(dice)),
            (EVAL_LOSS_METRIC.to_string(), mean(loss)),
        ]))
    }
}
