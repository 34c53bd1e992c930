use std::{
    num::NonZeroUsize,
    thread,
    time::{Duration, Instant},
};

use comms::Collective;
use log::debug;

use super::{
    AccumulationSchedule, DataLoader, Device, Differentiable, EvalRequest, Evaluator,
    KernelFlags, Listeners, LossFn, LossScaler, Metrics, Model, MultiStepDecay, Optimizer,
    Outcome, PRIMARY_METRIC, TRAIN_LOSS_METRIC, ToDevice, TrainingEvent, TrainingState,
    warmup_lr,
};
use crate::{
    cadence::EvalCadence, config::ConfigErr, info0, progress::ProgressTracker, OrchestraErr,
    Result, TrainingConfig,
};

/// The training loss reported when the per-step reduction is skipped.
pub const SKIPPED_REDUCE_TRAIN_LOSS: f64 = 0.15;

/// What a finished fit reports.
#[derive(Debug, Clone)]
pub struct FitReport {
    pub outcome: Outcome,
    pub epochs_run: usize,
    pub optimizer_steps: usize,
    /// The metrics of the last evaluation, if there was one.
    pub last_metrics: Option<Metrics>,
    pub elapsed: Duration,
}

/// Drives epochs, steps and evaluations on one rank.
///
/// Every rank of the group runs its own `Trainer` over the same
/// configuration, and they issue their collectives in the same order.
pub struct Trainer<'a> {
    config: &'a TrainingConfig,
    comm: &'a mut dyn Collective,
    device: Device,
    cadence: EvalCadence,
    progress: Option<ProgressTracker>,
}

impl<'a> Trainer<'a> {
    /// Creates a new `Trainer`.
    ///
    /// # Arguments
    /// * `config` - The validated run configuration.
    /// * `comm` - The process group, used for the loss reduction and to agree
    ///   on evaluation scores.
    /// * `device` - Where this rank computes.
    /// * `cadence` - The resolved evaluation schedule.
    pub fn new(
        config: &'a TrainingConfig,
        comm: &'a mut dyn Collective,
        device: Device,
        cadence: EvalCadence,
    ) -> Self {
        Self {
            config,
            comm,
            device,
            cadence,
            progress: None,
        }
    }

    /// Reports progress through `tracker`, meant for the leader only.
    pub fn with_progress(mut self, tracker: ProgressTracker) -> Self {
        self.progress = Some(tracker);
        self
    }

    /// Trains until the quality threshold is met, the model diverges or the
    /// epochs run out.
    ///
    /// # Returns
    /// The report of the run. Divergence is an outcome, not an error; errors
    /// are fatal for the whole group.
    pub fn fit<M, L, O, D, E>(
        &mut self,
        model: &mut M,
        loss_fn: &L,
        optimizer: &mut O,
        loader: &mut D,
        evaluator: &mut E,
        listeners: &mut Listeners<M, O>,
    ) -> Result<FitReport>
    where
        M: Model<Input = D::Image>,
        L: LossFn<M::Output, D::Label>,
        O: Optimizer,
        D: DataLoader,
        E: Evaluator<M>,
    {
        let config = self.config;
        let ga_steps = NonZeroUsize::new(config.ga_steps).ok_or(ConfigErr::Invalid {
            field: "ga_steps",
            reason: "must be greater than zero".into(),
        })?;

        let schedule = AccumulationSchedule::new(ga_steps);
        let mut decay = MultiStepDecay::new(&config.lr_decay_epochs, config.lr_decay_factor);
        let mut scaler = config.amp.then(LossScaler::default);
        let sleep = config.synthetic_sleep();
        let distributed = self.comm.size() > 1;
        let started = Instant::now();

        let mut state = TrainingState::new(self.cadence.start_eval_at);
        let mut last_metrics = None;
        let mut truncated = false;

        model.configure_kernels(KernelFlags {
            benchmark: config.cudnn_benchmark,
            deterministic: config.cudnn_deterministic,
        });
        model.set_mixed_precision(config.amp);
        model.set_training(true);

        listeners.dispatch(&TrainingEvent::FitStart)?;
        if let Some(progress) = self.progress.as_mut() {
            progress.start_training(config.epochs);
        }

        for epoch in 1..=config.epochs {
            state.begin_epoch(epoch);

            if let Some(lr) = warmup_lr(
                config.init_learning_rate,
                config.learning_rate,
                epoch,
                config.lr_warmup_epochs,
            ) {
                optimizer.set_learning_rate(lr);
            }

            if distributed {
                loader.set_epoch(epoch);
            }

            let steps = match config.max_training_step {
                Some(cap) => cap.min(loader.len()),
                None => loader.len(),
            };
            if let Some(progress) = self.progress.as_mut() {
                progress.start_epoch(epoch - 1, steps);
            }

            optimizer.zero_grad();
            truncated = false;

            for (iteration, (image, label)) in loader.batches().enumerate() {
                if config.max_training_step.is_some_and(|cap| iteration >= cap) {
                    truncated = true;
                    break;
                }

                state.global_step = iteration + 1;
                let image = image.to_device(&self.device);
                let label = label.to_device(&self.device);

                listeners.dispatch(&TrainingEvent::BatchStart)?;

                if let Some(duration) = sleep {
                    thread::sleep(duration);
                    self.report_step(iteration, None);
                    continue;
                }

                let output = model.forward(&image);
                let loss = loss_fn.loss(&output, &label).scaled(schedule.loss_scale());
                let mut loss_value = loss.value();

                match scaler.as_ref() {
                    Some(scaler) => loss.scaled(scaler.scale()).backward(),
                    None => loss.backward(),
                }

                if schedule.should_step(iteration) {
                    if distributed {
                        model.reduce_gradients(&mut *self.comm)?;
                    }

                    let stepped = match scaler.as_mut() {
                        Some(scaler) => scaler.step(optimizer),
                        None => {
                            optimizer.step();
                            true
                        }
                    };

                    if stepped {
                        state.optimizer_steps += 1;
                    }
                    optimizer.zero_grad();
                }

                if config.skip_reduce {
                    loss_value = 0.0;
                } else {
                    let mut reduced = [loss_value];
                    self.comm.all_reduce_mean(&mut reduced)?;
                    loss_value = reduced[0];
                    state.cumulative_loss.push(loss_value);
                }

                self.report_step(iteration, Some(loss_value));
            }

            if let Some(decay) = decay.as_mut() {
                decay.step(optimizer);
            }

            debug!(
                epoch = epoch,
                steps = state.global_step,
                lr = optimizer.learning_rate();
                "epoch trained"
            );

            let mut epoch_metrics = None;
            if state.is_eval_epoch() {
                state.schedule_next_eval(self.cadence.evaluate_every);

                let request = EvalRequest {
                    epoch: Some(epoch),
                    comm: &mut *self.comm,
                    device: &self.device,
                };
                let mut metrics = evaluator.evaluate(request, model)?;

                let train_loss = if config.skip_reduce {
                    SKIPPED_REDUCE_TRAIN_LOSS
                } else {
                    state.mean_loss()
                };
                metrics.insert(TRAIN_LOSS_METRIC.to_string(), train_loss);

                let local = metrics.get(PRIMARY_METRIC).copied();
                let score = agree_on_score(&mut *self.comm, local)?
                    .ok_or(OrchestraErr::MissingMetric(PRIMARY_METRIC))?;
                metrics.insert(PRIMARY_METRIC.to_string(), score);

                listeners.dispatch(&TrainingEvent::EpochEnd {
                    epoch,
                    metrics: &metrics,
                    model: &*model,
                    optimizer: &*optimizer,
                })?;
                model.set_training(true);

                info0!(epoch = epoch; "eval {}", format_metrics(&metrics));
                match state.judge(score, config.quality_threshold) {
                    Outcome::Success => info0!(epoch = epoch; "quality threshold reached"),
                    Outcome::Diverged => info0!(epoch = epoch; "MODEL DIVERGED. ABORTING."),
                    _ => {}
                }

                epoch_metrics = Some(metrics);
            }

            if let Some(progress) = self.progress.as_mut() {
                progress.end_epoch(epoch_metrics.as_ref());
            }

            if epoch_metrics.is_some() {
                last_metrics = epoch_metrics;
            }

            if state.outcome.is_terminal() {
                break;
            }
        }

        let outcome = state.finish(truncated);
        listeners.dispatch(&TrainingEvent::FitEnd)?;
        if let Some(progress) = self.progress.as_mut() {
            progress.end_training();
        }

        Ok(FitReport {
            outcome,
            epochs_run: state.epoch,
            optimizer_steps: state.optimizer_steps,
            last_metrics,
            elapsed: started.elapsed(),
        })
    }

    fn report_step(&mut self, iteration: usize, loss: Option<f64>) {
        if let Some(progress) = self.progress.as_mut() {
            let metrics = loss.map(|loss| Metrics::from([("loss".to_string(), loss)]));
            progress.update_step(iteration, metrics.as_ref());
        }
    }
}

/// Hands rank 0's score to every rank so they all take the same decision.
///
/// The score travels as raw bits, a non-finite score survives the trip.
fn agree_on_score(comm: &mut dyn Collective, local: Option<f64>) -> Result<Option<f64>> {
    let bits = local.map(|s| s.to_be_bytes().to_vec()).unwrap_or_default();
    let bits = comm.broadcast_bytes(bits, 0)?;

    Ok(<[u8; 8]>::try_from(bits.as_slice())
        .ok()
        .map(f64::from_be_bytes))
}

fn format_metrics(metrics: &Metrics) -> String {
    metrics
        .iter()
        .map(|(name, value)| format!("{name}={value:.6}"))
        .collect::<Vec<_>>()
        .join(" ")
}
