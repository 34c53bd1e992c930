/// Scores below this mean the model diverged.
pub const DIVERGENCE_THRESHOLD: f64 = 1e-6;

/// How a run ended, or that it's still going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Running,
    /// The primary metric reached the quality threshold.
    Success,
    /// The primary metric collapsed below `DIVERGENCE_THRESHOLD`.
    Diverged,
    /// The epochs ran out while the step cap was truncating them.
    StepLimitReached,
    /// The epochs ran out.
    EpochLimitReached,
}

impl Outcome {
    pub fn is_terminal(self) -> bool {
        self != Outcome::Running
    }
}

/// The loop's mutable state, owned by the engine.
#[derive(Debug, Clone)]
pub struct TrainingState {
    /// 1-indexed, 0 before the first epoch.
    pub epoch: usize,
    /// Steps run in the current epoch.
    pub global_step: usize,
    pub next_eval_epoch: usize,
    /// The reduced loss of every step of the current epoch.
    pub cumulative_loss: Vec<f64>,
    pub outcome: Outcome,
    /// Optimizer steps applied since the start of the run.
    pub optimizer_steps: usize,
}

impl TrainingState {
    pub fn new(start_eval_at: usize) -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            next_eval_epoch: start_eval_at,
            cumulative_loss: Vec::new(),
            outcome: Outcome::Running,
            optimizer_steps: 0,
        }
    }

    pub fn begin_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.global_step = 0;
        self.cumulative_loss.clear();
    }

    pub fn is_eval_epoch(&self) -> bool {
        self.epoch == self.next_eval_epoch
    }

    pub fn schedule_next_eval(&mut self, evaluate_every: usize) {
        self.next_eval_epoch += evaluate_every;
    }

    /// The mean reduced loss of the epoch, 0 when nothing was recorded.
    pub fn mean_loss(&self) -> f64 {
        match self.cumulative_loss.len() {
            0 => 0.0,
            n => self.cumulative_loss.iter().sum::<f64>() / n as f64,
        }
    }

    /// Decides the outcome from an evaluation score.
    ///
    /// Success is checked first, then divergence. A score between the two
    /// thresholds keeps the run going.
    pub fn judge(&mut self, score: f64, quality_threshold: f64) -> Outcome {
        if self.outcome.is_terminal() {
            return self.outcome;
        }

        if score >= quality_threshold {
            self.outcome = Outcome::Success;
        } else if score < DIVERGENCE_THRESHOLD {
            self.outcome = Outcome::Diverged;
        }

        self.outcome
    }

    /// Settles the outcome of a run whose epochs ran out.
    ///
    /// # Arguments
    /// * `truncated` - Whether the step cap cut the last epoch short.
    pub fn finish(&mut self, truncated: bool) -> Outcome {
        if !self.outcome.is_terminal() {
            self.outcome = if truncated {
                Outcome::StepLimitReached
            } else {
                Outcome::EpochLimitReached
            };
        }

        self.outcome
    }
}
