//! Learning rate schedules.

use super::Optimizer;

/// The learning rate of a warmup epoch.
///
/// Ramps linearly from `init_lr` to `target_lr`, reaching it at
/// `warmup_epochs`.
///
/// # Returns
/// The rate for `epoch`, `None` outside of the warmup or when there is none.
pub fn warmup_lr(init_lr: f64, target_lr: f64, epoch: usize, warmup_epochs: usize) -> Option<f64> {
    if warmup_epochs == 0 || epoch > warmup_epochs {
        return None;
    }

    let scale = epoch as f64 / warmup_epochs as f64;
    Some(init_lr + (target_lr - init_lr) * scale)
}

/// Multiplies the learning rate by `factor` at every milestone epoch.
#[derive(Debug, Clone)]
pub struct MultiStepDecay {
    milestones: Vec<usize>,
    factor: f64,
    epoch: usize,
}

impl MultiStepDecay {
    /// # Returns
    /// The decay, or `None` when there are no milestones.
    pub fn new(milestones: &[usize], factor: f64) -> Option<Self> {
        if milestones.is_empty() {
            return None;
        }

        Some(Self {
            milestones: milestones.to_vec(),
            factor,
            epoch: 0,
        })
    }

    /// Closes an epoch, decaying the rate if a milestone was reached.
    pub fn step<O: Optimizer + ?Sized>(&mut self, optimizer: &mut O) {
        self.epoch += 1;

        let hits = self.milestones.iter().filter(|&&m| m == self.epoch).count();
        if hits > 0 {
            let lr = optimizer.learning_rate() * self.factor.powi(hits as i32);
            optimizer.set_learning_rate(lr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(f64);

    impl Optimizer for Fixed {
        fn step(&mut self) {}
        fn zero_grad(&mut self) {}
        fn learning_rate(&self) -> f64 {
            self.0
        }
        fn set_learning_rate(&mut self, lr: f64) {
            self.0 = lr;
        }
        fn unscale_grads(&mut self, _factor: f64) -> bool {
            true
        }
    }

    #[test]
    fn warmup_reaches_the_target() {
        assert_eq!(warmup_lr(0.0, 1.0, 1, 4), Some(0.25));
        assert_eq!(warmup_lr(0.0, 1.0, 4, 4), Some(1.0));
        assert_eq!(warmup_lr(0.0, 1.0, 5, 4), None);
        assert_eq!(warmup_lr(0.0, 1.0, 1, 0), None);
    }

    #[test]
    fn decay_applies_at_milestones() {
        let mut opt = Fixed(1.0);
        let mut decay = MultiStepDecay::new(&[2, 4, 4], 0.5).unwrap();

        let mut seen = Vec::new();
        for _ in 0..5 {
            decay.step(&mut opt);
            seen.push(opt.0);
        }

        assert_eq!(seen, [1.0, 0.5, 0.5, 0.125, 0.125]);
        assert!(MultiStepDecay::new(&[], 0.5).is_none());
    }
}
