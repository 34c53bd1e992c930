use std::num::NonZeroUsize;

/// Defines when accumulated gradients are applied.
#[derive(Debug, Clone, Copy)]
pub struct AccumulationSchedule {
    ga_steps: NonZeroUsize,
}

impl AccumulationSchedule {
    pub fn new(ga_steps: NonZeroUsize) -> Self {
        Self { ga_steps }
    }

    /// The factor each step's loss is multiplied by before backward.
    #[inline]
    pub fn loss_scale(&self) -> f64 {
        1.0 / self.ga_steps.get() as f64
    }

    /// Returns true if this step closes an accumulation window.
    #[inline]
    pub fn should_step(&self, iteration: usize) -> bool {
        (iteration + 1) % self.ga_steps.get() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulation_schedule() {
        let s = AccumulationSchedule::new(NonZeroUsize::new(3).unwrap());
        assert!(!s.should_step(0));
        assert!(!s.should_step(1));
        assert!(s.should_step(2));
        assert!(!s.should_step(3));
        assert!(!s.should_step(4));
        assert!(s.should_step(5));
        assert!((s.loss_scale() - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn single_step_windows() {
        let s = AccumulationSchedule::new(NonZeroUsize::MIN);
        assert!((0..5).all(|i| s.should_step(i)));
        assert_eq!(s.loss_scale(), 1.0);
    }
}
