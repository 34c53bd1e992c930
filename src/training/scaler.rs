use log::debug;

use super::Optimizer;

const INIT_SCALE: f64 = 65536.0;
const GROWTH_FACTOR: f64 = 2.0;
const BACKOFF_FACTOR: f64 = 0.5;
const GROWTH_INTERVAL: usize = 2000;

/// Dynamic loss scaling for reduced precision training.
///
/// The loss is multiplied by the scale before backward. Before stepping, the
/// gradients are divided back; a non-finite gradient skips the step and
/// halves the scale, and every `GROWTH_INTERVAL` clean steps double it.
#[derive(Debug, Clone)]
pub struct LossScaler {
    scale: f64,
    clean_steps: usize,
}

impl Default for LossScaler {
    fn default() -> Self {
        Self {
            scale: INIT_SCALE,
            clean_steps: 0,
        }
    }
}

impl LossScaler {
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Unscales the gradients and steps if they are finite.
    ///
    /// # Returns
    /// Whether the optimizer stepped.
    pub fn step<O: Optimizer + ?Sized>(&mut self, optimizer: &mut O) -> bool {
        let finite = optimizer.unscale_grads(self.scale);
        if finite {
            optimizer.step();
        }

        self.update(finite);
        finite
    }

    fn update(&mut self, finite: bool) {
        if !finite {
            self.scale *= BACKOFF_FACTOR;
            self.clean_steps = 0;
            debug!(scale = self.scale; "gradient overflow, step skipped");
            return;
        }

        self.clean_steps += 1;
        if self.clean_steps == GROWTH_INTERVAL {
            self.scale *= GROWTH_FACTOR;
            self.clean_steps = 0;
        }
    }
}
