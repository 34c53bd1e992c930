use std::fmt;

use log::debug;

use super::model::ParamHandle;
use crate::{config::OptimizerKind, training::Optimizer, TrainingConfig};

/// Defines the strategy for updating parameters based on accumulated gradients.
pub trait UpdateRule: fmt::Debug {
    /// Updates `params` in place using `grad`.
    ///
    /// # Arguments
    /// * `grad` - The accumulated gradient, as long as `params`.
    /// * `params` - The parameters to update.
    fn update_params(&mut self, grad: &[f64], params: &mut [f64]);

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);
}

#[derive(Debug)]
pub struct Sgd {
    learning_rate: f64,
    momentum: f64,
    weight_decay: f64,
    nesterov: bool,
    velocity: Box<[f64]>,
}

impl Sgd {
    /// Creates a new `Sgd` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum`, `weight_decay`, `nesterov` - Hyperparameters to the optimization algorithm.
    ///
    /// # Returns
    /// A new `Sgd` instance.
    pub fn new(
        len: usize,
        learning_rate: f64,
        momentum: f64,
        weight_decay: f64,
        nesterov: bool,
    ) -> Self {
        Self {
            learning_rate,
            momentum,
            weight_decay,
            nesterov,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl UpdateRule for Sgd {
    fn update_params(&mut self, grad: &[f64], params: &mut [f64]) {
        let Self {
            learning_rate: lr,
            momentum: mu,
            weight_decay: wd,
            nesterov,
            ..
        } = *self;

        params
            .iter_mut()
            .zip(grad)
            .zip(self.velocity.iter_mut())
            .for_each(|((p, g), v)| {
                let g = g + wd * *p;
                *v = mu * *v + g;
                let d = if nesterov { g + mu * *v } else { *v };
                *p -= lr * d;
            });
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }
}

#[derive(Debug)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    beta1_t: f64,
    beta2_t: f64,
    weight_decay: f64,
    v: Box<[f64]>,
    s: Box<[f64]>,
    epsilon: f64,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `betas`, `weight_decay`, `epsilon` - Hyperparameters to the optimization algorithm.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(
        len: usize,
        learning_rate: f64,
        [beta1, beta2]: [f64; 2],
        weight_decay: f64,
        epsilon: f64,
    ) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            beta1_t: 1.,
            beta2_t: 1.,
            weight_decay,
            v: vec![0.; len].into_boxed_slice(),
            s: vec![0.; len].into_boxed_slice(),
            epsilon,
        }
    }
}

impl UpdateRule for Adam {
    fn update_params(&mut self, grad: &[f64], params: &mut [f64]) {
        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            weight_decay: wd,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;
        let step_size = lr * (bc2.sqrt() / bc1);

        params
            .iter_mut()
            .zip(grad)
            .zip(self.v.iter_mut())
            .zip(self.s.iter_mut())
            .for_each(|(((p, g), v), s)| {
                let g = g + wd * *p;
                *v = b1 * *v + (1. - b1) * g;
                *s = b2 * *s + (1. - b2) * g.powi(2);
                *p -= step_size * *v / (s.sqrt() + eps);
            });
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }
}

/// Adam moments with decoupled weight decay, rescaled layer-wise by the ratio
/// between the parameter norm and the update norm.
#[derive(Debug)]
pub struct Lamb {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    beta1_t: f64,
    beta2_t: f64,
    weight_decay: f64,
    v: Box<[f64]>,
    s: Box<[f64]>,
    update: Box<[f64]>,
    epsilon: f64,
}

impl Lamb {
    /// Creates a new `Lamb` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `betas`, `weight_decay`, `epsilon` - Hyperparameters to the optimization algorithm.
    ///
    /// # Returns
    /// A new `Lamb` instance.
    pub fn new(
        len: usize,
        learning_rate: f64,
        [beta1, beta2]: [f64; 2],
        weight_decay: f64,
        epsilon: f64,
    ) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            beta1_t: 1.,
            beta2_t: 1.,
            weight_decay,
            v: vec![0.; len].into_boxed_slice(),
            s: vec![0.; len].into_boxed_slice(),
            update: vec![0.; len].into_boxed_slice(),
            epsilon,
        }
    }
}

impl UpdateRule for Lamb {
    fn update_params(&mut self, grad: &[f64], params: &mut [f64]) {
        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            weight_decay: wd,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;

        params
            .iter()
            .zip(grad)
            .zip(self.v.iter_mut())
            .zip(self.s.iter_mut())
            .zip(self.update.iter_mut())
            .for_each(|((((p, g), v), s), u)| {
                *v = b1 * *v + (1. - b1) * g;
                *s = b2 * *s + (1. - b2) * g.powi(2);
                *u = (*v / bc1) / ((*s / bc2).sqrt() + eps) + wd * p;
            });

        let param_norm = l2_norm(params);
        let update_norm = l2_norm(&self.update);
        let trust_ratio = if param_norm > 0. && update_norm > 0. {
            param_norm / update_norm
        } else {
            1.
        };

        params
            .iter_mut()
            .zip(self.update.iter())
            .for_each(|(p, u)| *p -= lr * trust_ratio * u);
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }
}

fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Applies an [`UpdateRule`] to a shared parameter buffer.
#[derive(Debug)]
pub struct ParamOptimizer {
    params: ParamHandle,
    rule: Box<dyn UpdateRule>,
}

impl ParamOptimizer {
    pub fn new(params: ParamHandle, rule: Box<dyn UpdateRule>) -> Self {
        Self { params, rule }
    }
}

impl Optimizer for ParamOptimizer {
    fn step(&mut self) {
        let mut params = self.params.borrow_mut();
        let params = &mut *params;
        self.rule.update_params(&params.grads, &mut params.values);
    }

    fn zero_grad(&mut self) {
        self.params.borrow_mut().grads.fill(0.);
    }

    fn learning_rate(&self) -> f64 {
        self.rule.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.rule.set_learning_rate(lr);
    }

    fn unscale_grads(&mut self, factor: f64) -> bool {
        let mut params = self.params.borrow_mut();
        params.grads.iter_mut().for_each(|g| *g /= factor);
        params.grads.iter().all(|g| g.is_finite())
    }
}

/// Builds the configured optimizer over `params`.
///
/// SGD uses Nesterov momentum, LAMB and Adam take the configured betas.
pub fn build_optimizer(
    kind: OptimizerKind,
    params: ParamHandle,
    config: &TrainingConfig,
) -> ParamOptimizer {
    let len = params.borrow().len();
    let lr = config.learning_rate;
    let wd = config.weight_decay;

    let rule: Box<dyn UpdateRule> = match kind {
        OptimizerKind::Sgd => Box::new(Sgd::new(len, lr, config.momentum, wd, true)),
        OptimizerKind::Adam => Box::new(Adam::new(len, lr, config.lamb_betas, wd, 1e-8)),
        OptimizerKind::Lamb => Box::new(Lamb::new(len, lr, config.lamb_betas, wd, 1e-6)),
    };

    debug!(params = len, lr = lr; "optimizer {kind:?} built");
    ParamOptimizer::new(params, rule)
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::reference::model::Parameters;

    fn quadratic_steps(rule: &mut dyn UpdateRule, steps: usize) -> f64 {
        // minimize (p - 3)^2
        let mut params = [0.];
        for _ in 0..steps {
            let grad = [2. * (params[0] - 3.)];
            rule.update_params(&grad, &mut params);
        }
        params[0]
    }

    #[test]
    fn plain_sgd_step() {
        let mut sgd = Sgd::new(2, 0.1, 0., 0., false);
        let mut params = [1., 2.];
        sgd.update_params(&[1., -1.], &mut params);
        assert!((params[0] - 0.9).abs() < 1e-12);
        assert!((params[1] - 2.1).abs() < 1e-12);
    }

    #[test]
    fn nesterov_looks_ahead() {
        let mut sgd = Sgd::new(1, 0.1, 0.9, 0., true);
        let mut params = [0.];
        sgd.update_params(&[1.], &mut params);
        // v = 1, d = 1 + 0.9 * 1
        assert!((params[0] + 0.19).abs() < 1e-12);
    }

    #[test]
    fn sgd_and_adam_converge_on_a_quadratic() {
        let mut sgd = Sgd::new(1, 0.05, 0.9, 0., true);
        let mut adam = Adam::new(1, 0.1, [0.9, 0.999], 0., 1e-8);

        assert!((quadratic_steps(&mut sgd, 300) - 3.).abs() < 1e-2);
        assert!((quadratic_steps(&mut adam, 500) - 3.).abs() < 1e-1);
    }

    #[test]
    fn lamb_step_is_scaled_by_the_trust_ratio() {
        let mut lamb = Lamb::new(2, 0.01, [0.9, 0.999], 0., 0.);
        let mut params = [3., 4.];
        lamb.update_params(&[1., 1.], &mut params);

        // bias corrected update is [1, 1], trust ratio 5 / sqrt(2)
        let delta = 0.01 * 5. / 2f64.sqrt();
        assert!((params[0] - (3. - delta)).abs() < 1e-9);
        assert!((params[1] - (4. - delta)).abs() < 1e-9);
    }

    #[test]
    fn optimizer_steps_and_unscales_shared_params() {
        let params = Rc::new(RefCell::new(Parameters::zeros(2)));
        let config = TrainingConfig {
            learning_rate: 0.5,
            momentum: 0.,
            ..TrainingConfig::default()
        };
        let mut opt = build_optimizer(OptimizerKind::Sgd, Rc::clone(&params), &config);

        params.borrow_mut().grads = vec![4., -2.];
        assert!(opt.unscale_grads(2.));
        opt.step();
        assert_eq!(params.borrow().values, [-1., 0.5]);

        opt.zero_grad();
        assert_eq!(params.borrow().grads, [0., 0.]);

        params.borrow_mut().grads[0] = f64::INFINITY;
        assert!(!opt.unscale_grads(2.));

        opt.set_learning_rate(0.1);
        assert_eq!(opt.learning_rate(), 0.1);
    }
}
