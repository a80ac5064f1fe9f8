//! Optimizers that update model weights.
//!
//! Optimizers work on real numbers on the CPU. They receive the current
//! weights and the computed gradients, keyed by parameter name, and apply
//! their update rule in place.

use ndarray::ArrayD;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    #[error("gradient for '{name}' has shape {grad:?}, parameter has {param:?}")]
    ShapeMismatch { name: String, param: Vec<usize>, grad: Vec<usize> },
}

/// Common interface of all optimizers.
pub trait Optimizer {
    /// Performs one optimization step.
    ///
    /// * `parameters` - current parameter values, keyed by name (e.g. "glu_0.fc.weight").
    /// * `gradients` - gradients for (a subset of) these parameters. Parameters
    ///   without a gradient are left untouched.
    fn step(
        &mut self,
        parameters: &mut HashMap<String, ArrayD<f32>>,
        gradients: &HashMap<String, ArrayD<f32>>,
    ) -> Result<(), OptimizerError>;
}

fn check_shapes(name: &str, param: &ArrayD<f32>, grad: &ArrayD<f32>) -> Result<(), OptimizerError> {
    if param.shape() != grad.shape() {
        return Err(OptimizerError::ShapeMismatch {
            name: name.to_string(),
            param: param.shape().to_vec(),
            grad: grad.shape().to_vec(),
        });
    }
    Ok(())
}

/// Stochastic Gradient Descent with optional classical momentum.
pub struct Sgd {
    lr: f32,
    momentum: f32,
    velocity: HashMap<String, ArrayD<f32>>,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Self { lr, momentum: 0.0, velocity: HashMap::new() }
    }

    /// `v = momentum * v + g; p -= lr * v`
    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }
}

impl Optimizer for Sgd {
    fn step(
        &mut self,
        parameters: &mut HashMap<String, ArrayD<f32>>,
        gradients: &HashMap<String, ArrayD<f32>>,
    ) -> Result<(), OptimizerError> {
        for (name, grad) in gradients {
            let Some(param) = parameters.get_mut(name) else { continue };
            check_shapes(name, param, grad)?;

            if self.momentum == 0.0 {
                ndarray::azip!((p in param, &g in grad) *p -= self.lr * g);
                continue;
            }
            let v = self.velocity.entry(name.clone()).or_insert_with(|| ArrayD::zeros(grad.raw_dim()));
            let (lr, momentum) = (self.lr, self.momentum);
            ndarray::azip!((p in param, v in v, &g in grad) {
                *v = momentum * *v + g;
                *p -= lr * *v;
            });
        }
        Ok(())
    }
}

/// Adam with bias correction.
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: i32,
    m: HashMap<String, ArrayD<f32>>,
    v: HashMap<String, ArrayD<f32>>,
}

impl Adam {
    pub fn new(lr: f32) -> Self {
        Self { lr, beta1: 0.9, beta2: 0.999, eps: 1e-8, t: 0, m: HashMap::new(), v: HashMap::new() }
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(1e-3)
    }
}

impl Optimizer for Adam {
    fn step(
        &mut self,
        parameters: &mut HashMap<String, ArrayD<f32>>,
        gradients: &HashMap<String, ArrayD<f32>>,
    ) -> Result<(), OptimizerError> {
        self.t += 1;
        let (b1, b2, eps) = (self.beta1, self.beta2, self.eps);
        let step_size = self.lr * (1.0 - b2.powi(self.t)).sqrt() / (1.0 - b1.powi(self.t));

        for (name, grad) in gradients {
            let Some(param) = parameters.get_mut(name) else { continue };
            check_shapes(name, param, grad)?;

            let m = self.m.entry(name.clone()).or_insert_with(|| ArrayD::zeros(grad.raw_dim()));
            let v = self.v.entry(name.clone()).or_insert_with(|| ArrayD::zeros(grad.raw_dim()));
            ndarray::azip!((p in param, m in m, v in v, &g in grad) {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                *p -= step_size * *m / (v.sqrt() + eps);
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn single(name: &str, v: ArrayD<f32>) -> HashMap<String, ArrayD<f32>> {
        HashMap::from([(name.to_string(), v)])
    }

    #[test]
    fn sgd_moves_against_the_gradient() {
        let mut params = single("w", arr1(&[1.0, 2.0]).into_dyn());
        let grads = single("w", arr1(&[0.5, -1.0]).into_dyn());
        Sgd::new(0.1).step(&mut params, &grads).unwrap();
        let w = &params["w"];
        assert!((w[0] - 0.95).abs() < 1e-6);
        assert!((w[1] - 2.1).abs() < 1e-6);
    }

    #[test]
    fn sgd_momentum_accumulates_velocity() {
        let mut opt = Sgd::new(1.0).with_momentum(0.5);
        let mut params = single("w", arr1(&[0.0]).into_dyn());
        let grads = single("w", arr1(&[1.0]).into_dyn());
        opt.step(&mut params, &grads).unwrap();
        opt.step(&mut params, &grads).unwrap();
        // v1 = 1, v2 = 1.5
        assert!((params["w"][0] + 2.5).abs() < 1e-6);
    }

    #[test]
    fn adam_first_step_is_lr_sized() {
        let mut opt = Adam::new(0.01);
        let mut params = single("w", arr1(&[1.0, 1.0]).into_dyn());
        let grads = single("w", arr1(&[3.0, -0.2]).into_dyn());
        opt.step(&mut params, &grads).unwrap();
        assert!((params["w"][0] - 0.99).abs() < 1e-4);
        assert!((params["w"][1] - 1.01).abs() < 1e-4);
    }

    #[test]
    fn mismatched_gradient_is_an_error() {
        let mut params = single("w", arr1(&[1.0]).into_dyn());
        let grads = single("w", arr1(&[1.0, 2.0]).into_dyn());
        assert!(matches!(Sgd::new(0.1).step(&mut params, &grads), Err(OptimizerError::ShapeMismatch { .. })));
    }
}
