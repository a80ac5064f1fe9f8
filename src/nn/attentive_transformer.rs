//! Attentive transformer: turns the previous step's attention slice and the
//! running prior into a per-feature mask.

use super::activations::Activation;
use super::ghost_batchnorm::{GhostBatchNorm, GhostBatchNormOpts};
use super::linear::{Linear, LinearOpts};
use super::model::Model;
use super::module::{check_arity, check_width, Forward, Module, NnError, NnResult};
use crate::tensor::Tensor;

pub const DEFAULT_MASK_EPSILON: f32 = 1e-15;

#[derive(Debug, Clone, Default)]
pub struct AttentiveTransformerOpts {
    /// Default sparsemax.
    pub activation: Option<Activation>,
    pub gbn: GhostBatchNormOpts,
    /// Offset inside `log(mask + epsilon)`. Default 1e-15.
    pub epsilon: Option<f32>,
}

/// `mask = activation(GBN(Linear(a)) * prior)`.
///
/// The forward pass takes `[attention_input, prior]` and returns the mask
/// with its entropy term `sum(mask * log(mask + eps)) / batch` as loss.
#[derive(Debug, Clone)]
pub struct AttentiveTransformer {
    pub name: String,
    pub attention_dim: usize,
    pub features: usize,
    pub fc: Linear,
    pub gbn: GhostBatchNorm,
    activation: Activation,
    epsilon: f32,
}

impl AttentiveTransformer {
    pub fn new(model: &Model, attention_dim: usize, features: usize, opts: AttentiveTransformerOpts) -> NnResult<Self> {
        let epsilon = opts.epsilon.unwrap_or(DEFAULT_MASK_EPSILON);
        if !(epsilon > 0.0) {
            return Err(NnError::Config(format!("mask epsilon must be positive, got {}", epsilon)));
        }
        let name = model.layer_name("attentive_transformer");
        let fc = Linear::new(model, attention_dim, features, LinearOpts { bias: Some(false), init: None })?;
        let gbn = GhostBatchNorm::new(model, features, &opts.gbn)?;
        Ok(Self {
            name,
            attention_dim,
            features,
            fc,
            gbn,
            activation: opts.activation.unwrap_or(Activation::Sparsemax),
            epsilon,
        })
    }

    pub fn activation(&self) -> &Activation {
        &self.activation
    }
}

impl Module for AttentiveTransformer {
    fn forward(&self, inputs: &[Tensor]) -> NnResult<Forward> {
        check_arity(&self.name, inputs, 2)?;
        let (x, prior) = (&inputs[0], &inputs[1]);
        check_width(&self.name, x, self.attention_dim)?;
        let prior_shape = check_width(&self.name, prior, self.features)?;

        let projected = self.fc.forward(&[x.clone()])?.output;
        let normalized = self.gbn.forward(&[projected])?.output;
        let mask = self.activation.apply(&(&normalized * prior));

        let batch = prior_shape[0].max(1) as f32;
        let loss = (&mask * &mask.add_scalar(self.epsilon).log()).sum().scale(1.0 / batch);
        Ok(Forward::with_loss(mask, loss))
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.fc.parameters();
        params.extend(self.gbn.parameters());
        params
    }
}
