//! Gated Linear Unit: `a * gate(b)` where `[a | b] = GBN(x W)`.

use super::activations::Activation;
use super::ghost_batchnorm::{GhostBatchNorm, GhostBatchNormOpts};
use super::linear::{Linear, LinearOpts};
use super::model::Model;
use super::module::{check_arity, Forward, Module, NnError, NnResult};
use crate::tensor::Tensor;

#[derive(Debug, Clone, Default)]
pub struct GluOpts {
    /// Pre-built projection to `2 * output_dim`, shared with other blocks.
    /// A fresh bias-free projection is created when absent.
    pub fc: Option<Linear>,
    pub gbn: GhostBatchNormOpts,
    /// Gate activation. Default sigmoid.
    pub gate: Option<Activation>,
}

#[derive(Debug, Clone)]
pub struct Glu {
    pub name: String,
    pub input_dim: usize,
    pub output_dim: usize,
    pub fc: Linear,
    pub gbn: GhostBatchNorm,
    gate: Activation,
}

impl Glu {
    pub fn new(model: &Model, input_dim: usize, output_dim: usize, opts: GluOpts) -> NnResult<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(NnError::Config(format!("GLU needs non-zero dimensions, got {}x{}", input_dim, output_dim)));
        }
        let name = model.layer_name("glu");
        let fc = match opts.fc {
            Some(fc) => {
                if fc.in_features != input_dim || fc.out_features != 2 * output_dim {
                    return Err(NnError::Config(format!(
                        "{}: shared projection is {}x{}, expected {}x{}",
                        name,
                        fc.in_features,
                        fc.out_features,
                        input_dim,
                        2 * output_dim
                    )));
                }
                fc
            }
            None => Linear::new(model, input_dim, 2 * output_dim, LinearOpts { bias: Some(false), init: None })?,
        };
        let gbn = GhostBatchNorm::new(model, 2 * output_dim, &opts.gbn)?;
        Ok(Self { name, input_dim, output_dim, fc, gbn, gate: opts.gate.unwrap_or(Activation::Sigmoid) })
    }
}

impl Module for Glu {
    fn forward(&self, inputs: &[Tensor]) -> NnResult<Forward> {
        check_arity(&self.name, inputs, 1)?;
        let projected = self.fc.forward(inputs)?.output;
        let normalized = self.gbn.forward(&[projected])?.output;
        let value = normalized.slice(1, 0, self.output_dim);
        let gate = normalized.slice(1, self.output_dim, 2 * self.output_dim);
        Ok(Forward::new(&value * &self.gate.apply(&gate)))
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.fc.parameters();
        params.extend(self.gbn.parameters());
        params
    }
}
