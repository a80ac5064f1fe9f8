//! Feature transformer: a stack of GLU blocks with scaled residuals.
//!
//! The first blocks reuse projections shared by every feature transformer
//! of a TabNet; the remaining blocks own their weights. Each block after
//! the first computes `x = (x + GLU(x)) * sqrt(0.5)`, which keeps the
//! activation variance constant however many blocks are stacked.

use super::ghost_batchnorm::GhostBatchNormOpts;
use super::glu::{Glu, GluOpts};
use super::linear::{Linear, LinearOpts};
use super::model::Model;
use super::module::{check_arity, check_width, Forward, Module, NnError, NnResult};
use crate::tensor::Tensor;
use std::f32::consts::FRAC_1_SQRT_2;

#[derive(Debug, Clone, Default)]
pub struct FeatureTransformerOpts {
    /// Weight-tied projections, see [`shared_projections`].
    pub shared: Vec<Linear>,
    /// Default 2.
    pub independent_blocks: Option<usize>,
    /// Width of every block's output. Defaults to the input width.
    pub output_dim: Option<usize>,
    pub gbn: GhostBatchNormOpts,
}

/// Bias-free projections for `n` shared GLU blocks: the first maps
/// `input_dim` to `2 * output_dim`, the rest `output_dim` to `2 * output_dim`.
pub fn shared_projections(model: &Model, input_dim: usize, output_dim: usize, n: usize) -> NnResult<Vec<Linear>> {
    (0..n)
        .map(|i| {
            let fan_in = if i == 0 { input_dim } else { output_dim };
            Linear::new(model, fan_in, 2 * output_dim, LinearOpts { bias: Some(false), init: None })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct FeatureTransformer {
    pub name: String,
    pub input_dim: usize,
    pub output_dim: usize,
    pub blocks: Vec<Glu>,
}

impl FeatureTransformer {
    pub fn new(model: &Model, input_dim: usize, opts: FeatureTransformerOpts) -> NnResult<Self> {
        let output_dim = opts.output_dim.unwrap_or(input_dim);
        let independent = opts.independent_blocks.unwrap_or(2);
        if input_dim == 0 || output_dim == 0 {
            return Err(NnError::Config(format!(
                "feature transformer needs non-zero dimensions, got {}x{}",
                input_dim, output_dim
            )));
        }
        if opts.shared.is_empty() && independent == 0 {
            return Err(NnError::Config("feature transformer needs at least one block".to_string()));
        }

        let name = model.layer_name("feature_transformer");
        let mut blocks = Vec::with_capacity(opts.shared.len() + independent);
        for fc in opts.shared {
            let fan_in = if blocks.is_empty() { input_dim } else { output_dim };
            let glu_opts = GluOpts { fc: Some(fc), gbn: opts.gbn.clone(), gate: None };
            blocks.push(Glu::new(model, fan_in, output_dim, glu_opts)?);
        }
        for _ in 0..independent {
            let fan_in = if blocks.is_empty() { input_dim } else { output_dim };
            let glu_opts = GluOpts { fc: None, gbn: opts.gbn.clone(), gate: None };
            blocks.push(Glu::new(model, fan_in, output_dim, glu_opts)?);
        }
        Ok(Self { name, input_dim, output_dim, blocks })
    }
}

impl Module for FeatureTransformer {
    fn forward(&self, inputs: &[Tensor]) -> NnResult<Forward> {
        check_arity(&self.name, inputs, 1)?;
        check_width(&self.name, &inputs[0], self.input_dim)?;

        let (first, rest) = self
            .blocks
            .split_first()
            .ok_or_else(|| NnError::Config(format!("{}: no blocks", self.name)))?;
        let mut x = first.forward(inputs)?.output;
        for block in rest {
            let delta = block.forward(&[x.clone()])?.output;
            x = (&x + &delta).scale(FRAC_1_SQRT_2);
        }
        Ok(Forward::new(x))
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.blocks.iter().flat_map(|b| b.parameters()).collect()
    }
}
