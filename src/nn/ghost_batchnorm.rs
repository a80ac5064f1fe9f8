//! Ghost Batch Normalization.
//!
//! Normalization statistics are computed over small "virtual" batches
//! instead of the whole batch. Two partitionings are supported:
//!
//! - [`GhostAxis::Examples`]: the batch is split into groups of at most
//!   `virtual_batch_size` examples and every group is normalized per
//!   feature. This is the default.
//! - [`GhostAxis::Features`]: every example's feature vector is split into
//!   chunks of at most `virtual_batch_size` entries and every chunk is
//!   normalized over its own entries, with a scale/bias per position
//!   inside the chunk.
//!
//! In both cases the last group (or chunk) may be shorter.
//!
//! In training graphs the layer registers the batch statistics it computed
//! with the graph context; the trainer folds them into the running buffers
//! after each optimizer step. Inference graphs normalize with the running
//! buffers instead.

use super::model::{Initializer, Model};
use super::module::{check_arity, check_width, Forward, Module, NnError, NnResult};
use crate::tensor::{RunningUpdate, Tensor};
use ndarray::{ArrayD, IxDyn};

pub const DEFAULT_VIRTUAL_BATCH_SIZE: i64 = 128;
pub const DEFAULT_MOMENTUM: f32 = 0.01;
pub const DEFAULT_EPSILON: f32 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GhostAxis {
    #[default]
    Examples,
    Features,
}

#[derive(Debug, Clone, Default)]
pub struct GhostBatchNormOpts {
    /// Must be positive. Default 128.
    pub virtual_batch_size: Option<i64>,
    /// Weight of the batch statistic in the running average. Default 0.01.
    pub momentum: Option<f32>,
    /// Default 1e-5.
    pub epsilon: Option<f32>,
    pub axis: Option<GhostAxis>,
    /// Learnable scale and bias. Default `true`.
    pub scale_bias: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GhostBatchNormConfig {
    pub virtual_batch_size: usize,
    pub momentum: f32,
    pub epsilon: f32,
    pub axis: GhostAxis,
    pub scale_bias: bool,
}

impl GhostBatchNormOpts {
    pub fn resolve(&self) -> NnResult<GhostBatchNormConfig> {
        let vbs = self.virtual_batch_size.unwrap_or(DEFAULT_VIRTUAL_BATCH_SIZE);
        if vbs <= 0 {
            return Err(NnError::Config(format!("virtual batch size must be positive, got {}", vbs)));
        }
        let momentum = self.momentum.unwrap_or(DEFAULT_MOMENTUM);
        if !(0.0..=1.0).contains(&momentum) {
            return Err(NnError::Config(format!("momentum must lie in [0, 1], got {}", momentum)));
        }
        let epsilon = self.epsilon.unwrap_or(DEFAULT_EPSILON);
        if !(epsilon > 0.0) {
            return Err(NnError::Config(format!("epsilon must be positive, got {}", epsilon)));
        }
        Ok(GhostBatchNormConfig {
            virtual_batch_size: vbs as usize,
            momentum,
            epsilon,
            axis: self.axis.unwrap_or_default(),
            scale_bias: self.scale_bias.unwrap_or(true),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GhostBatchNorm {
    pub name: String,
    pub features: usize,
    pub config: GhostBatchNormConfig,
    pub gamma: Option<Tensor>,
    pub beta: Option<Tensor>,
    running_mean: Tensor,
    running_var: Tensor,
}

impl GhostBatchNorm {
    pub fn new(model: &Model, features: usize, opts: &GhostBatchNormOpts) -> NnResult<Self> {
        if features == 0 {
            return Err(NnError::Config("ghost batch norm needs at least one feature".to_string()));
        }
        let config = opts.resolve()?;
        let name = model.layer_name("gbn");

        let (param_width, stat_width) = match config.axis {
            GhostAxis::Examples => (features, features),
            GhostAxis::Features => {
                let v = config.virtual_batch_size;
                (v.min(features), (features + v - 1) / v)
            }
        };

        let (gamma, beta) = if config.scale_bias {
            let gamma = model.parameter(&format!("{}.gamma", name), &[1, param_width], Initializer::Ones)?;
            let beta = model.parameter(&format!("{}.beta", name), &[1, param_width], Initializer::Zeros)?;
            (Some(gamma), Some(beta))
        } else {
            (None, None)
        };

        let running_mean = model.buffer(&format!("{}.running_mean", name), ArrayD::zeros(IxDyn(&[1, stat_width])))?;
        let running_var = model.buffer(&format!("{}.running_var", name), ArrayD::ones(IxDyn(&[1, stat_width])))?;

        Ok(Self { name, features, config, gamma, beta, running_mean, running_var })
    }

    pub fn running_mean_name(&self) -> String {
        format!("{}.running_mean", self.name)
    }

    pub fn running_var_name(&self) -> String {
        format!("{}.running_var", self.name)
    }

    fn normalize(&self, x: &Tensor, mean: &Tensor, var: &Tensor) -> Tensor {
        let std = var.add_scalar(self.config.epsilon).sqrt();
        &(x - mean) / &std
    }

    fn affine(&self, x: Tensor, width: usize) -> Tensor {
        match (&self.gamma, &self.beta) {
            (Some(gamma), Some(beta)) => {
                let param_width = match self.config.axis {
                    GhostAxis::Examples => self.features,
                    GhostAxis::Features => self.config.virtual_batch_size.min(self.features),
                };
                if width == param_width {
                    &(&x * gamma) + beta
                } else {
                    &(&x * &gamma.slice(1, 0, width)) + &beta.slice(1, 0, width)
                }
            }
            _ => x,
        }
    }

    fn register(&self, mean: &Tensor, var: &Tensor) {
        let mut ctx = mean.context.borrow_mut();
        ctx.register_running_update(RunningUpdate {
            buffer: self.running_mean_name(),
            batch_stat: mean.node_id,
            momentum: self.config.momentum,
        });
        ctx.register_running_update(RunningUpdate {
            buffer: self.running_var_name(),
            batch_stat: var.node_id,
            momentum: self.config.momentum,
        });
    }

    fn forward_examples(&self, x: &Tensor, batch: usize, training: bool) -> NnResult<Tensor> {
        if !training {
            return Ok(self.affine(self.normalize(x, &self.running_mean, &self.running_var), self.features));
        }

        let v = self.config.virtual_batch_size;
        let groups = (batch + v - 1) / v;
        let mut outputs = Vec::with_capacity(groups);
        let mut means = Vec::with_capacity(groups);
        let mut vars = Vec::with_capacity(groups);
        for g in 0..groups {
            let group = if groups == 1 { x.clone() } else { x.slice(0, g * v, ((g + 1) * v).min(batch)) };
            let mean = group.mean_axis(0);
            let centered = &group - &mean;
            let var = (&centered * &centered).mean_axis(0);
            let std = var.add_scalar(self.config.epsilon).sqrt();
            outputs.push(&centered / &std);
            means.push(mean);
            vars.push(var);
        }

        let normalized = concat(&self.name, &outputs, 0)?;
        self.register(&average(&self.name, &means)?, &average(&self.name, &vars)?);
        Ok(self.affine(normalized, self.features))
    }

    fn forward_features(&self, x: &Tensor, training: bool) -> NnResult<Tensor> {
        let v = self.config.virtual_batch_size;
        let chunks = (self.features + v - 1) / v;
        let mut outputs = Vec::with_capacity(chunks);
        let mut means = Vec::with_capacity(chunks);
        let mut vars = Vec::with_capacity(chunks);

        for c in 0..chunks {
            let (start, end) = (c * v, ((c + 1) * v).min(self.features));
            let chunk = if chunks == 1 { x.clone() } else { x.slice(1, start, end) };
            let normalized = if training {
                let mean = chunk.mean();
                let var = chunk.variance();
                let out = self.normalize(&chunk, &mean, &var);
                means.push(mean.mean_axis(0));
                vars.push(var.mean_axis(0));
                out
            } else {
                let mean = self.running_mean.slice(1, c, c + 1);
                let var = self.running_var.slice(1, c, c + 1);
                self.normalize(&chunk, &mean, &var)
            };
            outputs.push(self.affine(normalized, end - start));
        }

        if training {
            let mean = concat(&self.name, &means, 1)?;
            let var = concat(&self.name, &vars, 1)?;
            self.register(&mean, &var);
        }
        concat(&self.name, &outputs, 1)
    }
}

fn concat(layer: &str, parts: &[Tensor], axis: usize) -> NnResult<Tensor> {
    Tensor::concat(parts, axis).ok_or_else(|| NnError::Config(format!("{}: nothing to concatenate", layer)))
}

fn average(layer: &str, parts: &[Tensor]) -> NnResult<Tensor> {
    let (first, rest) = parts
        .split_first()
        .ok_or_else(|| NnError::Config(format!("{}: no virtual batches", layer)))?;
    if rest.is_empty() {
        return Ok(first.clone());
    }
    Ok(rest.iter().fold(first.clone(), |acc, t| &acc + t).scale(1.0 / parts.len() as f32))
}

impl Module for GhostBatchNorm {
    fn forward(&self, inputs: &[Tensor]) -> NnResult<Forward> {
        check_arity(&self.name, inputs, 1)?;
        let x = &inputs[0];
        let shape = check_width(&self.name, x, self.features)?;
        let training = x.context.borrow().is_training();
        let output = match self.config.axis {
            GhostAxis::Examples => self.forward_examples(x, shape[0], training)?,
            GhostAxis::Features => self.forward_features(x, training)?,
        };
        Ok(Forward::new(output))
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.gamma.iter().chain(self.beta.iter()).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::Value;
    use ndarray::Array2;
    use std::collections::HashMap;

    fn feed(rows: usize, cols: usize) -> HashMap<String, Value> {
        let data = Array2::from_shape_fn((rows, cols), |(i, j)| (i * cols + j) as f32 * 0.5).into_dyn();
        HashMap::from([("x".to_string(), Value::Tensor(data))])
    }

    #[test]
    fn invalid_virtual_batch_size_is_a_config_error() {
        let model = Model::with_seed(0);
        for vbs in [0, -3] {
            let opts = GhostBatchNormOpts { virtual_batch_size: Some(vbs), ..Default::default() };
            assert!(matches!(GhostBatchNorm::new(&model, 4, &opts), Err(NnError::Config(_))));
        }
    }

    #[test]
    fn feature_chunks_keep_the_input_shape() {
        let model = Model::with_seed(0);
        let opts = GhostBatchNormOpts {
            virtual_batch_size: Some(2),
            axis: Some(GhostAxis::Features),
            ..Default::default()
        };
        let gbn = GhostBatchNorm::new(&model, 5, &opts).unwrap();
        assert_eq!(model.value_shape("gbn_0.gamma"), Some(vec![1, 2]));
        assert_eq!(model.value_shape("gbn_0.running_mean"), Some(vec![1, 3]));

        let x = Tensor::new_input_with_shape(model.context(), "x", &[4, 5]);
        let y = gbn.forward(&[x]).unwrap().output;
        assert_eq!(y.shape().unwrap(), vec![4, 5]);

        let out = model.run(&[&y], &feed(4, 5)).unwrap().remove(0);
        for row in 0..4 {
            // Two-entry chunks normalize to -1/+1, the single trailing entry to 0.
            assert!((out[[row, 0]] + 1.0).abs() < 1e-3);
            assert!((out[[row, 3]] - 1.0).abs() < 1e-3);
            assert_eq!(out[[row, 4]], 0.0);
        }
    }

    #[test]
    fn example_groups_are_normalized_per_feature() {
        let model = Model::with_seed(0);
        let opts = GhostBatchNormOpts { virtual_batch_size: Some(2), ..Default::default() };
        let gbn = GhostBatchNorm::new(&model, 3, &opts).unwrap();

        let x = Tensor::new_input_with_shape(model.context(), "x", &[5, 3]);
        let mark = model.context().borrow().running_updates_mark();
        let y = gbn.forward(&[x]).unwrap().output;
        assert_eq!(y.shape().unwrap(), vec![5, 3]);
        assert_eq!(model.context().borrow().running_updates_since(mark).len(), 2);

        let out = model.run(&[&y], &feed(5, 3)).unwrap().remove(0);
        for col in 0..3 {
            assert!((out[[0, col]] + 1.0).abs() < 1e-3);
            assert!((out[[1, col]] - 1.0).abs() < 1e-3);
            assert!((out[[3, col]] - 1.0).abs() < 1e-3);
            // A group of one example has zero spread.
            assert_eq!(out[[4, col]], 0.0);
        }
    }

    #[test]
    fn inference_uses_running_statistics() {
        let model = Model::with_seed(0);
        let gbn = GhostBatchNorm::new(&model, 2, &GhostBatchNormOpts::default()).unwrap();
        model.set_training(false);

        let x = Tensor::new_input_with_shape(model.context(), "x", &[3, 2]);
        let mark = model.context().borrow().running_updates_mark();
        let y = gbn.forward(&[x]).unwrap().output;
        assert!(model.context().borrow().running_updates_since(mark).is_empty());

        let feeds = feed(3, 2);
        let out = model.run(&[&y], &feeds).unwrap().remove(0);
        let input = feeds["x"].to_array();
        let scale = 1.0 / (1.0 + DEFAULT_EPSILON).sqrt();
        for (o, i) in out.iter().zip(input.iter()) {
            assert!((o - i * scale).abs() < 1e-6);
        }
    }
}
