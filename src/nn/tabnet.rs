//! The TabNet pipeline.
//!
//! ```text
//! x -> embeddings -> GBN -> initial feature transformer -> attention_0
//! for step in 0..decision_steps:
//!     mask, loss = attentive(attention, prior)
//!     prior     *= gamma - mask
//!     d          = feature_transformer(mask * x)
//!     output    += relu(d[:, :prediction_dim])
//!     attention  = d[:, prediction_dim:]
//! output = Linear(output), regularization = sum(loss) / decision_steps
//! ```
//!
//! The shared GLU projections are created once and injected into every
//! feature transformer, so they are weight-tied across the initial
//! transformer and all steps.

use super::activations::Activation;
use super::attentive_transformer::{AttentiveTransformer, AttentiveTransformerOpts, DEFAULT_MASK_EPSILON};
use super::decision_step::DecisionStep;
use super::embedding::{CategoricalColumn, EmbeddingGenerator};
use super::feature_transformer::{shared_projections, FeatureTransformer, FeatureTransformerOpts};
use super::ghost_batchnorm::{GhostBatchNorm, GhostBatchNormOpts};
use super::linear::{Linear, LinearOpts};
use super::model::Model;
use super::module::{check_arity, check_width, Forward, Module, NnError, NnResult};
use crate::tensor::Tensor;
use ndarray::{ArrayD, IxDyn};
use tracing::debug;

pub const DEFAULT_GAMMA: f32 = 1.3;

#[derive(Debug, Clone, Default)]
pub struct TabNetOpts {
    /// Default 2.
    pub shared_blocks: Option<usize>,
    /// Default 2.
    pub independent_blocks: Option<usize>,
    /// Default 3.
    pub decision_steps: Option<usize>,
    /// Width of the prediction half of every step. Default 8.
    pub prediction_layer_dim: Option<usize>,
    /// Width of the attention half of every step. Default 8.
    pub attention_layer_dim: Option<usize>,
    /// Prior relaxation, greater than 1. Default 1.3.
    pub gamma: Option<f32>,
    /// Default 1e-15.
    pub epsilon: Option<f32>,
    pub gbn: GhostBatchNormOpts,
    /// Attention activation. Default sparsemax.
    pub mask_activation: Option<Activation>,
    pub categorical: Vec<CategoricalColumn>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TabNetConfig {
    pub shared_blocks: usize,
    pub independent_blocks: usize,
    pub decision_steps: usize,
    pub prediction_layer_dim: usize,
    pub attention_layer_dim: usize,
    pub gamma: f32,
    pub epsilon: f32,
}

impl TabNetOpts {
    pub fn resolve(&self) -> NnResult<TabNetConfig> {
        let config = TabNetConfig {
            shared_blocks: self.shared_blocks.unwrap_or(2),
            independent_blocks: self.independent_blocks.unwrap_or(2),
            decision_steps: self.decision_steps.unwrap_or(3),
            prediction_layer_dim: self.prediction_layer_dim.unwrap_or(8),
            attention_layer_dim: self.attention_layer_dim.unwrap_or(8),
            gamma: self.gamma.unwrap_or(DEFAULT_GAMMA),
            epsilon: self.epsilon.unwrap_or(DEFAULT_MASK_EPSILON),
        };
        if config.decision_steps == 0 {
            return Err(NnError::Config("tabnet needs at least one decision step".to_string()));
        }
        if config.shared_blocks + config.independent_blocks == 0 {
            return Err(NnError::Config("tabnet feature transformers need at least one block".to_string()));
        }
        if config.prediction_layer_dim == 0 || config.attention_layer_dim == 0 {
            return Err(NnError::Config(format!(
                "prediction and attention widths must be positive, got {} and {}",
                config.prediction_layer_dim, config.attention_layer_dim
            )));
        }
        if !(config.gamma > 1.0) {
            return Err(NnError::Config(format!("gamma must exceed 1, got {}", config.gamma)));
        }
        Ok(config)
    }
}

/// Output of [`TabNet::forward_with_masks`].
#[derive(Debug, Clone)]
pub struct TabNetForward {
    /// `[batch, output_dim]` before any task activation.
    pub output: Tensor,
    /// Mean mask entropy over the decision steps.
    pub regularization: Tensor,
    /// One `[batch, features]` mask per decision step.
    pub masks: Vec<Tensor>,
    /// `sum_steps mask * sum_d relu(d)`, `[batch, features]`.
    pub importance: Tensor,
}

#[derive(Debug, Clone)]
pub struct TabNet {
    pub name: String,
    pub input_dim: usize,
    pub output_dim: usize,
    pub config: TabNetConfig,
    pub embeddings: EmbeddingGenerator,
    pub input_norm: GhostBatchNorm,
    pub initial: FeatureTransformer,
    pub steps: Vec<DecisionStep>,
    pub head: Linear,
}

impl TabNet {
    pub fn new(model: &Model, input_dim: usize, output_dim: usize, opts: TabNetOpts) -> NnResult<Self> {
        let config = opts.resolve()?;
        if input_dim == 0 || output_dim == 0 {
            return Err(NnError::Config(format!(
                "tabnet needs non-zero dimensions, got {} inputs and {} outputs",
                input_dim, output_dim
            )));
        }
        let name = model.layer_name("tabnet");
        let embeddings = EmbeddingGenerator::new(model, input_dim, opts.categorical.clone())?;
        let features = embeddings.output_dim();
        let input_norm = GhostBatchNorm::new(model, features, &opts.gbn)?;

        let width = config.prediction_layer_dim + config.attention_layer_dim;
        let shared = shared_projections(model, features, width, config.shared_blocks)?;
        let transformer_opts = FeatureTransformerOpts {
            shared,
            independent_blocks: Some(config.independent_blocks),
            output_dim: Some(width),
            gbn: opts.gbn.clone(),
        };
        let initial = FeatureTransformer::new(model, features, transformer_opts.clone())?;

        let mut steps = Vec::with_capacity(config.decision_steps);
        for _ in 0..config.decision_steps {
            let step_name = model.layer_name("decision_step");
            let attentive = AttentiveTransformer::new(
                model,
                config.attention_layer_dim,
                features,
                AttentiveTransformerOpts {
                    activation: opts.mask_activation.clone(),
                    gbn: opts.gbn.clone(),
                    epsilon: Some(config.epsilon),
                },
            )?;
            let transformer = FeatureTransformer::new(model, features, transformer_opts.clone())?;
            steps.push(DecisionStep::new(step_name, attentive, transformer, config.prediction_layer_dim, config.gamma)?);
        }

        let head = Linear::new(model, config.prediction_layer_dim, output_dim, LinearOpts::default())?;
        debug!(
            layer = %name,
            features,
            steps = config.decision_steps,
            parameters = model.parameter_names().len(),
            "built tabnet"
        );
        Ok(Self { name, input_dim, output_dim, config, embeddings, input_norm, initial, steps, head })
    }

    /// Width of the feature vector the attention masks range over.
    pub fn features(&self) -> usize {
        self.embeddings.output_dim()
    }

    pub fn forward_with_masks(&self, x: &Tensor) -> NnResult<TabNetForward> {
        let shape = check_width(&self.name, x, self.input_dim)?;
        let batch = shape[0];
        let features = self.features();

        let embedded = self.embeddings.forward(&[x.clone()])?.output;
        let normalized = self.input_norm.forward(&[embedded])?.output;
        let seed = self.initial.forward(&[normalized.clone()])?.output;
        let pred = self.config.prediction_layer_dim;
        let mut attention = seed.slice(1, pred, pred + self.config.attention_layer_dim);

        let mut prior = Tensor::new_literal(&x.context, ArrayD::ones(IxDyn(&[batch, features])), "prior");
        let mut output: Option<Tensor> = None;
        let mut loss: Option<Tensor> = None;
        let mut importance: Option<Tensor> = None;
        let mut masks = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let out = step.step(&attention, &prior, &normalized)?;
            let weight = out.output.mean().scale(pred as f32);
            let contribution = &out.mask * &weight;

            output = Some(accumulate(output, out.output));
            loss = Some(accumulate(loss, out.loss));
            importance = Some(accumulate(importance, contribution));
            masks.push(out.mask);
            attention = out.attention;
            prior = out.prior;
        }

        let missing = || NnError::Config(format!("{}: no decision steps", self.name));
        let aggregated = output.ok_or_else(missing)?;
        let regularization = loss.ok_or_else(missing)?.scale(1.0 / self.steps.len() as f32);
        let importance = importance.ok_or_else(missing)?;
        let output = self.head.forward(&[aggregated])?.output;
        Ok(TabNetForward { output, regularization, masks, importance })
    }
}

fn accumulate(acc: Option<Tensor>, term: Tensor) -> Tensor {
    match acc {
        Some(acc) => &acc + &term,
        None => term,
    }
}

impl Module for TabNet {
    /// Output with the averaged mask regularization as loss.
    fn forward(&self, inputs: &[Tensor]) -> NnResult<Forward> {
        check_arity(&self.name, inputs, 1)?;
        let out = self.forward_with_masks(&inputs[0])?;
        Ok(Forward::with_loss(out.output, out.regularization))
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.embeddings.parameters();
        params.extend(self.input_norm.parameters());
        params.extend(self.initial.parameters());
        for step in &self.steps {
            params.extend(step.parameters());
        }
        params.extend(self.head.parameters());
        // Shared projections appear once per feature transformer.
        let mut seen = std::collections::HashSet::new();
        params.retain(|p| seen.insert(p.node_id));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::Value;
    use ndarray::Array2;
    use std::collections::HashMap;

    fn small_opts() -> TabNetOpts {
        TabNetOpts {
            shared_blocks: Some(1),
            independent_blocks: Some(1),
            decision_steps: Some(2),
            prediction_layer_dim: Some(3),
            attention_layer_dim: Some(2),
            gbn: GhostBatchNormOpts { virtual_batch_size: Some(4), ..Default::default() },
            ..Default::default()
        }
    }

    #[test]
    fn forward_shapes_and_mask_invariants() {
        let model = Model::with_seed(21);
        let opts = TabNetOpts {
            categorical: vec![CategoricalColumn { index: 0, vocab_size: 3, embedding_dim: 2 }],
            ..small_opts()
        };
        let net = TabNet::new(&model, 4, 2, opts).unwrap();
        assert_eq!(net.features(), 5);

        let x = Tensor::new_input_with_shape(model.context(), "x", &[8, 4]);
        let out = net.forward_with_masks(&x).unwrap();
        assert_eq!(out.output.shape().unwrap(), vec![8, 2]);
        assert_eq!(out.masks.len(), 2);
        assert_eq!(out.importance.shape().unwrap(), vec![8, 5]);
        assert_eq!(out.regularization.shape().unwrap(), Vec::<usize>::new());

        let data = Array2::from_shape_fn((8, 4), |(i, j)| if j == 0 { (i % 3) as f32 } else { (i + j) as f32 * 0.3 });
        let feeds = HashMap::from([("x".to_string(), Value::Tensor(data.into_dyn()))]);
        let values = model.run(&[&out.masks[0], &out.masks[1], &out.importance], &feeds).unwrap();
        for mask in &values[..2] {
            for row in mask.outer_iter() {
                assert!(row.iter().all(|&m| m >= 0.0));
                assert!((row.sum() - 1.0).abs() < 1e-5);
            }
        }
        assert!(values[2].iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn shared_projections_are_tied_across_steps() {
        let model = Model::with_seed(1);
        let net = TabNet::new(&model, 3, 1, small_opts()).unwrap();
        let tied = net.initial.blocks[0].fc.weight.node_id;
        assert!(net.steps.iter().all(|s| s.transformer.blocks[0].fc.weight.node_id == tied));
        assert_ne!(net.steps[0].transformer.blocks[1].fc.weight.node_id, net.steps[1].transformer.blocks[1].fc.weight.node_id);

        let params = net.parameters();
        assert_eq!(params.len(), model.parameter_names().len());
    }

    #[test]
    fn invalid_options_are_rejected() {
        let model = Model::with_seed(0);
        for opts in [
            TabNetOpts { decision_steps: Some(0), ..Default::default() },
            TabNetOpts { gamma: Some(0.5), ..Default::default() },
            TabNetOpts { gamma: Some(1.0), ..Default::default() },
            TabNetOpts { shared_blocks: Some(0), independent_blocks: Some(0), ..Default::default() },
            TabNetOpts { gbn: GhostBatchNormOpts { virtual_batch_size: Some(0), ..Default::default() }, ..Default::default() },
        ] {
            assert!(matches!(TabNet::new(&model, 3, 1, opts), Err(NnError::Config(_))));
        }
    }

    #[test]
    fn gamma_of_one_is_rejected_and_just_above_is_accepted() {
        let err = TabNetOpts { gamma: Some(1.0), ..Default::default() }.resolve().unwrap_err();
        assert!(matches!(&err, NnError::Config(msg) if msg.contains("gamma must exceed 1")), "{}", err);
        let config = TabNetOpts { gamma: Some(1.0001), ..Default::default() }.resolve().unwrap();
        assert_eq!(config.gamma, 1.0001);
    }
}
