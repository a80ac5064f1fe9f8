//! One attend, mask, transform transition of the TabNet loop.

use super::attentive_transformer::AttentiveTransformer;
use super::feature_transformer::FeatureTransformer;
use super::module::{check_arity, shape_of, Forward, Module, NnError, NnResult};
use crate::tensor::Tensor;

/// Everything one step hands to the next and to the accumulator.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// `relu` of the prediction half.
    pub output: Tensor,
    /// Attention input for the next step.
    pub attention: Tensor,
    pub prior: Tensor,
    pub mask: Tensor,
    /// Mask entropy term of this step.
    pub loss: Tensor,
}

#[derive(Debug, Clone)]
pub struct DecisionStep {
    pub name: String,
    pub attentive: AttentiveTransformer,
    pub transformer: FeatureTransformer,
    pub prediction_dim: usize,
    pub gamma: f32,
}

impl DecisionStep {
    pub fn new(
        name: String,
        attentive: AttentiveTransformer,
        transformer: FeatureTransformer,
        prediction_dim: usize,
        gamma: f32,
    ) -> NnResult<Self> {
        if prediction_dim == 0 || prediction_dim >= transformer.output_dim {
            return Err(NnError::Config(format!(
                "{}: prediction width {} must be positive and below the transformer width {}",
                name, prediction_dim, transformer.output_dim
            )));
        }
        if attentive.attention_dim != transformer.output_dim - prediction_dim {
            return Err(NnError::Config(format!(
                "{}: attentive transformer expects width {}, step produces {}",
                name,
                attentive.attention_dim,
                transformer.output_dim - prediction_dim
            )));
        }
        if !(gamma > 1.0) {
            return Err(NnError::Config(format!("{}: gamma must exceed 1, got {}", name, gamma)));
        }
        Ok(Self { name, attentive, transformer, prediction_dim, gamma })
    }

    /// Runs the step on `attention` (previous slice), `prior` and the
    /// normalized input `features`.
    pub fn step(&self, attention: &Tensor, prior: &Tensor, features: &Tensor) -> NnResult<StepOutput> {
        let attended = self.attentive.forward(&[attention.clone(), prior.clone()])?;
        let mask = attended.output;
        let loss = attended
            .loss
            .ok_or_else(|| NnError::Config(format!("{}: attentive transformer returned no loss", self.name)))?;

        let next_prior = prior * &(-&mask).add_scalar(self.gamma);
        let masked = &mask * features;
        let transformed = self.transformer.forward(&[masked])?.output;

        let width = self.transformer.output_dim;
        let output = transformed.slice(1, 0, self.prediction_dim).relu();
        let attention = transformed.slice(1, self.prediction_dim, width);
        Ok(StepOutput { output, attention, prior: next_prior, mask, loss })
    }
}

impl Module for DecisionStep {
    /// Inputs `[attention, prior, features]`; output `[relu_out | attention | prior]`
    /// concatenated along the feature axis, loss the step's entropy term.
    fn forward(&self, inputs: &[Tensor]) -> NnResult<Forward> {
        check_arity(&self.name, inputs, 3)?;
        let out = self.step(&inputs[0], &inputs[1], &inputs[2])?;
        let joined = Tensor::concat(&[out.output, out.attention, out.prior], 1)
            .ok_or_else(|| NnError::Config(format!("{}: nothing to concatenate", self.name)))?;
        shape_of(&self.name, &joined)?;
        Ok(Forward::with_loss(joined, out.loss))
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.attentive.parameters();
        params.extend(self.transformer.parameters());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::Value;
    use crate::nn::attentive_transformer::AttentiveTransformerOpts;
    use crate::nn::feature_transformer::FeatureTransformerOpts;
    use crate::nn::model::Model;
    use ndarray::{Array2, ArrayD, IxDyn};
    use std::collections::HashMap;

    fn build(model: &Model, features: usize) -> DecisionStep {
        let attentive = AttentiveTransformer::new(model, 2, features, AttentiveTransformerOpts::default()).unwrap();
        let transformer = FeatureTransformer::new(
            model,
            features,
            FeatureTransformerOpts { output_dim: Some(5), ..Default::default() },
        )
        .unwrap();
        DecisionStep::new(model.layer_name("decision_step"), attentive, transformer, 3, 1.3).unwrap()
    }

    #[test]
    fn prior_stays_between_gamma_minus_one_and_gamma() {
        let model = Model::with_seed(5);
        let step = build(&model, 4);
        let a = Tensor::new_input_with_shape(model.context(), "a", &[6, 2]);
        let prior = Tensor::new_input_with_shape(model.context(), "prior", &[6, 4]);
        let x = Tensor::new_input_with_shape(model.context(), "x", &[6, 4]);
        let out = step.step(&a, &prior, &x).unwrap();
        assert_eq!(out.output.shape().unwrap(), vec![6, 3]);
        assert_eq!(out.attention.shape().unwrap(), vec![6, 2]);

        let feeds = HashMap::from([
            ("a".to_string(), Value::Tensor(Array2::from_shape_fn((6, 2), |(i, j)| (i as f32 - j as f32) * 0.7).into_dyn())),
            ("prior".to_string(), Value::Tensor(ArrayD::ones(IxDyn(&[6, 4])))),
            ("x".to_string(), Value::Tensor(Array2::from_shape_fn((6, 4), |(i, j)| (i * j) as f32 * 0.1).into_dyn())),
        ]);
        let values = model.run(&[&out.prior, &out.mask, &out.output], &feeds).unwrap();
        for (p, m) in values[0].iter().zip(values[1].iter()) {
            assert!((p - (1.3 - m)).abs() < 1e-6);
            assert!(*p >= 0.3 - 1e-6 && *p <= 1.3 + 1e-6);
        }
        assert!(values[2].iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn module_form_concatenates_step_state() {
        let model = Model::with_seed(5);
        let step = build(&model, 4);
        let a = Tensor::new_input_with_shape(model.context(), "a", &[2, 2]);
        let prior = Tensor::new_input_with_shape(model.context(), "prior", &[2, 4]);
        let x = Tensor::new_input_with_shape(model.context(), "x", &[2, 4]);
        let fwd = step.forward(&[a, prior, x]).unwrap();
        assert_eq!(fwd.output.shape().unwrap(), vec![2, 3 + 2 + 4]);
        assert!(fwd.loss.is_some());
    }

    #[test]
    fn mismatched_widths_are_rejected() {
        let model = Model::with_seed(0);
        let attentive = AttentiveTransformer::new(&model, 3, 4, AttentiveTransformerOpts::default()).unwrap();
        let transformer =
            FeatureTransformer::new(&model, 4, FeatureTransformerOpts { output_dim: Some(5), ..Default::default() })
                .unwrap();
        let result = DecisionStep::new("decision_step_0".to_string(), attentive, transformer, 3, 1.3);
        assert!(matches!(result, Err(NnError::Config(_))));
    }

    #[test]
    fn gamma_must_exceed_one() {
        let model = Model::with_seed(0);
        for gamma in [1.0, 0.9, f32::NAN] {
            let attentive = AttentiveTransformer::new(&model, 2, 4, AttentiveTransformerOpts::default()).unwrap();
            let transformer =
                FeatureTransformer::new(&model, 4, FeatureTransformerOpts { output_dim: Some(5), ..Default::default() })
                    .unwrap();
            let result = DecisionStep::new("decision_step_0".to_string(), attentive, transformer, 3, gamma);
            assert!(matches!(result, Err(NnError::Config(msg)) if msg.contains("gamma must exceed 1")));
        }
    }
}
