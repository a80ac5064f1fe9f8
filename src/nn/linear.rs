//! Fully connected (linear) layer in the graph paradigm.

use super::model::{Initializer, Model};
use super::module::{check_arity, check_width, Forward, Module, NnError, NnResult};
use crate::tensor::Tensor;

#[derive(Debug, Clone, Default)]
pub struct LinearOpts {
    /// Adds a learnable bias. Default `true`.
    pub bias: Option<bool>,
    /// Weight initializer. Defaults to the model's weight initializer.
    pub init: Option<Initializer>,
}

/// Fully connected layer.
///
/// Holds no data. It owns the symbolic handles of its weight (and optional
/// bias) `Parameter` nodes; `forward` appends `y = xW (+ b)` to the graph.
/// Cloning the layer shares its weights.
#[derive(Debug, Clone)]
pub struct Linear {
    pub name: String,
    pub in_features: usize,
    pub out_features: usize,
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl Linear {
    pub fn new(model: &Model, in_features: usize, out_features: usize, opts: LinearOpts) -> NnResult<Self> {
        if in_features == 0 || out_features == 0 {
            return Err(NnError::Config(format!(
                "linear layer needs non-zero dimensions, got {}x{}",
                in_features, out_features
            )));
        }
        let name = model.layer_name("linear");
        let init = opts.init.unwrap_or_else(|| model.weight_init());
        let weight = model.parameter(&format!("{}.weight", name), &[in_features, out_features], init)?;
        let bias = if opts.bias.unwrap_or(true) {
            Some(model.parameter(&format!("{}.bias", name), &[1, out_features], Initializer::Zeros)?)
        } else {
            None
        };
        Ok(Self { name, in_features, out_features, weight, bias })
    }
}

impl Module for Linear {
    fn forward(&self, inputs: &[Tensor]) -> NnResult<Forward> {
        check_arity(&self.name, inputs, 1)?;
        check_width(&self.name, &inputs[0], self.in_features)?;
        let projected = inputs[0].dot(&self.weight);
        let output = match &self.bias {
            Some(bias) => &projected + bias,
            None => projected,
        };
        Ok(Forward::new(output))
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        params.extend(self.bias.clone());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::Value;
    use ndarray::{arr2, ArrayD};
    use std::collections::HashMap;

    #[test]
    fn forward_computes_affine_map() {
        let model = Model::with_seed(0).with_weight_init(Initializer::Ones);
        let linear = Linear::new(&model, 2, 3, LinearOpts::default()).unwrap();
        assert_eq!(linear.parameters().len(), 2);

        let x = Tensor::new_input_with_shape(model.context(), "x", &[2, 2]);
        let y = linear.forward(&[x]).unwrap().output;
        assert_eq!(y.shape().unwrap(), vec![2, 3]);

        let feeds = HashMap::from([("x".to_string(), Value::Tensor(arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn()))]);
        let out = model.run(&[&y], &feeds).unwrap();
        let expected: ArrayD<f32> = arr2(&[[3.0, 3.0, 3.0], [7.0, 7.0, 7.0]]).into_dyn();
        assert_eq!(out[0], expected);
    }

    #[test]
    fn wrong_width_and_arity_are_reported() {
        let model = Model::with_seed(0);
        let linear = Linear::new(&model, 4, 2, LinearOpts { bias: Some(false), init: None }).unwrap();
        assert_eq!(linear.parameters().len(), 1);

        let x = Tensor::new_input_with_shape(model.context(), "x", &[3, 5]);
        assert!(matches!(linear.forward(&[x.clone()]), Err(NnError::Width { expected: 4, actual: 5, .. })));
        assert!(matches!(linear.forward(&[x.clone(), x]), Err(NnError::Arity { expected: 1, actual: 2, .. })));
        assert!(matches!(Linear::new(&model, 0, 2, LinearOpts::default()), Err(NnError::Config(_))));
    }
}
