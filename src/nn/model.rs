//! The `Model`: owner of the graph context, the parameter store and the
//! layer registry.
//!
//! Layers hold only symbolic handles. The numbers behind every `Parameter`
//! node (and every running-statistic buffer) live here and are bound by
//! name whenever a graph is executed.

use super::module::{NnError, NnResult};
use super::registry::LayerRegistry;
use crate::asg::{Shape, Value};
use crate::optimizers::{Optimizer, OptimizerError};
use crate::runtime::backend::{bind_inputs, Backend, RuntimeError};
use crate::runtime::cpu_backend::CpuBackend;
use crate::tensor::{GraphContext, Tensor};
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// How a parameter's initial value is drawn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Initializer {
    Zeros,
    Ones,
    Constant(f32),
    Uniform { low: f32, high: f32 },
    /// `U(-a, a)` with `a = gain * sqrt(6 / (fan_in + fan_out))`.
    GlorotUniform { gain: f32 },
    /// `N(0, s)` with `s = gain * sqrt(2 / (fan_in + fan_out))`.
    GlorotNormal { gain: f32 },
}

impl Default for Initializer {
    fn default() -> Self {
        Initializer::GlorotUniform { gain: 1.0 }
    }
}

impl Initializer {
    pub fn sample(&self, shape: &[usize], rng: &mut StdRng) -> NnResult<ArrayD<f32>> {
        let dim = IxDyn(shape);
        let (fan_in, fan_out) = match shape {
            [] => (1, 1),
            [n] => (*n, *n),
            [rows, cols, ..] => (*rows, *cols),
        };
        let fans = (fan_in + fan_out).max(1) as f32;

        match *self {
            Initializer::Zeros => Ok(ArrayD::zeros(dim)),
            Initializer::Ones => Ok(ArrayD::ones(dim)),
            Initializer::Constant(v) => Ok(ArrayD::from_elem(dim, v)),
            Initializer::Uniform { low, high } => {
                if !(low < high) {
                    return Err(NnError::Config(format!("uniform initializer needs low < high, got {}..{}", low, high)));
                }
                Ok(ArrayD::random_using(dim, Uniform::new(low, high), rng))
            }
            Initializer::GlorotUniform { gain } => {
                let limit = gain * (6.0 / fans).sqrt();
                if !(limit > 0.0) {
                    return Err(NnError::Config(format!("glorot gain must be positive, got {}", gain)));
                }
                Ok(ArrayD::random_using(dim, Uniform::new(-limit, limit), rng))
            }
            Initializer::GlorotNormal { gain } => {
                let std = gain * (2.0 / fans).sqrt();
                let normal = Normal::new(0.0, std)
                    .map_err(|e| NnError::Config(format!("glorot normal initializer: {}", e)))?;
                Ok(ArrayD::random_using(dim, normal, rng))
            }
        }
    }
}

/// Owns everything a set of layers needs besides their graph structure.
pub struct Model {
    context: Rc<RefCell<GraphContext>>,
    registry: RefCell<LayerRegistry>,
    /// Learnable parameters in creation order.
    params: RefCell<Vec<(String, Tensor)>>,
    values: RefCell<HashMap<String, ArrayD<f32>>>,
    /// Non-learnable state (running statistics), bound like inputs.
    buffers: RefCell<Vec<String>>,
    rng: RefCell<StdRng>,
    weight_init: Initializer,
}

impl Model {
    /// Model with an entropy-seeded RNG.
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Model whose parameter initialization is reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            context: Rc::new(RefCell::new(GraphContext::new())),
            registry: RefCell::new(LayerRegistry::new()),
            params: RefCell::new(Vec::new()),
            values: RefCell::new(HashMap::new()),
            buffers: RefCell::new(Vec::new()),
            rng: RefCell::new(rng),
            weight_init: Initializer::default(),
        }
    }

    /// Initializer used for projection and embedding weights.
    pub fn with_weight_init(mut self, init: Initializer) -> Self {
        self.weight_init = init;
        self
    }

    pub fn weight_init(&self) -> Initializer {
        self.weight_init
    }

    pub fn context(&self) -> &Rc<RefCell<GraphContext>> {
        &self.context
    }

    pub fn is_training(&self) -> bool {
        self.context.borrow().is_training()
    }

    /// Selects batch statistics (training) or running statistics (inference)
    /// for normalization layers built from now on.
    pub fn set_training(&self, training: bool) {
        self.context.borrow_mut().set_training(training);
    }

    /// Next `"{kind}_{n}"` name from this model's registry.
    pub fn layer_name(&self, kind: &str) -> String {
        self.registry.borrow_mut().next_name(kind)
    }

    /// Creates a learnable parameter and draws its initial value.
    pub fn parameter(&self, name: &str, shape: &[usize], init: Initializer) -> NnResult<Tensor> {
        if shape.iter().any(|&d| d == 0) {
            return Err(NnError::Config(format!("parameter '{}' has a zero dimension: {:?}", name, shape)));
        }
        if self.values.borrow().contains_key(name) {
            return Err(NnError::Config(format!("duplicate parameter name '{}'", name)));
        }
        let value = init.sample(shape, &mut self.rng.borrow_mut())?;
        let tensor = Tensor::new_parameter(&self.context, name, shape);
        self.values.borrow_mut().insert(name.to_string(), value);
        self.params.borrow_mut().push((name.to_string(), tensor.clone()));
        Ok(tensor)
    }

    /// Creates a non-learnable buffer. It enters graphs as an input node.
    pub fn buffer(&self, name: &str, value: ArrayD<f32>) -> NnResult<Tensor> {
        if self.values.borrow().contains_key(name) {
            return Err(NnError::Config(format!("duplicate buffer name '{}'", name)));
        }
        let tensor = Tensor::new_input_with_shape(&self.context, name, value.shape());
        self.values.borrow_mut().insert(name.to_string(), value);
        self.buffers.borrow_mut().push(name.to_string());
        Ok(tensor)
    }

    /// Parameter handles in creation order.
    pub fn learnables(&self) -> Vec<Tensor> {
        self.params.borrow().iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.params.borrow().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn buffer_names(&self) -> Vec<String> {
        self.buffers.borrow().clone()
    }

    /// Current value of a parameter or buffer.
    pub fn value(&self, name: &str) -> Option<ArrayD<f32>> {
        self.values.borrow().get(name).cloned()
    }

    pub fn value_shape(&self, name: &str) -> Option<Shape> {
        self.values.borrow().get(name).map(|v| v.shape().to_vec())
    }

    /// Replaces a stored value. Returns `false` when `name` is unknown or
    /// the shapes differ.
    pub fn set_value(&self, name: &str, value: ArrayD<f32>) -> bool {
        let mut values = self.values.borrow_mut();
        match values.get_mut(name) {
            Some(slot) if slot.shape() == value.shape() => {
                *slot = value;
                true
            }
            _ => false,
        }
    }

    /// Every parameter and buffer value, keyed by node name, ready for binding.
    pub fn bindings(&self) -> HashMap<String, Value> {
        self.values.borrow().iter().map(|(k, v)| (k.clone(), Value::Tensor(v.clone()))).collect()
    }

    /// Learnable values only, in creation order.
    pub fn parameter_values(&self) -> Vec<(String, ArrayD<f32>)> {
        let values = self.values.borrow();
        self.params
            .borrow()
            .iter()
            .filter_map(|(n, _)| values.get(n).map(|v| (n.clone(), v.clone())))
            .collect()
    }

    /// Runs one optimizer update over the learnable parameters.
    pub fn apply_gradients(
        &self,
        optimizer: &mut dyn Optimizer,
        gradients: &HashMap<String, ArrayD<f32>>,
    ) -> Result<(), OptimizerError> {
        let names = self.parameter_names();
        let mut values = self.values.borrow_mut();
        let mut learnable: HashMap<String, ArrayD<f32>> =
            names.iter().filter_map(|n| values.remove(n).map(|v| (n.clone(), v))).collect();
        let result = optimizer.step(&mut learnable, gradients);
        values.extend(learnable);
        result
    }

    /// Evaluates `outputs` with the current parameter values and `feeds`
    /// bound to the graph inputs of the same names.
    pub fn run(&self, outputs: &[&Tensor], feeds: &HashMap<String, Value>) -> Result<Vec<ArrayD<f32>>, RuntimeError> {
        let mut graph = self.context.borrow().main_graph().clone();
        graph.set_outputs(outputs.iter().map(|t| t.node_id).collect());
        let mut values = self.bindings();
        values.extend(feeds.iter().map(|(k, v)| (k.clone(), v.clone())));
        let (results, _) = CpuBackend::new().run(&graph, bind_inputs(&graph, &values))?;
        Ok(results.iter().map(Value::to_array).collect())
    }

    /// `buffer = (1 - momentum) * buffer + momentum * batch_value`.
    pub fn update_buffer(&self, name: &str, batch_value: &ArrayD<f32>, momentum: f32) -> bool {
        let mut values = self.values.borrow_mut();
        match values.get_mut(name) {
            Some(slot) if slot.shape() == batch_value.shape() => {
                slot.zip_mut_with(batch_value, |r, &b| *r = (1.0 - momentum) * *r + momentum * b);
                true
            }
            _ => false,
        }
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_models_initialize_identically() {
        let a = Model::with_seed(7);
        let b = Model::with_seed(7);
        a.parameter("w", &[3, 4], Initializer::default()).unwrap();
        b.parameter("w", &[3, 4], Initializer::default()).unwrap();
        assert_eq!(a.value("w"), b.value("w"));
        let limit = (6.0f32 / 7.0).sqrt();
        assert!(a.value("w").unwrap().iter().all(|v| v.abs() <= limit));
    }

    #[test]
    fn duplicate_and_degenerate_parameters_are_rejected() {
        let model = Model::with_seed(0);
        model.parameter("w", &[2], Initializer::Ones).unwrap();
        assert!(matches!(model.parameter("w", &[2], Initializer::Ones), Err(NnError::Config(_))));
        assert!(matches!(model.parameter("z", &[0, 3], Initializer::Ones), Err(NnError::Config(_))));
        assert!(matches!(
            model.parameter("u", &[2], Initializer::Uniform { low: 1.0, high: 1.0 }),
            Err(NnError::Config(_))
        ));
    }

    #[test]
    fn buffers_are_not_learnable() {
        let model = Model::with_seed(0);
        model.parameter("w", &[2], Initializer::Ones).unwrap();
        model.buffer("running_mean", ArrayD::zeros(IxDyn(&[1, 2]))).unwrap();
        assert_eq!(model.parameter_names(), vec!["w".to_string()]);
        assert_eq!(model.bindings().len(), 2);

        let batch = ArrayD::from_elem(IxDyn(&[1, 2]), 1.0);
        assert!(model.update_buffer("running_mean", &batch, 0.25));
        assert_eq!(model.value("running_mean").unwrap()[[0, 1]], 0.25);
        assert!(!model.set_value("running_mean", ArrayD::zeros(IxDyn(&[2]))));
    }
}
