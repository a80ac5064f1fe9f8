//! Module defining the core `Module` trait for all layers, and the errors
//! layers report while building their part of the graph.

use crate::analysis::shape_inference::ShapeInferenceError;
use crate::asg::Shape;
use crate::tensor::Tensor;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NnError {
    #[error("{layer}: expected {expected} input(s), got {actual}")]
    Arity { layer: String, expected: usize, actual: usize },

    #[error("{layer}: {source}")]
    Shape {
        layer: String,
        #[source]
        source: ShapeInferenceError,
    },

    #[error("{layer}: expected width {expected}, got {actual}")]
    Width { layer: String, expected: usize, actual: usize },

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type NnResult<T> = Result<T, NnError>;

/// Output of a forward pass plus the optional scalar auxiliary loss.
#[derive(Debug, Clone)]
pub struct Forward {
    pub output: Tensor,
    pub loss: Option<Tensor>,
}

impl Forward {
    pub fn new(output: Tensor) -> Self {
        Self { output, loss: None }
    }

    pub fn with_loss(output: Tensor, loss: Tensor) -> Self {
        Self { output, loss: Some(loss) }
    }
}

/// Trait defining the common interface for all layers/modules.
///
/// In the graph-based architecture, `Module` is any component that can
/// add a specific pattern of operations and parameters to the graph.
pub trait Module {
    /// Performs a "symbolic" forward pass, building the corresponding part of the graph.
    fn forward(&self, inputs: &[Tensor]) -> NnResult<Forward>;

    /// Returns all trainable parameters (as symbolic tensors) that belong to this module.
    fn parameters(&self) -> Vec<Tensor>;
}

/// Rejects a call with the wrong number of inputs.
pub fn check_arity(layer: &str, inputs: &[Tensor], expected: usize) -> NnResult<()> {
    if inputs.len() != expected {
        return Err(NnError::Arity { layer: layer.to_string(), expected, actual: inputs.len() });
    }
    Ok(())
}

/// Shape of `tensor`, with inference errors attributed to `layer`.
pub fn shape_of(layer: &str, tensor: &Tensor) -> NnResult<Shape> {
    tensor.shape().map_err(|source| NnError::Shape { layer: layer.to_string(), source })
}

/// Rejects a rank-2 input whose last dimension is not `expected`.
pub fn check_width(layer: &str, tensor: &Tensor, expected: usize) -> NnResult<Shape> {
    let shape = shape_of(layer, tensor)?;
    let actual = shape.last().copied().unwrap_or(1);
    if shape.len() != 2 || actual != expected {
        return Err(NnError::Width { layer: layer.to_string(), expected, actual });
    }
    Ok(shape)
}
