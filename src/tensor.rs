//! `Tensor` handles and the `GraphContext` they build into.
//!
//! A `Tensor` holds no data. It is a handle to a node of the Abstract
//! Semantic Graph; every operation on it appends a node and returns a new
//! handle. Real numbers only appear once a backend runs the graph.

use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
use crate::asg::{Asg, DType, NodeId, NodeType, Shape, Value};
use ndarray::{arr0, ArrayD, IxDyn};
use std::cell::RefCell;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;

/// Running-statistic update registered by a normalization layer while a
/// training graph is built. After every optimizer step the trainer applies
/// `buffer = (1 - momentum) * buffer + momentum * value(batch_stat)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningUpdate {
    pub buffer: String,
    pub batch_stat: NodeId,
    pub momentum: f32,
}

/// Owns the graph under construction.
///
/// Shared between handles as `Rc<RefCell<GraphContext>>`.
#[derive(Debug, Clone)]
pub struct GraphContext {
    main_graph: Asg,
    training: bool,
    running_updates: Vec<RunningUpdate>,
}

impl GraphContext {
    pub fn new() -> Self {
        Self {
            main_graph: Asg::new(0, Some("main".to_string())),
            training: true,
            running_updates: Vec::new(),
        }
    }

    pub fn main_graph_mut(&mut self) -> &mut Asg {
        &mut self.main_graph
    }

    pub fn main_graph(&self) -> &Asg {
        &self.main_graph
    }

    /// Whether layers built from now on use batch statistics.
    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn register_running_update(&mut self, update: RunningUpdate) {
        self.running_updates.push(update);
    }

    /// Number of updates registered so far; pair with [`Self::running_updates_since`].
    pub fn running_updates_mark(&self) -> usize {
        self.running_updates.len()
    }

    pub fn running_updates_since(&self, mark: usize) -> Vec<RunningUpdate> {
        self.running_updates.get(mark..).map(|u| u.to_vec()).unwrap_or_default()
    }
}

impl Default for GraphContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Symbolic handle to a node of the graph.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub node_id: NodeId,
    pub context: Rc<RefCell<GraphContext>>,
}

impl Tensor {
    /// New graph input. Real data is bound by name at run time.
    pub fn new_input(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let mut ctx = context.borrow_mut();
        let graph = ctx.main_graph_mut();
        let node_id = graph.add_node(Some(name.to_string()), NodeType::Input { name: name.to_string() });
        graph.inputs.push(node_id);
        Self { node_id, context: Rc::clone(context) }
    }

    /// New graph input with a declared shape, so downstream shapes can be inferred eagerly.
    pub fn new_input_with_shape(context: &Rc<RefCell<GraphContext>>, name: &str, shape: &[usize]) -> Self {
        let input = Self::new_input(context, name);
        input.declare_shape(shape);
        input
    }

    /// New learnable parameter node. Its value lives in the model's parameter store.
    pub fn new_parameter(context: &Rc<RefCell<GraphContext>>, name: &str, shape: &[usize]) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(Some(name.to_string()), NodeType::Parameter { name: name.to_string() });
        let param = Self { node_id, context: Rc::clone(context) };
        param.declare_shape(shape);
        param
    }

    /// Constant embedded directly in the graph.
    pub fn new_literal(context: &Rc<RefCell<GraphContext>>, data: ArrayD<f32>, name: &str) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(Some(name.to_string()), NodeType::Literal(Value::Tensor(data)));
        Self { node_id, context: Rc::clone(context) }
    }

    /// Rank-0 constant.
    pub fn scalar(context: &Rc<RefCell<GraphContext>>, value: f32) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(None, NodeType::Literal(Value::Tensor(arr0(value).into_dyn())));
        Self { node_id, context: Rc::clone(context) }
    }

    fn declare_shape(&self, shape: &[usize]) {
        let mut ctx = self.context.borrow_mut();
        if let Ok(node) = ctx.main_graph_mut().get_node_mut(self.node_id) {
            node.shape = Some(shape.to_vec());
            node.dtype = Some(DType::F32);
        }
    }

    fn push(&self, node_type: NodeType) -> Tensor {
        let node_id = self.context.borrow_mut().main_graph_mut().add_node(None, node_type);
        Tensor { node_id, context: Rc::clone(&self.context) }
    }

    /// Infers (and caches) the shape of this node from declared input and parameter shapes.
    pub fn shape(&self) -> Result<Shape, ShapeInferenceError> {
        let mut ctx = self.context.borrow_mut();
        ShapeInference::infer_node(ctx.main_graph_mut(), self.node_id)
    }

    /// Size of the last axis.
    pub fn last_dim(&self) -> Result<usize, ShapeInferenceError> {
        Ok(self.shape()?.last().copied().unwrap_or(1))
    }

    // --- Math ---

    pub fn dot(&self, other: &Tensor) -> Self {
        self.push(NodeType::MatrixMultiply(self.node_id, other.node_id))
    }

    pub fn sqrt(&self) -> Self {
        self.push(NodeType::Sqrt(self.node_id))
    }

    pub fn exp(&self) -> Self {
        self.push(NodeType::Exp(self.node_id))
    }

    pub fn log(&self) -> Self {
        self.push(NodeType::Log(self.node_id))
    }

    /// `self * factor` with a scalar literal.
    pub fn scale(&self, factor: f32) -> Self {
        let f = Tensor::scalar(&self.context, factor);
        self * &f
    }

    /// `self + offset` with a scalar literal.
    pub fn add_scalar(&self, offset: f32) -> Self {
        let o = Tensor::scalar(&self.context, offset);
        self + &o
    }

    // --- Activations ---

    pub fn relu(&self) -> Self {
        self.push(NodeType::ReLU(self.node_id))
    }

    pub fn sigmoid(&self) -> Self {
        self.push(NodeType::Sigmoid(self.node_id))
    }

    pub fn tanh(&self) -> Self {
        self.push(NodeType::Tanh(self.node_id))
    }

    pub fn softmax(&self) -> Self {
        self.push(NodeType::Softmax(self.node_id))
    }

    pub fn sparsemax(&self) -> Self {
        self.push(NodeType::Sparsemax(self.node_id))
    }

    // --- Reductions ---

    pub fn sum(&self) -> Self {
        self.push(NodeType::Sum(self.node_id))
    }

    /// Mean over the last axis, keepdim.
    pub fn mean(&self) -> Self {
        self.push(NodeType::Mean(self.node_id))
    }

    /// Mean over `axis` (negative counts from the end), keepdim.
    pub fn mean_axis(&self, axis: isize) -> Self {
        self.push(NodeType::MeanAxis(self.node_id, axis))
    }

    pub fn variance(&self) -> Self {
        self.push(NodeType::Variance(self.node_id))
    }

    // --- Structure ---

    /// `-1` marks the single dimension inferred from the element count.
    pub fn reshape(&self, shape: Vec<i64>) -> Self {
        let shape_data = ArrayD::from_shape_vec(IxDyn(&[shape.len()]), shape.iter().map(|&x| x as f32).collect())
            .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[0])));
        let shape_node = Tensor::new_literal(&self.context, shape_data, "shape");
        self.push(NodeType::Reshape(self.node_id, shape_node.node_id))
    }

    pub fn transpose(&self, axis1: usize, axis2: usize) -> Self {
        self.push(NodeType::Transpose(self.node_id, axis1, axis2))
    }

    /// `self[.., start..end, ..]` along `axis`.
    pub fn slice(&self, axis: usize, start: usize, end: usize) -> Self {
        self.push(NodeType::Slice { input: self.node_id, axis, start, end })
    }

    /// Concatenates handles of the same context along `axis`.
    pub fn concat(tensors: &[Tensor], axis: usize) -> Option<Self> {
        let first = tensors.first()?;
        if tensors.len() == 1 {
            return Some(first.clone());
        }
        let inputs = tensors.iter().map(|t| t.node_id).collect();
        Some(first.push(NodeType::Concat { inputs, axis }))
    }

    /// Looks up the rows of `weight` addressed by the integer-coded values of `self`.
    pub fn embedding(&self, weight: &Tensor) -> Self {
        self.push(NodeType::Embedding { indices: self.node_id, weight: weight.node_id })
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $variant:ident, $op:tt) => {
        impl $trait<&Tensor> for &Tensor {
            type Output = Tensor;
            fn $method(self, rhs: &Tensor) -> Tensor {
                self.push(NodeType::$variant(self.node_id, rhs.node_id))
            }
        }

        impl $trait<Tensor> for Tensor {
            type Output = Tensor;
            fn $method(self, rhs: Tensor) -> Tensor {
                &self $op &rhs
            }
        }

        impl $trait<&Tensor> for Tensor {
            type Output = Tensor;
            fn $method(self, rhs: &Tensor) -> Tensor {
                &self $op rhs
            }
        }

        impl $trait<Tensor> for &Tensor {
            type Output = Tensor;
            fn $method(self, rhs: Tensor) -> Tensor {
                self $op &rhs
            }
        }
    };
}

impl_binary_op!(Add, add, Add, +);
impl_binary_op!(Sub, sub, Subtract, -);
impl_binary_op!(Mul, mul, Multiply, *);
impl_binary_op!(Div, div, Divide, /);

impl Neg for &Tensor {
    type Output = Tensor;
    fn neg(self) -> Tensor {
        self.push(NodeType::Negate(self.node_id))
    }
}
