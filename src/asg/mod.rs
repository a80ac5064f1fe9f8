//! ASG: the Abstract Semantic Graph every model is compiled into.
//!
//! Layers never compute anything directly. They append nodes to an [`Asg`],
//! and a backend later evaluates the graph against concrete values.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Node identifier inside one graph.
pub type NodeId = usize;
/// Graph identifier.
pub type AsgId = usize;
/// Tensor shape.
pub type Shape = Vec<usize>;

pub type AsgResult<T> = std::result::Result<T, AsgError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsgError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum DType {
    F32,
    I32,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Same as the key in `Asg::nodes`, duplicated for convenience.
    pub id: NodeId,
    pub name: Option<String>,
    pub node_type: NodeType,
    pub shape: Option<Shape>,
    pub dtype: Option<DType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeType {
    // Data
    Input { name: String },
    Parameter { name: String },
    Literal(Value),
    /// Value of a node that lives in another graph (the forward graph, for
    /// gradient graphs). Resolved from the memo at run time.
    External { name: String, source_asg_id: AsgId, source_node_id: NodeId },

    // Binary, numpy-style broadcasting
    Add(NodeId, NodeId),
    Subtract(NodeId, NodeId),
    Multiply(NodeId, NodeId),
    Divide(NodeId, NodeId),
    MatrixMultiply(NodeId, NodeId),
    GreaterThan(NodeId, NodeId),

    // Unary
    Negate(NodeId),
    Exp(NodeId),
    Log(NodeId),
    Sqrt(NodeId),
    ReLU(NodeId),
    Sigmoid(NodeId),
    Tanh(NodeId),
    /// Softmax over the last axis.
    Softmax(NodeId),
    /// Euclidean projection of every last-axis row onto the probability simplex.
    Sparsemax(NodeId),

    // Reductions
    Sum(NodeId),
    /// Mean over the last axis, keepdim.
    Mean(NodeId),
    /// Mean over an arbitrary axis, keepdim.
    MeanAxis(NodeId, isize),
    /// Population variance over the last axis, keepdim.
    Variance(NodeId),

    // Structure
    /// Second operand is a literal shape; one `-1` entry is inferred.
    Reshape(NodeId, NodeId),
    Transpose(NodeId, usize, usize),
    /// Broadcast the first operand to the shape of the second.
    Broadcast(NodeId, NodeId),
    /// Sum the first operand down to the shape of the second.
    ReduceSumTo(NodeId, NodeId),
    /// `input[.., start..end, ..]` along `axis`.
    Slice { input: NodeId, axis: usize, start: usize, end: usize },
    /// Writes `grad_output` into `start..` along `axis` of a zero tensor shaped like `like`.
    SliceGrad { grad_output: NodeId, like: NodeId, axis: usize, start: usize },
    Concat { inputs: Vec<NodeId>, axis: usize },

    // Lookup tables
    /// `indices[*]` (integer-coded f32) into `weight[num_embeddings, dim]` -> `[*, dim]`.
    Embedding { indices: NodeId, weight: NodeId },
    EmbeddingGrad { grad_output: NodeId, indices: NodeId, num_embeddings: usize },
}

impl NodeType {
    /// Operand ids in evaluation order.
    pub fn operands(&self) -> Vec<NodeId> {
        match self {
            NodeType::Input { .. }
            | NodeType::Parameter { .. }
            | NodeType::Literal(_)
            | NodeType::External { .. } => vec![],

            NodeType::Add(a, b)
            | NodeType::Subtract(a, b)
            | NodeType::Multiply(a, b)
            | NodeType::Divide(a, b)
            | NodeType::MatrixMultiply(a, b)
            | NodeType::GreaterThan(a, b)
            | NodeType::Reshape(a, b)
            | NodeType::Broadcast(a, b)
            | NodeType::ReduceSumTo(a, b) => vec![*a, *b],

            NodeType::Negate(a)
            | NodeType::Exp(a)
            | NodeType::Log(a)
            | NodeType::Sqrt(a)
            | NodeType::ReLU(a)
            | NodeType::Sigmoid(a)
            | NodeType::Tanh(a)
            | NodeType::Softmax(a)
            | NodeType::Sparsemax(a)
            | NodeType::Sum(a)
            | NodeType::Mean(a)
            | NodeType::MeanAxis(a, _)
            | NodeType::Variance(a)
            | NodeType::Transpose(a, _, _) => vec![*a],

            NodeType::Slice { input, .. } => vec![*input],
            NodeType::SliceGrad { grad_output, like, .. } => vec![*grad_output, *like],
            NodeType::Concat { inputs, .. } => inputs.clone(),
            NodeType::Embedding { indices, weight } => vec![*indices, *weight],
            NodeType::EmbeddingGrad { grad_output, indices, .. } => vec![*grad_output, *indices],
        }
    }

    /// Short operation name used in logs and error messages.
    pub fn op_name(&self) -> &'static str {
        match self {
            NodeType::Input { .. } => "Input",
            NodeType::Parameter { .. } => "Parameter",
            NodeType::Literal(_) => "Literal",
            NodeType::External { .. } => "External",
            NodeType::Add(..) => "Add",
            NodeType::Subtract(..) => "Subtract",
            NodeType::Multiply(..) => "Multiply",
            NodeType::Divide(..) => "Divide",
            NodeType::MatrixMultiply(..) => "MatrixMultiply",
            NodeType::GreaterThan(..) => "GreaterThan",
            NodeType::Negate(_) => "Negate",
            NodeType::Exp(_) => "Exp",
            NodeType::Log(_) => "Log",
            NodeType::Sqrt(_) => "Sqrt",
            NodeType::ReLU(_) => "ReLU",
            NodeType::Sigmoid(_) => "Sigmoid",
            NodeType::Tanh(_) => "Tanh",
            NodeType::Softmax(_) => "Softmax",
            NodeType::Sparsemax(_) => "Sparsemax",
            NodeType::Sum(_) => "Sum",
            NodeType::Mean(_) => "Mean",
            NodeType::MeanAxis(..) => "MeanAxis",
            NodeType::Variance(_) => "Variance",
            NodeType::Reshape(..) => "Reshape",
            NodeType::Transpose(..) => "Transpose",
            NodeType::Broadcast(..) => "Broadcast",
            NodeType::ReduceSumTo(..) => "ReduceSumTo",
            NodeType::Slice { .. } => "Slice",
            NodeType::SliceGrad { .. } => "SliceGrad",
            NodeType::Concat { .. } => "Concat",
            NodeType::Embedding { .. } => "Embedding",
            NodeType::EmbeddingGrad { .. } => "EmbeddingGrad",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Tensor(ArrayD<f32>),
    ScalarF32(f32),
    ScalarI32(i32),
    ScalarBool(bool),
}

impl Value {
    /// Views any value as a dense f32 array (scalars become rank-0 arrays).
    pub fn to_array(&self) -> ArrayD<f32> {
        match self {
            Value::Tensor(arr) => arr.clone(),
            Value::ScalarF32(v) => ndarray::arr0(*v).into_dyn(),
            Value::ScalarI32(v) => ndarray::arr0(*v as f32).into_dyn(),
            Value::ScalarBool(v) => ndarray::arr0(if *v { 1.0 } else { 0.0 }).into_dyn(),
        }
    }

    /// First element, for scalar outputs such as a loss.
    pub fn scalar(&self) -> Option<f32> {
        match self {
            Value::Tensor(arr) => arr.iter().next().copied(),
            Value::ScalarF32(v) => Some(*v),
            Value::ScalarI32(v) => Some(*v as f32),
            Value::ScalarBool(v) => Some(if *v { 1.0 } else { 0.0 }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asg {
    pub id: AsgId,
    pub name: Option<String>,
    pub nodes: HashMap<NodeId, Node>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

impl Asg {
    pub fn new(id: AsgId, name: Option<String>) -> Self {
        Self { id, name, nodes: HashMap::new(), inputs: vec![], outputs: vec![] }
    }

    pub fn add_node(&mut self, name: Option<String>, node_type: NodeType) -> NodeId {
        let new_id = self.nodes.len();
        let mut node = Node { id: new_id, name, node_type, shape: None, dtype: None };

        // Literals know their shape up front so inference never stalls on them.
        match &node.node_type {
            NodeType::Literal(Value::Tensor(arr)) => {
                node.shape = Some(arr.shape().to_vec());
                node.dtype = Some(DType::F32);
            }
            NodeType::Literal(Value::ScalarF32(_)) => {
                node.shape = Some(vec![]);
                node.dtype = Some(DType::F32);
            }
            NodeType::Literal(Value::ScalarI32(_)) => {
                node.shape = Some(vec![]);
                node.dtype = Some(DType::I32);
            }
            NodeType::Literal(Value::ScalarBool(_)) => {
                node.shape = Some(vec![]);
                node.dtype = Some(DType::Bool);
            }
            _ => {}
        }

        self.nodes.insert(new_id, node);
        new_id
    }

    pub fn set_inputs(&mut self, inputs: Vec<NodeId>) {
        self.inputs = inputs;
    }
    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) {
        self.outputs = outputs;
    }

    /// Shortcut for graphs with a single output.
    pub fn set_output(&mut self, output: NodeId) {
        self.set_outputs(vec![output]);
    }

    pub fn get_node(&self, id: NodeId) -> AsgResult<&Node> {
        self.nodes.get(&id).ok_or(AsgError::NodeNotFound(id))
    }
    pub fn get_node_mut(&mut self, id: NodeId) -> AsgResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(AsgError::NodeNotFound(id))
    }

    /// Name carried by an `Input` or `Parameter` node.
    pub fn leaf_name(&self, id: NodeId) -> Option<&str> {
        match &self.nodes.get(&id)?.node_type {
            NodeType::Input { name } | NodeType::Parameter { name } => Some(name.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_nodes_carry_their_shape() {
        let mut asg = Asg::new(0, None);
        let t = asg.add_node(None, NodeType::Literal(Value::Tensor(ArrayD::zeros(ndarray::IxDyn(&[2, 3])))));
        let s = asg.add_node(None, NodeType::Literal(Value::ScalarF32(1.0)));
        assert_eq!(asg.get_node(t).unwrap().shape, Some(vec![2, 3]));
        assert_eq!(asg.get_node(s).unwrap().shape, Some(vec![]));
    }

    #[test]
    fn operands_follow_node_structure() {
        let concat = NodeType::Concat { inputs: vec![3, 1, 2], axis: 1 };
        assert_eq!(concat.operands(), vec![3, 1, 2]);
        assert!(NodeType::Input { name: "x".into() }.operands().is_empty());
        assert_eq!(NodeType::Slice { input: 4, axis: 1, start: 0, end: 2 }.operands(), vec![4]);
    }
}
