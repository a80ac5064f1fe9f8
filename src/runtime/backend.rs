//! Abstract interface (trait) for execution backends.

use crate::asg::{Asg, AsgId, NodeId, NodeType};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while a graph is executed. Shared by all backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Node {0} not found in graph {1}.")]
    NodeNotFound(NodeId, AsgId),

    #[error("Shape error: {0}")]
    ShapeError(String),

    #[error("No value bound for input '{0}' (node {1}).")]
    MissingInput(String, NodeId),

    #[error("No value bound for parameter '{0}' (node {1}). Initialize the parameter before running the graph.")]
    MissingParameter(String, NodeId),

    #[error("Index {index} out of range for a table of {size} rows")]
    IndexOutOfRange { index: f32, size: usize },

    #[error("non-finite value produced by {op} at node {node}")]
    NumericalInstability { node: NodeId, op: String },
}

/// Cache of already computed node values, keyed by (AsgId, NodeId).
pub type Memo<T> = HashMap<(AsgId, NodeId), T>;

/// Common interface of an execution environment.
///
/// A backend takes an ASG plus the values of its leaves and computes the
/// outputs.
pub trait Backend {
    /// Device-specific representation of a value.
    type DeviceData: std::fmt::Debug;

    /// Executes the graph, using and extending the memo.
    ///
    /// `initial_memo` holds the bound leaves (inputs, parameters) and, for
    /// gradient graphs, the memo of the forward run their `External` nodes
    /// refer to.
    ///
    /// Returns the output values (in `main_asg.outputs` order) and the final memo.
    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError>;
}

/// Binds every `Input`/`Parameter` node of `asg` whose name appears in `values`.
pub fn bind_inputs<T: Clone>(asg: &Asg, values: &HashMap<String, T>) -> Memo<T> {
    let mut memo = Memo::new();
    for node in asg.nodes.values() {
        if let NodeType::Input { name } | NodeType::Parameter { name } = &node.node_type {
            if let Some(v) = values.get(name) {
                memo.insert((asg.id, node.id), v.clone());
            }
        }
    }
    memo
}
