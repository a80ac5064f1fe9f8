//! Module for shape and data type inference (Shape Inference).
//!
//! Traverses the computation graph and determines the shape
//! and data type of the output tensor for each node based on its input shapes and operation type.

use crate::asg::{Asg, AsgError, DType, Node, NodeId, NodeType, Shape, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeInferenceError {
    #[error("Graph error: {0}")]
    AsgError(#[from] AsgError),

    #[error("Incompatible shapes for operation '{op}': left operand {shape1:?}, right operand {shape2:?}. \
             Ensure dimensions are compatible for broadcasting or matrix multiplication.")]
    IncompatibleShapes {
        op: String,
        shape1: Shape,
        shape2: Shape,
    },

    #[error("Shape information missing for node {0}.")]
    MissingShapeInfo(NodeId),

    #[error("Initial shape not specified for '{0}'. \
             Declare the shape when creating the input or pass it in initial_shapes.")]
    MissingInitialShape(String),

    #[error("Invalid tensor rank for node {node_id}: expected {expected}D, got {actual}D.")]
    InvalidRank {
        node_id: NodeId,
        expected: usize,
        actual: usize,
    },

    #[error("Node {0} must be a Literal for shape computation (e.g., for Reshape operation). \
             Dynamic shapes are not supported.")]
    NotALiteral(NodeId),

    #[error("Broadcast error: cannot broadcast shapes {0:?} and {1:?} to a common shape.")]
    BroadcastError(Shape, Shape),

    #[error("Matrix multiplication error: incompatible inner dimensions {0} and {1}.")]
    MatmulDimensionError(usize, usize),

    #[error("Invalid slice {start}..{end} on axis {axis} of shape {shape:?} (node {node_id})")]
    InvalidSlice {
        node_id: NodeId,
        axis: usize,
        start: usize,
        end: usize,
        shape: Shape,
    },

    #[error("Axis {axis} out of range for rank {rank} (node {node_id})")]
    InvalidAxis { node_id: NodeId, axis: isize, rank: usize },

    #[error("Cannot reshape {from:?} into {to:?} (node {node_id})")]
    InvalidReshape { node_id: NodeId, from: Shape, to: Vec<i64> },
}

type Result<T> = std::result::Result<T, ShapeInferenceError>;

/// Numpy-style broadcast of two shapes, `None` when incompatible.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Shape> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

/// Resolves a possibly negative axis against `rank`.
pub fn normalize_axis(axis: isize, rank: usize) -> Option<usize> {
    let ax = if axis < 0 { rank as isize + axis } else { axis };
    if ax < 0 || ax as usize >= rank {
        None
    } else {
        Some(ax as usize)
    }
}

/// Resolves a reshape target (one `-1` allowed) for `len` elements.
pub fn resolve_reshape(len: usize, target: &[i64]) -> Option<Shape> {
    let unknown = target.iter().filter(|&&d| d < 0).count();
    let known: usize = target.iter().filter(|&&d| d >= 0).map(|&d| d as usize).product();
    match unknown {
        0 if known == len => Some(target.iter().map(|&d| d as usize).collect()),
        1 if known > 0 && len % known == 0 => Some(
            target
                .iter()
                .map(|&d| if d < 0 { len / known } else { d as usize })
                .collect(),
        ),
        _ => None,
    }
}

/// Structure that performs shape inference for ASG.
pub struct ShapeInference;

impl ShapeInference {
    /// Runs the shape inference process for the graph.
    ///
    /// Modifies the graph in-place, filling in the `shape` and `dtype` fields for each node.
    ///
    /// # Arguments
    /// * `asg` - Mutable reference to the graph to analyze.
    /// * `initial_shapes` - Shapes and types for `Input`, `Parameter` and `External`
    ///   nodes, keyed by name. Leaves that already carry a declared shape may be omitted.
    pub fn run(asg: &mut Asg, initial_shapes: &HashMap<String, (Shape, DType)>) -> Result<()> {
        let sorted_nodes = Self::topological_sort(asg)?;

        for node_id in sorted_nodes {
            let mut node = asg.get_node(node_id)?.clone();
            let (shape, dtype) = Self::infer_node_shape(asg, &node, initial_shapes)?;
            node.shape = Some(shape);
            node.dtype = Some(dtype);
            asg.nodes.insert(node_id, node);
        }

        Ok(())
    }

    /// Infers the shape of one node, filling in only the nodes it depends on
    /// that do not carry a shape yet.
    pub fn infer_node(asg: &mut Asg, node_id: NodeId) -> Result<Shape> {
        let order = Self::topological_order_from(asg, &[node_id])?;
        let no_initial = HashMap::new();
        for id in order {
            let node = asg.get_node(id)?;
            if node.shape.is_some() && node.dtype.is_some() {
                continue;
            }
            let node = node.clone();
            let (shape, dtype) = Self::infer_node_shape(asg, &node, &no_initial)?;
            let slot = asg.get_node_mut(id)?;
            slot.shape = Some(shape);
            slot.dtype = Some(dtype);
        }
        asg.get_node(node_id)?
            .shape
            .clone()
            .ok_or(ShapeInferenceError::MissingShapeInfo(node_id))
    }

    /// Main shape inference logic for a single node.
    fn infer_node_shape(
        asg: &Asg,
        node: &Node,
        initial_shapes: &HashMap<String, (Shape, DType)>,
    ) -> Result<(Shape, DType)> {
        match &node.node_type {
            NodeType::Input { name }
            | NodeType::Parameter { name }
            | NodeType::External { name, .. } => {
                if let Some(found) = initial_shapes.get(name) {
                    return Ok(found.clone());
                }
                match &node.shape {
                    Some(shape) => Ok((shape.clone(), node.dtype.unwrap_or(DType::F32))),
                    None => Err(ShapeInferenceError::MissingInitialShape(name.clone())),
                }
            }

            NodeType::Literal(value) => match value {
                Value::Tensor(arr) => Ok((arr.shape().to_vec(), DType::F32)),
                Value::ScalarI32(_) => Ok((vec![], DType::I32)),
                Value::ScalarBool(_) => Ok((vec![], DType::Bool)),
                Value::ScalarF32(_) => Ok((vec![], DType::F32)),
            },

            NodeType::Add(l, r)
            | NodeType::Subtract(l, r)
            | NodeType::Multiply(l, r)
            | NodeType::Divide(l, r)
            | NodeType::GreaterThan(l, r) => {
                let (ls, ld) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;
                let out = broadcast_shapes(&ls, &rs).ok_or(ShapeInferenceError::BroadcastError(ls, rs))?;
                Ok((out, ld))
            }

            NodeType::MatrixMultiply(l, r) => {
                let (ls, ld) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;

                // Scalar operands degrade to elementwise scaling.
                if ls.is_empty() || rs.is_empty() {
                    let out = if ls.is_empty() { rs } else { ls };
                    return Ok((out, ld));
                }
                if ls.len() != 2 || rs.len() != 2 {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: 2,
                        actual: if ls.len() != 2 { ls.len() } else { rs.len() },
                    });
                }
                if ls[1] != rs[0] {
                    return Err(ShapeInferenceError::MatmulDimensionError(ls[1], rs[0]));
                }
                Ok((vec![ls[0], rs[1]], ld))
            }

            // Element-wise operations - shape unchanged
            NodeType::Negate(id)
            | NodeType::Exp(id)
            | NodeType::Log(id)
            | NodeType::Sqrt(id)
            | NodeType::ReLU(id)
            | NodeType::Sigmoid(id)
            | NodeType::Tanh(id)
            | NodeType::Softmax(id)
            | NodeType::Sparsemax(id) => Self::get_shape_dtype(asg, *id),

            NodeType::Sum(_) => Ok((vec![], DType::F32)),

            NodeType::Mean(id) | NodeType::Variance(id) => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                // Keep the reduced axis with size 1 so the result broadcasts back.
                if let Some(last) = shape.last_mut() {
                    *last = 1;
                }
                Ok((shape, dtype))
            }

            NodeType::MeanAxis(id, axis) => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                if shape.is_empty() {
                    return Ok((shape, dtype));
                }
                let ax = normalize_axis(*axis, shape.len()).ok_or(ShapeInferenceError::InvalidAxis {
                    node_id: node.id,
                    axis: *axis,
                    rank: shape.len(),
                })?;
                shape[ax] = 1;
                Ok((shape, dtype))
            }

            NodeType::Transpose(id, axis1, axis2) => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                if *axis1 >= shape.len() || *axis2 >= shape.len() {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: axis1.max(axis2) + 1,
                        actual: shape.len(),
                    });
                }
                shape.swap(*axis1, *axis2);
                Ok((shape, dtype))
            }

            NodeType::Reshape(data_id, shape_id) => {
                let (data_shape, dtype) = Self::get_shape_dtype(asg, *data_id)?;
                let shape_node = asg.get_node(*shape_id)?;
                if let NodeType::Literal(Value::Tensor(shape_tensor)) = &shape_node.node_type {
                    let target: Vec<i64> = shape_tensor.iter().map(|&x| x as i64).collect();
                    let len = data_shape.iter().product();
                    let resolved = resolve_reshape(len, &target).ok_or(ShapeInferenceError::InvalidReshape {
                        node_id: node.id,
                        from: data_shape,
                        to: target,
                    })?;
                    Ok((resolved, dtype))
                } else {
                    Err(ShapeInferenceError::NotALiteral(*shape_id))
                }
            }

            NodeType::Broadcast(source_id, target_id) | NodeType::ReduceSumTo(source_id, target_id) => {
                let (_, dtype) = Self::get_shape_dtype(asg, *source_id)?;
                let (target_shape, _) = Self::get_shape_dtype(asg, *target_id)?;
                Ok((target_shape, dtype))
            }

            NodeType::Slice { input, axis, start, end } => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *input)?;
                if *axis >= shape.len() || start >= end || *end > shape[*axis] {
                    return Err(ShapeInferenceError::InvalidSlice {
                        node_id: node.id,
                        axis: *axis,
                        start: *start,
                        end: *end,
                        shape,
                    });
                }
                shape[*axis] = end - start;
                Ok((shape, dtype))
            }

            NodeType::SliceGrad { like, .. } => Self::get_shape_dtype(asg, *like),

            NodeType::Concat { inputs, axis } => {
                let mut iter = inputs.iter();
                let first = iter.next().ok_or(ShapeInferenceError::MissingShapeInfo(node.id))?;
                let (mut out, dtype) = Self::get_shape_dtype(asg, *first)?;
                if *axis >= out.len() {
                    return Err(ShapeInferenceError::InvalidAxis {
                        node_id: node.id,
                        axis: *axis as isize,
                        rank: out.len(),
                    });
                }
                for id in iter {
                    let (shape, _) = Self::get_shape_dtype(asg, *id)?;
                    let compatible = shape.len() == out.len()
                        && shape.iter().zip(out.iter()).enumerate().all(|(i, (a, b))| i == *axis || a == b);
                    if !compatible {
                        return Err(ShapeInferenceError::IncompatibleShapes {
                            op: "Concat".to_string(),
                            shape1: out,
                            shape2: shape,
                        });
                    }
                    out[*axis] += shape[*axis];
                }
                Ok((out, dtype))
            }

            // Embedding: indices[*] + weight[num_embeddings, embedding_dim] -> [*, embedding_dim]
            NodeType::Embedding { indices, weight } => {
                let (indices_shape, _) = Self::get_shape_dtype(asg, *indices)?;
                let (weight_shape, dtype) = Self::get_shape_dtype(asg, *weight)?;

                if weight_shape.len() != 2 {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: 2,
                        actual: weight_shape.len(),
                    });
                }

                let mut output_shape = indices_shape;
                output_shape.push(weight_shape[1]);
                Ok((output_shape, dtype))
            }

            // EmbeddingGrad: grad_output[*, embedding_dim] + indices[*] -> [num_embeddings, embedding_dim]
            NodeType::EmbeddingGrad { grad_output, num_embeddings, .. } => {
                let (grad_shape, dtype) = Self::get_shape_dtype(asg, *grad_output)?;
                let embedding_dim = grad_shape.last().copied().unwrap_or(1);
                Ok((vec![*num_embeddings, embedding_dim], dtype))
            }
        }
    }

    /// Helper function to get already computed shape and type for a node.
    fn get_shape_dtype(asg: &Asg, node_id: NodeId) -> Result<(Shape, DType)> {
        let node = asg.get_node(node_id)?;
        match (&node.shape, &node.dtype) {
            (Some(s), Some(d)) => Ok((s.clone(), *d)),
            _ => Err(ShapeInferenceError::MissingShapeInfo(node_id)),
        }
    }

    /// Performs topological sort of the graph.
    /// Returns node IDs reachable from the outputs (or every node when the
    /// graph has no outputs yet) in an order suitable for computation.
    pub fn topological_sort(asg: &Asg) -> Result<Vec<NodeId>> {
        if asg.outputs.is_empty() {
            let mut all: Vec<NodeId> = asg.nodes.keys().copied().collect();
            all.sort_unstable();
            return Self::topological_order_from(asg, &all);
        }
        Self::topological_order_from(asg, &asg.outputs)
    }

    /// Post-order over the operands of `roots`. Iterative, so long chains of
    /// decision steps cannot overflow the stack.
    pub fn topological_order_from(asg: &Asg, roots: &[NodeId]) -> Result<Vec<NodeId>> {
        let mut sorted = Vec::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<(NodeId, bool)> = roots.iter().rev().map(|&id| (id, false)).collect();

        while let Some((node_id, expanded)) = stack.pop() {
            if expanded {
                if visited.insert(node_id) {
                    sorted.push(node_id);
                }
                continue;
            }
            if visited.contains(&node_id) {
                continue;
            }
            let node = asg.get_node(node_id)?;
            stack.push((node_id, true));
            for operand in node.node_type.operands().into_iter().rev() {
                if !visited.contains(&operand) {
                    stack.push((operand, false));
                }
            }
        }
        Ok(sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcasting_follows_numpy_rules() {
        assert_eq!(broadcast_shapes(&[4, 3], &[1, 3]), Some(vec![4, 3]));
        assert_eq!(broadcast_shapes(&[4, 3], &[]), Some(vec![4, 3]));
        assert_eq!(broadcast_shapes(&[4, 1], &[1, 5]), Some(vec![4, 5]));
        assert_eq!(broadcast_shapes(&[4, 3], &[2, 3]), None);
    }

    #[test]
    fn reshape_infers_one_dimension() {
        assert_eq!(resolve_reshape(12, &[-1, 4]), Some(vec![3, 4]));
        assert_eq!(resolve_reshape(12, &[3, 4]), Some(vec![3, 4]));
        assert_eq!(resolve_reshape(12, &[5, -1]), None);
        assert_eq!(resolve_reshape(12, &[-1, -1]), None);
    }

    #[test]
    fn matmul_mismatch_is_reported() {
        let mut asg = Asg::new(0, None);
        let a = asg.add_node(Some("a".into()), NodeType::Input { name: "a".into() });
        let b = asg.add_node(Some("b".into()), NodeType::Input { name: "b".into() });
        let mm = asg.add_node(None, NodeType::MatrixMultiply(a, b));
        asg.set_output(mm);
        let shapes = HashMap::from([
            ("a".to_string(), (vec![2, 3], DType::F32)),
            ("b".to_string(), (vec![4, 5], DType::F32)),
        ]);
        let err = ShapeInference::run(&mut asg, &shapes).unwrap_err();
        assert_eq!(err, ShapeInferenceError::MatmulDimensionError(3, 4));
    }

    #[test]
    fn slice_and_concat_shapes() {
        let mut asg = Asg::new(0, None);
        let x = asg.add_node(Some("x".into()), NodeType::Input { name: "x".into() });
        let left = asg.add_node(None, NodeType::Slice { input: x, axis: 1, start: 0, end: 2 });
        let right = asg.add_node(None, NodeType::Slice { input: x, axis: 1, start: 2, end: 5 });
        let joined = asg.add_node(None, NodeType::Concat { inputs: vec![right, left], axis: 1 });
        let bad = asg.add_node(None, NodeType::Slice { input: x, axis: 1, start: 3, end: 9 });
        asg.get_node_mut(x).unwrap().shape = Some(vec![6, 5]);
        asg.get_node_mut(x).unwrap().dtype = Some(DType::F32);

        assert_eq!(ShapeInference::infer_node(&mut asg, left).unwrap(), vec![6, 2]);
        assert_eq!(ShapeInference::infer_node(&mut asg, joined).unwrap(), vec![6, 5]);
        assert!(matches!(
            ShapeInference::infer_node(&mut asg, bad),
            Err(ShapeInferenceError::InvalidSlice { .. })
        ));
    }

    #[test]
    fn topological_order_puts_operands_first() {
        let mut asg = Asg::new(0, None);
        let x = asg.add_node(None, NodeType::Input { name: "x".into() });
        let sq = asg.add_node(None, NodeType::Multiply(x, x));
        let out = asg.add_node(None, NodeType::Add(sq, x));
        asg.set_output(out);
        assert_eq!(ShapeInference::topological_sort(&asg).unwrap(), vec![x, sq, out]);
    }
}
