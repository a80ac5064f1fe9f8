//! Reverse-mode differentiation: builds the graph of d(loss)/d(node).
//!
//! Algorithm:
//!  - walk the forward graph in reverse topological order starting at the loss;
//!  - for every node that has an upstream gradient, emit the contributions to
//!    its operands and accumulate (sum) them;
//!  - the result is a separate ASG whose outputs are the gradients of the
//!    requested nodes, in the requested order.
//!
//! Forward values are referenced through `External` nodes named
//! `external_{graph}_{node}`; the backend resolves them from the memo of the
//! forward run, so the forward graph must be run first with the same memo.
//!
//! Only nodes from which a requested node is reachable receive gradients, so
//! constant branches (literals, masks, shape helpers) cost nothing.

use crate::analysis::shape_inference::{normalize_axis, ShapeInference, ShapeInferenceError};
use crate::asg::{Asg, AsgError, DType, NodeId, NodeType, Shape, Value};
use ndarray::{ArrayD, IxDyn};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AutogradError {
    #[error("ASG: {0}")]
    Asg(#[from] AsgError),
    #[error("Shape: {0}")]
    Shape(#[from] ShapeInferenceError),
    #[error("node {0} has no inferred shape; run shape inference on the forward graph first")]
    MissingShape(NodeId),
    #[error("cannot differentiate {op} on node {node}")]
    Unsupported { op: &'static str, node: NodeId },
}

pub type AutogradResult<T> = Result<T, AutogradError>;

/// Builder of gradient graphs for one forward graph.
pub struct Gradients {
    src: Asg,
    grad: Asg,
    /// Forward node -> accumulated gradient node in `grad`.
    gmap: HashMap<NodeId, NodeId>,
    /// Forward node -> its `External` image in `grad`.
    images: HashMap<NodeId, NodeId>,
    needs: HashSet<NodeId>,
}

impl Gradients {
    /// `src` must already carry shapes (see [`ShapeInference::run`]).
    pub fn new(src: Asg) -> Self {
        let grad_id = src.id + 1;
        Self {
            src,
            grad: Asg::new(grad_id, Some("grad".to_string())),
            gmap: HashMap::new(),
            images: HashMap::new(),
            needs: HashSet::new(),
        }
    }

    /// Builds the gradient graph of `loss_id` with respect to `wrt`.
    ///
    /// The returned graph has one output per entry of `wrt`. A requested node
    /// the loss does not depend on gets a zero gradient of its own shape.
    pub fn build(mut self, loss_id: NodeId, wrt: &[NodeId]) -> AutogradResult<Asg> {
        let order = ShapeInference::topological_order_from(&self.src, &[loss_id])?;
        self.mark_needs(&order, wrt)?;

        // Seed dL/dL = 1, broadcast when the loss is not a scalar.
        let one = self.lit_scalar(1.0);
        let seed = if self.shape_of(loss_id)?.is_empty() {
            one
        } else {
            let loss_im = self.reuse(loss_id)?;
            self.add_node(NodeType::Broadcast(one, loss_im))
        };
        self.gmap.insert(loss_id, seed);

        for &id in order.iter().rev() {
            let g = match self.gmap.get(&id).copied() {
                Some(g) => g,
                None => continue,
            };
            let node_type = self.src.get_node(id)?.node_type.clone();
            self.backprop(id, &node_type, g)?;
        }

        let mut outputs = Vec::with_capacity(wrt.len());
        for &target in wrt {
            let out = match self.gmap.get(&target).copied() {
                Some(g) => g,
                None => {
                    let shape = self.shape_of(target)?;
                    let zeros = ArrayD::<f32>::zeros(IxDyn(&shape));
                    self.grad.add_node(None, NodeType::Literal(Value::Tensor(zeros)))
                }
            };
            if let Some(name) = self.src.leaf_name(target).map(|n| format!("grad_{}", n)) {
                if let Ok(node) = self.grad.get_node_mut(out) {
                    node.name.get_or_insert(name);
                }
            }
            outputs.push(out);
        }
        self.grad.set_outputs(outputs);

        ShapeInference::run(&mut self.grad, &HashMap::new())?;
        Ok(self.grad)
    }

    /// A node needs a gradient when some requested node is among its ancestors.
    fn mark_needs(&mut self, order: &[NodeId], wrt: &[NodeId]) -> AutogradResult<()> {
        self.needs.extend(wrt.iter().copied());
        for &id in order {
            let node = self.src.get_node(id)?;
            if node.node_type.operands().iter().any(|op| self.needs.contains(op)) {
                self.needs.insert(id);
            }
        }
        Ok(())
    }

    fn backprop(&mut self, id: NodeId, node_type: &NodeType, g: NodeId) -> AutogradResult<()> {
        match node_type {
            NodeType::Input { .. }
            | NodeType::Parameter { .. }
            | NodeType::Literal(_)
            | NodeType::External { .. } => {}

            // -------- Binary --------
            NodeType::Add(a, b) => {
                if self.needs(*a) {
                    let ga = self.reduce_to(g, id, *a)?;
                    self.acc(*a, ga);
                }
                if self.needs(*b) {
                    let gb = self.reduce_to(g, id, *b)?;
                    self.acc(*b, gb);
                }
            }
            NodeType::Subtract(a, b) => {
                if self.needs(*a) {
                    let ga = self.reduce_to(g, id, *a)?;
                    self.acc(*a, ga);
                }
                if self.needs(*b) {
                    let neg = self.add_node(NodeType::Negate(g));
                    let gb = self.reduce_to(neg, id, *b)?;
                    self.acc(*b, gb);
                }
            }
            NodeType::Multiply(a, b) => {
                if self.needs(*a) {
                    let b_im = self.reuse(*b)?;
                    let ga = self.add_node(NodeType::Multiply(g, b_im));
                    let ga = self.reduce_to(ga, id, *a)?;
                    self.acc(*a, ga);
                }
                if self.needs(*b) {
                    let a_im = self.reuse(*a)?;
                    let gb = self.add_node(NodeType::Multiply(g, a_im));
                    let gb = self.reduce_to(gb, id, *b)?;
                    self.acc(*b, gb);
                }
            }
            NodeType::Divide(a, b) => {
                let b_im = self.reuse(*b)?;
                if self.needs(*a) {
                    // g / b
                    let ga = self.add_node(NodeType::Divide(g, b_im));
                    let ga = self.reduce_to(ga, id, *a)?;
                    self.acc(*a, ga);
                }
                if self.needs(*b) {
                    // -g * a / b^2
                    let a_im = self.reuse(*a)?;
                    let b2 = self.add_node(NodeType::Multiply(b_im, b_im));
                    let num = self.add_node(NodeType::Multiply(g, a_im));
                    let quot = self.add_node(NodeType::Divide(num, b2));
                    let gb = self.add_node(NodeType::Negate(quot));
                    let gb = self.reduce_to(gb, id, *b)?;
                    self.acc(*b, gb);
                }
            }
            NodeType::MatrixMultiply(a, b) => {
                let (sa, sb) = (self.shape_of(*a)?, self.shape_of(*b)?);
                if sa.is_empty() || sb.is_empty() {
                    // Scalar operand: plain scaling.
                    return self.backprop(id, &NodeType::Multiply(*a, *b), g);
                }
                if self.needs(*a) {
                    // g @ b^T
                    let b_im = self.reuse(*b)?;
                    let bt = self.add_node(NodeType::Transpose(b_im, 0, 1));
                    let ga = self.add_node(NodeType::MatrixMultiply(g, bt));
                    self.acc(*a, ga);
                }
                if self.needs(*b) {
                    // a^T @ g
                    let a_im = self.reuse(*a)?;
                    let at = self.add_node(NodeType::Transpose(a_im, 0, 1));
                    let gb = self.add_node(NodeType::MatrixMultiply(at, g));
                    self.acc(*b, gb);
                }
            }
            NodeType::GreaterThan(_, _) => {}

            // -------- Unary --------
            NodeType::Negate(x) => {
                if self.needs(*x) {
                    let gx = self.add_node(NodeType::Negate(g));
                    self.acc(*x, gx);
                }
            }
            NodeType::Exp(x) => {
                if self.needs(*x) {
                    let y = self.reuse(id)?;
                    let gx = self.add_node(NodeType::Multiply(g, y));
                    self.acc(*x, gx);
                }
            }
            NodeType::Log(x) => {
                if self.needs(*x) {
                    let x_im = self.reuse(*x)?;
                    let gx = self.add_node(NodeType::Divide(g, x_im));
                    self.acc(*x, gx);
                }
            }
            NodeType::Sqrt(x) => {
                if self.needs(*x) {
                    // g / (2 * sqrt(x))
                    let y = self.reuse(id)?;
                    let two = self.lit_scalar(2.0);
                    let denom = self.add_node(NodeType::Multiply(two, y));
                    let gx = self.add_node(NodeType::Divide(g, denom));
                    self.acc(*x, gx);
                }
            }
            NodeType::ReLU(x) => {
                if self.needs(*x) {
                    let zero = self.lit_scalar(0.0);
                    let x_im = self.reuse(*x)?;
                    let mask = self.add_node(NodeType::GreaterThan(x_im, zero));
                    let gx = self.add_node(NodeType::Multiply(g, mask));
                    self.acc(*x, gx);
                }
            }
            NodeType::Sigmoid(x) => {
                if self.needs(*x) {
                    // g * y * (1 - y)
                    let y = self.reuse(id)?;
                    let one = self.lit_scalar(1.0);
                    let one_minus_y = self.add_node(NodeType::Subtract(one, y));
                    let term = self.add_node(NodeType::Multiply(y, one_minus_y));
                    let gx = self.add_node(NodeType::Multiply(g, term));
                    self.acc(*x, gx);
                }
            }
            NodeType::Tanh(x) => {
                if self.needs(*x) {
                    // g * (1 - y^2)
                    let y = self.reuse(id)?;
                    let one = self.lit_scalar(1.0);
                    let y2 = self.add_node(NodeType::Multiply(y, y));
                    let term = self.add_node(NodeType::Subtract(one, y2));
                    let gx = self.add_node(NodeType::Multiply(g, term));
                    self.acc(*x, gx);
                }
            }
            NodeType::Softmax(x) => {
                if self.needs(*x) {
                    // y * (g - sum_last(g * y))
                    let y = self.reuse(id)?;
                    let n = self.len_of_axis(*x, -1)? as f32;
                    let gy = self.add_node(NodeType::Multiply(g, y));
                    let mean = self.add_node(NodeType::Mean(gy));
                    let n_lit = self.lit_scalar(n);
                    let sum = self.add_node(NodeType::Multiply(mean, n_lit));
                    let centered = self.add_node(NodeType::Subtract(g, sum));
                    let gx = self.add_node(NodeType::Multiply(y, centered));
                    self.acc(*x, gx);
                }
            }
            NodeType::Sparsemax(x) => {
                if self.needs(*x) {
                    // s * (g - sum(s * g) / sum(s)), s = support indicator
                    let y = self.reuse(id)?;
                    let zero = self.lit_scalar(0.0);
                    let support = self.add_node(NodeType::GreaterThan(y, zero));
                    let sg = self.add_node(NodeType::Multiply(support, g));
                    let sg_mean = self.add_node(NodeType::Mean(sg));
                    let s_mean = self.add_node(NodeType::Mean(support));
                    let v_hat = self.add_node(NodeType::Divide(sg_mean, s_mean));
                    let centered = self.add_node(NodeType::Subtract(g, v_hat));
                    let gx = self.add_node(NodeType::Multiply(support, centered));
                    self.acc(*x, gx);
                }
            }

            // -------- Reductions --------
            NodeType::Sum(x) => {
                if self.needs(*x) {
                    let x_im = self.reuse(*x)?;
                    let gx = self.add_node(NodeType::Broadcast(g, x_im));
                    self.acc(*x, gx);
                }
            }
            NodeType::Mean(x) => {
                if self.needs(*x) {
                    let n = self.len_of_axis(*x, -1)? as f32;
                    self.spread_mean(*x, g, n)?;
                }
            }
            NodeType::MeanAxis(x, axis) => {
                if self.needs(*x) {
                    let n = self.len_of_axis(*x, *axis)? as f32;
                    self.spread_mean(*x, g, n)?;
                }
            }
            NodeType::Variance(x) => {
                if self.needs(*x) {
                    // g * (2/n) * (x - mean(x))
                    let n = self.len_of_axis(*x, -1)? as f32;
                    let x_im = self.reuse(*x)?;
                    let mean_x = self.add_node(NodeType::Mean(x_im));
                    let centered = self.add_node(NodeType::Subtract(x_im, mean_x));
                    let two_over_n = self.lit_scalar(2.0 / n);
                    let factor = self.add_node(NodeType::Multiply(g, two_over_n));
                    let gx = self.add_node(NodeType::Multiply(factor, centered));
                    self.acc(*x, gx);
                }
            }

            // -------- Structure --------
            NodeType::Reshape(x, _) => {
                if self.needs(*x) {
                    let shape = self.shape_of(*x)?;
                    let data: Vec<f32> = shape.iter().map(|&d| d as f32).collect();
                    let shape_lit = ArrayD::from_shape_vec(IxDyn(&[data.len()]), data)
                        .map_err(|_| AutogradError::MissingShape(*x))?;
                    let shape_node = self.grad.add_node(None, NodeType::Literal(Value::Tensor(shape_lit)));
                    let gx = self.add_node(NodeType::Reshape(g, shape_node));
                    self.acc(*x, gx);
                }
            }
            NodeType::Transpose(x, a1, a2) => {
                if self.needs(*x) {
                    let gx = self.add_node(NodeType::Transpose(g, *a2, *a1));
                    self.acc(*x, gx);
                }
            }
            NodeType::Broadcast(x, _) => {
                if self.needs(*x) {
                    let x_im = self.reuse(*x)?;
                    let gx = self.add_node(NodeType::ReduceSumTo(g, x_im));
                    self.acc(*x, gx);
                }
            }
            NodeType::ReduceSumTo(x, _) => {
                if self.needs(*x) {
                    let x_im = self.reuse(*x)?;
                    let gx = self.add_node(NodeType::Broadcast(g, x_im));
                    self.acc(*x, gx);
                }
            }
            NodeType::Slice { input, axis, start, .. } => {
                if self.needs(*input) {
                    let like = self.reuse(*input)?;
                    let gx = self.add_node(NodeType::SliceGrad { grad_output: g, like, axis: *axis, start: *start });
                    self.acc(*input, gx);
                }
            }
            NodeType::SliceGrad { grad_output, axis, start, .. } => {
                if self.needs(*grad_output) {
                    let len = self.len_of_axis(*grad_output, *axis as isize)?;
                    let gx = self.add_node(NodeType::Slice { input: g, axis: *axis, start: *start, end: start + len });
                    self.acc(*grad_output, gx);
                }
            }
            NodeType::Concat { inputs, axis } => {
                let mut offset = 0;
                for &input in inputs {
                    let len = self.len_of_axis(input, *axis as isize)?;
                    if self.needs(input) {
                        let gx = self.add_node(NodeType::Slice { input: g, axis: *axis, start: offset, end: offset + len });
                        self.acc(input, gx);
                    }
                    offset += len;
                }
            }

            // -------- Lookup tables --------
            NodeType::Embedding { indices, weight } => {
                if self.needs(*indices) {
                    return Err(AutogradError::Unsupported { op: "Embedding(indices)", node: id });
                }
                if self.needs(*weight) {
                    let num_embeddings = self.len_of_axis(*weight, 0)?;
                    let idx_im = self.reuse(*indices)?;
                    let gw = self.add_node(NodeType::EmbeddingGrad { grad_output: g, indices: idx_im, num_embeddings });
                    self.acc(*weight, gw);
                }
            }
            NodeType::EmbeddingGrad { grad_output, indices, .. } => {
                if self.needs(*grad_output) {
                    let idx_im = self.reuse(*indices)?;
                    let gx = self.add_node(NodeType::Embedding { indices: idx_im, weight: g });
                    self.acc(*grad_output, gx);
                }
            }
        }
        Ok(())
    }

    fn needs(&self, id: NodeId) -> bool {
        self.needs.contains(&id)
    }

    /// `dx = broadcast(g / n)` for mean-like reductions.
    fn spread_mean(&mut self, x: NodeId, g: NodeId, n: f32) -> AutogradResult<()> {
        let inv_n = self.lit_scalar(1.0 / n);
        let scaled = self.add_node(NodeType::Multiply(g, inv_n));
        let x_im = self.reuse(x)?;
        let gx = self.add_node(NodeType::Broadcast(scaled, x_im));
        self.acc(x, gx);
        Ok(())
    }

    fn add_node(&mut self, node_type: NodeType) -> NodeId {
        self.grad.add_node(None, node_type)
    }

    fn lit_scalar(&mut self, v: f32) -> NodeId {
        self.grad.add_node(None, NodeType::Literal(Value::ScalarF32(v)))
    }

    /// Image of a forward node inside the gradient graph.
    fn reuse(&mut self, src_id: NodeId) -> AutogradResult<NodeId> {
        if let Some(&existing) = self.images.get(&src_id) {
            return Ok(existing);
        }
        let shape = self.shape_of(src_id)?;
        let dtype = self.src.get_node(src_id)?.dtype.unwrap_or(DType::F32);
        let name = format!("external_{}_{}", self.src.id, src_id);
        let id = self.grad.add_node(
            Some(name.clone()),
            NodeType::External { name, source_asg_id: self.src.id, source_node_id: src_id },
        );
        let node = self.grad.get_node_mut(id)?;
        node.shape = Some(shape);
        node.dtype = Some(dtype);
        self.images.insert(src_id, id);
        Ok(id)
    }

    /// dL/d(target) += contrib
    fn acc(&mut self, target: NodeId, contrib: NodeId) {
        let total = match self.gmap.get(&target).copied() {
            Some(prev) => self.add_node(NodeType::Add(prev, contrib)),
            None => contrib,
        };
        self.gmap.insert(target, total);
    }

    /// Sums `g` (shaped like `node`) down to the shape of `operand` when
    /// the operand was broadcast.
    fn reduce_to(&mut self, g: NodeId, node: NodeId, operand: NodeId) -> AutogradResult<NodeId> {
        if self.shape_of(node)? == self.shape_of(operand)? {
            return Ok(g);
        }
        let target = self.reuse(operand)?;
        Ok(self.add_node(NodeType::ReduceSumTo(g, target)))
    }

    fn shape_of(&self, src_id: NodeId) -> AutogradResult<Shape> {
        self.src.get_node(src_id)?.shape.clone().ok_or(AutogradError::MissingShape(src_id))
    }

    fn len_of_axis(&self, src_id: NodeId, axis: isize) -> AutogradResult<usize> {
        let shape = self.shape_of(src_id)?;
        if shape.is_empty() {
            return Ok(1);
        }
        let ax = normalize_axis(axis, shape.len()).ok_or(AutogradError::MissingShape(src_id))?;
        Ok(shape[ax])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{GraphContext, Tensor};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn gradient_outputs_follow_request_order() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input_with_shape(&ctx, "x", &[2, 3]);
        let w = Tensor::new_parameter(&ctx, "w", &[3, 1]);
        let unused = Tensor::new_parameter(&ctx, "unused", &[4]);
        let loss = x.dot(&w).sum();

        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(loss.node_id);
        ShapeInference::run(&mut graph, &HashMap::new()).unwrap();

        let grad = Gradients::new(graph).build(loss.node_id, &[w.node_id, unused.node_id]).unwrap();
        assert_eq!(grad.outputs.len(), 2);
        assert_eq!(grad.get_node(grad.outputs[0]).unwrap().shape, Some(vec![3, 1]));
        let zero = grad.get_node(grad.outputs[1]).unwrap();
        assert!(matches!(zero.node_type, NodeType::Literal(_)));
        assert_eq!(zero.shape, Some(vec![4]));
    }

    #[test]
    fn constant_branches_get_no_gradient_nodes() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input_with_shape(&ctx, "x", &[3]);
        let c = Tensor::new_literal(&ctx, ndarray::arr1(&[1.0, -1.0, 2.0]).into_dyn(), "c");
        let loss = (&x * &c.exp()).sum();

        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(loss.node_id);
        ShapeInference::run(&mut graph, &HashMap::new()).unwrap();

        let grad = Gradients::new(graph).build(loss.node_id, &[x.node_id]).unwrap();
        assert!(!grad.nodes.values().any(|n| matches!(n.node_type, NodeType::Exp(_))));
    }
}
