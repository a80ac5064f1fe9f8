//! Backend that executes the ASG on the CPU.
//!
//! Walks the graph in topological order and evaluates every node with `ndarray`.

use super::backend::{Backend, Memo, RuntimeError};
use crate::analysis::shape_inference::{broadcast_shapes, normalize_axis, resolve_reshape, ShapeInference};
use crate::asg::{Asg, AsgId, NodeId, NodeType, Value};
use ndarray::{arr0, concatenate, ArrayD, ArrayView2, Axis, Ix2, IxDyn, Slice, Zip};
use std::borrow::Cow;
use std::cmp::Ordering;

type RtResult<T> = Result<T, RuntimeError>;

/// Execution context for one graph plus the memo of graphs it references.
struct ExecutionContext<'a> {
    graph: &'a Asg,
    memo: Memo<Value>,
    nan_check: bool,
}

impl<'a> ExecutionContext<'a> {
    fn new(graph: &'a Asg, memo: Memo<Value>, nan_check: bool) -> Self {
        Self { graph, memo, nan_check }
    }

    fn fetch(&self, asg_id: AsgId, node_id: NodeId) -> RtResult<&Value> {
        self.memo.get(&(asg_id, node_id)).ok_or(RuntimeError::NodeNotFound(node_id, asg_id))
    }

    fn arg(&self, node_id: NodeId) -> RtResult<Cow<'_, ArrayD<f32>>> {
        Ok(as_array(self.fetch(self.graph.id, node_id)?))
    }

    /// Evaluates one node. Operands are already in the memo because nodes
    /// are visited in topological order.
    fn evaluate_node(&mut self, node_id: NodeId) -> RtResult<()> {
        let asg_id = self.graph.id;
        if self.memo.contains_key(&(asg_id, node_id)) {
            return Ok(());
        }
        let graph = self.graph;
        let node = graph.nodes.get(&node_id).ok_or(RuntimeError::NodeNotFound(node_id, asg_id))?;

        let result = match &node.node_type {
            NodeType::Input { name } => return Err(RuntimeError::MissingInput(name.clone(), node.id)),
            NodeType::Parameter { name } => return Err(RuntimeError::MissingParameter(name.clone(), node.id)),
            NodeType::Literal(value) => value.clone(),
            NodeType::External { source_asg_id, source_node_id, .. } => {
                self.fetch(*source_asg_id, *source_node_id)?.clone()
            }

            NodeType::Add(l, r) => Value::Tensor(binary(&*self.arg(*l)?, &*self.arg(*r)?, |a, b| a + b)?),
            NodeType::Subtract(l, r) => Value::Tensor(binary(&*self.arg(*l)?, &*self.arg(*r)?, |a, b| a - b)?),
            NodeType::Multiply(l, r) => Value::Tensor(binary(&*self.arg(*l)?, &*self.arg(*r)?, |a, b| a * b)?),
            NodeType::Divide(l, r) => Value::Tensor(binary(&*self.arg(*l)?, &*self.arg(*r)?, |a, b| a / b)?),
            NodeType::GreaterThan(l, r) => Value::Tensor(binary(&*self.arg(*l)?, &*self.arg(*r)?, |a, b| {
                if a > b {
                    1.0
                } else {
                    0.0
                }
            })?),
            NodeType::MatrixMultiply(l, r) => Value::Tensor(op_matmul(&*self.arg(*l)?, &*self.arg(*r)?)?),

            NodeType::Negate(x) => Value::Tensor(self.arg(*x)?.mapv(|v| -v)),
            NodeType::Exp(x) => Value::Tensor(self.arg(*x)?.mapv(f32::exp)),
            NodeType::Log(x) => Value::Tensor(self.arg(*x)?.mapv(f32::ln)),
            NodeType::Sqrt(x) => Value::Tensor(self.arg(*x)?.mapv(f32::sqrt)),
            NodeType::ReLU(x) => Value::Tensor(self.arg(*x)?.mapv(|v| v.max(0.0))),
            NodeType::Sigmoid(x) => Value::Tensor(self.arg(*x)?.mapv(|v| 1.0 / (1.0 + (-v).exp()))),
            NodeType::Tanh(x) => Value::Tensor(self.arg(*x)?.mapv(f32::tanh)),
            NodeType::Softmax(x) => Value::Tensor(op_softmax(&*self.arg(*x)?)),
            NodeType::Sparsemax(x) => Value::Tensor(op_sparsemax(&*self.arg(*x)?)),

            NodeType::Sum(x) => Value::Tensor(arr0(self.arg(*x)?.sum()).into_dyn()),
            NodeType::Mean(x) => Value::Tensor(op_mean_axis(&*self.arg(*x)?, -1)?),
            NodeType::MeanAxis(x, axis) => Value::Tensor(op_mean_axis(&*self.arg(*x)?, *axis)?),
            NodeType::Variance(x) => Value::Tensor(op_variance(&*self.arg(*x)?)?),

            NodeType::Reshape(x, shape) => Value::Tensor(op_reshape(&*self.arg(*x)?, &*self.arg(*shape)?)?),
            NodeType::Transpose(x, a1, a2) => Value::Tensor(op_transpose(&*self.arg(*x)?, *a1, *a2)?),
            NodeType::Broadcast(x, target) => {
                let target_shape = self.arg(*target)?.shape().to_vec();
                Value::Tensor(op_broadcast(&*self.arg(*x)?, &target_shape)?)
            }
            NodeType::ReduceSumTo(x, target) => {
                let target_shape = self.arg(*target)?.shape().to_vec();
                Value::Tensor(op_reduce_sum_to(&*self.arg(*x)?, &target_shape)?)
            }
            NodeType::Slice { input, axis, start, end } => {
                Value::Tensor(op_slice(&*self.arg(*input)?, *axis, *start, *end)?)
            }
            NodeType::SliceGrad { grad_output, like, axis, start } => {
                let like_shape = self.arg(*like)?.shape().to_vec();
                Value::Tensor(op_slice_grad(&*self.arg(*grad_output)?, &like_shape, *axis, *start)?)
            }
            NodeType::Concat { inputs, axis } => {
                let parts = inputs.iter().map(|id| self.arg(*id)).collect::<RtResult<Vec<_>>>()?;
                let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
                let joined = concatenate(Axis(*axis), &views).map_err(|e| RuntimeError::ShapeError(e.to_string()))?;
                Value::Tensor(joined)
            }

            NodeType::Embedding { indices, weight } => {
                Value::Tensor(op_embedding(&*self.arg(*indices)?, &*self.arg(*weight)?)?)
            }
            NodeType::EmbeddingGrad { grad_output, indices, num_embeddings } => {
                Value::Tensor(op_embedding_grad(&*self.arg(*grad_output)?, &*self.arg(*indices)?, *num_embeddings)?)
            }
        };

        if self.nan_check && !node.node_type.operands().is_empty() {
            if let Value::Tensor(arr) = &result {
                if arr.iter().any(|v| !v.is_finite()) {
                    return Err(RuntimeError::NumericalInstability {
                        node: node_id,
                        op: node.node_type.op_name().to_string(),
                    });
                }
            }
        }

        self.memo.insert((asg_id, node_id), result);
        Ok(())
    }
}

/// CPU backend. With `nan_check` enabled every computed node is scanned for NaN and Inf.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend {
    nan_check: bool,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self { nan_check: false }
    }

    pub fn with_nan_check(mut self, enabled: bool) -> Self {
        self.nan_check = enabled;
        self
    }
}

impl Backend for CpuBackend {
    type DeviceData = Value;

    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError> {
        let sorted_nodes = ShapeInference::topological_sort(main_asg)
            .map_err(|e| RuntimeError::ShapeError(format!("Topological sort failed: {}", e)))?;

        let mut context = ExecutionContext::new(main_asg, initial_memo, self.nan_check);
        for node_id in sorted_nodes {
            context.evaluate_node(node_id)?;
        }

        let results = main_asg
            .outputs
            .iter()
            .map(|id| context.fetch(main_asg.id, *id).cloned())
            .collect::<RtResult<Vec<_>>>()?;
        Ok((results, context.memo))
    }
}

fn as_array(value: &Value) -> Cow<'_, ArrayD<f32>> {
    match value {
        Value::Tensor(arr) => Cow::Borrowed(arr),
        other => Cow::Owned(other.to_array()),
    }
}

/// Elementwise op with numpy broadcasting. Shapes are checked first since
/// `ndarray` panics on incompatible co-broadcasts.
fn binary(a: &ArrayD<f32>, b: &ArrayD<f32>, f: impl Fn(f32, f32) -> f32) -> RtResult<ArrayD<f32>> {
    if a.shape() == b.shape() {
        return Ok(Zip::from(a).and(b).map_collect(|&x, &y| f(x, y)));
    }
    let out = broadcast_shapes(a.shape(), b.shape())
        .ok_or_else(|| RuntimeError::ShapeError(format!("Cannot broadcast {:?} with {:?}", a.shape(), b.shape())))?;
    let err = || RuntimeError::ShapeError(format!("Cannot broadcast to {:?}", out));
    let av = a.broadcast(IxDyn(&out)).ok_or_else(err)?;
    let bv = b.broadcast(IxDyn(&out)).ok_or_else(err)?;
    Ok(Zip::from(av).and(bv).map_collect(|&x, &y| f(x, y)))
}

fn as_matrix(a: &ArrayD<f32>) -> RtResult<ArrayView2<'_, f32>> {
    a.view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| RuntimeError::ShapeError(format!("Expected a matrix, got shape {:?}", a.shape())))
}

fn op_matmul(a: &ArrayD<f32>, b: &ArrayD<f32>) -> RtResult<ArrayD<f32>> {
    if a.ndim() == 0 || b.ndim() == 0 {
        return binary(a, b, |x, y| x * y);
    }
    let (am, bm) = (as_matrix(a)?, as_matrix(b)?);
    if am.ncols() != bm.nrows() {
        return Err(RuntimeError::ShapeError(format!(
            "Incompatible matmul shapes: {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    Ok(am.dot(&bm).into_dyn())
}

fn last_axis(a: &ArrayD<f32>) -> Option<Axis> {
    a.ndim().checked_sub(1).map(Axis)
}

fn op_softmax(a: &ArrayD<f32>) -> ArrayD<f32> {
    let mut out = a.clone();
    match last_axis(a) {
        Some(axis) => {
            for mut lane in out.lanes_mut(axis) {
                let max = lane.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                lane.mapv_inplace(|v| (v - max).exp());
                let sum = lane.sum();
                lane.mapv_inplace(|v| v / sum);
            }
        }
        None => out.fill(1.0),
    }
    out
}

/// Projection of every last-axis lane onto the probability simplex.
fn op_sparsemax(a: &ArrayD<f32>) -> ArrayD<f32> {
    let mut out = a.clone();
    let axis = match last_axis(a) {
        Some(axis) => axis,
        None => {
            out.fill(1.0);
            return out;
        }
    };
    for mut lane in out.lanes_mut(axis) {
        // Threshold search in f64.
        let mut sorted: Vec<f64> = lane.iter().map(|&v| v as f64).collect();
        sorted.sort_by(|x, y| y.partial_cmp(x).unwrap_or(Ordering::Equal));
        let mut cumsum = 0.0f64;
        let mut tau = 0.0f64;
        for (k, &z) in sorted.iter().enumerate() {
            cumsum += z;
            let k = (k + 1) as f64;
            if 1.0 + k * z > cumsum {
                tau = (cumsum - 1.0) / k;
            }
        }
        lane.mapv_inplace(|v| ((v as f64 - tau).max(0.0)) as f32);
    }
    out
}

fn op_mean_axis(a: &ArrayD<f32>, axis: isize) -> RtResult<ArrayD<f32>> {
    if a.ndim() == 0 {
        return Ok(a.clone());
    }
    let ax = normalize_axis(axis, a.ndim())
        .map(Axis)
        .ok_or_else(|| RuntimeError::ShapeError(format!("Axis {} out of range for {:?}", axis, a.shape())))?;
    let mean = a
        .mean_axis(ax)
        .ok_or_else(|| RuntimeError::ShapeError(format!("Mean over an empty axis of {:?}", a.shape())))?;
    Ok(mean.insert_axis(ax))
}

fn op_variance(a: &ArrayD<f32>) -> RtResult<ArrayD<f32>> {
    match last_axis(a) {
        Some(axis) if a.len_of(axis) > 0 => Ok(a.var_axis(axis, 0.0).insert_axis(axis)),
        Some(_) => Err(RuntimeError::ShapeError(format!("Variance over an empty axis of {:?}", a.shape()))),
        None => Ok(ArrayD::zeros(IxDyn(&[]))),
    }
}

fn op_reshape(a: &ArrayD<f32>, shape: &ArrayD<f32>) -> RtResult<ArrayD<f32>> {
    let target: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
    let resolved = resolve_reshape(a.len(), &target)
        .ok_or_else(|| RuntimeError::ShapeError(format!("Cannot reshape {:?} into {:?}", a.shape(), target)))?;
    a.to_shape(IxDyn(&resolved))
        .map(|view| view.to_owned())
        .map_err(|e| RuntimeError::ShapeError(e.to_string()))
}

fn op_transpose(a: &ArrayD<f32>, axis1: usize, axis2: usize) -> RtResult<ArrayD<f32>> {
    if axis1 >= a.ndim() || axis2 >= a.ndim() {
        return Err(RuntimeError::ShapeError(format!(
            "Transpose axes ({}, {}) out of range for {:?}",
            axis1,
            axis2,
            a.shape()
        )));
    }
    let mut axes: Vec<usize> = (0..a.ndim()).collect();
    axes.swap(axis1, axis2);
    Ok(a.clone().permuted_axes(axes).as_standard_layout().to_owned())
}

fn op_broadcast(a: &ArrayD<f32>, target: &[usize]) -> RtResult<ArrayD<f32>> {
    if a.len() == 1 {
        let v = a.iter().next().copied().unwrap_or(0.0);
        return Ok(ArrayD::from_elem(IxDyn(target), v));
    }
    a.broadcast(IxDyn(target))
        .map(|view| view.to_owned())
        .ok_or_else(|| RuntimeError::ShapeError(format!("Cannot broadcast {:?} to {:?}", a.shape(), target)))
}

/// Sums the axes that were broadcast so the result has shape `target`.
fn op_reduce_sum_to(a: &ArrayD<f32>, target: &[usize]) -> RtResult<ArrayD<f32>> {
    let mut out = a.clone();
    while out.ndim() > target.len() {
        out = out.sum_axis(Axis(0));
    }
    for (i, &dim) in target.iter().enumerate() {
        if i < out.ndim() && dim == 1 && out.shape()[i] != 1 {
            out = out.sum_axis(Axis(i)).insert_axis(Axis(i));
        }
    }
    if out.shape() != target {
        return Err(RuntimeError::ShapeError(format!("Cannot reduce {:?} to {:?}", a.shape(), target)));
    }
    Ok(out)
}

fn op_slice(a: &ArrayD<f32>, axis: usize, start: usize, end: usize) -> RtResult<ArrayD<f32>> {
    if axis >= a.ndim() || start > end || end > a.shape()[axis] {
        return Err(RuntimeError::ShapeError(format!(
            "Slice {}..{} on axis {} out of range for {:?}",
            start,
            end,
            axis,
            a.shape()
        )));
    }
    Ok(a.slice_axis(Axis(axis), Slice::from(start..end)).to_owned())
}

fn op_slice_grad(g: &ArrayD<f32>, like: &[usize], axis: usize, start: usize) -> RtResult<ArrayD<f32>> {
    let mut out = ArrayD::zeros(IxDyn(like));
    let len = g.shape().get(axis).copied().unwrap_or(0);
    if axis >= like.len() || start + len > like[axis] {
        return Err(RuntimeError::ShapeError(format!(
            "Slice gradient {:?} at {} on axis {} does not fit {:?}",
            g.shape(),
            start,
            axis,
            like
        )));
    }
    let mut window = out.slice_axis_mut(Axis(axis), Slice::from(start..start + len));
    if window.shape() != g.shape() {
        return Err(RuntimeError::ShapeError(format!("Slice gradient {:?} does not fit {:?}", g.shape(), like)));
    }
    window.assign(g);
    Ok(out)
}

/// Validates an integer-coded f32 index.
fn table_index(raw: f32, size: usize) -> RtResult<usize> {
    if raw < 0.0 || raw.fract() != 0.0 || raw as usize >= size {
        return Err(RuntimeError::IndexOutOfRange { index: raw, size });
    }
    Ok(raw as usize)
}

fn op_embedding(indices: &ArrayD<f32>, weight: &ArrayD<f32>) -> RtResult<ArrayD<f32>> {
    let table = as_matrix(weight)?;
    let (num_embeddings, dim) = table.dim();

    let mut data = Vec::with_capacity(indices.len() * dim);
    for &raw in indices.iter() {
        let idx = table_index(raw, num_embeddings)?;
        data.extend(table.row(idx).iter().copied());
    }

    let mut shape = indices.shape().to_vec();
    shape.push(dim);
    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| RuntimeError::ShapeError(e.to_string()))
}

/// Scatter-add of `grad_output[*, dim]` into the rows addressed by `indices[*]`.
fn op_embedding_grad(grad: &ArrayD<f32>, indices: &ArrayD<f32>, num_embeddings: usize) -> RtResult<ArrayD<f32>> {
    let dim = grad.shape().last().copied().unwrap_or(1);
    let rows = grad
        .to_shape((indices.len(), dim))
        .map_err(|e| RuntimeError::ShapeError(e.to_string()))?;

    let mut out = ndarray::Array2::<f32>::zeros((num_embeddings, dim));
    for (i, &raw) in indices.iter().enumerate() {
        let idx = table_index(raw, num_embeddings)?;
        let mut row = out.row_mut(idx);
        row += &rows.row(i);
    }
    Ok(out.into_dyn())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn sparsemax_rows_lie_on_the_simplex() {
        let z = arr2(&[[1.0, 0.5, -1.0, 2.0], [0.1, 0.1, 0.1, 0.1], [3.0, -2.0, 0.0, 0.0]]).into_dyn();
        let p = op_sparsemax(&z);
        for row in p.lanes(Axis(1)) {
            assert!((row.sum() - 1.0).abs() < 1e-6);
            assert!(row.iter().all(|&v| v >= 0.0));
        }
        // A dominant entry takes all the mass.
        assert_eq!(p[[2, 0]], 1.0);
        assert!((p[[1, 2]] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn sparsemax_stays_on_the_simplex_for_wide_and_large_rows() {
        let mut rng = StdRng::seed_from_u64(17);
        for &width in &[1usize, 2, 3, 7, 64, 300] {
            for &scale in &[0.01f32, 0.1, 1.0, 10.0, 100.0, 1000.0] {
                let z = ArrayD::from_shape_fn(IxDyn(&[50, width]), |_| rng.gen_range(-1.0f32..1.0) * scale);
                let p = op_sparsemax(&z);
                for (zr, pr) in z.lanes(Axis(1)).into_iter().zip(p.lanes(Axis(1))) {
                    assert!(pr.iter().all(|&v| v >= 0.0), "negative entry at width {} scale {}", width, scale);
                    let sum: f64 = pr.iter().map(|&v| v as f64).sum();
                    assert!((sum - 1.0).abs() <= 1e-6, "sum {} at width {} scale {}", sum, width, scale);

                    // The largest entry is always in the support, so it pins the threshold.
                    let top = (0..width).max_by(|&a, &b| zr[a].total_cmp(&zr[b])).unwrap();
                    let tau = zr[top] as f64 - pr[top] as f64;
                    assert!(tau >= zr[top] as f64 - 1.0 - 1e-6);
                    for (&zv, &pv) in zr.iter().zip(pr.iter()) {
                        if (zv as f64) < tau - 1e-6 {
                            assert_eq!(pv, 0.0, "entry {} below threshold {} kept mass", zv, tau);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn softmax_normalizes_each_row() {
        let z = arr2(&[[1.0, 2.0, 3.0], [0.0, 0.0, 0.0]]).into_dyn();
        let p = op_softmax(&z);
        for row in p.lanes(Axis(1)) {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert!((p[[1, 0]] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn broadcasting_mismatch_is_an_error() {
        let a = arr2(&[[1.0, 2.0, 3.0]]).into_dyn();
        let b = arr1(&[1.0, 2.0]).into_dyn();
        assert!(matches!(binary(&a, &b, |x, y| x + y), Err(RuntimeError::ShapeError(_))));
    }

    #[test]
    fn reduce_sum_to_undoes_broadcast() {
        let g = ArrayD::from_elem(IxDyn(&[4, 3]), 1.0);
        let r = op_reduce_sum_to(&g, &[1, 3]).unwrap();
        assert_eq!(r, arr2(&[[4.0, 4.0, 4.0]]).into_dyn());
        let s = op_reduce_sum_to(&g, &[3]).unwrap();
        assert_eq!(s, arr1(&[4.0, 4.0, 4.0]).into_dyn());
    }

    #[test]
    fn embedding_rejects_out_of_range_indices() {
        let w = arr2(&[[0.0, 1.0], [2.0, 3.0]]).into_dyn();
        let ok = op_embedding(&arr1(&[1.0, 0.0]).into_dyn(), &w).unwrap();
        assert_eq!(ok, arr2(&[[2.0, 3.0], [0.0, 1.0]]).into_dyn());
        let err = op_embedding(&arr1(&[2.0]).into_dyn(), &w).unwrap_err();
        assert_eq!(err, RuntimeError::IndexOutOfRange { index: 2.0, size: 2 });
    }

    #[test]
    fn nan_check_reports_the_offending_node() {
        let mut asg = Asg::new(0, None);
        let x = asg.add_node(None, NodeType::Literal(Value::Tensor(arr1(&[-1.0]).into_dyn())));
        let root = asg.add_node(None, NodeType::Sqrt(x));
        asg.set_output(root);

        assert!(CpuBackend::new().run(&asg, Memo::new()).is_ok());
        let err = CpuBackend::new().with_nan_check(true).run(&asg, Memo::new()).unwrap_err();
        assert_eq!(err, RuntimeError::NumericalInstability { node: root, op: "Sqrt".to_string() });
    }
}
