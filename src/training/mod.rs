//! Training and validation loop.
//!
//! The loop follows the usual graph workflow:
//! 1. build the forward graph once for the training batch size;
//! 2. run shape inference and build the gradient graph w.r.t. every
//!    learnable parameter of the [`Model`];
//! 3. per batch: bind data and parameters, run forward, run the gradient
//!    graph on the forward memo, step the optimizer, fold the batch
//!    statistics into the normalization buffers.
//!
//! Validation runs inference-mode graphs (one per distinct batch size) over
//! non-overlapping slices of the validation set and classifies every
//! `(prediction, target)` row pair into a [`ConfusionMatrix`].

use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
use crate::asg::{Asg, NodeId, Value};
use crate::autograd::{AutogradError, Gradients};
use crate::data::{row_chunks, DataError, DataLoader};
use crate::losses::{tabnet_cost, DEFAULT_LAMBDA_SPARSE};
use crate::metrics::{ConfusionMatrix, MatchType};
use crate::nn::{Model, Module, NnError};
use crate::optimizers::{Adam, Optimizer, OptimizerError};
use crate::runtime::backend::{bind_inputs, Backend, Memo, RuntimeError};
use crate::runtime::cpu_backend::CpuBackend;
use crate::tensor::{RunningUpdate, Tensor};
use ndarray::{concatenate, ArrayD, Axis, Slice};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_EPOCHS: usize = 10;
pub const DEFAULT_BATCH_SIZE: usize = 1024;
pub const DEFAULT_VALIDATE_EVERY: usize = 1;

/// Task loss from `(prediction, target)`.
pub type CostFn = Box<dyn Fn(&Tensor, &Tensor) -> Tensor>;
/// Classifies one `(prediction row, target row)` pair.
pub type MatchTypeFn = Box<dyn Fn(&[f32], &[f32]) -> MatchType>;
/// Called after every optimizer step with `(epoch, batch, cost)`.
pub type CostObserver = Box<dyn FnMut(usize, usize, f32)>;
/// Called after every validation pass with the matrix and the mean cost.
pub type ValidationObserver = Box<dyn FnMut(&ConfusionMatrix, f32)>;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("invalid training configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Nn(#[from] NnError),

    #[error(transparent)]
    Shape(#[from] ShapeInferenceError),

    #[error(transparent)]
    Autograd(#[from] AutogradError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("non-finite value produced by {op} at node {node}; graph dumped to {dump:?}")]
    NumericalInstability { node: NodeId, op: String, dump: Option<PathBuf> },
}

pub type TrainResult<T> = Result<T, TrainError>;

/// Options of [`train`]. `None` fields take the documented default.
#[derive(Default)]
pub struct TrainOpts {
    /// Default 10.
    pub epochs: Option<usize>,
    /// Default 1024.
    pub batch_size: Option<usize>,
    /// Validate every n-th epoch. Default 1.
    pub validate_every: Option<usize>,
    /// Default Adam with learning rate 1e-3.
    pub solver: Option<Box<dyn Optimizer>>,
    /// Required.
    pub cost_fn: Option<CostFn>,
    /// Weight of the module's auxiliary loss. Default 1e-3.
    pub lambda_sparse: Option<f32>,
    pub cost_observer: Option<CostObserver>,
    pub validation_observer: Option<ValidationObserver>,
    /// Required when validation data is given.
    pub match_type_for: Option<MatchTypeFn>,
    /// Checks every computed value for NaN/Inf and dumps the graph on failure.
    pub dev_mode: bool,
    /// Where DevMode dumps go. Default the system temp dir.
    pub dev_graph_dump_dir: Option<PathBuf>,
    /// Seed of the padding rows. Default 0.
    pub seed: Option<u64>,
}

/// What a training run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainReport {
    /// Mean cost over the batches of every epoch.
    pub epoch_costs: Vec<f32>,
    pub steps: usize,
    pub validation: Option<ConfusionMatrix>,
    pub validation_cost: Option<f32>,
}

impl TrainReport {
    pub fn final_cost(&self) -> Option<f32> {
        self.epoch_costs.last().copied()
    }
}

/// A forward graph with named data inputs and the nodes the loop reads.
struct ForwardGraph {
    graph: Asg,
    x: String,
    y: Option<String>,
    output: NodeId,
    cost: Option<NodeId>,
    updates: Vec<RunningUpdate>,
}

struct GraphPlan<'a> {
    tag: String,
    x_shape: Vec<usize>,
    y_shape: Option<Vec<usize>>,
    training: bool,
    cost_fn: Option<&'a CostFn>,
    lambda: f32,
}

fn build_forward(model: &Model, module: &dyn Module, plan: GraphPlan<'_>) -> TrainResult<ForwardGraph> {
    let was_training = model.is_training();
    model.set_training(plan.training);
    let mark = model.context().borrow().running_updates_mark();
    let built = append_forward(model, module, &plan);
    model.set_training(was_training);
    let (x, y, output, cost) = built?;

    let updates = if plan.training { model.context().borrow().running_updates_since(mark) } else { Vec::new() };
    let mut outputs = vec![output];
    outputs.extend(cost);
    outputs.extend(updates.iter().map(|u| u.batch_stat));

    let mut graph = model.context().borrow().main_graph().clone();
    graph.set_outputs(outputs);
    ShapeInference::run(&mut graph, &HashMap::new())?;
    debug!(graph = %plan.tag, nodes = graph.nodes.len(), running_updates = updates.len(), "built forward graph");
    Ok(ForwardGraph { graph, x, y, output, cost, updates })
}

type Appended = (String, Option<String>, NodeId, Option<NodeId>);

fn append_forward(model: &Model, module: &dyn Module, plan: &GraphPlan<'_>) -> TrainResult<Appended> {
    let x_name = format!("{}.x", plan.tag);
    let x = Tensor::new_input_with_shape(model.context(), &x_name, &plan.x_shape);
    let forward = module.forward(&[x])?;

    let (y_name, cost) = match (&plan.y_shape, plan.cost_fn) {
        (Some(y_shape), Some(cost_fn)) => {
            let y_name = format!("{}.y", plan.tag);
            let y = Tensor::new_input_with_shape(model.context(), &y_name, y_shape);
            let task = cost_fn(&forward.output, &y);
            let cost = match &forward.loss {
                Some(reg) => tabnet_cost(&task, reg, plan.lambda),
                None => task,
            };
            (Some(y_name), Some(cost.node_id))
        }
        _ => (None, None),
    };
    Ok((x_name, y_name, forward.output.node_id, cost))
}

fn batch_shape(data: &ArrayD<f32>, rows: usize) -> Vec<usize> {
    let mut shape = data.shape().to_vec();
    if let Some(first) = shape.first_mut() {
        *first = rows;
    }
    shape
}

fn rows_of(data: &ArrayD<f32>) -> usize {
    data.shape().first().copied().unwrap_or(0)
}

fn scalar_of(value: &Value) -> f32 {
    value.to_array().iter().copied().next().unwrap_or(f32::NAN)
}

/// Runs `graph`, turning DevMode instability reports into a dump plus
/// [`TrainError::NumericalInstability`].
fn execute(backend: &CpuBackend, graph: &Asg, memo: Memo<Value>, dump_dir: Option<&Path>) -> TrainResult<(Vec<Value>, Memo<Value>)> {
    match backend.run(graph, memo) {
        Ok(result) => Ok(result),
        Err(RuntimeError::NumericalInstability { node, op }) => {
            let dump = dump_dir.and_then(|dir| dump_graph(graph, dir, node));
            Err(TrainError::NumericalInstability { node, op, dump })
        }
        Err(e) => Err(e.into()),
    }
}

fn dump_graph(graph: &Asg, dir: &Path, node: NodeId) -> Option<PathBuf> {
    let path = dir.join(format!("rustytab-graph{}-node{}-{}.json", graph.id, node, std::process::id()));
    let written = serde_json::to_vec_pretty(graph)
        .map_err(|e| e.to_string())
        .and_then(|bytes| std::fs::write(&path, bytes).map_err(|e| e.to_string()));
    match written {
        Ok(()) => {
            warn!(path = %path.display(), node, "numerical instability, graph dumped");
            Some(path)
        }
        Err(e) => {
            warn!(error = %e, node, "numerical instability, graph dump failed");
            None
        }
    }
}

/// Trains `module` (built on `model`) on `train_x`/`train_y`.
///
/// Validation runs when `validate_x` has rows. Any build or execution error
/// aborts the run.
pub fn train(
    model: &Model,
    module: &dyn Module,
    train_x: &ArrayD<f32>,
    train_y: &ArrayD<f32>,
    validate_x: &ArrayD<f32>,
    validate_y: &ArrayD<f32>,
    mut opts: TrainOpts,
) -> TrainResult<TrainReport> {
    let epochs = opts.epochs.unwrap_or(DEFAULT_EPOCHS);
    let batch_size = opts.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
    let validate_every = opts.validate_every.unwrap_or(DEFAULT_VALIDATE_EVERY);
    let lambda = opts.lambda_sparse.unwrap_or(DEFAULT_LAMBDA_SPARSE);
    let cost_fn = opts.cost_fn.take().ok_or_else(|| TrainError::Config("a cost function is required".to_string()))?;
    if epochs == 0 || batch_size == 0 || validate_every == 0 {
        return Err(TrainError::Config(format!(
            "epochs ({}), batch size ({}) and validation interval ({}) must be positive",
            epochs, batch_size, validate_every
        )));
    }
    let validating = rows_of(validate_x) > 0;
    if validating && opts.match_type_for.is_none() {
        return Err(TrainError::Config("a match type classifier is required for validation".to_string()));
    }
    if validating && rows_of(validate_y) != rows_of(validate_x) {
        return Err(DataError::RowMismatch { features: rows_of(validate_x), labels: rows_of(validate_y) }.into());
    }

    let mut solver: Box<dyn Optimizer> = match opts.solver.take() {
        Some(solver) => solver,
        None => Box::new(Adam::default()),
    };
    let backend = CpuBackend::new().with_nan_check(opts.dev_mode);
    let dump_dir = opts.dev_mode.then(|| opts.dev_graph_dump_dir.clone().unwrap_or_else(std::env::temp_dir));

    let forward = build_forward(
        model,
        module,
        GraphPlan {
            tag: "train".to_string(),
            x_shape: batch_shape(train_x, batch_size),
            y_shape: Some(batch_shape(train_y, batch_size)),
            training: true,
            cost_fn: Some(&cost_fn),
            lambda,
        },
    )?;
    let (x_name, y_name, cost_id) = match (&forward.y, forward.cost) {
        (Some(y), Some(cost)) => (forward.x.clone(), y.clone(), cost),
        _ => return Err(TrainError::Config("training graph has no cost".to_string())),
    };

    let param_names = model.parameter_names();
    let wrt: Vec<NodeId> = model.learnables().iter().map(|t| t.node_id).collect();
    let grad_graph = Gradients::new(forward.graph.clone()).build(cost_id, &wrt)?;
    info!(
        parameters = param_names.len(),
        forward_nodes = forward.graph.nodes.len(),
        grad_nodes = grad_graph.nodes.len(),
        batch_size,
        epochs,
        "training graph ready"
    );

    let mut loader = DataLoader::with_seed(train_x.clone(), train_y.clone(), batch_size, opts.seed.unwrap_or(0))?;
    let mut eval_graphs: HashMap<usize, ForwardGraph> = HashMap::new();
    let mut report = TrainReport::default();

    for epoch in 0..epochs {
        loader.reset();
        let mut epoch_cost = 0.0f32;
        let mut batches = 0usize;

        for (batch_index, batch) in loader.by_ref().enumerate() {
            let mut values = model.bindings();
            values.insert(x_name.clone(), Value::Tensor(batch.features));
            values.insert(y_name.clone(), Value::Tensor(batch.labels));

            let memo = bind_inputs(&forward.graph, &values);
            let (results, forward_memo) = execute(&backend, &forward.graph, memo, dump_dir.as_deref())?;
            let cost = results.get(1).map(scalar_of).unwrap_or(f32::NAN);

            let (grads, _) = execute(&backend, &grad_graph, forward_memo.clone(), dump_dir.as_deref())?;
            let gradients: HashMap<String, ArrayD<f32>> =
                param_names.iter().cloned().zip(grads.iter().map(Value::to_array)).collect();
            model.apply_gradients(solver.as_mut(), &gradients)?;

            for update in &forward.updates {
                let Some(stat) = forward_memo.get(&(forward.graph.id, update.batch_stat)) else {
                    warn!(buffer = %update.buffer, "batch statistic was not computed");
                    continue;
                };
                if !model.update_buffer(&update.buffer, &stat.to_array(), update.momentum) {
                    warn!(buffer = %update.buffer, "running statistic shape changed, update skipped");
                }
            }

            debug!(epoch, batch = batch_index, cost, "step");
            if let Some(observer) = opts.cost_observer.as_mut() {
                observer(epoch, batch_index, cost);
            }
            epoch_cost += cost;
            batches += 1;
            report.steps += 1;
        }

        let mean_cost = epoch_cost / batches.max(1) as f32;
        report.epoch_costs.push(mean_cost);
        info!(epoch, cost = mean_cost, batches, "epoch finished");

        if validating && (epoch + 1) % validate_every == 0 {
            let classify = opts
                .match_type_for
                .as_ref()
                .ok_or_else(|| TrainError::Config("a match type classifier is required for validation".to_string()))?;
            let (matrix, cost) = validate(
                model,
                module,
                &mut eval_graphs,
                validate_x,
                validate_y,
                batch_size,
                &cost_fn,
                lambda,
                classify,
                &backend,
                dump_dir.as_deref(),
            )?;
            info!(
                epoch,
                cost,
                accuracy = matrix.accuracy(),
                precision = matrix.precision(),
                recall = matrix.recall(),
                f1 = matrix.f1(),
                "validation"
            );
            if let Some(observer) = opts.validation_observer.as_mut() {
                observer(&matrix, cost);
            }
            report.validation = Some(matrix);
            report.validation_cost = Some(cost);
        }
    }

    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn validate(
    model: &Model,
    module: &dyn Module,
    graphs: &mut HashMap<usize, ForwardGraph>,
    x: &ArrayD<f32>,
    y: &ArrayD<f32>,
    batch_size: usize,
    cost_fn: &CostFn,
    lambda: f32,
    classify: &MatchTypeFn,
    backend: &CpuBackend,
    dump_dir: Option<&Path>,
) -> TrainResult<(ConfusionMatrix, f32)> {
    let mut matrix = ConfusionMatrix::new();
    let mut total_cost = 0.0f32;
    let mut batches = 0usize;

    for range in row_chunks(rows_of(x), batch_size) {
        let rows = range.len();
        let bx = x.slice_axis(Axis(0), Slice::from(range.clone())).to_owned();
        let by = y.slice_axis(Axis(0), Slice::from(range)).to_owned();

        if !graphs.contains_key(&rows) {
            let plan = GraphPlan {
                tag: format!("eval{}", rows),
                x_shape: batch_shape(x, rows),
                y_shape: Some(batch_shape(y, rows)),
                training: false,
                cost_fn: Some(cost_fn),
                lambda,
            };
            graphs.insert(rows, build_forward(model, module, plan)?);
        }
        let Some(eval) = graphs.get(&rows) else {
            continue;
        };

        let mut values = model.bindings();
        values.insert(eval.x.clone(), Value::Tensor(bx));
        if let Some(y_name) = &eval.y {
            values.insert(y_name.clone(), Value::Tensor(by.clone()));
        }
        let (results, _) = execute(backend, &eval.graph, bind_inputs(&eval.graph, &values), dump_dir)?;
        let prediction = results.first().map(Value::to_array).unwrap_or_default();
        if eval.cost.is_some() {
            total_cost += results.get(1).map(scalar_of).unwrap_or(f32::NAN);
        }
        batches += 1;

        for (p, t) in prediction.outer_iter().zip(by.outer_iter()) {
            let p: Vec<f32> = p.iter().copied().collect();
            let t: Vec<f32> = t.iter().copied().collect();
            matrix.record(classify(&p, &t));
        }
    }

    Ok((matrix, total_cost / batches.max(1) as f32))
}

/// Runs `module` in inference mode over `x` in slices of `batch_size` rows
/// and stacks the outputs.
pub fn predict(model: &Model, module: &dyn Module, x: &ArrayD<f32>, batch_size: usize) -> TrainResult<ArrayD<f32>> {
    if batch_size == 0 {
        return Err(DataError::ZeroBatchSize.into());
    }
    let backend = CpuBackend::new();
    let mut graphs: HashMap<usize, ForwardGraph> = HashMap::new();
    let mut outputs = Vec::new();

    for range in row_chunks(rows_of(x), batch_size) {
        let rows = range.len();
        if !graphs.contains_key(&rows) {
            let plan = GraphPlan {
                tag: format!("predict{}", rows),
                x_shape: batch_shape(x, rows),
                y_shape: None,
                training: false,
                cost_fn: None,
                lambda: 0.0,
            };
            graphs.insert(rows, build_forward(model, module, plan)?);
        }
        let Some(graph) = graphs.get(&rows) else {
            continue;
        };
        let mut values = model.bindings();
        values.insert(graph.x.clone(), Value::Tensor(x.slice_axis(Axis(0), Slice::from(range)).to_owned()));
        let (results, _) = backend.run(&graph.graph, bind_inputs(&graph.graph, &values))?;
        outputs.push(results.first().map(Value::to_array).unwrap_or_default());
    }

    let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
    concatenate(Axis(0), &views).map_err(|e| RuntimeError::ShapeError(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::losses::mse_loss_mean;
    use crate::metrics::threshold_match;
    use crate::nn::{Initializer, Linear, LinearOpts};
    use ndarray::{Array2, IxDyn};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn regression_data(rows: usize) -> (ArrayD<f32>, ArrayD<f32>) {
        let x = Array2::from_shape_fn((rows, 2), |(i, j)| (i as f32 * 0.5) - j as f32).into_dyn();
        let y = Array2::from_shape_fn((rows, 1), |(i, _)| 2.0 * (i as f32 * 0.5) + 1.0).into_dyn();
        (x, y)
    }

    #[test]
    fn missing_cost_function_is_a_config_error() {
        let model = Model::with_seed(0);
        let linear = Linear::new(&model, 2, 1, LinearOpts::default()).unwrap();
        let (x, y) = regression_data(4);
        let empty = ArrayD::zeros(IxDyn(&[0, 2]));
        let err = train(&model, &linear, &x, &y, &empty, &empty, TrainOpts::default()).unwrap_err();
        assert!(matches!(err, TrainError::Config(_)));
    }

    #[test]
    fn validation_needs_a_classifier() {
        let model = Model::with_seed(0);
        let linear = Linear::new(&model, 2, 1, LinearOpts::default()).unwrap();
        let (x, y) = regression_data(4);
        let opts = TrainOpts { cost_fn: Some(Box::new(|p: &Tensor, t: &Tensor| mse_loss_mean(p, t))), ..Default::default() };
        let err = train(&model, &linear, &x, &y, &x, &y, opts).unwrap_err();
        assert!(matches!(err, TrainError::Config(_)));
    }

    #[test]
    fn linear_regression_cost_decreases() {
        let model = Model::with_seed(0).with_weight_init(Initializer::Zeros);
        let linear = Linear::new(&model, 2, 1, LinearOpts::default()).unwrap();
        let (x, y) = regression_data(8);
        let costs: Rc<RefCell<Vec<f32>>> = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&costs);
        let opts = TrainOpts {
            epochs: Some(20),
            batch_size: Some(4),
            solver: Some(Box::new(Adam::new(0.05))),
            cost_fn: Some(Box::new(|p: &Tensor, t: &Tensor| mse_loss_mean(p, t))),
            cost_observer: Some(Box::new(move |_: usize, _: usize, c: f32| seen.borrow_mut().push(c))),
            ..Default::default()
        };
        let empty = ArrayD::zeros(IxDyn(&[0, 2]));
        let report = train(&model, &linear, &x, &y, &empty, &empty, opts).unwrap();

        assert_eq!(report.epoch_costs.len(), 20);
        assert_eq!(report.steps, 40);
        assert_eq!(costs.borrow().len(), 40);
        assert!(report.final_cost().unwrap() < report.epoch_costs[0]);
        assert!(report.validation.is_none());

        let predictions = predict(&model, &linear, &x, 3).unwrap();
        assert_eq!(predictions.shape(), &[8, 1]);
    }

    #[test]
    fn validation_fills_a_confusion_matrix() {
        let model = Model::with_seed(4);
        let linear = Linear::new(&model, 2, 1, LinearOpts::default()).unwrap();
        let (x, y) = regression_data(6);
        let matrices = Rc::new(RefCell::new(0usize));
        let seen = Rc::clone(&matrices);
        let opts = TrainOpts {
            epochs: Some(2),
            batch_size: Some(4),
            cost_fn: Some(Box::new(|p: &Tensor, t: &Tensor| mse_loss_mean(p, t))),
            match_type_for: Some(Box::new(threshold_match(0.5))),
            validation_observer: Some(Box::new(move |m: &ConfusionMatrix, _: f32| *seen.borrow_mut() += m.total())),
            ..Default::default()
        };
        let report = train(&model, &linear, &x, &y, &x, &y, opts).unwrap();
        // Six rows validated after each of the two epochs.
        assert_eq!(*matrices.borrow(), 12);
        assert_eq!(report.validation.unwrap().total(), 6);
        assert!(report.validation_cost.unwrap().is_finite());
    }

    #[test]
    fn dev_mode_reports_instability_with_a_dump() {
        let model = Model::with_seed(0).with_weight_init(Initializer::Ones);
        let linear = Linear::new(&model, 2, 1, LinearOpts::default()).unwrap();
        let (x, y) = regression_data(2);
        let dir = tempfile::tempdir().unwrap();
        let opts = TrainOpts {
            epochs: Some(1),
            batch_size: Some(2),
            cost_fn: Some(Box::new(|p: &Tensor, t: &Tensor| (p - t).log().sum())),
            dev_mode: true,
            dev_graph_dump_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let empty = ArrayD::zeros(IxDyn(&[0, 2]));
        match train(&model, &linear, &x, &y, &empty, &empty, opts) {
            Err(TrainError::NumericalInstability { dump: Some(path), .. }) => assert!(path.exists()),
            other => panic!("expected numerical instability, got {:?}", other.map(|r| r.steps)),
        }
    }
}
