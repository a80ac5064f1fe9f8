//! # Graph Analysis Module
//!
//! Analysis passes that process the ASG before execution.
//!
//! - [`ShapeInference`](shape_inference::ShapeInference): propagates tensor shapes
//!   through the graph, detecting shape mismatches before runtime.
//!
//! ```text
//! ASG (untyped) -> Shape Inference -> ASG (with shapes/dtypes)
//! ```
//!
//! Layers call [`Tensor::shape`](crate::tensor::Tensor::shape) while they build,
//! which infers only the nodes the queried handle depends on. The trainer runs
//! the full pass once the batch size of a graph is known:
//!
//! ```ignore
//! use rustytab::analysis::shape_inference::ShapeInference;
//!
//! let mut graph = context.borrow().main_graph().clone();
//! let shapes = HashMap::from([
//!     ("x".to_string(), (vec![32, 54], DType::F32)),
//! ]);
//! ShapeInference::run(&mut graph, &shapes)?;
//! ```

pub mod shape_inference;
