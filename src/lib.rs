//! # RustyTab: TabNet on a graph-based autodiff engine
//!
//! **RustyTab** implements TabNet, sequential attention for tabular data,
//! on top of an **Abstract Semantic Graph (ASG)**: layers append nodes to
//! a graph, a separate gradient graph is derived from it, and a backend
//! evaluates both against bound values.
//!
//! ## Usage Example
//!
//! ```no_run
//! use rustytab::losses::binary_cross_entropy;
//! use rustytab::metrics::threshold_match;
//! use rustytab::nn::{Model, TabNet, TabNetOpts};
//! use rustytab::tensor::Tensor;
//! use rustytab::training::{train, TrainOpts};
//! use ndarray::{ArrayD, IxDyn};
//!
//! let model = Model::with_seed(0);
//! let net = TabNet::new(&model, 4, 1, TabNetOpts::default()).unwrap();
//!
//! let x = ArrayD::<f32>::zeros(IxDyn(&[64, 4]));
//! let y = ArrayD::<f32>::zeros(IxDyn(&[64, 1]));
//! let opts = TrainOpts {
//!     epochs: Some(5),
//!     batch_size: Some(32),
//!     cost_fn: Some(Box::new(|p: &Tensor, t: &Tensor| binary_cross_entropy(&p.sigmoid(), t, 1e-7))),
//!     match_type_for: Some(Box::new(threshold_match(0.0))),
//!     ..Default::default()
//! };
//! let report = train(&model, &net, &x, &y, &x, &y, opts).unwrap();
//! println!("final cost {:?}", report.final_cost());
//! ```

pub mod analysis;
pub mod asg;
pub mod autograd;
pub mod data;
pub mod losses;
pub mod metrics;
pub mod nn;
pub mod optimizers;
pub mod runtime;
pub mod serialization;
pub mod tensor;
pub mod training;
