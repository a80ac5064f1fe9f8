//! # Neural Network Layers Module
//!
//! Building blocks of the TabNet pipeline.
//!
//! In the graph-based architecture each "layer" adds a specific pattern of
//! nodes (operations and parameters) to the ASG owned by a [`Model`]. The
//! model also owns the parameter values, the running-statistic buffers and
//! the [`LayerRegistry`] that names every layer.
//!
//! ## Available Layers
//!
//! ### Core
//! - [`Linear`]: fully connected layer, shareable between blocks
//! - [`Embedding`]: lookup table
//! - [`Activation`]: closed set of activations, including [`Activation::Sparsemax`]
//!
//! ### Normalization
//! - [`GhostBatchNorm`]: batch normalization over virtual batches
//!
//! ### TabNet
//! - [`Glu`]: gated linear unit, the atomic transformer block
//! - [`FeatureTransformer`]: shared and step-independent GLU stack
//! - [`AttentiveTransformer`]: sparse feature mask from the running prior
//! - [`DecisionStep`]: one attend, mask, transform transition
//! - [`EmbeddingGenerator`]: embeds categorical columns in place
//! - [`TabNet`]: the full pipeline
//!
//! ## Example
//!
//! ```ignore
//! use rustytab::nn::{Model, Module, TabNet, TabNetOpts};
//! use rustytab::tensor::Tensor;
//!
//! let model = Model::with_seed(0);
//! let net = TabNet::new(&model, 10, 1, TabNetOpts::default())?;
//! let x = Tensor::new_input_with_shape(model.context(), "x", &[256, 10]);
//! let forward = net.forward(&[x])?;
//! ```

pub mod activations;
pub mod attentive_transformer;
pub mod decision_step;
pub mod embedding;
pub mod feature_transformer;
pub mod ghost_batchnorm;
pub mod glu;
pub mod linear;
pub mod model;
pub mod module;
pub mod registry;
pub mod tabnet;

pub use activations::Activation;
pub use attentive_transformer::{AttentiveTransformer, AttentiveTransformerOpts};
pub use decision_step::{DecisionStep, StepOutput};
pub use embedding::{CategoricalColumn, Embedding, EmbeddingGenerator};
pub use feature_transformer::{shared_projections, FeatureTransformer, FeatureTransformerOpts};
pub use ghost_batchnorm::{GhostAxis, GhostBatchNorm, GhostBatchNormOpts};
pub use glu::{Glu, GluOpts};
pub use linear::{Linear, LinearOpts};
pub use model::{Initializer, Model};
pub use module::{Forward, Module, NnError, NnResult};
pub use registry::LayerRegistry;
pub use tabnet::{TabNet, TabNetForward, TabNetOpts};
