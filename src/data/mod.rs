//! # Data Loading Module
//!
//! Batching for in-memory tabular datasets.
//!
//! ## Example
//!
//! ```ignore
//! use rustytab::data::DataLoader;
//!
//! let mut loader = DataLoader::with_seed(features, labels, 256, 0)?;
//! for batch in loader.by_ref() {
//!     // Train on batch.features / batch.labels
//! }
//! loader.reset();
//! ```

pub mod dataloader;

pub use dataloader::{row_chunks, Batch, DataError, DataLoader};
