//! Metrics for evaluating model quality.
//!
//! Validation classifies every `(prediction, target)` pair into a
//! [`MatchType`] and accumulates a [`ConfusionMatrix`]:
//!
//! ```rust,ignore
//! use rustytab::metrics::{threshold_match, ConfusionMatrix};
//!
//! let classify = threshold_match(0.5);
//! let mut matrix = ConfusionMatrix::new();
//! for (p, t) in predictions.iter().zip(targets.iter()) {
//!     matrix.record(classify(&[*p], &[*t]));
//! }
//! println!("F1: {:.4}", matrix.f1());
//! ```

pub mod classification;

pub use classification::{threshold_match, ConfusionMatrix, MatchType};
