//! Module containing implementations of loss functions in graph paradigm.
//!
//! Loss functions here are regular Rust functions that take
//! symbolic `Tensor` descriptors and add nodes to the graph necessary
//! for computing the error value. Batch-averaged losses expect rank-2
//! `[batch, width]` operands.
//!
//! # Available Loss Functions
//!
//! - **MSE (Mean Squared Error)**: `mse_loss`, `mse_loss_mean`
//! - **Cross-Entropy**: `cross_entropy_loss` (on logits, one-hot targets)
//! - **Binary Cross-Entropy**: `binary_cross_entropy` (on probabilities)
//! - **TabNet objective**: `tabnet_cost`

use crate::tensor::Tensor;

/// Weight of the mask regularization in [`tabnet_cost`].
pub const DEFAULT_LAMBDA_SPARSE: f32 = 1e-3;

/// Mean over every entry of a rank-2 tensor, as a scalar node.
fn mean_all(t: &Tensor) -> Tensor {
    t.mean().mean_axis(0).sum()
}

// ============================================================================
// MSE Loss (Mean Squared Error)
// ============================================================================

/// Computes symbolic graph for Mean Squared Error (MSE) - sum.
///
/// Formula: `MSE = sum((y_pred - y_true)^2)`.
pub fn mse_loss(y_pred: &Tensor, y_true: &Tensor) -> Tensor {
    let error = y_pred - y_true;
    let squared_error = &error * &error;
    squared_error.sum()
}

/// Computes MSE with mean value instead of sum.
///
/// Formula: `MSE = mean((y_pred - y_true)^2)`.
pub fn mse_loss_mean(y_pred: &Tensor, y_true: &Tensor) -> Tensor {
    let error = y_pred - y_true;
    mean_all(&(&error * &error))
}

// ============================================================================
// Cross-Entropy Loss
// ============================================================================

/// Softmax cross-entropy averaged over the batch.
///
/// Formula: `CE = -sum(y_true * log(softmax(logits) + eps)) / batch`
///
/// # Arguments
///
/// * `logits` - Raw scores `[batch, classes]`
/// * `y_true` - One-hot encoded true labels
/// * `eps` - Small value for numerical stability
pub fn cross_entropy_loss(logits: &Tensor, y_true: &Tensor, eps: f32) -> Tensor {
    let log_probs = logits.softmax().add_scalar(eps).log();
    -&(y_true * &log_probs).mean_axis(0).sum()
}

// ============================================================================
// Binary Cross-Entropy Loss
// ============================================================================

/// Computes Binary Cross-Entropy Loss.
///
/// Formula: `BCE = -mean(y_true * log(y_pred + eps) + (1 - y_true) * log(1 - y_pred + eps))`
///
/// # Arguments
///
/// * `y_pred` - Predicted probabilities (0-1, after sigmoid)
/// * `y_true` - True labels (0 or 1)
/// * `eps` - Small value for numerical stability
pub fn binary_cross_entropy(y_pred: &Tensor, y_true: &Tensor, eps: f32) -> Tensor {
    let log_pred = y_pred.add_scalar(eps).log();
    let log_one_minus_pred = (-y_pred).add_scalar(1.0 + eps).log();

    let one_minus_true = (-y_true).add_scalar(1.0);
    let term1 = y_true * &log_pred;
    let term2 = &one_minus_true * &log_one_minus_pred;

    -&mean_all(&(&term1 + &term2))
}

// ============================================================================
// TabNet objective
// ============================================================================

/// `task_loss - lambda * regularization`.
///
/// `regularization` is the averaged `sum(mask * log(mask + eps))` term of
/// the decision steps. It is non-positive and most negative for diffuse
/// masks, so subtracting it penalizes them.
pub fn tabnet_cost(task_loss: &Tensor, regularization: &Tensor, lambda: f32) -> Tensor {
    task_loss - &regularization.scale(lambda)
}
