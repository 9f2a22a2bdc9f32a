//! Loss functions.
//!
//! Each loss reduces predictions and targets of the same shape to a recorded
//! `1×1` tensor, ready for [`Tensor::backward`].

use crate::error::Result;
use crate::tensors::Tensor;

/// A scalar objective over predictions and targets.
pub trait Loss {
    /// Computes the loss as a `1×1` tensor.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`](crate::Error::ShapeMismatch) if the shapes differ.
    fn apply(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor>;
}

/// Sum of squared differences.
///
/// The sum is not divided by the element count, so gradients scale with the
/// batch size. Pick learning rates accordingly.
#[derive(Debug, Default, Clone, Copy)]
pub struct MseLoss;

impl Loss for MseLoss {
    fn apply(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let diff = predictions.sub(targets)?;
        Ok(diff.mul(&diff)?.sum())
    }
}

/// `-sum(log_softmax(predictions) ⊙ targets)`, for one-hot target rows.
///
/// Predictions are raw logits; the row-wise log-softmax is applied here.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrossEntropyLoss;

impl Loss for CrossEntropyLoss {
    fn apply(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let picked = predictions.log_softmax().mul(targets)?;
        Ok(picked.sum().mul_scalar(-1.0))
    }
}
