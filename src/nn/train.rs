//! Full-batch training driver.
//!
//! ## Loop
//!
//! Each epoch is one un-batched, un-shuffled pass over the whole data set:
//!
//! 1. clear the tape
//! 2. zero gradients
//! 3. forward the data through the architecture
//! 4. compute the loss against the labels
//! 5. backward from the loss
//! 6. optimizer step
//!
//! The tape is cleared once more after the last epoch, so no intermediate
//! survives the call.

use crate::context;
use crate::error::Result;
use crate::nn::layers::Module;
use crate::nn::loss::Loss;
use crate::nn::optim::Optimizer;
use crate::tensors::Tensor;

/// Reporting knobs for [`AssembledModel::train`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrainConfig {
    /// Log the loss every this many epochs. `None` means `max(epochs / 10, 1)`.
    pub report_every: Option<usize>,
}

impl TrainConfig {
    /// Sets an explicit reporting interval. Zero is treated as one.
    #[must_use]
    pub fn with_report_every(mut self, epochs: usize) -> Self {
        self.report_every = Some(epochs.max(1));
        self
    }

    fn interval(self, epochs: usize) -> usize {
        self.report_every.unwrap_or(epochs / 10).max(1)
    }
}

/// Outcome of a training run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainReport {
    /// Loss after each epoch's forward pass, in order.
    pub history: Vec<f64>,
}

impl TrainReport {
    /// Loss of the last epoch, or `None` if no epoch ran.
    #[must_use]
    pub fn final_loss(&self) -> Option<f64> {
        self.history.last().copied()
    }

    /// Number of epochs run.
    #[must_use]
    pub fn epochs(&self) -> usize {
        self.history.len()
    }
}

/// An architecture bundled with the optimizer and loss that train it.
///
/// The optimizer must track the architecture's parameters, typically built
/// from [`Module::parameters`].
pub struct AssembledModel<M, O, L> {
    /// The network.
    pub architecture: M,
    /// Updates the network's parameters.
    pub optimizer: O,
    /// Objective minimized by [`AssembledModel::train`].
    pub loss: L,
    /// Reporting settings.
    pub config: TrainConfig,
}

impl<M: Module, O: Optimizer, L: Loss> AssembledModel<M, O, L> {
    /// Bundles the three parts with the default [`TrainConfig`].
    pub fn new(architecture: M, optimizer: O, loss: L) -> Self {
        Self {
            architecture,
            optimizer,
            loss,
            config: TrainConfig::default(),
        }
    }

    /// Replaces the reporting settings.
    #[must_use]
    pub fn with_config(mut self, config: TrainConfig) -> Self {
        self.config = config;
        self
    }

    /// Trains for `epochs` full-batch passes.
    ///
    /// # Errors
    /// Any shape error from the forward pass or the loss, or a graph error from
    /// the backward pass. The tape is cleared before returning either way.
    pub fn train(&mut self, data: &Tensor, labels: &Tensor, epochs: usize) -> Result<TrainReport> {
        let outcome = self.run_epochs(data, labels, epochs);
        context::clear_tape();
        outcome
    }

    fn run_epochs(&mut self, data: &Tensor, labels: &Tensor, epochs: usize) -> Result<TrainReport> {
        let every = self.config.interval(epochs);
        let mut report = TrainReport {
            history: Vec::with_capacity(epochs),
        };

        for epoch in 0..epochs {
            context::clear_tape();
            self.optimizer.zero_grad();

            let output = self.architecture.forward(data)?;
            let loss = self.loss.apply(&output, labels)?;
            loss.backward()?;
            self.optimizer.step();

            let value = loss.item()?;
            report.history.push(value);
            if epoch % every == 0 || epoch + 1 == epochs {
                tracing::info!(epoch, loss = value, "training");
            }
        }

        Ok(report)
    }

    /// Forward pass with recording disabled.
    ///
    /// # Errors
    /// Any shape error from the architecture.
    pub fn predict(&self, input: &Tensor) -> Result<Tensor> {
        let _guard = context::no_grad();
        self.architecture.forward(input)
    }
}
