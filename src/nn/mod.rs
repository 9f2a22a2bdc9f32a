//! Neural-network toolkit built on the graph operations.
//!
//! Everything here is expressed in terms of recorded [`Tensor`](crate::Tensor)
//! operations, so gradients come from [`Tensor::backward`](crate::Tensor::backward)
//! rather than hand-written backward passes.
//!
//! ## Submodules
//!
//! - [`layers`]: the [`Module`] trait, [`Sequential`], [`Dense`] and parameter-free activations
//! - [`loss`]: the [`Loss`] trait with [`MseLoss`] and [`CrossEntropyLoss`]
//! - [`optim`]: the [`Optimizer`] trait with [`Sgd`] and [`Adam`]
//! - [`train`]: [`AssembledModel`], the full-batch training driver

pub mod layers;
pub mod loss;
pub mod optim;
pub mod train;

pub use layers::{Dense, Flatten, Module, Relu, Sequential, SequentialBuilder, Sigmoid};
pub use loss::{CrossEntropyLoss, Loss, MseLoss};
pub use optim::{Adam, AdamConfig, Optimizer, Sgd};
pub use train::{AssembledModel, TrainConfig, TrainReport};
