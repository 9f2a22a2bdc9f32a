//! mlscript: the numeric core of a small machine-learning scripting language.
//!
//! A script front end parses source text and drives this crate through a
//! handful of entry points: an [`Evaluator`](evaluator::Evaluator) holding
//! scoped, dynamically typed variables, and a reverse-mode automatic
//! differentiation engine over dense 2-D matrices that the evaluator's
//! arithmetic feeds into.
//!
//! # Features
//!
//! - Dense `f64` matrices with row-parallel matrix multiplication.
//! - Dynamic computation graphs recorded while a global toggle is on, with
//!   [`Tensor::backward`] computing gradients for every reachable input.
//! - A tape that owns intermediates between training iterations.
//! - Layers, losses, optimizers and a full-batch training driver in [`nn`].
//! - Parameter checkpoints in the `.bpat` binary format.
//!
//! # Modules
//!
//! - [`tensors`]: [`Matrix`] values and [`Tensor`] graph handles.
//! - [`backprop`]: graph-building operations and the backward pass.
//! - [`context`]: the recording toggle, the tape and [`no_grad`](context::no_grad).
//! - [`evaluator`]: runtime values, scopes and operator dispatch.
//! - [`nn`]: modules, losses, optimizers and training.
//! - [`modelio`]: saving and loading parameter lists.
//! - [`error`]: the crate-wide [`Error`] type.
//!
//! # Example
//!
//! ```rust
//! use mlscript::evaluator::{Evaluator, Value};
//! use mlscript::Tensor;
//!
//! let mut ev = Evaluator::new();
//! let w = Tensor::from_rows(vec![vec![2.0]]).unwrap();
//! ev.assign_variable("w", Value::Tensor(w.clone()));
//!
//! let x = ev.get_variable("w").unwrap();
//! let y = ev.evaluate("*", &x, &x).unwrap();
//! y.as_tensor().unwrap().sum().backward().unwrap();
//! assert_eq!(w.grad().data(), &[4.0]);
//! ```

pub mod backprop;
pub mod context;
pub mod error;
pub mod evaluator;
pub mod modelio;
pub mod nn;
pub(crate) mod ops;
pub mod tensors;

pub use error::{Error, Result};
pub use tensors::{Matrix, Tensor};
