//! # Kernel Layer
//!
//! Numeric kernels behind the matrix and tensor operations.
//!
//! ## Submodules
//!
//! - [`cpu`]: multi-threaded CPU kernels
//!
//! ## Notes
//!
//! - Kernels operate on raw [`Matrix`](crate::tensors::Matrix) storage and never touch the graph
//! - Shape checks happen before a kernel is called
//! - Parallel kernels are deterministic regardless of thread count

pub(crate) mod cpu;
