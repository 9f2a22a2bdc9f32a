//! Graph-building operations and the reverse-mode backward pass.
//!
//! # Backpropagation
//!
//! Every operation here follows the same pattern:
//! 1. **Forward**: compute the output value with the plain [`Matrix`] kernels.
//! 2. **Record**: if [`context::is_recording`] is on, attach weak edges to the
//!    operands, tag the output with its [`Op`] and register it on the tape.
//! 3. **Backward**: [`Tensor::backward`] walks the recorded graph in reverse
//!    topological order and applies the gradient rule keyed by each node's tag.
//!
//! ## Gradient Rules
//!
//! With `g` the node's gradient:
//!
//! | op | parent contribution |
//! |---|---|
//! | add(a,b) | da += g; db += g |
//! | sub(a,b) | da += g; db -= g |
//! | mul(a,b) | da += g⊙b; db += g⊙a |
//! | div(a,b) | da += g⊘b; db += −g⊙a⊘b² |
//! | matmul(A,B) | dA += g·Bᵗ; dB += Aᵗ·g |
//! | scalar-mul(a,k) | da += g·k |
//! | sum(a) | da += g₀₀ broadcast to shape(a) |
//! | relu(x) | dx += g⊙\[x>0\] |
//! | sigmoid(x) | dx += g⊙s⊙(1−s) |
//! | log(x) | dx += g⊘x |
//! | log_softmax(x) | dx += g − softmax(x)⊙rowsum(g) |
//! | flatten(x) | dx += reshape(g, shape(x)) |
//! | get_row / slice(x) | scatter-add g into the selected region of dx |
//!
//! `softmax` is recorded but has no rule; differentiate through `log_softmax`.
//!
//! ## Usage Guidelines
//!
//! - Intermediates are owned by the tape; clearing it before `backward` turns
//!   their edges into [`Error::DanglingGraphEdge`] failures.
//! - Gradients accumulate. Call [`Tensor::zero_grad`] (or an optimizer's
//!   `zero_grad`) between passes.
//!
//! ```rust
//! use mlscript::tensors::Tensor;
//!
//! let a = Tensor::from_rows(vec![vec![1.0, 2.0]]).unwrap();
//! let b = Tensor::from_rows(vec![vec![3.0, 4.0]]).unwrap();
//! let loss = a.mul(&b).unwrap().sum();
//! loss.backward().unwrap();
//! assert_eq!(a.grad().data(), &[3.0, 4.0]);
//! ```

use std::collections::HashSet;
use std::rc::Rc;

use crate::context;
use crate::error::{Error, Result};
use crate::ops::cpu;
use crate::tensors::{Matrix, Op, Selection, SliceSpec, Tensor};

/// Wraps a freshly computed value, recording it if the context says so.
///
/// Leaf operands go on the tape with the output: a temporary leaf would
/// otherwise be gone before `backward` reaches it.
fn record(value: Matrix, op: Op, parents: &[&Tensor]) -> Tensor {
    if context::is_recording() {
        let out = Tensor::from_parents(value, op, parents);
        for parent in parents.iter().filter(|p| p.is_leaf()) {
            context::register(parent);
        }
        context::register(&out);
        out
    } else {
        let out = Tensor::from_matrix(value);
        out.set_requires_grad(false);
        out
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

impl Tensor {
    /// Elementwise `self + other`.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the shapes differ.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        let value = self.value().add(&other.value())?;
        Ok(record(value, Op::Add, &[self, other]))
    }

    /// Elementwise `self - other`.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the shapes differ.
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        let value = self.value().sub(&other.value())?;
        Ok(record(value, Op::Sub, &[self, other]))
    }

    /// Elementwise `self ⊙ other`.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the shapes differ.
    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        let value = self.value().mul(&other.value())?;
        Ok(record(value, Op::Mul, &[self, other]))
    }

    /// Elementwise `self ⊘ other`. Zero divisors produce non-finite entries.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the shapes differ.
    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        let value = self.value().div(&other.value())?;
        Ok(record(value, Op::Div, &[self, other]))
    }

    /// `self · k`.
    #[must_use]
    pub fn mul_scalar(&self, k: f64) -> Tensor {
        let value = self.value().scale(k);
        record(value, Op::ScalarMul(k), &[self])
    }

    /// Matrix product `self · other`.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if `self.cols != other.rows`.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        let value = self.value().matmul(&other.value())?;
        Ok(record(value, Op::MatMul, &[self, other]))
    }

    /// Sum of all elements as a 1×1 tensor.
    #[must_use]
    pub fn sum(&self) -> Tensor {
        let total = self.value().sum();
        record(Matrix::filled(1, 1, total), Op::Sum, &[self])
    }

    /// `max(x, 0)` elementwise.
    #[must_use]
    pub fn relu(&self) -> Tensor {
        let value = self.value().map(|x| x.max(0.0));
        record(value, Op::Relu, &[self])
    }

    /// Logistic sigmoid elementwise.
    #[must_use]
    pub fn sigmoid(&self) -> Tensor {
        let value = self.value().map(sigmoid);
        record(value, Op::Sigmoid, &[self])
    }

    /// Natural logarithm elementwise.
    #[must_use]
    pub fn log(&self) -> Tensor {
        let value = self.value().map(f64::ln);
        record(value, Op::Log, &[self])
    }

    /// Row-wise softmax.
    ///
    /// Recorded without a gradient rule: `backward` through it fails with
    /// [`Error::UnknownOperationTag`].
    #[must_use]
    pub fn softmax(&self) -> Tensor {
        let value = self.value().softmax_rows();
        record(value, Op::Softmax, &[self])
    }

    /// Row-wise log-softmax.
    #[must_use]
    pub fn log_softmax(&self) -> Tensor {
        let value = self.value().log_softmax_rows();
        record(value, Op::LogSoftmax, &[self])
    }

    /// Reshapes into a single 1×(R·C) row, row-major.
    #[must_use]
    pub fn flatten(&self) -> Tensor {
        let value = {
            let v = self.value();
            Matrix::from_raw(1, v.len(), v.data().to_vec())
        };
        record(value, Op::Flatten, &[self])
    }

    /// Extracts row `index` as a 1×C tensor.
    ///
    /// # Errors
    /// [`Error::IndexOutOfRange`] if `index >= rows`.
    pub fn get_row(&self, index: usize) -> Result<Tensor> {
        let value = {
            let v = self.value();
            Matrix::from_raw(1, v.cols(), v.row(index)?.to_vec())
        };
        Ok(record(value, Op::GetRow(index), &[self]))
    }

    /// Rows `start..stop`, clamped to the tensor. An empty range yields a 0×C tensor.
    #[must_use]
    pub fn slice_rows(&self, start: usize, stop: usize) -> Tensor {
        let (rows, cols) = self.shape();
        let stop = stop.min(rows);
        let start = start.min(stop);
        let value = {
            let v = self.value();
            Matrix::from_raw(stop - start, cols, v.data()[start * cols..stop * cols].to_vec())
        };
        record(value, Op::SliceRows(start..stop), &[self])
    }

    /// Rectangular slice with independent `start:stop:step` per axis.
    ///
    /// # Errors
    /// [`Error::ZeroSliceStep`] if either step is zero.
    pub fn slice(&self, rows: SliceSpec, cols: SliceSpec) -> Result<Tensor> {
        let (r, c) = self.shape();
        let selection = Selection {
            rows: rows.indices(r)?,
            cols: cols.indices(c)?,
        };
        let value = cpu::gather(&self.value(), &selection.rows, &selection.cols);
        Ok(record(value, Op::Slice(Rc::new(selection)), &[self]))
    }

    /// Runs reverse-mode differentiation from this tensor.
    ///
    /// If this tensor has no gradient yet it is seeded with ones of its own
    /// shape. Every ancestor reachable through recorded edges then receives its
    /// accumulated gradient.
    ///
    /// Intermediate nodes keep their gradient after the call. A second
    /// `backward` from another root that shares an intermediate propagates
    /// that intermediate's full accumulated total again, so clear the tape
    /// (or rebuild the graph) between passes that share nodes.
    ///
    /// # Errors
    /// - [`Error::DanglingGraphEdge`] if an ancestor was freed before this call
    /// - [`Error::UnknownOperationTag`] if a node has no gradient rule
    pub fn backward(&self) -> Result<()> {
        let _span = tracing::debug_span!("backward", root = self.id()).entered();

        let order = topological_order(self)?;
        if !self.has_grad() {
            let (rows, cols) = self.shape();
            self.set_grad(Matrix::ones(rows, cols))?;
        }
        tracing::debug!(nodes = order.len(), "graph sorted");

        for node in order.iter().rev() {
            if node.is_leaf() {
                continue;
            }
            let Some(grad) = node.grad_snapshot() else {
                continue;
            };
            let parents = node.parents()?;
            let contributions = gradient_rule(node, &grad, &parents)?;
            for (parent, contribution) in parents.iter().zip(&contributions) {
                if parent.requires_grad() {
                    parent.accumulate_grad(contribution)?;
                }
            }
        }
        Ok(())
    }
}

/// Post-order DFS from `root`: every ancestor precedes its descendants.
///
/// Iterative, so deep chains do not exhaust the call stack.
fn topological_order(root: &Tensor) -> Result<Vec<Tensor>> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![(root.clone(), false)];

    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !visited.insert(node.id()) {
            continue;
        }
        let parents = node.parents()?;
        stack.push((node, true));
        for parent in parents.into_iter().rev() {
            if !visited.contains(&parent.id()) {
                stack.push((parent, false));
            }
        }
    }
    Ok(order)
}

/// Computes one gradient contribution per parent, in parent order.
fn gradient_rule(node: &Tensor, g: &Matrix, parents: &[Tensor]) -> Result<Vec<Matrix>> {
    let unary = || parents[0].value().clone();
    let contributions = match node.op() {
        Op::Leaf => Vec::new(),
        Op::Add => vec![g.clone(), g.clone()],
        Op::Sub => vec![g.clone(), g.scale(-1.0)],
        Op::Mul => {
            let a = parents[0].value();
            let b = parents[1].value();
            vec![g.mul(&b)?, g.mul(&a)?]
        }
        Op::Div => {
            let a = parents[0].value();
            let b = parents[1].value();
            let da = g.div(&b)?;
            let db = g.zip_with(&a, |gi, ai| -gi * ai)?.zip_with(&b, |num, bi| num / (bi * bi))?;
            vec![da, db]
        }
        Op::MatMul => {
            let a = parents[0].value();
            let b = parents[1].value();
            vec![g.matmul(&b.transpose())?, a.transpose().matmul(g)?]
        }
        Op::ScalarMul(k) => vec![g.scale(*k)],
        Op::Sum => {
            let (rows, cols) = parents[0].shape();
            vec![Matrix::filled(rows, cols, g.get(0, 0)?)]
        }
        Op::Relu => {
            let mask = unary().map(|x| if x > 0.0 { 1.0 } else { 0.0 });
            vec![g.mul(&mask)?]
        }
        Op::Sigmoid => {
            let slope = unary().map(|x| {
                let s = sigmoid(x);
                s * (1.0 - s)
            });
            vec![g.mul(&slope)?]
        }
        Op::Log => vec![g.div(&unary())?],
        Op::LogSoftmax => {
            let probs = unary().softmax_rows();
            let row_sums = g.row_sums();
            let cols = g.cols();
            let mut dx = g.clone();
            let sums = row_sums.data();
            for ((i, cell), &p) in dx.data_mut().iter_mut().enumerate().zip(probs.data()) {
                *cell -= p * sums[i / cols];
            }
            vec![dx]
        }
        Op::Flatten => {
            let (rows, cols) = parents[0].shape();
            vec![g.reshape(rows, cols)?]
        }
        Op::GetRow(index) => {
            let (rows, cols) = parents[0].shape();
            vec![scatter(rows, cols, &[*index], &(0..cols).collect::<Vec<_>>(), g)]
        }
        Op::SliceRows(range) => {
            let (rows, cols) = parents[0].shape();
            let picked: Vec<usize> = range.clone().collect();
            vec![scatter(rows, cols, &picked, &(0..cols).collect::<Vec<_>>(), g)]
        }
        Op::Slice(selection) => {
            let (rows, cols) = parents[0].shape();
            vec![scatter(rows, cols, &selection.rows, &selection.cols, g)]
        }
        Op::Softmax => return Err(Error::UnknownOperationTag(node.op().name().to_owned())),
    };
    Ok(contributions)
}

fn scatter(rows: usize, cols: usize, picked_rows: &[usize], picked_cols: &[usize], g: &Matrix) -> Matrix {
    let mut dx = Matrix::zeros(rows, cols);
    cpu::scatter_add(&mut dx, picked_rows, picked_cols, g);
    dx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context;

    fn leaf(rows: Vec<Vec<f64>>) -> Tensor {
        Tensor::from_rows(rows).unwrap()
    }

    #[test]
    fn topological_order_puts_parents_first() {
        context::reset();
        let a = leaf(vec![vec![1.0]]);
        let b = a.mul_scalar(2.0);
        let c = a.add(&b).unwrap();
        let order = topological_order(&c).unwrap();
        let pos = |t: &Tensor| order.iter().position(|o| o.ptr_eq(t)).unwrap();
        assert_eq!(order.len(), 3);
        assert!(pos(&a) < pos(&b));
        assert!(pos(&b) < pos(&c));
    }

    #[test]
    fn shared_operand_accumulates_twice() {
        context::reset();
        let x = leaf(vec![vec![3.0]]);
        let y = x.mul(&x).unwrap();
        y.backward().unwrap();
        assert_eq!(x.grad().data(), &[6.0]);
    }

    #[test]
    fn softmax_has_no_gradient_rule() {
        context::reset();
        let x = leaf(vec![vec![1.0, 2.0]]);
        let err = x.softmax().sum().backward().unwrap_err();
        assert!(matches!(err, Error::UnknownOperationTag(ref tag) if tag == "softmax"));
    }

    #[test]
    fn unrecorded_ops_produce_leaves() {
        context::reset();
        let x = leaf(vec![vec![1.0, -1.0]]);
        let y = {
            let _guard = context::no_grad();
            x.relu()
        };
        assert!(y.is_leaf());
        assert!(!y.requires_grad());
        assert_eq!(context::tape_len(), 0);
    }

    #[test]
    fn temporary_leaf_operands_are_taped() {
        context::reset();
        let x = leaf(vec![vec![1.0, 2.0]]);
        let y = x.mul(&leaf(vec![vec![3.0, 4.0]])).unwrap().sum();
        y.backward().unwrap();
        assert_eq!(x.grad().data(), &[3.0, 4.0]);

        context::clear_tape();
        let z = x.add(&leaf(vec![vec![0.0, 0.0]])).unwrap();
        let total = z.sum();
        drop(z);
        context::clear_tape();
        assert!(matches!(total.backward(), Err(Error::DanglingGraphEdge { .. })));
    }

    #[test]
    fn shared_intermediate_keeps_its_gradient() {
        context::reset();
        let a = leaf(vec![vec![1.0]]);
        let h = a.mul_scalar(2.0);
        let first = h.sum();
        let second = h.sum();
        first.backward().unwrap();
        second.backward().unwrap();
        assert_eq!(a.grad().data(), &[6.0]);
    }
}
