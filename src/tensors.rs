//! Core matrix storage and graph-node tensors.
//!
//! # Core Tensor Utilities
//!
//! This module defines the two data types everything else is built from:
//!
//! - [`Matrix`]: a dense, row-major `f64` matrix with plain (non-recording) arithmetic
//! - [`Tensor`]: a shared handle to a computation-graph node holding a value matrix,
//!   a lazily allocated gradient, weak edges to its parents and an [`Op`] tag
//!
//! ## Design Highlights
//! - A `Tensor` is an `Rc` handle; cloning it shares the node
//! - Parent edges are `Weak`, so a graph never keeps its inputs alive on its own;
//!   the tape in [`crate::context`] owns intermediates for the duration of one pass
//! - Gradients are allocated on first write and always match the value's shape
//! - `Matrix::parse` loads matrix literals from lightweight nested-array text
//!
//! ## Limitations
//! - Rank 2 only; vectors are 1×N rows
//! - No broadcasting; elementwise operators require identical shapes
//!
//! ## Example
//!
//! ```rust
//! use mlscript::tensors::Tensor;
//! let t = Tensor::from_rows(vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
//! assert_eq!(t.shape(), (2, 3));
//! ```

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::ops::Range;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::ops::cpu;

/// A dense R×C matrix of `f64` in row-major order.
///
/// Zero-sized matrices (no rows or no columns) are valid values.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Creates a matrix from a row-major buffer.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if `data.len() != rows * cols`.
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if rows.checked_mul(cols) != Some(data.len()) {
            return Err(Error::ShapeMismatch {
                expected: vec![rows, cols],
                got: vec![data.len()],
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Internal constructor for buffers whose length is known to be correct.
    pub(crate) fn from_raw(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        debug_assert_eq!(data.len(), rows * cols);
        Self { rows, cols, data }
    }

    /// Builds a matrix from nested rows.
    ///
    /// An empty outer vector yields a 0×0 matrix.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the rows are ragged.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(rows.len() * cols);
        let row_count = rows.len();
        for row in rows {
            if row.len() != cols {
                return Err(Error::ShapeMismatch {
                    expected: vec![cols],
                    got: vec![row.len()],
                });
            }
            data.extend(row);
        }
        Ok(Self::from_raw(row_count, cols, data))
    }

    /// A matrix filled with `value`.
    ///
    /// # Panics
    /// Panics if `rows * cols` overflows `usize`, like any oversized allocation.
    #[must_use]
    pub fn filled(rows: usize, cols: usize, value: f64) -> Self {
        Self::from_raw(rows, cols, vec![value; rows.saturating_mul(cols)])
    }

    /// A matrix of zeros.
    #[must_use]
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, 0.0)
    }

    /// A matrix of ones.
    #[must_use]
    pub fn ones(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, 1.0)
    }

    /// Number of rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `(rows, cols)`.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Total element count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `true` when either dimension is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Row-major element slice.
    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Consumes the matrix, returning its row-major buffer.
    #[must_use]
    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    /// Reads element `(r, c)`.
    ///
    /// # Errors
    /// [`Error::IndexOutOfRange`] if either index is outside the matrix.
    pub fn get(&self, r: usize, c: usize) -> Result<f64> {
        if r >= self.rows {
            return Err(Error::IndexOutOfRange { index: r, bound: self.rows });
        }
        if c >= self.cols {
            return Err(Error::IndexOutOfRange { index: c, bound: self.cols });
        }
        Ok(self.data[r * self.cols + c])
    }

    /// Borrows row `r`.
    ///
    /// # Errors
    /// [`Error::IndexOutOfRange`] if `r >= rows`.
    pub fn row(&self, r: usize) -> Result<&[f64]> {
        if r >= self.rows {
            return Err(Error::IndexOutOfRange { index: r, bound: self.rows });
        }
        Ok(&self.data[r * self.cols..(r + 1) * self.cols])
    }

    /// Applies `f` to every element.
    #[must_use]
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self::from_raw(self.rows, self.cols, self.data.iter().map(|&x| f(x)).collect())
    }

    /// Combines two same-shaped matrices elementwise.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the shapes differ.
    pub fn zip_with(&self, other: &Self, f: impl Fn(f64, f64) -> f64) -> Result<Self> {
        self.check_same_shape(other)?;
        Ok(Self::from_raw(
            self.rows,
            self.cols,
            self.data.iter().zip(&other.data).map(|(&a, &b)| f(a, b)).collect(),
        ))
    }

    fn check_same_shape(&self, other: &Self) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(Error::shape(self.shape(), other.shape()));
        }
        Ok(())
    }

    /// Elementwise `self + other`.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the shapes differ.
    pub fn add(&self, other: &Self) -> Result<Self> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Elementwise `self - other`.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the shapes differ.
    pub fn sub(&self, other: &Self) -> Result<Self> {
        self.zip_with(other, |a, b| a - b)
    }

    /// Elementwise (Hadamard) product.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the shapes differ.
    pub fn mul(&self, other: &Self) -> Result<Self> {
        self.zip_with(other, |a, b| a * b)
    }

    /// Elementwise quotient. Zero divisors yield non-finite entries.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the shapes differ.
    pub fn div(&self, other: &Self) -> Result<Self> {
        self.zip_with(other, |a, b| a / b)
    }

    /// Multiplies every element by `k`.
    #[must_use]
    pub fn scale(&self, k: f64) -> Self {
        self.map(|x| x * k)
    }

    /// Matrix product `self · other`.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if `self.cols() != other.rows()`.
    pub fn matmul(&self, other: &Self) -> Result<Self> {
        if self.cols != other.rows {
            return Err(Error::ShapeMismatch {
                expected: vec![self.cols, other.cols],
                got: vec![other.rows, other.cols],
            });
        }
        Ok(cpu::matmul(self, other))
    }

    /// The transpose.
    #[must_use]
    pub fn transpose(&self) -> Self {
        let mut out = vec![0.0; self.data.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                out[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Self::from_raw(self.cols, self.rows, out)
    }

    /// Sum of all elements.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Reinterprets the row-major buffer with a new shape.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the element counts differ.
    pub fn reshape(&self, rows: usize, cols: usize) -> Result<Self> {
        if rows.checked_mul(cols) != Some(self.data.len()) {
            return Err(Error::shape((rows, cols), self.shape()));
        }
        Ok(Self::from_raw(rows, cols, self.data.clone()))
    }

    /// In-place `self += other`.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the shapes differ.
    pub fn add_assign(&mut self, other: &Self) -> Result<()> {
        self.check_same_shape(other)?;
        for (a, &b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
        Ok(())
    }

    /// Row-wise softmax, shifted by each row's maximum.
    #[must_use]
    pub fn softmax_rows(&self) -> Self {
        let mut out = self.data.clone();
        if self.cols > 0 {
            for row in out.chunks_mut(self.cols) {
                let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let mut total = 0.0;
                for x in row.iter_mut() {
                    *x = (*x - max).exp();
                    total += *x;
                }
                for x in row.iter_mut() {
                    *x /= total;
                }
            }
        }
        Self::from_raw(self.rows, self.cols, out)
    }

    /// Row-wise log-softmax: `x - max - ln(sum(exp(x - max)))`.
    #[must_use]
    pub fn log_softmax_rows(&self) -> Self {
        let mut out = self.data.clone();
        if self.cols > 0 {
            for row in out.chunks_mut(self.cols) {
                let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let log_total = row.iter().map(|&x| (x - max).exp()).sum::<f64>().ln();
                for x in row.iter_mut() {
                    *x = *x - max - log_total;
                }
            }
        }
        Self::from_raw(self.rows, self.cols, out)
    }

    /// Sum of each row as an R×1 column.
    #[must_use]
    pub fn row_sums(&self) -> Self {
        let sums = if self.cols == 0 {
            vec![0.0; self.rows]
        } else {
            self.data.chunks(self.cols).map(|row| row.iter().sum()).collect()
        };
        Self::from_raw(self.rows, 1, sums)
    }

    /// Parses a nested-array literal such as `[[1, 2], [3.5, -4e2]]`.
    ///
    /// A flat list (`[1, 2, 3]`) becomes a 1×N row; a bare number becomes 1×1.
    ///
    /// # Errors
    /// [`Error::Parse`] on malformed text, ragged rows or nesting deeper than two.
    pub fn parse(text: &str) -> Result<Self> {
        enum Tok {
            LBrack,
            RBrack,
            Comma,
            Num(f64),
        }

        fn next_token(i: &mut usize, s: &[u8]) -> Result<Option<Tok>> {
            while *i < s.len() && s[*i].is_ascii_whitespace() {
                *i += 1;
            }
            if *i >= s.len() {
                return Ok(None);
            }
            let c = s[*i];
            *i += 1;
            Ok(Some(match c {
                b'[' => Tok::LBrack,
                b']' => Tok::RBrack,
                b',' => Tok::Comma,
                b'-' | b'+' | b'.' | b'0'..=b'9' => {
                    let start = *i - 1;
                    while *i < s.len()
                        && (s[*i].is_ascii_digit() || matches!(s[*i], b'.' | b'e' | b'E' | b'+' | b'-'))
                    {
                        *i += 1;
                    }
                    let lexeme = std::str::from_utf8(&s[start..*i]).map_err(|_| Error::Parse("bad number"))?;
                    Tok::Num(lexeme.parse::<f64>().map_err(|_| Error::Parse("bad number"))?)
                }
                _ => return Err(Error::Parse("invalid character")),
            }))
        }

        let bytes = text.as_bytes();
        let mut idx = 0;
        let mut rows: Vec<Vec<f64>> = Vec::new();
        let mut current: Vec<f64> = Vec::new();
        let mut depth = 0usize;
        let mut max_depth = 0usize;
        let mut expect_val = true;
        let mut after_comma = false;
        let mut closed = false;

        while let Some(tok) = next_token(&mut idx, bytes)? {
            if closed {
                return Err(Error::Parse("trailing input"));
            }
            match tok {
                Tok::LBrack => {
                    if !expect_val {
                        return Err(Error::Parse("missing comma"));
                    }
                    depth += 1;
                    max_depth = max_depth.max(depth);
                    if depth > 2 || (depth == 2 && max_depth == 2 && !current.is_empty()) {
                        return Err(Error::Parse("nesting deeper than two levels"));
                    }
                }
                Tok::RBrack => {
                    if depth == 0 {
                        return Err(Error::Parse("unbalanced brackets"));
                    }
                    if after_comma {
                        return Err(Error::Parse("trailing comma"));
                    }
                    if depth == 2 || (depth == 1 && max_depth == 1) {
                        rows.push(std::mem::take(&mut current));
                    }
                    depth -= 1;
                    closed = depth == 0;
                    expect_val = false;
                }
                Tok::Comma => {
                    if expect_val {
                        return Err(Error::Parse("comma where value expected"));
                    }
                    expect_val = true;
                    after_comma = true;
                    continue;
                }
                Tok::Num(n) => {
                    if !expect_val {
                        return Err(Error::Parse("two values without comma"));
                    }
                    if max_depth == 2 && depth == 1 {
                        return Err(Error::Parse("mixed numbers and rows"));
                    }
                    if depth == 0 {
                        current.push(n);
                        rows.push(std::mem::take(&mut current));
                        closed = true;
                    } else {
                        current.push(n);
                    }
                    expect_val = false;
                }
            }
            after_comma = false;
        }

        if !closed {
            return Err(Error::Parse("unexpected end of input"));
        }
        if max_depth == 1 && rows[0].is_empty() {
            return Ok(Self::zeros(0, 0));
        }
        Self::from_rows(rows).map_err(|_| Error::Parse("ragged rows"))
    }
}

/// The operation that produced a tensor, keying its gradient rule.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// No recorded parents.
    Leaf,
    /// Elementwise `a + b`.
    Add,
    /// Elementwise `a - b`.
    Sub,
    /// Elementwise `a ⊙ b`.
    Mul,
    /// Elementwise `a ⊘ b`.
    Div,
    /// `A · B`.
    MatMul,
    /// `a · k` for the carried scalar operand `k`.
    ScalarMul(f64),
    /// Sum of all elements into a 1×1 tensor.
    Sum,
    /// `max(x, 0)`.
    Relu,
    /// Logistic sigmoid.
    Sigmoid,
    /// Natural logarithm.
    Log,
    /// Row-wise softmax. Recorded, but carries no gradient rule.
    Softmax,
    /// Row-wise log-softmax.
    LogSoftmax,
    /// Row-major reshape into a single row.
    Flatten,
    /// Extraction of one row.
    GetRow(usize),
    /// Contiguous run of rows.
    SliceRows(Range<usize>),
    /// Arbitrary rectangular selection.
    Slice(Rc<Selection>),
}

impl Op {
    /// Short name used in diagnostics and errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Leaf => "leaf",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::MatMul => "matmul",
            Self::ScalarMul(_) => "scalar_mul",
            Self::Sum => "sum",
            Self::Relu => "relu",
            Self::Sigmoid => "sigmoid",
            Self::Log => "log",
            Self::Softmax => "softmax",
            Self::LogSoftmax => "log_softmax",
            Self::Flatten => "flatten",
            Self::GetRow(_) => "get_row",
            Self::SliceRows(_) => "slice_rows",
            Self::Slice(_) => "slice",
        }
    }
}

/// Resolved row and column indices of a rectangular slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Source row of each output row.
    pub rows: Vec<usize>,
    /// Source column of each output column.
    pub cols: Vec<usize>,
}

/// A `start:stop:step` slice along one axis.
///
/// Bounds follow the usual half-open convention: `None` means "from the
/// beginning" / "to the end" (in the direction of `step`), negative values count
/// from the end and out-of-range bounds are clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SliceSpec {
    /// First index, inclusive.
    pub start: Option<isize>,
    /// Last index, exclusive.
    pub stop: Option<isize>,
    /// Stride; defaults to 1, never 0.
    pub step: Option<isize>,
}

impl SliceSpec {
    /// A slice with all three parts given explicitly.
    #[must_use]
    pub fn new(start: Option<isize>, stop: Option<isize>, step: Option<isize>) -> Self {
        Self { start, stop, step }
    }

    /// The whole axis.
    #[must_use]
    pub fn full() -> Self {
        Self::default()
    }

    /// `start..stop` with unit step.
    #[must_use]
    pub fn range(start: isize, stop: isize) -> Self {
        Self::new(Some(start), Some(stop), None)
    }

    /// Resolves the slice against an axis of length `len`.
    ///
    /// # Errors
    /// [`Error::ZeroSliceStep`] if the step is zero.
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub fn indices(&self, len: usize) -> Result<Vec<usize>> {
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return Err(Error::ZeroSliceStep);
        }
        let len = len as isize;
        let (lo, hi) = if step > 0 { (0, len) } else { (-1, len - 1) };
        let bound = |v: Option<isize>, default: isize| match v {
            None => default,
            Some(v) => (if v < 0 { v + len } else { v }).clamp(lo, hi),
        };
        let start = bound(self.start, if step > 0 { 0 } else { len - 1 });
        let stop = bound(self.stop, if step > 0 { len } else { -1 });

        let mut out = Vec::new();
        let mut i = start;
        while (step > 0 && i < stop) || (step < 0 && i > stop) {
            out.push(i as usize);
            i += step;
        }
        Ok(out)
    }
}

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) struct Node {
    id: u64,
    value: RefCell<Matrix>,
    grad: RefCell<Option<Matrix>>,
    parents: Vec<Weak<Node>>,
    op: Op,
    requires_grad: Cell<bool>,
}

/// A shared handle to a computation-graph node.
///
/// Cloning a `Tensor` clones the handle, not the data: all clones observe the
/// same value and gradient. Graph-building operations live in
/// [`crate::backprop`].
#[derive(Clone)]
pub struct Tensor(Rc<Node>);

impl Tensor {
    fn with_node(value: Matrix, parents: Vec<Weak<Node>>, op: Op, requires_grad: bool) -> Self {
        Self(Rc::new(Node {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            value: RefCell::new(value),
            grad: RefCell::new(None),
            parents,
            op,
            requires_grad: Cell::new(requires_grad),
        }))
    }

    /// Wraps an existing matrix as a trainable leaf.
    #[must_use]
    pub fn from_matrix(value: Matrix) -> Self {
        Self::with_node(value, Vec::new(), Op::Leaf, true)
    }

    /// A trainable leaf from a raw row-major buffer.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if `data.len() != rows * cols`.
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        Matrix::new(rows, cols, data).map(Self::from_matrix)
    }

    /// A trainable leaf from nested rows.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the rows are ragged.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        Matrix::from_rows(rows).map(Self::from_matrix)
    }

    /// A leaf of zeros.
    #[must_use]
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::from_matrix(Matrix::zeros(rows, cols))
    }

    /// A leaf of ones.
    #[must_use]
    pub fn ones(rows: usize, cols: usize) -> Self {
        Self::from_matrix(Matrix::ones(rows, cols))
    }

    /// A leaf that never receives gradients.
    #[must_use]
    pub fn constant(value: Matrix) -> Self {
        Self::with_node(value, Vec::new(), Op::Leaf, false)
    }

    /// Creates a recorded graph node. Callers decide whether recording is on.
    pub(crate) fn from_parents(value: Matrix, op: Op, parents: &[&Tensor]) -> Self {
        let requires_grad = parents.iter().any(|p| p.requires_grad());
        let edges = parents.iter().map(|p| Rc::downgrade(&p.0)).collect();
        Self::with_node(value, edges, op, requires_grad)
    }

    /// Diagnostic identifier, unique and increasing within the process.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// The operation that produced this tensor.
    #[must_use]
    pub fn op(&self) -> &Op {
        &self.0.op
    }

    /// `true` if no parent edges were recorded.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.0.parents.is_empty()
    }

    /// Whether backward accumulates into this tensor.
    #[must_use]
    pub fn requires_grad(&self) -> bool {
        self.0.requires_grad.get()
    }

    /// Enables or disables gradient accumulation into this tensor.
    pub fn set_requires_grad(&self, requires_grad: bool) {
        self.0.requires_grad.set(requires_grad);
    }

    /// `(rows, cols)` of the value.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        self.0.value.borrow().shape()
    }

    /// Borrows the value matrix.
    ///
    /// # Panics
    /// Panics if the value is being mutated concurrently through [`Tensor::set_value`].
    #[must_use]
    pub fn value(&self) -> Ref<'_, Matrix> {
        self.0.value.borrow()
    }

    pub(crate) fn value_mut(&self) -> RefMut<'_, Matrix> {
        self.0.value.borrow_mut()
    }

    /// Replaces the value in place, keeping its shape.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if `value` has a different shape.
    pub fn set_value(&self, value: Matrix) -> Result<()> {
        let mut current = self.0.value.borrow_mut();
        if current.shape() != value.shape() {
            return Err(Error::shape(current.shape(), value.shape()));
        }
        *current = value;
        Ok(())
    }

    /// Reads a single element of the value.
    ///
    /// # Errors
    /// [`Error::IndexOutOfRange`] outside the value's bounds.
    pub fn get_element(&self, r: usize, c: usize) -> Result<f64> {
        self.0.value.borrow().get(r, c)
    }

    /// Element `(0, 0)`; the scalar value of a 1×1 tensor.
    ///
    /// # Errors
    /// [`Error::IndexOutOfRange`] if the tensor is empty.
    pub fn item(&self) -> Result<f64> {
        self.get_element(0, 0)
    }

    /// `true` once a gradient buffer has been allocated.
    #[must_use]
    pub fn has_grad(&self) -> bool {
        self.0.grad.borrow().is_some()
    }

    /// The accumulated gradient, or zeros if none has been written.
    #[must_use]
    pub fn grad(&self) -> Matrix {
        match &*self.0.grad.borrow() {
            Some(grad) => grad.clone(),
            None => {
                let (rows, cols) = self.shape();
                Matrix::zeros(rows, cols)
            }
        }
    }

    pub(crate) fn grad_snapshot(&self) -> Option<Matrix> {
        self.0.grad.borrow().clone()
    }

    /// Overwrites the gradient buffer.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if `grad` does not match the value's shape.
    pub fn set_grad(&self, grad: Matrix) -> Result<()> {
        if grad.shape() != self.shape() {
            return Err(Error::shape(self.shape(), grad.shape()));
        }
        *self.0.grad.borrow_mut() = Some(grad);
        Ok(())
    }

    /// Adds `contribution` into the gradient, allocating it on first write.
    pub(crate) fn accumulate_grad(&self, contribution: &Matrix) -> Result<()> {
        let mut slot = self.0.grad.borrow_mut();
        match slot.as_mut() {
            Some(grad) => grad.add_assign(contribution),
            None => {
                let shape = self.0.value.borrow().shape();
                if contribution.shape() != shape {
                    return Err(Error::shape(shape, contribution.shape()));
                }
                *slot = Some(contribution.clone());
                Ok(())
            }
        }
    }

    /// Releases the gradient buffer.
    pub fn zero_grad(&self) {
        *self.0.grad.borrow_mut() = None;
    }

    /// Upgrades every parent edge.
    ///
    /// # Errors
    /// [`Error::DanglingGraphEdge`] if any parent has been freed.
    pub fn parents(&self) -> Result<Vec<Tensor>> {
        self.0
            .parents
            .iter()
            .map(|edge| {
                edge.upgrade()
                    .map(Tensor)
                    .ok_or(Error::DanglingGraphEdge { node: self.0.id })
            })
            .collect()
    }

    /// `true` if both handles point at the same node.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Plain elementwise sum; the result is a fresh leaf with no edges.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the shapes differ.
    pub fn plain_add(&self, other: &Self) -> Result<Self> {
        self.value().add(&other.value()).map(Self::from_matrix)
    }

    /// Plain elementwise difference.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the shapes differ.
    pub fn plain_sub(&self, other: &Self) -> Result<Self> {
        self.value().sub(&other.value()).map(Self::from_matrix)
    }

    /// Plain elementwise product.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the shapes differ.
    pub fn plain_mul(&self, other: &Self) -> Result<Self> {
        self.value().mul(&other.value()).map(Self::from_matrix)
    }

    /// Plain elementwise quotient.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the shapes differ.
    pub fn plain_div(&self, other: &Self) -> Result<Self> {
        self.value().div(&other.value()).map(Self::from_matrix)
    }

    /// Plain scalar product.
    #[must_use]
    pub fn plain_scale(&self, k: f64) -> Self {
        Self::from_matrix(self.value().scale(k))
    }

    /// Plain matrix product.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the inner dimensions differ.
    pub fn plain_matmul(&self, other: &Self) -> Result<Self> {
        self.value().matmul(&other.value()).map(Self::from_matrix)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.0.id)
            .field("shape", &self.shape())
            .field("op", &self.0.op.name())
            .field("requires_grad", &self.requires_grad())
            .finish_non_exhaustive()
    }
}

impl From<Matrix> for Tensor {
    fn from(value: Matrix) -> Self {
        Self::from_matrix(value)
    }
}
