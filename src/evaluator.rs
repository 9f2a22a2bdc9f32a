//! Scoped, dynamically-typed evaluator.
//!
//! The script front end translates source text into calls against
//! [`Evaluator`]: variable bindings go through [`Evaluator::assign_variable`] and
//! [`Evaluator::get_variable`], blocks and function bodies bracket themselves
//! with [`Evaluator::enter_scope`] / [`Evaluator::exit_scope`], and arithmetic
//! goes through [`Evaluator::evaluate`]. Arithmetic on tensors builds graph
//! nodes, so a script's expressions are differentiable.
//!
//! # Dispatch Table
//!
//! | left | right | operators | result |
//! |---|---|---|---|
//! | tensor | tensor | `+ - * /` | elementwise graph op |
//! | tensor | int/float | `*` | graph scalar-mul |
//! | int/float | tensor | `*` | graph scalar-mul |
//! | int | int | `+ - *` | int |
//! | int | int | `/` | float |
//! | int/float | int/float | `+ - * /` | float (when either is float) |
//! | string | string | `+` | concatenation |
//!
//! Anything else fails with [`Error::UnsupportedOperands`].

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use crate::context;
use crate::error::{Error, Result};
use crate::tensors::Tensor;

/// A runtime value of the scripting language.
#[derive(Clone)]
pub enum Value {
    /// 64-bit signed integer.
    Int(i64),
    /// Double-precision float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Boolean.
    Bool(bool),
    /// A graph tensor handle.
    Tensor(Tensor),
    /// Anything the front end needs to store but the core never inspects
    /// (modules, optimizers, callables).
    Opaque(Rc<dyn Any>),
}

impl Value {
    /// Stable type name used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Bool(_) => "bool",
            Self::Tensor(_) => "tensor",
            Self::Opaque(_) => "opaque",
        }
    }

    /// Wraps any value as [`Value::Opaque`].
    pub fn opaque<T: Any>(value: T) -> Self {
        Self::Opaque(Rc::new(value))
    }

    /// Borrows the tensor inside a [`Value::Tensor`].
    #[must_use]
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// The numeric value of an int or float, widened to `f64`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Downcasts an opaque payload.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Opaque(any) => any.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "Int({i})"),
            Self::Float(x) => write!(f, "Float({x})"),
            Self::Str(s) => write!(f, "Str({s:?})"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Tensor(t) => write!(f, "{t:?}"),
            Self::Opaque(_) => f.write_str("Opaque(..)"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Tensor(a), Self::Tensor(b)) => a.ptr_eq(b),
            (Self::Opaque(a), Self::Opaque(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Tensor> for Value {
    fn from(v: Tensor) -> Self {
        Self::Tensor(v)
    }
}

/// Arithmetic operators handled by [`Evaluator::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
}

impl BinaryOp {
    /// The operator's source symbol.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
        }
    }
}

impl FromStr for BinaryOp {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "+" => Ok(Self::Add),
            "-" => Ok(Self::Sub),
            "*" => Ok(Self::Mul),
            "/" => Ok(Self::Div),
            _ => Err(()),
        }
    }
}

/// Comparison operators handled by [`Evaluator::compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl FromStr for CompareOp {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "==" => Ok(Self::Eq),
            "!=" => Ok(Self::Ne),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            _ => Err(()),
        }
    }
}

impl CompareOp {
    fn holds<T: PartialOrd>(self, a: &T, b: &T) -> bool {
        match self {
            Self::Eq => a == b,
            Self::Ne => a != b,
            Self::Lt => a < b,
            Self::Le => a <= b,
            Self::Gt => a > b,
            Self::Ge => a >= b,
        }
    }
}

fn unsupported(op: &str, left: &Value, right: &Value) -> Error {
    Error::UnsupportedOperands {
        op: op.to_owned(),
        left: left.type_name(),
        right: right.type_name(),
    }
}

/// A stack of scopes plus the operator dispatch table.
#[derive(Debug)]
pub struct Evaluator {
    scopes: Vec<HashMap<String, Value>>,
}

impl Evaluator {
    /// An evaluator holding only the global scope.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scopes: vec![HashMap::new()],
        }
    }

    /// Pushes a fresh innermost scope.
    pub fn enter_scope(&mut self) {
        self.scopes.push(HashMap::new());
        tracing::trace!(depth = self.scopes.len(), "scope entered");
    }

    /// Pops the innermost scope.
    ///
    /// # Errors
    /// [`Error::GlobalScopeExit`] if only the global scope remains.
    pub fn exit_scope(&mut self) -> Result<()> {
        if self.scopes.len() <= 1 {
            return Err(Error::GlobalScopeExit);
        }
        self.scopes.pop();
        tracing::trace!(depth = self.scopes.len(), "scope exited");
        Ok(())
    }

    /// Number of live scopes, global included.
    #[must_use]
    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    /// Binds `name` in the innermost scope, shadowing outer bindings.
    pub fn assign_variable(&mut self, name: impl Into<String>, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.into(), value);
        }
    }

    /// Looks `name` up from the innermost scope outwards.
    ///
    /// # Errors
    /// [`Error::UndefinedVariable`] if no scope binds it.
    pub fn get_variable(&self, name: &str) -> Result<Value> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .cloned()
            .ok_or_else(|| Error::UndefinedVariable(name.to_owned()))
    }

    /// Applies the arithmetic operator spelled `op` (`+`, `-`, `*` or `/`).
    ///
    /// # Errors
    /// [`Error::UnsupportedOperands`] for unknown operators or operand types,
    /// plus whatever the selected operation raises.
    pub fn evaluate(&self, op: &str, left: &Value, right: &Value) -> Result<Value> {
        let parsed = op.parse::<BinaryOp>().map_err(|()| unsupported(op, left, right))?;
        self.apply(parsed, left, right)
    }

    /// Applies an already-parsed arithmetic operator.
    ///
    /// # Errors
    /// See [`Evaluator::evaluate`].
    pub fn apply(&self, op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
        use Value::{Float, Int, Str};

        match (left, right) {
            (Value::Tensor(a), Value::Tensor(b)) => {
                let out = match op {
                    BinaryOp::Add => a.add(b)?,
                    BinaryOp::Sub => a.sub(b)?,
                    BinaryOp::Mul => a.mul(b)?,
                    BinaryOp::Div => a.div(b)?,
                };
                Ok(Value::Tensor(out))
            }
            (Value::Tensor(t), Int(_) | Float(_)) | (Int(_) | Float(_), Value::Tensor(t)) => {
                if op != BinaryOp::Mul {
                    return Err(unsupported(op.symbol(), left, right));
                }
                let k = if let Value::Tensor(_) = left { right } else { left };
                let k = k.as_f64().ok_or_else(|| unsupported(op.symbol(), left, right))?;
                Ok(Value::Tensor(t.mul_scalar(k)))
            }
            (Int(a), Int(b)) => int_arith(op, *a, *b),
            (Int(_) | Float(_), Int(_) | Float(_)) => {
                let (a, b) = (left.as_f64(), right.as_f64());
                match (a, b) {
                    (Some(a), Some(b)) => float_arith(op, a, b),
                    _ => Err(unsupported(op.symbol(), left, right)),
                }
            }
            (Str(a), Str(b)) if op == BinaryOp::Add => Ok(Str(format!("{a}{b}"))),
            _ => Err(unsupported(op.symbol(), left, right)),
        }
    }

    /// Graph matrix product of two tensor values.
    ///
    /// # Errors
    /// - [`Error::UnsupportedOperands`] if either operand is not a tensor
    /// - [`Error::ShapeMismatch`] if the inner dimensions differ
    pub fn matmul(&self, left: &Value, right: &Value) -> Result<Value> {
        match (left, right) {
            (Value::Tensor(a), Value::Tensor(b)) => Ok(Value::Tensor(a.matmul(b)?)),
            _ => Err(unsupported("matmul", left, right)),
        }
    }

    /// Applies the comparison operator spelled `op`.
    ///
    /// Numbers compare after promotion, strings lexicographically, booleans and
    /// other values by equality only.
    ///
    /// # Errors
    /// [`Error::UnsupportedOperands`] for unknown operators or incomparable types.
    pub fn compare(&self, op: &str, left: &Value, right: &Value) -> Result<Value> {
        let cmp = op.parse::<CompareOp>().map_err(|()| unsupported(op, left, right))?;
        let holds = match (left, right) {
            (Value::Int(a), Value::Int(b)) => cmp.holds(a, b),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                match (left.as_f64(), right.as_f64()) {
                    (Some(a), Some(b)) => cmp.holds(&a, &b),
                    _ => return Err(unsupported(op, left, right)),
                }
            }
            (Value::Str(a), Value::Str(b)) => cmp.holds(a, b),
            _ => match cmp {
                CompareOp::Eq => left == right,
                CompareOp::Ne => left != right,
                _ => return Err(unsupported(op, left, right)),
            },
        };
        Ok(Value::Bool(holds))
    }

    /// Enables or disables graph recording for subsequent operations.
    pub fn set_grad_enabled(&self, enabled: bool) {
        context::set_recording(enabled);
    }

    /// Whether graph recording is enabled.
    #[must_use]
    pub fn is_grad_enabled(&self) -> bool {
        context::is_recording()
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn int_arith(op: BinaryOp, a: i64, b: i64) -> Result<Value> {
    let overflow = || Error::IntegerOverflow(format!("{a} {} {b}", op.symbol()));
    match op {
        BinaryOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
        BinaryOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
        BinaryOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
        #[allow(clippy::cast_precision_loss)]
        BinaryOp::Div => float_arith(op, a as f64, b as f64),
    }
}

fn float_arith(op: BinaryOp, a: f64, b: f64) -> Result<Value> {
    let out = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(Error::DivisionByZero);
            }
            a / b
        }
    };
    Ok(Value::Float(out))
}
