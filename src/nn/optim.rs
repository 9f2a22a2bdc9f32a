//! Optimizers.
//!
//! An optimizer owns handles to the parameters it updates. Because
//! [`Tensor`] handles share storage, updates are visible through the module
//! that produced the parameters.
//!
//! A parameter whose gradient buffer was never allocated is treated as having
//! a zero gradient.

use crate::tensors::{Matrix, Tensor};

/// Applies accumulated gradients to a fixed set of parameters.
pub trait Optimizer {
    /// Releases every tracked parameter's gradient buffer.
    fn zero_grad(&mut self);

    /// Updates every tracked parameter from its current gradient.
    fn step(&mut self);

    /// Current step size.
    fn learning_rate(&self) -> f64;
}

/// Stochastic gradient descent.
///
/// # Formula
///
/// $$ w := w - \\text{lr} \\cdot \\frac{\\partial L}{\\partial w} $$
pub struct Sgd {
    params: Vec<Tensor>,
    lr: f64,
}

impl Sgd {
    /// Tracks `params` with step size `lr`.
    #[must_use]
    pub fn new(params: Vec<Tensor>, lr: f64) -> Self {
        Self { params, lr }
    }

    /// The tracked parameters.
    #[must_use]
    pub fn params(&self) -> &[Tensor] {
        &self.params
    }
}

impl Optimizer for Sgd {
    fn zero_grad(&mut self) {
        self.params.iter().for_each(Tensor::zero_grad);
    }

    fn step(&mut self) {
        for p in &self.params {
            let Some(grad) = p.grad_snapshot() else {
                continue;
            };
            let mut value = p.value_mut();
            for (w, g) in value.data_mut().iter_mut().zip(grad.data()) {
                *w -= self.lr * g;
            }
        }
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }
}

/// Hyperparameters for [`Adam`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    /// Step size.
    pub lr: f64,
    /// Decay of the first moment.
    pub beta1: f64,
    /// Decay of the second moment.
    pub beta2: f64,
    /// Added to the denominator.
    pub eps: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl AdamConfig {
    /// Defaults with a different learning rate.
    #[must_use]
    pub fn with_lr(lr: f64) -> Self {
        Self {
            lr,
            ..Self::default()
        }
    }

    /// Overrides both moment decays.
    #[must_use]
    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    /// Overrides the denominator epsilon.
    #[must_use]
    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }
}

/// Adam with bias-corrected moment estimates.
///
/// # Formula
///
/// With `t` counting calls to [`Optimizer::step`]:
///
/// - `m := β₁·m + (1 − β₁)·g`
/// - `v := β₂·v + (1 − β₂)·g²`
/// - `w := w − lr · (m / (1 − β₁ᵗ)) / (sqrt(v / (1 − β₂ᵗ)) + ε)`
pub struct Adam {
    params: Vec<Tensor>,
    config: AdamConfig,
    m: Vec<Matrix>,
    v: Vec<Matrix>,
    t: i32,
}

impl Adam {
    /// Tracks `params` with the default configuration.
    #[must_use]
    pub fn new(params: Vec<Tensor>) -> Self {
        Self::with_config(params, AdamConfig::default())
    }

    /// Tracks `params` with an explicit configuration.
    #[must_use]
    pub fn with_config(params: Vec<Tensor>, config: AdamConfig) -> Self {
        let zeros = |p: &Tensor| {
            let (rows, cols) = p.shape();
            Matrix::zeros(rows, cols)
        };
        let m = params.iter().map(zeros).collect();
        let v = params.iter().map(zeros).collect();
        Self {
            params,
            config,
            m,
            v,
            t: 0,
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> AdamConfig {
        self.config
    }

    /// Number of completed steps.
    #[must_use]
    pub fn steps(&self) -> i32 {
        self.t
    }
}

impl Optimizer for Adam {
    fn zero_grad(&mut self) {
        self.params.iter().for_each(Tensor::zero_grad);
    }

    fn step(&mut self) {
        let AdamConfig {
            lr,
            beta1,
            beta2,
            eps,
        } = self.config;
        self.t = self.t.saturating_add(1);
        let bias1 = 1.0 - beta1.powi(self.t);
        let bias2 = 1.0 - beta2.powi(self.t);

        for ((p, m), v) in self.params.iter().zip(&mut self.m).zip(&mut self.v) {
            let grad = p.grad();
            let mut value = p.value_mut();

            #[allow(clippy::suspicious_operation_groupings)]
            for (((w, g), m_val), v_val) in value
                .data_mut()
                .iter_mut()
                .zip(grad.data())
                .zip(m.data_mut())
                .zip(v.data_mut())
            {
                *m_val = beta1 * *m_val + (1.0 - beta1) * g;
                *v_val = beta2 * *v_val + (1.0 - beta2) * g * g;
                let m_hat = *m_val / bias1;
                let v_hat = *v_val / bias2;
                *w -= lr * m_hat / (v_hat.sqrt() + eps);
            }
        }
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }
}
