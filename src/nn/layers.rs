//! Layers and containers.
//!
//! A [`Module`] maps an input tensor to an output tensor using recorded graph
//! operations and exposes its trainable parameters. Containers concatenate the
//! parameters of their children in insertion order, which is the order
//! optimizers and checkpoints see.
//!
//! ## Example
//!
//! ```
//! use mlscript::nn::{Module, Sequential};
//! use mlscript::Tensor;
//!
//! let net = Sequential::builder(2).seed(7).dense(4).relu().dense(1).sigmoid().build();
//! let x = Tensor::from_rows(vec![vec![0.0, 1.0], vec![1.0, 0.0]]).unwrap();
//! let y = net.forward(&x).unwrap();
//! assert_eq!(y.shape(), (2, 1));
//! assert_eq!(net.parameters().len(), 4);
//! ```

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::tensors::{Matrix, Tensor};

/// A differentiable computation with trainable parameters.
pub trait Module {
    /// Runs the computation, recording graph edges when recording is enabled.
    ///
    /// # Errors
    /// Propagates shape errors from the underlying graph operations.
    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    /// Handles to every trainable parameter, in a stable order.
    fn parameters(&self) -> Vec<Tensor>;
}

/// Ordered container applying its children left to right.
#[derive(Default)]
pub struct Sequential {
    modules: Vec<Box<dyn Module>>,
}

impl Sequential {
    /// An empty container; its forward pass is the identity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a builder for inputs with `input_features` columns.
    #[must_use]
    pub fn builder(input_features: usize) -> SequentialBuilder {
        SequentialBuilder {
            features: input_features,
            seed: None,
            net: Self::new(),
        }
    }

    /// Appends `module` after the existing children.
    pub fn add_module(&mut self, module: impl Module + 'static) {
        self.modules.push(Box::new(module));
    }

    /// Number of children.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// `true` if there are no children.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.modules
            .iter()
            .try_fold(input.clone(), |x, module| module.forward(&x))
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.modules.iter().flat_map(|m| m.parameters()).collect()
    }
}

/// Assembles a [`Sequential`], inferring each [`Dense`] layer's input width
/// from the previous layer's output width.
pub struct SequentialBuilder {
    features: usize,
    seed: Option<u64>,
    net: Sequential,
}

impl SequentialBuilder {
    /// Initializes subsequent dense layers deterministically from `seed`.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Appends a dense layer producing `out_features` columns.
    #[must_use]
    pub fn dense(mut self, out_features: usize) -> Self {
        let layer = match self.seed {
            Some(seed) => {
                self.seed = Some(seed.wrapping_add(1));
                Dense::seeded(self.features, out_features, seed)
            }
            None => Dense::new(self.features, out_features),
        };
        self.net.add_module(layer);
        self.features = out_features;
        self
    }

    /// Appends a ReLU activation.
    #[must_use]
    pub fn relu(mut self) -> Self {
        self.net.add_module(Relu);
        self
    }

    /// Appends a sigmoid activation.
    #[must_use]
    pub fn sigmoid(mut self) -> Self {
        self.net.add_module(Sigmoid);
        self
    }

    /// Appends a flatten step. The inferred width is left unchanged, which is
    /// exact for single-row inputs.
    #[must_use]
    pub fn flatten(mut self) -> Self {
        self.net.add_module(Flatten);
        self
    }

    /// Width of the most recent layer's output.
    #[must_use]
    pub fn features(&self) -> usize {
        self.features
    }

    /// Finishes the network.
    #[must_use]
    pub fn build(self) -> Sequential {
        self.net
    }
}

/// Fully connected layer: `input·weight + bias`.
///
/// `weight` is `in×out` and `bias` is `1×out`. For an `N`-row input the bias
/// is expanded through a recorded `ones(N×1)·bias` product, so its gradient is
/// the column sum of the upstream gradient.
pub struct Dense {
    weight: Tensor,
    bias: Tensor,
}

impl Dense {
    /// A layer initialized uniformly in `[-1, 1)` from the thread RNG.
    #[must_use]
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self::init(in_features, out_features, &mut rand::rng())
    }

    /// A layer initialized uniformly in `[-1, 1)` from a seeded RNG.
    #[must_use]
    pub fn seeded(in_features: usize, out_features: usize, seed: u64) -> Self {
        Self::init(in_features, out_features, &mut StdRng::seed_from_u64(seed))
    }

    fn init(in_features: usize, out_features: usize, rng: &mut impl Rng) -> Self {
        let mut draw = |rows: usize, cols: usize| {
            let data = (0..rows * cols).map(|_| rng.random_range(-1.0..1.0)).collect();
            Tensor::from_matrix(Matrix::from_raw(rows, cols, data))
        };
        let weight = draw(in_features, out_features);
        let bias = draw(1, out_features);
        Self { weight, bias }
    }

    /// A layer around existing parameters.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] unless `bias` is `1×out` where `weight` is `in×out`.
    pub fn from_parameters(weight: Tensor, bias: Tensor) -> Result<Self> {
        let expected = (1, weight.shape().1);
        if bias.shape() != expected {
            return Err(Error::shape(expected, bias.shape()));
        }
        Ok(Self { weight, bias })
    }

    /// The `in×out` weight.
    #[must_use]
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// The `1×out` bias.
    #[must_use]
    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// `(in_features, out_features)`.
    #[must_use]
    pub fn dims(&self) -> (usize, usize) {
        self.weight.shape()
    }
}

impl Module for Dense {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let projected = input.matmul(&self.weight)?;
        let ones = Tensor::constant(Matrix::ones(input.shape().0, 1));
        let bias = ones.matmul(&self.bias)?;
        projected.add(&bias)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone(), self.bias.clone()]
    }
}

/// Elementwise `max(x, 0)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Relu;

impl Module for Relu {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        Ok(input.relu())
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

/// Elementwise logistic function.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sigmoid;

impl Module for Sigmoid {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        Ok(input.sigmoid())
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

/// Reshapes the input into a single row.
#[derive(Debug, Default, Clone, Copy)]
pub struct Flatten;

impl Module for Flatten {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        Ok(input.flatten())
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}
