use std::collections::HashMap;

use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    #[error("missing tensor `{0}`")]
    Missing(String),
    #[error("tensor `{name}` has shape {got:?}, expected {expected:?}")]
    Shape {
        name: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    #[error("tensor `{name}` holds {got} values, its shape needs {expected}")]
    Length {
        name: String,
        got: usize,
        expected: usize,
    },
    #[error("checkpoint carries tensors the architecture does not use: {0:?}")]
    Unused(Vec<String>),
    #[error("layout error: {0}")]
    Layout(#[from] ndarray::ShapeError),
}

/// How a fresh parameter is filled when no learned value is available.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    GlorotUniform { fan_in: usize, fan_out: usize },
    Constant(f32),
}

/// Supplies named parameter tensors to layers as they are constructed.
pub trait ParamSource {
    fn take(&mut self, name: &str, shape: &[usize], init: Init) -> Result<ArrayD<f32>, ParamError>;
}

/// Produces untrained parameters from a seeded generator.
pub struct Initializer {
    rng: StdRng,
}

impl Initializer {
    pub const DEFAULT_SEED: u64 = 0x5eed_0f_2a;

    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for Initializer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SEED)
    }
}

impl ParamSource for Initializer {
    fn take(&mut self, _name: &str, shape: &[usize], init: Init) -> Result<ArrayD<f32>, ParamError> {
        let array = match init {
            Init::Constant(value) => ArrayD::from_elem(IxDyn(shape), value),
            Init::GlorotUniform { fan_in, fan_out } => {
                let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
                ArrayD::from_shape_simple_fn(IxDyn(shape), || self.rng.random_range(-limit..limit))
            }
        };
        Ok(array)
    }
}

/// Learned parameters keyed by layer path, as read from a checkpoint.
///
/// Every tensor is consumed at most once; [`WeightFile::finish`] reports any
/// that the architecture never asked for.
#[derive(Debug, Default)]
pub struct WeightFile {
    tensors: HashMap<String, (Vec<usize>, Vec<f32>)>,
}

impl WeightFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) {
        self.tensors.insert(name.into(), (shape, data));
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn finish(self) -> Result<(), ParamError> {
        if self.tensors.is_empty() {
            return Ok(());
        }
        let mut names: Vec<String> = self.tensors.into_keys().collect();
        names.sort();
        Err(ParamError::Unused(names))
    }
}

impl ParamSource for WeightFile {
    fn take(&mut self, name: &str, shape: &[usize], _init: Init) -> Result<ArrayD<f32>, ParamError> {
        let (got, data) = self
            .tensors
            .remove(name)
            .ok_or_else(|| ParamError::Missing(name.to_string()))?;
        if got != shape {
            return Err(ParamError::Shape {
                name: name.to_string(),
                got,
                expected: shape.to_vec(),
            });
        }
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(ParamError::Length {
                name: name.to_string(),
                got: data.len(),
                expected,
            });
        }
        Ok(ArrayD::from_shape_vec(IxDyn(shape), data)?)
    }
}
