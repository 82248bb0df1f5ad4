//! Minimal inference-only tensor operations over `ndarray`.
//!
//! Feature maps are `Array3<f32>` laid out as `(channels, height, width)`.

mod layers;
mod ops;
mod params;

pub use layers::{BatchNorm, Conv2d, PRelu, ParamVisitor};
pub use ops::{add_inplace, concat_channels, depth_to_space, relu_inplace, tanh_inplace, ShapeError};
pub use params::{Init, Initializer, ParamError, ParamSource, WeightFile};
