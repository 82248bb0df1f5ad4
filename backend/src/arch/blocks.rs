use ndarray::Array3;

use crate::nn::{
    Conv2d, ParamError, ParamSource, ParamVisitor, ShapeError, add_inplace, depth_to_space,
    relu_inplace,
};

/// Convolution followed by ReLU.
#[derive(Debug, Clone)]
pub(super) struct ConvRelu {
    conv: Conv2d,
}

impl ConvRelu {
    pub fn new(
        params: &mut dyn ParamSource,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
    ) -> Result<Self, ParamError> {
        Ok(Self {
            conv: Conv2d::new(params, name, in_channels, out_channels, kernel)?,
        })
    }

    pub fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>, ShapeError> {
        let mut y = self.conv.forward(x)?;
        relu_inplace(&mut y);
        Ok(y)
    }

    pub fn visit(&self, visitor: &mut ParamVisitor<'_>) {
        self.conv.visit(visitor);
    }
}

/// `relu(conv2(relu(conv1(x))) + x)` at constant width.
#[derive(Debug, Clone)]
pub(super) struct ResidualBlock {
    conv1: ConvRelu,
    conv2: Conv2d,
}

impl ResidualBlock {
    pub fn new(params: &mut dyn ParamSource, name: &str, width: usize) -> Result<Self, ParamError> {
        Ok(Self {
            conv1: ConvRelu::new(params, &format!("{name}.conv1"), width, width, 3)?,
            conv2: Conv2d::new(params, &format!("{name}.conv2"), width, width, 3)?,
        })
    }

    pub fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>, ShapeError> {
        let mut y = self.conv2.forward(&self.conv1.forward(x)?)?;
        add_inplace(&mut y, x)?;
        relu_inplace(&mut y);
        Ok(y)
    }

    pub fn visit(&self, visitor: &mut ParamVisitor<'_>) {
        self.conv1.visit(visitor);
        self.conv2.visit(visitor);
    }
}

/// Final convolution to `channels * scale²` maps, then depth-to-space.
#[derive(Debug, Clone)]
pub(super) struct SubPixel {
    conv: Conv2d,
    scale: usize,
}

impl SubPixel {
    pub fn new(
        params: &mut dyn ParamSource,
        name: &str,
        in_channels: usize,
        channels: usize,
        scale: usize,
    ) -> Result<Self, ParamError> {
        Ok(Self {
            conv: Conv2d::new(params, name, in_channels, channels * scale * scale, 3)?,
            scale,
        })
    }

    pub fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>, ShapeError> {
        depth_to_space(&self.conv.forward(x)?, self.scale)
    }

    pub fn visit(&self, visitor: &mut ParamVisitor<'_>) {
        self.conv.visit(visitor);
    }
}
