use ndarray::Array3;

use super::blocks::{ConvRelu, ResidualBlock, SubPixel};
use super::{ArchitectureDescriptor, ArchitectureError, SuperResolution};
use crate::nn::{ParamSource, ParamVisitor, ShapeError};

const WIDTH: usize = 128;
const BLOCKS: usize = 6;

/// Wide residual network with a sub-pixel reconstruction tail.
///
/// `head` (9x9) -> 6 residual blocks -> 3x3 narrowing to 64 then 32 -> sub-pixel.
pub struct EnhancedResidual {
    descriptor: ArchitectureDescriptor,
    head: ConvRelu,
    body: Vec<ResidualBlock>,
    neck: [ConvRelu; 2],
    tail: SubPixel,
}

impl EnhancedResidual {
    pub fn new(
        descriptor: ArchitectureDescriptor,
        params: &mut dyn ParamSource,
    ) -> Result<Self, ArchitectureError> {
        let head = ConvRelu::new(params, "head", descriptor.channels, WIDTH, 9)?;
        let body = (0..BLOCKS)
            .map(|i| ResidualBlock::new(params, &format!("body.{i}"), WIDTH))
            .collect::<Result<Vec<_>, _>>()?;
        let neck = [
            ConvRelu::new(params, "neck.0", WIDTH, 64, 3)?,
            ConvRelu::new(params, "neck.1", 64, 32, 3)?,
        ];
        let tail = SubPixel::new(
            params,
            "tail",
            32,
            descriptor.channels,
            descriptor.scale_factor,
        )?;

        Ok(Self {
            descriptor,
            head,
            body,
            neck,
            tail,
        })
    }
}

impl SuperResolution for EnhancedResidual {
    fn descriptor(&self) -> ArchitectureDescriptor {
        self.descriptor
    }

    fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>, ShapeError> {
        let mut y = self.head.forward(x)?;
        for block in &self.body {
            y = block.forward(&y)?;
        }
        for layer in &self.neck {
            y = layer.forward(&y)?;
        }
        self.tail.forward(&y)
    }

    fn visit_params(&self, visitor: &mut ParamVisitor<'_>) {
        self.head.visit(visitor);
        self.body.iter().for_each(|block| block.visit(visitor));
        self.neck.iter().for_each(|layer| layer.visit(visitor));
        self.tail.visit(visitor);
    }
}
