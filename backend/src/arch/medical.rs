use ndarray::Array3;

use super::blocks::{ConvRelu, ResidualBlock, SubPixel};
use super::{ArchitectureDescriptor, ArchitectureError, SuperResolution};
use crate::nn::{ParamSource, ParamVisitor, ShapeError, concat_channels};

const STEM_WIDTH: usize = 64;
const BRANCH_WIDTH: usize = 32;
const BRANCH_KERNELS: [usize; 3] = [3, 5, 7];
const FUSED_WIDTH: usize = BRANCH_WIDTH * BRANCH_KERNELS.len();
const BLOCKS: usize = 8;

/// Two stacked convolutions with the same kernel size.
struct Branch {
    layers: [ConvRelu; 2],
}

/// Multi-scale network for radiographs.
///
/// A shared 7x7 stem feeds three branches (3x3, 5x5 and 7x7 kernels) whose
/// outputs are concatenated and refined by eight residual blocks before the
/// sub-pixel tail.
pub struct MedicalMultiBranch {
    descriptor: ArchitectureDescriptor,
    stem: ConvRelu,
    branches: Vec<Branch>,
    body: Vec<ResidualBlock>,
    neck: ConvRelu,
    tail: SubPixel,
}

impl MedicalMultiBranch {
    pub fn new(
        descriptor: ArchitectureDescriptor,
        params: &mut dyn ParamSource,
    ) -> Result<Self, ArchitectureError> {
        let stem = ConvRelu::new(params, "stem", descriptor.channels, STEM_WIDTH, 7)?;

        let mut branches = Vec::with_capacity(BRANCH_KERNELS.len());
        for (b, kernel) in BRANCH_KERNELS.into_iter().enumerate() {
            branches.push(Branch {
                layers: [
                    ConvRelu::new(params, &format!("branch.{b}.0"), STEM_WIDTH, BRANCH_WIDTH, kernel)?,
                    ConvRelu::new(params, &format!("branch.{b}.1"), BRANCH_WIDTH, BRANCH_WIDTH, kernel)?,
                ],
            });
        }

        let body = (0..BLOCKS)
            .map(|i| ResidualBlock::new(params, &format!("body.{i}"), FUSED_WIDTH))
            .collect::<Result<Vec<_>, _>>()?;
        let neck = ConvRelu::new(params, "neck", FUSED_WIDTH, 64, 3)?;
        let tail = SubPixel::new(params, "tail", 64, descriptor.channels, descriptor.scale_factor)?;

        Ok(Self {
            descriptor,
            stem,
            branches,
            body,
            neck,
            tail,
        })
    }
}

impl SuperResolution for MedicalMultiBranch {
    fn descriptor(&self) -> ArchitectureDescriptor {
        self.descriptor
    }

    fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>, ShapeError> {
        let features = self.stem.forward(x)?;

        let mut outputs = Vec::with_capacity(self.branches.len());
        for branch in &self.branches {
            let [first, second] = &branch.layers;
            outputs.push(second.forward(&first.forward(&features)?)?);
        }
        let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
        let mut y = concat_channels(&views)?;

        for block in &self.body {
            y = block.forward(&y)?;
        }
        self.tail.forward(&self.neck.forward(&y)?)
    }

    fn visit_params(&self, visitor: &mut ParamVisitor<'_>) {
        self.stem.visit(visitor);
        for branch in &self.branches {
            branch.layers.iter().for_each(|layer| layer.visit(visitor));
        }
        self.body.iter().for_each(|block| block.visit(visitor));
        self.neck.visit(visitor);
        self.tail.visit(visitor);
    }
}
