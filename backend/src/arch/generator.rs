use ndarray::Array3;

use super::{ArchitectureDescriptor, ArchitectureError, SuperResolution};
use crate::nn::{
    BatchNorm, Conv2d, PRelu, ParamError, ParamSource, ParamVisitor, ShapeError, add_inplace,
    depth_to_space, tanh_inplace,
};

const WIDTH: usize = 64;
const BLOCKS: usize = 16;
const UPSAMPLE_WIDTH: usize = 256;

struct GeneratorBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    act: PRelu,
    conv2: Conv2d,
    bn2: BatchNorm,
}

impl GeneratorBlock {
    fn new(params: &mut dyn ParamSource, name: &str) -> Result<Self, ParamError> {
        Ok(Self {
            conv1: Conv2d::new(params, &format!("{name}.conv1"), WIDTH, WIDTH, 3)?,
            bn1: BatchNorm::new(params, &format!("{name}.bn1"), WIDTH)?,
            act: PRelu::new(params, &format!("{name}.act"), WIDTH)?,
            conv2: Conv2d::new(params, &format!("{name}.conv2"), WIDTH, WIDTH, 3)?,
            bn2: BatchNorm::new(params, &format!("{name}.bn2"), WIDTH)?,
        })
    }

    fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>, ShapeError> {
        let mut y = self.conv1.forward(x)?;
        self.bn1.forward_inplace(&mut y)?;
        self.act.forward_inplace(&mut y)?;
        let mut y = self.conv2.forward(&y)?;
        self.bn2.forward_inplace(&mut y)?;
        add_inplace(&mut y, x)?;
        Ok(y)
    }

    fn visit(&self, visitor: &mut ParamVisitor<'_>) {
        self.conv1.visit(visitor);
        self.bn1.visit(visitor);
        self.act.visit(visitor);
        self.conv2.visit(visitor);
        self.bn2.visit(visitor);
    }
}

/// One 2x step: conv to 256 maps, depth-to-space by 2, PReLU over 64.
struct Upsample {
    conv: Conv2d,
    act: PRelu,
}

impl Upsample {
    fn new(params: &mut dyn ParamSource, name: &str) -> Result<Self, ParamError> {
        Ok(Self {
            conv: Conv2d::new(params, &format!("{name}.conv"), WIDTH, UPSAMPLE_WIDTH, 3)?,
            act: PRelu::new(params, &format!("{name}.act"), UPSAMPLE_WIDTH / 4)?,
        })
    }

    fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>, ShapeError> {
        let mut y = depth_to_space(&self.conv.forward(x)?, 2)?;
        self.act.forward_inplace(&mut y)?;
        Ok(y)
    }
}

/// Adversarial-style generator.
///
/// The trunk runs 16 batch-normalized residual blocks with a global skip back
/// to the head, then upsamples in `log2(scale)` 2x steps. The `tanh` output in
/// `[-1, 1]` is mapped to `[0, 1]` by [`SuperResolution::rescale_output`].
pub struct Generator {
    descriptor: ArchitectureDescriptor,
    head: Conv2d,
    head_act: PRelu,
    body: Vec<GeneratorBlock>,
    trunk: Conv2d,
    trunk_bn: BatchNorm,
    upsample: Vec<Upsample>,
    output: Conv2d,
}

impl Generator {
    pub fn new(
        descriptor: ArchitectureDescriptor,
        params: &mut dyn ParamSource,
    ) -> Result<Self, ArchitectureError> {
        descriptor.validate()?;
        let steps = descriptor.scale_factor.trailing_zeros() as usize;

        let head = Conv2d::new(params, "head", descriptor.channels, WIDTH, 9)?;
        let head_act = PRelu::new(params, "head_act", WIDTH)?;
        let body = (0..BLOCKS)
            .map(|i| GeneratorBlock::new(params, &format!("body.{i}")))
            .collect::<Result<Vec<_>, _>>()?;
        let trunk = Conv2d::new(params, "trunk", WIDTH, WIDTH, 3)?;
        let trunk_bn = BatchNorm::new(params, "trunk_bn", WIDTH)?;
        let upsample = (0..steps)
            .map(|i| Upsample::new(params, &format!("upsample.{i}")))
            .collect::<Result<Vec<_>, _>>()?;
        let output = Conv2d::new(params, "output", WIDTH, descriptor.channels, 9)?;

        Ok(Self {
            descriptor,
            head,
            head_act,
            body,
            trunk,
            trunk_bn,
            upsample,
            output,
        })
    }
}

impl SuperResolution for Generator {
    fn descriptor(&self) -> ArchitectureDescriptor {
        self.descriptor
    }

    fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>, ShapeError> {
        let mut skip = self.head.forward(x)?;
        self.head_act.forward_inplace(&mut skip)?;

        let mut y = skip.clone();
        for block in &self.body {
            y = block.forward(&y)?;
        }
        let mut y = self.trunk.forward(&y)?;
        self.trunk_bn.forward_inplace(&mut y)?;
        add_inplace(&mut y, &skip)?;

        for step in &self.upsample {
            y = step.forward(&y)?;
        }
        let mut y = self.output.forward(&y)?;
        tanh_inplace(&mut y);
        Ok(y)
    }

    fn rescale_output(&self, y: &mut Array3<f32>) {
        y.mapv_inplace(|v| (v + 1.0) * 0.5);
    }

    fn visit_params(&self, visitor: &mut ParamVisitor<'_>) {
        self.head.visit(visitor);
        self.head_act.visit(visitor);
        self.body.iter().for_each(|block| block.visit(visitor));
        self.trunk.visit(visitor);
        self.trunk_bn.visit(visitor);
        for step in &self.upsample {
            step.conv.visit(visitor);
            step.act.visit(visitor);
        }
        self.output.visit(visitor);
    }
}
