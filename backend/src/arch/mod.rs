//! Registry of the super-resolution networks.
//!
//! All variants share one contract: a single-channel low-resolution tensor in,
//! a tensor `scale_factor` times larger on each spatial axis out. The variant is
//! chosen once when the model is built; requests never branch on it.

mod blocks;
mod generator;
mod medical;
mod residual;

use ndarray::{Array3, Array4};

use crate::nn::{ParamError, ParamSource, ParamVisitor, ShapeError};

pub use generator::Generator;
pub use medical::MedicalMultiBranch;
pub use residual::EnhancedResidual;
pub use shared::ArchitectureKind;

pub const DEFAULT_SCALE_FACTOR: usize = 4;
pub const DEFAULT_CHANNELS: usize = 1;

#[derive(Debug, thiserror::Error)]
pub enum ArchitectureError {
    #[error("scale factor must be at least 1")]
    ZeroScale,
    #[error("at least one channel is required")]
    ZeroChannels,
    #[error("the {kind} network upsamples in 2x steps and cannot reach scale {scale}")]
    ScaleNotPowerOfTwo { kind: ArchitectureKind, scale: usize },
    #[error("{channels} channels at scale {scale} overflow the sub-pixel channel count")]
    ScaleOverflow { channels: usize, scale: usize },
    #[error(transparent)]
    Params(#[from] ParamError),
}

/// Identifies a network topology and the shape contract it was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchitectureDescriptor {
    pub kind: ArchitectureKind,
    pub scale_factor: usize,
    pub channels: usize,
}

impl ArchitectureDescriptor {
    pub fn new(kind: ArchitectureKind) -> Self {
        Self {
            kind,
            scale_factor: DEFAULT_SCALE_FACTOR,
            channels: DEFAULT_CHANNELS,
        }
    }

    pub fn with_scale_factor(mut self, scale_factor: usize) -> Self {
        self.scale_factor = scale_factor;
        self
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn validate(&self) -> Result<(), ArchitectureError> {
        if self.scale_factor == 0 {
            return Err(ArchitectureError::ZeroScale);
        }
        if self.channels == 0 {
            return Err(ArchitectureError::ZeroChannels);
        }
        let scale = self.scale_factor;
        if self
            .channels
            .checked_mul(scale)
            .and_then(|v| v.checked_mul(scale))
            .is_none()
        {
            return Err(ArchitectureError::ScaleOverflow {
                channels: self.channels,
                scale,
            });
        }
        if self.kind == ArchitectureKind::Srgan && !self.scale_factor.is_power_of_two() {
            return Err(ArchitectureError::ScaleNotPowerOfTwo {
                kind: self.kind,
                scale: self.scale_factor,
            });
        }
        Ok(())
    }
}

impl Default for ArchitectureDescriptor {
    fn default() -> Self {
        Self::new(ArchitectureKind::default())
    }
}

/// A super-resolution network bound to concrete weights.
///
/// Implementations are immutable after construction, so one instance can
/// serve concurrent forward passes.
pub trait SuperResolution: Send + Sync {
    fn descriptor(&self) -> ArchitectureDescriptor;

    /// Runs the network on one `(channels, height, width)` feature map.
    fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>, ShapeError>;

    /// Walks every learned tensor with its checkpoint name.
    fn visit_params(&self, visitor: &mut ParamVisitor<'_>);

    /// Maps the raw network output into the `[0, 1]` working range.
    fn rescale_output(&self, _y: &mut Array3<f32>) {}

    /// Runs a `(N, H, W, channels)` batch and returns `(N, H * s, W * s, channels)`.
    fn infer(&self, batch: &Array4<f32>) -> Result<Array4<f32>, ShapeError> {
        let descriptor = self.descriptor();
        let (n, height, width, channels) = batch.dim();
        if channels != descriptor.channels {
            return Err(ShapeError::Batch {
                channels: descriptor.channels,
                shape: batch.shape().to_vec(),
            });
        }

        let scale = descriptor.scale_factor;
        let expected = (channels, height * scale, width * scale);
        let mut out = Array4::zeros((n, height * scale, width * scale, channels));
        for (item, mut target) in batch.outer_iter().zip(out.outer_iter_mut()) {
            let chw = item.permuted_axes([2, 0, 1]).as_standard_layout().into_owned();
            let mut y = self.forward(&chw)?;
            self.rescale_output(&mut y);
            if y.dim() != expected {
                return Err(ShapeError::Mismatch {
                    left: y.shape().to_vec(),
                    right: vec![expected.0, expected.1, expected.2],
                });
            }
            target.assign(&y.permuted_axes([1, 2, 0]));
        }

        Ok(out)
    }
}

/// Builds the network named by `descriptor`, pulling every tensor from `params`.
pub fn build(
    descriptor: ArchitectureDescriptor,
    params: &mut dyn ParamSource,
) -> Result<Box<dyn SuperResolution>, ArchitectureError> {
    descriptor.validate()?;
    let model: Box<dyn SuperResolution> = match descriptor.kind {
        ArchitectureKind::Enhanced => Box::new(EnhancedResidual::new(descriptor, params)?),
        ArchitectureKind::Srgan => Box::new(Generator::new(descriptor, params)?),
        ArchitectureKind::Medical => Box::new(MedicalMultiBranch::new(descriptor, params)?),
    };
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Initializer;
    use strum::IntoEnumIterator;

    fn batch(height: usize, width: usize) -> Array4<f32> {
        Array4::from_shape_fn((1, height, width, 1), |(_, y, x, _)| {
            ((y * width + x) % 7) as f32 / 7.0
        })
    }

    #[test]
    fn every_architecture_upscales_by_its_factor() {
        for kind in ArchitectureKind::iter() {
            let model = build(ArchitectureDescriptor::new(kind), &mut Initializer::default()).unwrap();
            let out = model.infer(&batch(3, 2)).unwrap();
            assert_eq!(out.dim(), (1, 12, 8, 1), "{kind}");
        }
    }

    #[test]
    fn inference_is_reproducible() {
        for kind in ArchitectureKind::iter() {
            let model = build(ArchitectureDescriptor::new(kind), &mut Initializer::default()).unwrap();
            let input = batch(2, 3);
            assert_eq!(model.infer(&input).unwrap(), model.infer(&input).unwrap(), "{kind}");
        }
    }

    #[test]
    fn construction_is_deterministic() {
        let descriptor = ArchitectureDescriptor::new(ArchitectureKind::Medical);
        let a = build(descriptor, &mut Initializer::default()).unwrap();
        let b = build(descriptor, &mut Initializer::default()).unwrap();
        let input = batch(2, 2);
        assert_eq!(a.infer(&input).unwrap(), b.infer(&input).unwrap());
    }

    #[test]
    fn generator_output_lands_in_unit_range() {
        let model = build(
            ArchitectureDescriptor::new(ArchitectureKind::Srgan),
            &mut Initializer::default(),
        )
        .unwrap();
        let out = model.infer(&batch(2, 2)).unwrap();
        assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn other_scale_factors_are_honoured() {
        let descriptor = ArchitectureDescriptor::new(ArchitectureKind::Enhanced).with_scale_factor(3);
        let model = build(descriptor, &mut Initializer::default()).unwrap();
        assert_eq!(model.infer(&batch(2, 2)).unwrap().dim(), (1, 6, 6, 1));

        let descriptor = ArchitectureDescriptor::new(ArchitectureKind::Srgan).with_scale_factor(2);
        let model = build(descriptor, &mut Initializer::default()).unwrap();
        assert_eq!(model.infer(&batch(2, 2)).unwrap().dim(), (1, 4, 4, 1));
    }

    #[test]
    fn generator_requires_power_of_two_scale() {
        let descriptor = ArchitectureDescriptor::new(ArchitectureKind::Srgan).with_scale_factor(3);
        assert!(matches!(
            build(descriptor, &mut Initializer::default()),
            Err(ArchitectureError::ScaleNotPowerOfTwo { scale: 3, .. })
        ));
    }

    #[test]
    fn degenerate_descriptors_are_rejected() {
        let zero_scale = ArchitectureDescriptor::default().with_scale_factor(0);
        assert!(matches!(zero_scale.validate(), Err(ArchitectureError::ZeroScale)));
        let zero_channels = ArchitectureDescriptor::default().with_channels(0);
        assert!(matches!(zero_channels.validate(), Err(ArchitectureError::ZeroChannels)));
        let huge_scale = ArchitectureDescriptor::default().with_scale_factor(usize::MAX / 2);
        assert!(matches!(
            build(huge_scale, &mut Initializer::default()),
            Err(ArchitectureError::ScaleOverflow { .. })
        ));
    }

    #[test]
    fn batch_with_wrong_channel_count_fails() {
        let model = build(ArchitectureDescriptor::default(), &mut Initializer::default()).unwrap();
        let input = Array4::<f32>::zeros((1, 2, 2, 3));
        assert!(matches!(model.infer(&input), Err(ShapeError::Batch { .. })));
    }
}
