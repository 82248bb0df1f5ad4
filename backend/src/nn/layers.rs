use ndarray::{linalg, prelude::*};

use super::ops::ShapeError;
use super::params::{Init, ParamError, ParamSource};

/// Callback used to walk the parameters of a network by name.
pub type ParamVisitor<'a> = dyn FnMut(&str, ArrayViewD<'_, f32>) + 'a;

/// A 2-D convolution with zero "same" padding and an odd square kernel.
///
/// Weights are laid out as `(out, in, k, k)`.
#[derive(Debug, Clone)]
pub struct Conv2d {
    name: String,
    weight: Array4<f32>,
    bias: Array1<f32>,
}

impl Conv2d {
    pub fn new(
        params: &mut dyn ParamSource,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
    ) -> Result<Self, ParamError> {
        let receptive = kernel * kernel;
        let weight = params
            .take(
                &format!("{name}.weight"),
                &[out_channels, in_channels, kernel, kernel],
                Init::GlorotUniform {
                    fan_in: in_channels * receptive,
                    fan_out: out_channels * receptive,
                },
            )?
            .into_dimensionality::<Ix4>()?;
        let bias = params
            .take(&format!("{name}.bias"), &[out_channels], Init::Constant(0.0))?
            .into_dimensionality::<Ix1>()?;

        Ok(Self {
            name: name.to_string(),
            weight,
            bias,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    // Accumulates one matrix product per kernel tap so only a single shifted
    // copy of the input is alive at a time.
    pub fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>, ShapeError> {
        let (channels, height, width) = x.dim();
        let (out_channels, in_channels, kernel, _) = self.weight.dim();
        if channels != in_channels {
            return Err(ShapeError::Channels {
                expected: in_channels,
                got: channels,
            });
        }

        let pad = kernel / 2;
        let mut padded = Array3::<f32>::zeros((channels, height + 2 * pad, width + 2 * pad));
        padded
            .slice_mut(s![.., pad..pad + height, pad..pad + width])
            .assign(x);

        let pixels = height * width;
        let mut out = Array2::<f32>::zeros((out_channels, pixels));
        for ky in 0..kernel {
            for kx in 0..kernel {
                let window = padded
                    .slice(s![.., ky..ky + height, kx..kx + width])
                    .to_owned()
                    .into_shape_with_order((channels, pixels))?;
                let taps = self.weight.slice(s![.., .., ky, kx]);
                linalg::general_mat_mul(1.0, &taps, &window, 1.0, &mut out);
            }
        }
        out += &self.bias.view().insert_axis(Axis(1));

        Ok(out.into_shape_with_order((out_channels, height, width))?)
    }

    pub fn visit(&self, visitor: &mut ParamVisitor<'_>) {
        visitor(&format!("{}.weight", self.name), self.weight.view().into_dyn());
        visitor(&format!("{}.bias", self.name), self.bias.view().into_dyn());
    }
}

/// Inference-mode batch normalization using the stored moving statistics.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    name: String,
    gamma: Array1<f32>,
    beta: Array1<f32>,
    mean: Array1<f32>,
    variance: Array1<f32>,
}

impl BatchNorm {
    pub const EPSILON: f32 = 1e-3;

    pub fn new(params: &mut dyn ParamSource, name: &str, channels: usize) -> Result<Self, ParamError> {
        let mut take = |field: &str, value: f32| -> Result<Array1<f32>, ParamError> {
            params
                .take(&format!("{name}.{field}"), &[channels], Init::Constant(value))?
                .into_dimensionality::<Ix1>()
                .map_err(ParamError::from)
        };

        Ok(Self {
            name: name.to_string(),
            gamma: take("gamma", 1.0)?,
            beta: take("beta", 0.0)?,
            mean: take("moving_mean", 0.0)?,
            variance: take("moving_variance", 1.0)?,
        })
    }

    pub fn forward_inplace(&self, x: &mut Array3<f32>) -> Result<(), ShapeError> {
        if x.dim().0 != self.gamma.len() {
            return Err(ShapeError::Channels {
                expected: self.gamma.len(),
                got: x.dim().0,
            });
        }

        for (c, mut plane) in x.axis_iter_mut(Axis(0)).enumerate() {
            let scale = self.gamma[c] / (self.variance[c] + Self::EPSILON).sqrt();
            let shift = self.beta[c] - self.mean[c] * scale;
            plane.mapv_inplace(|v| v * scale + shift);
        }
        Ok(())
    }

    pub fn visit(&self, visitor: &mut ParamVisitor<'_>) {
        visitor(&format!("{}.gamma", self.name), self.gamma.view().into_dyn());
        visitor(&format!("{}.beta", self.name), self.beta.view().into_dyn());
        visitor(&format!("{}.moving_mean", self.name), self.mean.view().into_dyn());
        visitor(
            &format!("{}.moving_variance", self.name),
            self.variance.view().into_dyn(),
        );
    }
}

/// Parametric ReLU with one learned slope per channel.
#[derive(Debug, Clone)]
pub struct PRelu {
    name: String,
    alpha: Array1<f32>,
}

impl PRelu {
    pub fn new(params: &mut dyn ParamSource, name: &str, channels: usize) -> Result<Self, ParamError> {
        let alpha = params
            .take(&format!("{name}.alpha"), &[channels], Init::Constant(0.0))?
            .into_dimensionality::<Ix1>()?;
        Ok(Self {
            name: name.to_string(),
            alpha,
        })
    }

    pub fn forward_inplace(&self, x: &mut Array3<f32>) -> Result<(), ShapeError> {
        if x.dim().0 != self.alpha.len() {
            return Err(ShapeError::Channels {
                expected: self.alpha.len(),
                got: x.dim().0,
            });
        }

        for (mut plane, &alpha) in x.axis_iter_mut(Axis(0)).zip(self.alpha.iter()) {
            plane.mapv_inplace(|v| if v >= 0.0 { v } else { alpha * v });
        }
        Ok(())
    }

    pub fn visit(&self, visitor: &mut ParamVisitor<'_>) {
        visitor(&format!("{}.alpha", self.name), self.alpha.view().into_dyn());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{Initializer, WeightFile};

    fn conv_with(weight: Vec<f32>, bias: Vec<f32>, in_c: usize, out_c: usize, k: usize) -> Conv2d {
        let mut weights = WeightFile::new();
        weights.insert("c.weight", vec![out_c, in_c, k, k], weight);
        weights.insert("c.bias", vec![out_c], bias);
        Conv2d::new(&mut weights, "c", in_c, out_c, k).unwrap()
    }

    #[test]
    fn identity_kernel_reproduces_input() {
        let mut kernel = vec![0.0; 9];
        kernel[4] = 1.0;
        let conv = conv_with(kernel, vec![0.0], 1, 1, 3);

        let x = Array3::from_shape_fn((1, 4, 5), |(_, h, w)| (h * 5 + w) as f32);
        assert_eq!(conv.forward(&x).unwrap(), x);
    }

    #[test]
    fn box_kernel_sees_zero_padding() {
        let conv = conv_with(vec![1.0; 9], vec![0.5], 1, 1, 3);
        let x = Array3::<f32>::ones((1, 3, 3));
        let y = conv.forward(&x).unwrap();

        assert_eq!(y[[0, 0, 0]], 4.5);
        assert_eq!(y[[0, 0, 1]], 6.5);
        assert_eq!(y[[0, 1, 1]], 9.5);
    }

    #[test]
    fn conv_mixes_input_channels_per_output() {
        // 1x1 kernel: out0 = in0 + in1, out1 = in0 - in1
        let conv = conv_with(vec![1.0, 1.0, 1.0, -1.0], vec![0.0, 0.0], 2, 2, 1);
        let mut x = Array3::<f32>::zeros((2, 1, 2));
        x[[0, 0, 0]] = 3.0;
        x[[1, 0, 0]] = 1.0;
        let y = conv.forward(&x).unwrap();
        assert_eq!(y[[0, 0, 0]], 4.0);
        assert_eq!(y[[1, 0, 0]], 2.0);
        assert_eq!(y[[0, 0, 1]], 0.0);
    }

    #[test]
    fn conv_rejects_wrong_channel_count() {
        let conv = Conv2d::new(&mut Initializer::default(), "c", 3, 8, 3).unwrap();
        let x = Array3::<f32>::zeros((1, 4, 4));
        assert!(matches!(
            conv.forward(&x),
            Err(ShapeError::Channels { expected: 3, got: 1 })
        ));
    }

    #[test]
    fn fresh_batch_norm_is_near_identity() {
        let bn = BatchNorm::new(&mut Initializer::default(), "bn", 2).unwrap();
        let mut x = Array3::from_elem((2, 2, 2), 2.0f32);
        bn.forward_inplace(&mut x).unwrap();
        let expected = 2.0 / (1.0f32 + BatchNorm::EPSILON).sqrt();
        assert!(x.iter().all(|v| (v - expected).abs() < 1e-6));
    }

    #[test]
    fn prelu_scales_negatives_per_channel() {
        let mut weights = WeightFile::new();
        weights.insert("act.alpha", vec![2], vec![0.5, 0.25]);
        let act = PRelu::new(&mut weights, "act", 2).unwrap();

        let mut x = Array3::from_elem((2, 1, 1), -4.0f32);
        act.forward_inplace(&mut x).unwrap();
        assert_eq!(x[[0, 0, 0]], -2.0);
        assert_eq!(x[[1, 0, 0]], -1.0);
    }

    #[test]
    fn visit_reports_every_tensor() {
        let conv = Conv2d::new(&mut Initializer::default(), "head", 1, 4, 3).unwrap();
        let mut seen = Vec::new();
        conv.visit(&mut |name: &str, view: ArrayViewD<'_, f32>| {
            seen.push((name.to_string(), view.shape().to_vec()))
        });
        assert_eq!(
            seen,
            vec![
                ("head.weight".to_string(), vec![4, 1, 3, 3]),
                ("head.bias".to_string(), vec![4]),
            ]
        );
    }
}
