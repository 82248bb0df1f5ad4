use ndarray::{Array3, ArrayView3, Axis, concatenate, s};

#[derive(Debug, thiserror::Error)]
pub enum ShapeError {
    #[error("expected {expected} input channels, got {got}")]
    Channels { expected: usize, got: usize },
    #[error("cannot rearrange {channels} channels into {block}x{block} blocks")]
    Indivisible { channels: usize, block: usize },
    #[error("shape mismatch: {left:?} vs {right:?}")]
    Mismatch { left: Vec<usize>, right: Vec<usize> },
    #[error("expected a batch shaped (N, H, W, {channels}), got {shape:?}")]
    Batch { channels: usize, shape: Vec<usize> },
    #[error("layout error: {0}")]
    Layout(#[from] ndarray::ShapeError),
}

pub fn relu_inplace(x: &mut Array3<f32>) {
    x.mapv_inplace(|v| v.max(0.0));
}

pub fn tanh_inplace(x: &mut Array3<f32>) {
    x.mapv_inplace(f32::tanh);
}

/// Adds `skip` into `x` element-wise.
pub fn add_inplace(x: &mut Array3<f32>, skip: &Array3<f32>) -> Result<(), ShapeError> {
    if x.shape() != skip.shape() {
        return Err(ShapeError::Mismatch {
            left: x.shape().to_vec(),
            right: skip.shape().to_vec(),
        });
    }
    *x += skip;
    Ok(())
}

/// Stacks feature maps along the channel axis.
pub fn concat_channels(parts: &[ArrayView3<'_, f32>]) -> Result<Array3<f32>, ShapeError> {
    Ok(concatenate(Axis(0), parts)?)
}

/// Sub-pixel rearrangement: `(C * block², H, W)` becomes `(C, H * block, W * block)`.
///
/// Channel groups are ordered row-major over the block offset, so output pixel
/// `(c, h * block + i, w * block + j)` reads input channel `(i * block + j) * C + c`
/// at `(h, w)`. The total number of samples is unchanged.
pub fn depth_to_space(x: &Array3<f32>, block: usize) -> Result<Array3<f32>, ShapeError> {
    let (channels, height, width) = x.dim();
    let cells = block * block;
    if block == 0 || channels % cells != 0 {
        return Err(ShapeError::Indivisible { channels, block });
    }

    let out_channels = channels / cells;
    let mut out = Array3::zeros((out_channels, height * block, width * block));
    for i in 0..block {
        for j in 0..block {
            let group = (i * block + j) * out_channels;
            let src = x.slice(s![group..group + out_channels, .., ..]);
            out.slice_mut(s![.., i..;block, j..;block]).assign(&src);
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn depth_to_space_interleaves_channel_groups() {
        // four 1x1 channels become one 2x2 plane in reading order
        let x = Array::from_shape_vec((4, 1, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let y = depth_to_space(&x, 2).unwrap();
        assert_eq!(y.dim(), (1, 2, 2));
        assert_eq!(y.iter().copied().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn depth_to_space_preserves_sample_count() {
        let x = Array::from_shape_fn((2 * 16, 3, 5), |(c, h, w)| (c * 100 + h * 10 + w) as f32);
        let y = depth_to_space(&x, 4).unwrap();
        assert_eq!(y.dim(), (2, 12, 20));
        assert_eq!(y.len(), x.len());

        let mut before: Vec<f32> = x.iter().copied().collect();
        let mut after: Vec<f32> = y.iter().copied().collect();
        before.sort_by(f32::total_cmp);
        after.sort_by(f32::total_cmp);
        assert_eq!(before, after);

        // output channel 1, block offset (1, 2) comes from input channel (1*4+2)*2+1
        assert_eq!(y[[1, 2 * 4 + 1, 3 * 4 + 2]], x[[13, 2, 3]]);
    }

    #[test]
    fn depth_to_space_rejects_indivisible_channels() {
        let x = Array3::<f32>::zeros((6, 2, 2));
        assert!(matches!(
            depth_to_space(&x, 2),
            Err(ShapeError::Indivisible { channels: 6, block: 2 })
        ));
    }

    #[test]
    fn add_requires_identical_shapes() {
        let mut x = Array3::<f32>::ones((1, 2, 2));
        let skip = Array3::<f32>::ones((1, 2, 3));
        assert!(add_inplace(&mut x, &skip).is_err());

        let skip = Array3::<f32>::ones((1, 2, 2));
        add_inplace(&mut x, &skip).unwrap();
        assert!(x.iter().all(|&v| v == 2.0));
    }

    #[test]
    fn concat_stacks_channels() {
        let a = Array3::<f32>::zeros((2, 3, 3));
        let b = Array3::<f32>::ones((1, 3, 3));
        let c = concat_channels(&[a.view(), b.view()]).unwrap();
        assert_eq!(c.dim(), (3, 3, 3));
        assert_eq!(c[[2, 1, 1]], 1.0);
    }

    #[test]
    fn relu_clamps_negatives() {
        let mut x = Array::from_shape_vec((1, 1, 3), vec![-1.0, 0.0, 2.5]).unwrap();
        relu_inplace(&mut x);
        assert_eq!(x.iter().copied().collect::<Vec<_>>(), vec![0.0, 0.0, 2.5]);
    }
}
