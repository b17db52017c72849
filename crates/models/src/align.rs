//! Spatial reconciliation between decoder tensors and their skip connections.
//!
//! Every decoder stage and the output head route size fixes through
//! [`align_to`], so the rounding rule lives in exactly one place:
//! for a signed difference `d = reference - current` the leading edge gets
//! `floor(d / 2)` and the trailing edge the remainder. Positive amounts are
//! zero-filled; negative amounts crop.

use burn::tensor::{backend::Backend, Tensor};

use crate::error::{ModelError, ModelResult};

/// Leading/trailing split of a signed size difference.
pub fn pad_split(diff: isize) -> (isize, isize) {
    let lead = diff.div_euclid(2);
    (lead, diff - lead)
}

/// Zero-pad or crop `x` so its spatial size equals `[height, width]`.
pub fn align_to<B: Backend>(x: Tensor<B, 4>, [height, width]: [usize; 2]) -> Tensor<B, 4> {
    let [batch, channels, h, w] = x.dims();
    if h == height && w == width {
        return x;
    }

    let (top, bottom) = pad_split(height as isize - h as isize);
    let (left, right) = pad_split(width as isize - w as isize);

    // Crop first so the remaining work is pure padding.
    let y0 = (-top).max(0) as usize;
    let y1 = h - (-bottom).max(0) as usize;
    let x0 = (-left).max(0) as usize;
    let x1 = w - (-right).max(0) as usize;
    let cropped = if y0 > 0 || x0 > 0 || y1 < h || x1 < w {
        x.slice([0..batch, 0..channels, y0..y1, x0..x1])
    } else {
        x
    };

    let pad_top = top.max(0) as usize;
    let pad_left = left.max(0) as usize;
    let [_, _, ch, cw] = cropped.dims();
    if ch == height && cw == width {
        return cropped;
    }
    let device = cropped.device();
    Tensor::<B, 4>::zeros([batch, channels, height, width], &device).slice_assign(
        [
            0..batch,
            0..channels,
            pad_top..pad_top + ch,
            pad_left..pad_left + cw,
        ],
        cropped,
    )
}

/// Align `upsampled` to `skip` and concatenate along channels, skip first.
///
/// Channel counts are checked against what the consuming stage was built
/// for; a mismatch is a wiring error, never broadcast or truncated.
pub fn align_and_concat<B: Backend>(
    stage: &'static str,
    skip: Tensor<B, 4>,
    upsampled: Tensor<B, 4>,
    expected: [usize; 2],
) -> ModelResult<Tensor<B, 4>> {
    let [skip_batch, skip_channels, skip_h, skip_w] = skip.dims();
    let [up_batch, up_channels, _, _] = upsampled.dims();
    let [expected_skip, expected_up] = expected;

    if skip_batch != up_batch {
        return Err(ModelError::shape(
            stage,
            format!("batch {up_batch} does not match skip batch {skip_batch}"),
        ));
    }
    if skip_channels != expected_skip {
        return Err(ModelError::shape(
            stage,
            format!("skip has {skip_channels} channels, stage expects {expected_skip}"),
        ));
    }
    if up_channels != expected_up {
        return Err(ModelError::shape(
            stage,
            format!("upsampled tensor has {up_channels} channels, stage expects {expected_up}"),
        ));
    }

    let aligned = align_to(upsampled, [skip_h, skip_w]);
    Ok(Tensor::cat(vec![skip, aligned], 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type B = NdArray<f32>;

    fn values(t: Tensor<B, 4>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn split_puts_floor_half_on_leading_edge() {
        for diff in 0..17isize {
            let (lead, trail) = pad_split(diff);
            assert_eq!(lead + trail, diff);
            assert_eq!(lead, diff / 2);
        }
        assert_eq!(pad_split(3), (1, 2));
        assert_eq!(pad_split(-1), (-1, 0));
        assert_eq!(pad_split(-3), (-2, -1));
    }

    #[test]
    fn odd_padding_zero_fills_and_keeps_interior() {
        let device = Default::default();
        let x = Tensor::<B, 4>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0, 4.0], [1, 1, 2, 2]),
            &device,
        );
        let out = align_to(x, [3, 5]);
        assert_eq!(out.dims(), [1, 1, 3, 5]);
        // top 0 / bottom 1, left 1 / right 2
        #[rustfmt::skip]
        let expected = vec![
            0.0, 1.0, 2.0, 0.0, 0.0,
            0.0, 3.0, 4.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 0.0, 0.0,
        ];
        assert_eq!(values(out), expected);
    }

    #[test]
    fn oversize_tensor_is_cropped_with_same_rule() {
        let device = Default::default();
        let data: Vec<f32> = (0..9).map(|v| v as f32).collect();
        let x = Tensor::<B, 4>::from_data(TensorData::new(data, [1, 1, 3, 3]), &device);
        let out = align_to(x, [2, 2]);
        // diff -1: one row/column dropped from the leading edge
        assert_eq!(values(out), vec![4.0, 5.0, 7.0, 8.0]);
    }

    #[test]
    fn matching_size_is_untouched() {
        let device = Default::default();
        let x = Tensor::<B, 4>::ones([2, 3, 4, 4], &device);
        let out = align_to(x, [4, 4]);
        assert_eq!(out.dims(), [2, 3, 4, 4]);
        assert!(values(out).iter().all(|v| *v == 1.0));
    }

    #[test]
    fn concat_orders_skip_before_upsampled() {
        let device = Default::default();
        let skip = Tensor::<B, 4>::ones([1, 2, 4, 4], &device);
        let up = Tensor::<B, 4>::zeros([1, 3, 4, 4], &device).add_scalar(5.0);
        let out = align_and_concat("test", skip, up, [2, 3]).unwrap();
        assert_eq!(out.dims(), [1, 5, 4, 4]);
        let v = values(out);
        assert!(v[..32].iter().all(|x| *x == 1.0));
        assert!(v[32..].iter().all(|x| *x == 5.0));
    }

    #[test]
    fn concat_rejects_channel_mismatch() {
        let device = Default::default();
        let skip = Tensor::<B, 4>::ones([1, 4, 4, 4], &device);
        let up = Tensor::<B, 4>::ones([1, 3, 2, 2], &device);
        let err = align_and_concat("stage", skip, up, [2, 3]).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { stage: "stage", .. }));
    }
}
