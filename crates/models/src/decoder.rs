//! Top-down decoder that fuses the backbone pyramid through skip connections.

use burn::module::Module;
use burn::nn::conv::{ConvTranspose2d, ConvTranspose2dConfig};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};

use crate::align::{align_and_concat, align_to};
use crate::backbone::PYRAMID_CHANNELS;
use crate::blocks::ConvBlock;
use crate::error::{ModelError, ModelResult};

/// Bilinear resize (`align_corners = false`) to an exact output size.
///
/// Output pixel `i` samples the input at `(i + 0.5) * in / out - 0.5`,
/// clamped to the valid range, so border pixels copy the border input.
pub fn resize_bilinear<B: Backend>(x: Tensor<B, 4>, [height, width]: [usize; 2]) -> Tensor<B, 4> {
    let x = resize_axis(x, 2, height);
    resize_axis(x, 3, width)
}

/// Linear interpolation along one spatial axis of a `[B, C, H, W]` tensor.
fn resize_axis<B: Backend>(x: Tensor<B, 4>, dim: usize, output: usize) -> Tensor<B, 4> {
    let input = x.dims()[dim];
    if input == output || input == 0 {
        return x;
    }
    let scale = input as f32 / output as f32;
    let mut lo = Vec::with_capacity(output);
    let mut hi = Vec::with_capacity(output);
    let mut frac = Vec::with_capacity(output);
    for i in 0..output {
        let src = ((i as f32 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(input - 1);
        lo.push(i0 as i64);
        hi.push((i0 + 1).min(input - 1) as i64);
        frac.push(src - i0 as f32);
    }

    let device = x.device();
    let index = |v: Vec<i64>| Tensor::<B, 1, Int>::from_data(TensorData::new(v, [output]), &device);
    let mut weight_shape = [1; 4];
    weight_shape[dim] = output;
    let weight = Tensor::<B, 1>::from_data(TensorData::new(frac, [output]), &device)
        .reshape(weight_shape);

    let a = x.clone().select(dim, index(lo));
    let b = x.select(dim, index(hi));
    a.clone() + (b - a) * weight
}

/// Double the spatial size with bilinear interpolation, then reconcile to
/// `reference` with the shared alignment rule.
pub fn upsample_to<B: Backend>(x: Tensor<B, 4>, reference: [usize; 2]) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    align_to(resize_bilinear(x, [h * 2, w * 2]), reference)
}

/// Learned 2× upsample, align against the skip tensor, concat, fuse.
#[derive(Module, Debug)]
pub struct UpStage<B: Backend> {
    up: ConvTranspose2d<B>,
    fuse: ConvBlock<B>,
    in_channels: usize,
    skip_channels: usize,
}

impl<B: Backend> UpStage<B> {
    pub fn new(
        in_channels: usize,
        skip_channels: usize,
        out_channels: usize,
        device: &B::Device,
    ) -> Self {
        let up_channels = in_channels / 2;
        Self {
            up: ConvTranspose2dConfig::new([in_channels, up_channels], [2, 2])
                .with_stride([2, 2])
                .init(device),
            fuse: ConvBlock::new(skip_channels + up_channels, out_channels, device),
            in_channels,
            skip_channels,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, skip: Tensor<B, 4>) -> ModelResult<Tensor<B, 4>> {
        let [_, channels, _, _] = x.dims();
        if channels != self.in_channels {
            return Err(ModelError::shape(
                "decoder stage",
                format!("input has {channels} channels, stage expects {}", self.in_channels),
            ));
        }
        let up = self.up.forward(x);
        let merged = align_and_concat(
            "decoder stage",
            skip,
            up,
            [self.skip_channels, self.in_channels / 2],
        )?;
        Ok(self.fuse.forward(merged))
    }
}

/// Extra resolution-recovery step against the pre-pool stem map.
#[derive(Module, Debug)]
pub struct StemStage<B: Backend> {
    fuse: ConvBlock<B>,
    in_channels: usize,
    skip_channels: usize,
}

impl<B: Backend> StemStage<B> {
    pub fn new(
        in_channels: usize,
        skip_channels: usize,
        out_channels: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            fuse: ConvBlock::new(skip_channels + in_channels, out_channels, device),
            in_channels,
            skip_channels,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, stem: Tensor<B, 4>) -> ModelResult<Tensor<B, 4>> {
        let [_, _, h, w] = x.dims();
        let up = resize_bilinear(x, [h * 2, w * 2]);
        let merged = align_and_concat(
            "stem stage",
            stem,
            up,
            [self.skip_channels, self.in_channels],
        )?;
        Ok(self.fuse.forward(merged))
    }
}

/// Channels of the fused map the decoder hands to the head.
pub const DECODER_CHANNELS: usize = PYRAMID_CHANNELS[0];

/// Decoder over the five-level ResNet pyramid. Produces
/// [`DECODER_CHANNELS`] channels at the stem's resolution (stride 2).
#[derive(Module, Debug)]
pub struct SkipDecoder<B: Backend> {
    stages: Vec<UpStage<B>>,
    stem: StemStage<B>,
}

impl<B: Backend> SkipDecoder<B> {
    pub fn new(device: &B::Device) -> Self {
        let [c0, c1, c2, c3, c4] = PYRAMID_CHANNELS;
        let stages = vec![
            UpStage::new(c4, c3, c3, device),
            UpStage::new(c3, c2, c2, device),
            UpStage::new(c2, c1, c1, device),
        ];
        Self {
            stages,
            stem: StemStage::new(c1, c0, DECODER_CHANNELS, device),
        }
    }

    /// `pyramid` is the backbone output, shallow to deep.
    pub fn forward(&self, mut pyramid: Vec<Tensor<B, 4>>) -> ModelResult<Tensor<B, 4>> {
        if pyramid.len() != PYRAMID_CHANNELS.len() {
            return Err(ModelError::shape(
                "decoder",
                format!(
                    "expected {} feature maps, got {}",
                    PYRAMID_CHANNELS.len(),
                    pyramid.len()
                ),
            ));
        }
        let mut x = pyramid.pop().ok_or_else(|| ModelError::shape("decoder", "empty pyramid"))?;
        for stage in &self.stages {
            let skip = pyramid
                .pop()
                .ok_or_else(|| ModelError::shape("decoder", "ran out of skip connections"))?;
            x = stage.forward(x, skip)?;
        }
        let stem = pyramid
            .pop()
            .ok_or_else(|| ModelError::shape("decoder", "missing stem feature map"))?;
        self.stem.forward(x, stem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn up_stage_pads_odd_skip() {
        let device = Default::default();
        let stage = UpStage::<B>::new(8, 4, 6, &device);
        let x = Tensor::zeros([2, 8, 3, 3], &device);
        let skip = Tensor::zeros([2, 4, 7, 7], &device);
        let out = stage.forward(x, skip).unwrap();
        assert_eq!(out.dims(), [2, 6, 7, 7]);
    }

    #[test]
    fn up_stage_rejects_wrong_skip_channels() {
        let device = Default::default();
        let stage = UpStage::<B>::new(8, 4, 6, &device);
        let x = Tensor::zeros([1, 8, 2, 2], &device);
        let skip = Tensor::zeros([1, 5, 4, 4], &device);
        assert!(matches!(
            stage.forward(x, skip),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn decoder_requires_full_pyramid() {
        let device = Default::default();
        let decoder = SkipDecoder::<B>::new(&device);
        let pyramid = vec![Tensor::zeros([1, 64, 8, 8], &device)];
        assert!(decoder.forward(pyramid).is_err());
    }

    fn values(x: Tensor<B, 4>) -> Vec<f32> {
        x.into_data().to_vec::<f32>().unwrap()
    }

    fn close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-6, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn bilinear_uses_half_pixel_centres() {
        let device = Default::default();
        let x = Tensor::<B, 4>::from_data(TensorData::new(vec![0.0f32, 1.0], [1, 1, 1, 2]), &device);
        close(&values(resize_bilinear(x, [1, 4])), &[0.0, 0.25, 0.75, 1.0]);
    }

    #[test]
    fn bilinear_doubling_keeps_border_values() {
        let device = Default::default();
        let x = Tensor::<B, 4>::from_data(
            TensorData::new(vec![0.0f32, 1.0, 2.0, 3.0], [1, 1, 2, 2]),
            &device,
        );
        let out = values(resize_bilinear(x, [4, 4]));
        // Separable: column ramp plus twice the row ramp.
        let ramp = [0.0f32, 0.25, 0.75, 1.0];
        let expected: Vec<f32> = (0..4)
            .flat_map(|r| (0..4).map(move |c| ramp[c] + 2.0 * ramp[r]))
            .collect();
        close(&out, &expected);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[15], 3.0);
    }

    #[test]
    fn bilinear_upsample_aligns_to_reference() {
        let device = Default::default();
        let x = Tensor::<B, 4>::ones([1, 2, 5, 5], &device);
        let out = upsample_to(x, [11, 9]);
        assert_eq!(out.dims(), [1, 2, 11, 9]);
    }

    #[test]
    fn upsample_to_zero_fills_trailing_border() {
        let device = Default::default();
        let x = Tensor::<B, 4>::from_data(
            TensorData::new(vec![0.0f32, 1.0, 2.0, 3.0], [1, 1, 2, 2]),
            &device,
        );
        let out = values(upsample_to(x, [5, 5]));
        let ramp = [0.0f32, 0.25, 0.75, 1.0];
        for r in 0..5 {
            for c in 0..5 {
                let expected = if r == 4 || c == 4 {
                    0.0
                } else {
                    ramp[c] + 2.0 * ramp[r]
                };
                assert!((out[r * 5 + c] - expected).abs() < 1e-6, "({r}, {c})");
            }
        }
    }

    #[test]
    fn stem_stage_sees_interpolated_borders() {
        let device = Default::default();
        let stage = StemStage::<B>::new(1, 1, 2, &device);
        let x = Tensor::<B, 4>::from_data(
            TensorData::new(vec![0.0f32, 1.0, 2.0, 3.0], [1, 1, 2, 2]),
            &device,
        );
        let stem = Tensor::<B, 4>::ones([1, 1, 4, 4], &device);
        let out = stage.forward(x.clone(), stem.clone()).unwrap();
        let merged = Tensor::cat(vec![stem, resize_bilinear(x, [4, 4])], 1);
        close(&values(out), &values(stage.fuse.forward(merged)));
    }
}
