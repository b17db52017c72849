//! ResNet feature backbone producing a shallow-to-deep feature pyramid.

use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::blocks::{residual_stage, BasicBlock};
use crate::error::{ModelError, ModelResult};

/// Input channel count the reference ResNet weights were trained with.
pub const NATIVE_INPUT_CHANNELS: usize = 3;
/// Channels of the stem map followed by the four residual stages.
pub const PYRAMID_CHANNELS: [usize; 5] = [64, 64, 128, 256, 512];
/// Spatial reduction between the input and the deepest feature map.
pub const TOTAL_STRIDE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackboneDepth {
    #[serde(rename = "resnet18")]
    ResNet18,
    #[serde(rename = "resnet34")]
    ResNet34,
}

impl BackboneDepth {
    fn blocks(self) -> [usize; 4] {
        match self {
            Self::ResNet18 => [2, 2, 2, 2],
            Self::ResNet34 => [3, 4, 6, 3],
        }
    }
}

/// How the backbone parameters are populated at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackboneInit {
    Random,
    /// Copy every parameter from a saved backbone record of the same depth.
    Pretrained(PathBuf),
}

#[derive(Module, Debug)]
pub struct ResNetBackbone<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    maxpool: MaxPool2d,
    layer1: Vec<BasicBlock<B>>,
    layer2: Vec<BasicBlock<B>>,
    layer3: Vec<BasicBlock<B>>,
    layer4: Vec<BasicBlock<B>>,
    input_channels: usize,
}

impl<B: Backend> ResNetBackbone<B> {
    /// Randomly initialized backbone. The stem convolution is built for
    /// `input_channels`; every later stage keeps its native width.
    pub fn new(depth: BackboneDepth, input_channels: usize, device: &B::Device) -> Self {
        if input_channels != NATIVE_INPUT_CHANNELS {
            tracing::debug!(
                "adapting backbone stem from {NATIVE_INPUT_CHANNELS} to {input_channels} input channels"
            );
        }
        let [c0, c1, c2, c3, c4] = PYRAMID_CHANNELS;
        let [n1, n2, n3, n4] = depth.blocks();
        Self {
            conv1: Conv2dConfig::new([input_channels, c0], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .init(device),
            bn1: BatchNormConfig::new(c0).init(device),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            layer1: residual_stage(c0, c1, n1, 1, device),
            layer2: residual_stage(c1, c2, n2, 2, device),
            layer3: residual_stage(c2, c3, n3, 2, device),
            layer4: residual_stage(c3, c4, n4, 2, device),
            input_channels,
        }
    }

    pub fn init(
        depth: BackboneDepth,
        input_channels: usize,
        init: &BackboneInit,
        device: &B::Device,
    ) -> ModelResult<Self> {
        match init {
            BackboneInit::Random => Ok(Self::new(depth, input_channels, device)),
            BackboneInit::Pretrained(path) => {
                if input_channels != NATIVE_INPUT_CHANNELS {
                    return Err(ModelError::Configuration(format!(
                        "pretrained backbone weights expect {NATIVE_INPUT_CHANNELS} input channels, got {input_channels}"
                    )));
                }
                Self::load_pretrained(depth, path, device)
            }
        }
    }

    fn load_pretrained(depth: BackboneDepth, path: &Path, device: &B::Device) -> ModelResult<Self> {
        tracing::info!("loading pretrained backbone weights from {}", path.display());
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        Self::new(depth, NATIVE_INPUT_CHANNELS, device)
            .load_file(path.to_path_buf(), &recorder, device)
            .map_err(|e| ModelError::Weights {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    /// Feature maps ordered shallow to deep: the stem output (stride 2,
    /// captured before pooling) followed by the four residual stages
    /// (strides 4, 8, 16, 32).
    pub fn forward(&self, x: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let stem = relu(self.bn1.forward(self.conv1.forward(x)));
        let mut x = self.maxpool.forward(stem.clone());
        let mut pyramid = Vec::with_capacity(PYRAMID_CHANNELS.len());
        pyramid.push(stem);
        for stage in [&self.layer1, &self.layer2, &self.layer3, &self.layer4] {
            for block in stage {
                x = block.forward(x);
            }
            pyramid.push(x.clone());
        }
        pyramid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn pyramid_halves_resolution_per_stage() {
        let device = Default::default();
        let backbone = ResNetBackbone::<B>::new(BackboneDepth::ResNet18, 1, &device);
        let features = backbone.forward(Tensor::zeros([1, 1, 64, 96], &device));
        let dims: Vec<_> = features.iter().map(|f| f.dims()).collect();
        assert_eq!(
            dims,
            vec![
                [1, 64, 32, 48],
                [1, 64, 16, 24],
                [1, 128, 8, 12],
                [1, 256, 4, 6],
                [1, 512, 2, 3],
            ]
        );
    }

    #[test]
    fn pretrained_rejects_non_native_channels() {
        let device = Default::default();
        let err = ResNetBackbone::<B>::init(
            BackboneDepth::ResNet18,
            1,
            &BackboneInit::Pretrained(PathBuf::from("unused.bin")),
            &device,
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::Configuration(_)));
    }

    #[test]
    fn missing_pretrained_record_is_a_weights_error() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let err = ResNetBackbone::<B>::init(
            BackboneDepth::ResNet18,
            3,
            &BackboneInit::Pretrained(dir.path().join("absent")),
            &device,
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::Weights { .. }));
    }
}
