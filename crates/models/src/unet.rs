//! Assembled segmentation networks behind the [`SegmentationModel`] trait.

use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::backbone::ResNetBackbone;
use crate::config::SegmentationConfig;
use crate::decoder::{SkipDecoder, DECODER_CHANNELS};
use crate::error::{ModelError, ModelResult};
use crate::head::OutputHead;
use crate::temporal::TemporalAggregator;

/// Capability shared by every variant: frames in, per-pixel logits out.
///
/// Input is always `[batch, time, channels, height, width]`; single-frame
/// variants require `time == 1`. Output is `[batch, classes, height, width]`
/// raw logits for the last time step.
pub trait SegmentationModel<B: Backend> {
    fn forward(&self, frames: Tensor<B, 5>) -> ModelResult<Tensor<B, 4>>;

    fn input_channels(&self) -> usize;

    fn sequence_length(&self) -> usize;
}

fn check_frames<B: Backend>(
    frames: &Tensor<B, 5>,
    input_channels: usize,
    sequence_length: usize,
) -> ModelResult<()> {
    let [_, time, channels, _, _] = frames.dims();
    if time != sequence_length {
        return Err(ModelError::shape(
            "model input",
            format!("sequence has {time} frames, model expects {sequence_length}"),
        ));
    }
    if channels != input_channels {
        return Err(ModelError::shape(
            "model input",
            format!("frames have {channels} channels, model expects {input_channels}"),
        ));
    }
    Ok(())
}

fn frame_at<B: Backend>(frames: &Tensor<B, 5>, t: usize) -> Tensor<B, 4> {
    let [batch, _, channels, h, w] = frames.dims();
    frames
        .clone()
        .slice([0..batch, t..t + 1, 0..channels, 0..h, 0..w])
        .reshape([batch, channels, h, w])
}

/// Backbone plus skip decoder: one frame to a fused stride-2 feature map.
#[derive(Module, Debug)]
pub struct EncoderDecoder<B: Backend> {
    backbone: ResNetBackbone<B>,
    decoder: SkipDecoder<B>,
}

impl<B: Backend> EncoderDecoder<B> {
    pub fn new(cfg: &SegmentationConfig, device: &B::Device) -> ModelResult<Self> {
        let backbone = ResNetBackbone::init(
            cfg.architecture.backbone_depth(),
            cfg.input_channels,
            &cfg.backbone_init(),
            device,
        )?;
        Ok(Self {
            backbone,
            decoder: SkipDecoder::new(device),
        })
    }

    pub fn input_channels(&self) -> usize {
        self.backbone.input_channels()
    }

    pub fn backbone(&self) -> &ResNetBackbone<B> {
        &self.backbone
    }

    pub fn features(&self, x: Tensor<B, 4>) -> ModelResult<Tensor<B, 4>> {
        let [_, channels, _, _] = x.dims();
        if channels != self.input_channels() {
            return Err(ModelError::shape(
                "backbone",
                format!(
                    "image has {channels} channels, backbone expects {}",
                    self.input_channels()
                ),
            ));
        }
        self.decoder.forward(self.backbone.forward(x))
    }
}

/// Single-frame ResNet U-Net.
#[derive(Module, Debug)]
pub struct ResUNet<B: Backend> {
    body: EncoderDecoder<B>,
    head: OutputHead<B>,
}

impl<B: Backend> ResUNet<B> {
    pub fn new(cfg: &SegmentationConfig, device: &B::Device) -> ModelResult<Self> {
        cfg.validate()?;
        if cfg.architecture.is_sequence() {
            return Err(ModelError::Configuration(format!(
                "{} is a sequence architecture; build it as ConvLstmUNet",
                cfg.architecture
            )));
        }
        tracing::info!(
            "building {} ({} -> {} channels)",
            cfg.architecture,
            cfg.input_channels,
            cfg.num_classes
        );
        Ok(Self {
            body: EncoderDecoder::new(cfg, device)?,
            head: OutputHead::new(DECODER_CHANNELS, cfg.num_classes, device),
        })
    }

    pub fn encoder_decoder(&self) -> &EncoderDecoder<B> {
        &self.body
    }

    /// `[batch, channels, height, width]` to logits of the same spatial size.
    pub fn forward_image(&self, x: Tensor<B, 4>) -> ModelResult<Tensor<B, 4>> {
        let [_, _, h, w] = x.dims();
        let features = self.body.features(x)?;
        Ok(self.head.forward(features, [h, w]))
    }
}

impl<B: Backend> SegmentationModel<B> for ResUNet<B> {
    fn forward(&self, frames: Tensor<B, 5>) -> ModelResult<Tensor<B, 4>> {
        check_frames(&frames, self.input_channels(), 1)?;
        self.forward_image(frame_at(&frames, 0))
    }

    fn input_channels(&self) -> usize {
        self.body.input_channels()
    }

    fn sequence_length(&self) -> usize {
        1
    }
}

/// Per-frame ResNet U-Net features reduced over time by a ConvLSTM; predicts
/// the mask of the last frame.
#[derive(Module, Debug)]
pub struct ConvLstmUNet<B: Backend> {
    body: EncoderDecoder<B>,
    temporal: TemporalAggregator<B>,
    head: OutputHead<B>,
}

impl<B: Backend> ConvLstmUNet<B> {
    pub fn new(cfg: &SegmentationConfig, device: &B::Device) -> ModelResult<Self> {
        cfg.validate()?;
        if !cfg.architecture.is_sequence() {
            return Err(ModelError::Configuration(format!(
                "{} is a single-frame architecture; build it as ResUNet",
                cfg.architecture
            )));
        }
        tracing::info!(
            "building {} over {} frames ({} conv-lstm layers)",
            cfg.architecture,
            cfg.sequence_length,
            cfg.temporal_layers
        );
        Ok(Self {
            body: EncoderDecoder::new(cfg, device)?,
            temporal: TemporalAggregator::new(
                DECODER_CHANNELS,
                cfg.temporal_layers,
                cfg.temporal_kernel,
                cfg.sequence_length,
                device,
            ),
            head: OutputHead::new(DECODER_CHANNELS, cfg.num_classes, device),
        })
    }

    /// Fused decoder features of a single frame, before aggregation.
    pub fn frame_features(&self, x: Tensor<B, 4>) -> ModelResult<Tensor<B, 4>> {
        self.body.features(x)
    }

    /// Output head applied to an aggregated (or single-frame) feature map.
    pub fn project(&self, features: Tensor<B, 4>, output_size: [usize; 2]) -> Tensor<B, 4> {
        self.head.forward(features, output_size)
    }
}

impl<B: Backend> SegmentationModel<B> for ConvLstmUNet<B> {
    fn forward(&self, frames: Tensor<B, 5>) -> ModelResult<Tensor<B, 4>> {
        check_frames(&frames, self.input_channels(), self.sequence_length())?;
        let [_, time, _, h, w] = frames.dims();
        let features = (0..time)
            .map(|t| self.body.features(frame_at(&frames, t)))
            .collect::<ModelResult<Vec<_>>>()?;
        let aggregated = self.temporal.forward(features)?;
        Ok(self.project(aggregated, [h, w]))
    }

    fn input_channels(&self) -> usize {
        self.body.input_channels()
    }

    fn sequence_length(&self) -> usize {
        self.temporal.sequence_length()
    }
}
