//! Burn segmentation networks that turn a (possibly temporal) scan into
//! per-pixel mask logits.
//!
//! - [`ResUNet`]: ResNet-18/34 encoder with a skip-aligned U-Net decoder.
//! - [`ConvLstmUNet`]: the same encoder-decoder per frame, reduced over a
//!   fixed-length sequence by stacked ConvLSTM cells.
//!
//! Both implement [`SegmentationModel`] and are selected from
//! [`Architecture`] once, at construction. Heads emit raw logits; losses and
//! inference callers apply the activation.

pub mod align;
pub mod backbone;
pub mod blocks;
pub mod config;
pub mod decoder;
pub mod error;
pub mod head;
pub mod temporal;
pub mod unet;

pub use align::{align_and_concat, align_to, pad_split};
pub use backbone::{
    BackboneDepth, BackboneInit, ResNetBackbone, NATIVE_INPUT_CHANNELS, PYRAMID_CHANNELS,
    TOTAL_STRIDE,
};
pub use config::{Architecture, SegmentationConfig};
pub use decoder::{SkipDecoder, DECODER_CHANNELS};
pub use error::{ModelError, ModelResult};
pub use head::OutputHead;
pub use temporal::{ConvLstmCell, LstmState, TemporalAggregator};
pub use unet::{ConvLstmUNet, EncoderDecoder, ResUNet, SegmentationModel};

pub mod prelude {
    pub use super::{
        Architecture, ConvLstmUNet, ModelError, ModelResult, ResUNet, SegmentationConfig,
        SegmentationModel,
    };
}
