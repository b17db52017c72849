use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::backbone::{BackboneDepth, BackboneInit, NATIVE_INPUT_CHANNELS};
use crate::error::{ModelError, ModelResult};

/// Closed set of model variants, chosen once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "resnet18-unet")]
    ResNet18Unet,
    #[serde(rename = "resnet34-unet")]
    ResNet34Unet,
    /// ResNet-18 encoder-decoder per frame with a ConvLSTM over the fused maps.
    #[serde(rename = "conv-lstm-unet")]
    ConvLstmUnet,
}

impl Architecture {
    pub const ALL: [Architecture; 3] = [
        Architecture::ResNet18Unet,
        Architecture::ResNet34Unet,
        Architecture::ConvLstmUnet,
    ];

    pub fn backbone_depth(self) -> BackboneDepth {
        match self {
            Self::ResNet18Unet | Self::ConvLstmUnet => BackboneDepth::ResNet18,
            Self::ResNet34Unet => BackboneDepth::ResNet34,
        }
    }

    pub fn is_sequence(self) -> bool {
        matches!(self, Self::ConvLstmUnet)
    }

    pub fn default_sequence_length(self) -> usize {
        if self.is_sequence() {
            3
        } else {
            1
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ResNet18Unet => "resnet18-unet",
            Self::ResNet34Unet => "resnet34-unet",
            Self::ConvLstmUnet => "conv-lstm-unet",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Architecture {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|arch| arch.name() == s)
            .ok_or_else(|| {
                let known: Vec<_> = Self::ALL.iter().map(|a| a.name()).collect();
                ModelError::Configuration(format!(
                    "unknown architecture `{s}` (expected one of {})",
                    known.join(", ")
                ))
            })
    }
}

/// Immutable description of a model instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    pub input_channels: usize,
    pub num_classes: usize,
    pub architecture: Architecture,
    pub pretrained: bool,
    /// Saved backbone record copied into the encoder when `pretrained` is set.
    pub pretrained_weights: Option<PathBuf>,
    pub sequence_length: usize,
    pub temporal_layers: usize,
    pub temporal_kernel: usize,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            input_channels: 1,
            num_classes: 1,
            architecture: Architecture::ResNet18Unet,
            pretrained: false,
            pretrained_weights: None,
            sequence_length: 1,
            temporal_layers: 2,
            temporal_kernel: 3,
        }
    }
}

impl SegmentationConfig {
    pub fn new(architecture: Architecture, input_channels: usize) -> Self {
        Self {
            architecture,
            input_channels,
            sequence_length: architecture.default_sequence_length(),
            ..Default::default()
        }
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    pub fn with_sequence_length(mut self, sequence_length: usize) -> Self {
        self.sequence_length = sequence_length;
        self
    }

    pub fn with_pretrained(mut self, weights: impl Into<PathBuf>) -> Self {
        self.pretrained = true;
        self.pretrained_weights = Some(weights.into());
        self
    }

    pub fn validate(&self) -> ModelResult<()> {
        let fail = |msg: String| Err(ModelError::Configuration(msg));
        if self.input_channels == 0 {
            return fail("input_channels must be at least 1".into());
        }
        if self.num_classes == 0 {
            return fail("num_classes must be at least 1".into());
        }
        if self.sequence_length == 0 {
            return fail("sequence_length must be at least 1".into());
        }
        if !self.architecture.is_sequence() && self.sequence_length != 1 {
            return fail(format!(
                "{} consumes single frames; sequence_length must be 1, got {}",
                self.architecture, self.sequence_length
            ));
        }
        if self.architecture.is_sequence() {
            if self.temporal_layers == 0 {
                return fail("temporal_layers must be at least 1".into());
            }
            if self.temporal_kernel % 2 == 0 {
                return fail(format!(
                    "temporal_kernel must be odd, got {}",
                    self.temporal_kernel
                ));
            }
        }
        if self.pretrained {
            if self.input_channels != NATIVE_INPUT_CHANNELS {
                return fail(format!(
                    "pretrained weights require {NATIVE_INPUT_CHANNELS} input channels, got {}",
                    self.input_channels
                ));
            }
            if self.pretrained_weights.is_none() {
                return fail("pretrained is set but no pretrained_weights path was given".into());
            }
        }
        Ok(())
    }

    pub fn backbone_init(&self) -> BackboneInit {
        match (&self.pretrained_weights, self.pretrained) {
            (Some(path), true) => BackboneInit::Pretrained(path.clone()),
            _ => BackboneInit::Random,
        }
    }

    /// Same architecture with random backbone init, for rebuilding a model
    /// whose parameters come from a checkpoint.
    pub fn for_checkpoint(&self) -> Self {
        Self {
            pretrained: false,
            pretrained_weights: None,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        SegmentationConfig::default().validate().unwrap();
        for arch in Architecture::ALL {
            SegmentationConfig::new(arch, 1).validate().unwrap();
        }
    }

    #[test]
    fn pretrained_with_grayscale_input_is_rejected() {
        let cfg = SegmentationConfig::new(Architecture::ResNet18Unet, 1).with_pretrained("w.bin");
        assert!(matches!(cfg.validate(), Err(ModelError::Configuration(_))));
    }

    #[test]
    fn pretrained_requires_weights_path() {
        let cfg = SegmentationConfig {
            pretrained: true,
            input_channels: 3,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ModelError::Configuration(_))));
    }

    #[test]
    fn single_frame_variants_reject_sequences() {
        let cfg = SegmentationConfig::new(Architecture::ResNet34Unet, 1).with_sequence_length(3);
        assert!(cfg.validate().is_err());
        let cfg = SegmentationConfig::new(Architecture::ConvLstmUnet, 1).with_sequence_length(5);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn even_temporal_kernel_is_rejected() {
        let mut cfg = SegmentationConfig::new(Architecture::ConvLstmUnet, 1);
        cfg.temporal_kernel = 4;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn display_uses_config_names() {
        assert_eq!(Architecture::ResNet18Unet.to_string(), "resnet18-unet");
        assert_eq!(Architecture::ConvLstmUnet.to_string(), "conv-lstm-unet");
        assert_eq!("resnet34-unet".parse::<Architecture>().unwrap(), Architecture::ResNet34Unet);
        assert!("attention-unet".parse::<Architecture>().is_err());
    }
}
