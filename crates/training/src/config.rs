//! Experiment configuration: TOML file, then CLI overrides, then frozen.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use segmentation_models::{ModelError, SegmentationConfig, TOTAL_STRIDE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::loss::LossConfig;

/// Environment variable naming the experiment file when `--config` is absent.
pub const CONFIG_ENV: &str = "SEGMENTATION_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("invalid experiment config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Adam => "adam",
            Self::Sgd => "sgd",
        })
    }
}

impl FromStr for OptimizerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "adam" => Ok(Self::Adam),
            "sgd" => Ok(Self::Sgd),
            other => Err(format!("unknown optimizer `{other}` (expected adam or sgd)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub epochs: usize,
    pub weight_decay: f32,
    /// SGD only.
    pub momentum: f64,
    pub scheduler: bool,
    pub step_size: usize,
    pub gamma: f64,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            optimizer: OptimizerKind::Adam,
            learning_rate: 3e-4,
            batch_size: 16,
            epochs: 2,
            weight_decay: 1e-5,
            momentum: 0.9,
            scheduler: true,
            step_size: 20,
            gamma: 0.1,
        }
    }
}

impl OptimConfig {
    /// Step decay: `lr * gamma^(epoch / step_size)`.
    pub fn lr_at(&self, epoch: usize) -> f64 {
        if !self.scheduler || self.step_size == 0 {
            return self.learning_rate;
        }
        self.learning_rate * self.gamma.powi((epoch / self.step_size) as i32)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub image_dir: PathBuf,
    pub label_dir: PathBuf,
    pub test_image_dir: PathBuf,
    pub test_label_dir: PathBuf,
    pub image_width: u32,
    pub image_height: u32,
    pub val_split: f32,
    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from("data/train/images"),
            label_dir: PathBuf::from("data/train/labels"),
            test_image_dir: PathBuf::from("data/test/images"),
            test_label_dir: PathBuf::from("data/test/labels"),
            image_width: 1024,
            image_height: 256,
            val_split: 0.2,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub checkpoint_dir: PathBuf,
    pub log_dir: PathBuf,
    pub results_dir: PathBuf,
    pub save_model: bool,
    pub save_visualizations: bool,
    pub experiment_name: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints"),
            log_dir: PathBuf::from("logs"),
            results_dir: PathBuf::from("results"),
            save_model: true,
            save_visualizations: false,
            experiment_name: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub model: SegmentationConfig,
    pub loss: LossConfig,
    pub optim: OptimConfig,
    pub data: DataConfig,
    pub output: OutputConfig,
}

impl ExperimentConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read `path` when given, otherwise start from defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                tracing::info!("loading experiment config from {}", path.display());
                Self::from_path(path)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn experiment_name(&self) -> String {
        self.output.experiment_name.clone().unwrap_or_else(|| {
            format!(
                "{}_{}_Epochs{}_LR{}",
                self.model.architecture, self.loss.kind, self.optim.epochs, self.optim.learning_rate
            )
        })
    }

    /// `[height, width]` every frame is resized to.
    pub fn image_size(&self) -> [usize; 2] {
        [self.data.image_height as usize, self.data.image_width as usize]
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.output.checkpoint_dir.join(self.experiment_name())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.output.log_dir.join(self.experiment_name())
    }

    pub fn results_dir(&self) -> PathBuf {
        self.output.results_dir.join(self.experiment_name())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.model.validate()?;
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let (w, h) = (self.data.image_width as usize, self.data.image_height as usize);
        if w == 0 || h == 0 || w % TOTAL_STRIDE != 0 || h % TOTAL_STRIDE != 0 {
            return invalid(format!(
                "image size {w}x{h} must be non-zero and divisible by {TOTAL_STRIDE}"
            ));
        }
        if !(0.0..1.0).contains(&self.data.val_split) {
            return invalid(format!("val_split must be in [0, 1), got {}", self.data.val_split));
        }
        if self.model.num_classes != 1 {
            return invalid(format!(
                "label masks are binary; num_classes must be 1, got {}",
                self.model.num_classes
            ));
        }
        if self.optim.batch_size == 0 {
            return invalid("batch_size must be at least 1".into());
        }
        if self.optim.epochs == 0 {
            return invalid("epochs must be at least 1".into());
        }
        if self.optim.learning_rate <= 0.0 {
            return invalid(format!(
                "learning_rate must be positive, got {}",
                self.optim.learning_rate
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::LossKind;
    use segmentation_models::Architecture;

    #[test]
    fn defaults_validate() {
        let cfg = ExperimentConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.experiment_name(), "resnet18-unet_dice-focal_Epochs2_LR0.0003");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exp.toml");
        std::fs::write(
            &path,
            r#"
[model]
architecture = "conv-lstm-unet"
sequence_length = 3

[loss]
kind = "soft-iou"

[optim]
optimizer = "sgd"
epochs = 5

[output]
experiment_name = "lstm-run"
"#,
        )
        .unwrap();
        let cfg = ExperimentConfig::from_path(&path).unwrap();
        assert_eq!(cfg.model.architecture, Architecture::ConvLstmUnet);
        assert_eq!(cfg.model.input_channels, 1);
        assert_eq!(cfg.loss.kind, LossKind::SoftIou);
        assert_eq!(cfg.optim.optimizer, OptimizerKind::Sgd);
        assert_eq!(cfg.optim.batch_size, 16);
        assert_eq!(cfg.data.image_width, 1024);
        assert_eq!(cfg.checkpoint_dir(), PathBuf::from("checkpoints/lstm-run"));
        cfg.validate().unwrap();
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[optim\nepochs = ").unwrap();
        assert!(matches!(
            ExperimentConfig::from_path(&path),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            ExperimentConfig::from_path(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn image_size_must_be_stride_aligned() {
        let mut cfg = ExperimentConfig::default();
        cfg.data.image_width = 1000;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn multi_class_head_is_rejected_for_binary_masks() {
        let mut cfg = ExperimentConfig::default();
        cfg.model.num_classes = 2;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_model_section_surfaces_model_error() {
        let mut cfg = ExperimentConfig::default();
        cfg.model.pretrained = true;
        assert!(matches!(cfg.validate(), Err(ConfigError::Model(_))));
    }

    #[test]
    fn step_schedule() {
        let optim = OptimConfig {
            learning_rate: 1.0,
            step_size: 2,
            gamma: 0.1,
            ..Default::default()
        };
        assert_eq!(optim.lr_at(0), 1.0);
        assert_eq!(optim.lr_at(1), 1.0);
        assert!((optim.lr_at(2) - 0.1).abs() < 1e-12);
        assert!((optim.lr_at(5) - 0.01).abs() < 1e-12);
        let flat = OptimConfig {
            scheduler: false,
            ..optim
        };
        assert_eq!(flat.lr_at(9), 1.0);
    }
}
