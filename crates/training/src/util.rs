use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::backend::Autodiff;
use burn::module::{AutodiffModule, Module};
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer, SgdConfig};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use segmentation_models::{Architecture, ConvLstmUNet, ResUNet, SegmentationModel};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::config::{ExperimentConfig, OptimizerKind};
use crate::dataset::{SampleLoader, SegmentationDataset};
use crate::loss::{LossKind, SegmentationLoss};
use crate::metrics::{batch_metrics, MetricAccumulator, SegmentationMetrics};
use crate::TrainBackend;

pub type ADBackend = Autodiff<TrainBackend>;

pub const BEST_CHECKPOINT: &str = "best.bin";
pub const LAST_CHECKPOINT: &str = "last.bin";
pub const TRAINING_LOG: &str = "training_log.jsonl";

/// Install the `tracing` subscriber for the binaries; `RUST_LOG` overrides
/// the default `info` level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            tracing::warn!("built with backend-wgpu; the WGPU backend is used despite --backend nd-array");
        }
        _ => {}
    }
    Ok(())
}

#[derive(Parser, Debug, Default)]
#[command(
    name = "train",
    about = "Train a segmentation model from an experiment config"
)]
pub struct TrainArgs {
    /// Experiment TOML (falls back to $SEGMENTATION_CONFIG, then defaults).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Architecture: resnet18-unet, resnet34-unet or conv-lstm-unet.
    #[arg(long)]
    pub model: Option<Architecture>,
    /// Loss: dice-focal, dice, soft-iou or focal-tversky.
    #[arg(long)]
    pub loss: Option<LossKind>,
    /// Optimizer: adam or sgd.
    #[arg(long)]
    pub optimizer: Option<OptimizerKind>,
    #[arg(long)]
    pub epochs: Option<usize>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long)]
    pub lr: Option<f64>,
    /// Frames per sample (sequence architectures only).
    #[arg(long)]
    pub sequence_length: Option<usize>,
    #[arg(long)]
    pub input_channels: Option<usize>,
    #[arg(long)]
    pub image_dir: Option<PathBuf>,
    #[arg(long)]
    pub label_dir: Option<PathBuf>,
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    #[arg(long)]
    pub experiment_name: Option<String>,
    #[arg(long)]
    pub seed: Option<u64>,
    /// Stop each epoch after this many batches.
    #[arg(long)]
    pub max_batches: Option<usize>,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,
}

impl TrainArgs {
    /// Layer explicit flags over a loaded config.
    pub fn apply(&self, cfg: &mut ExperimentConfig) {
        if let Some(arch) = self.model {
            cfg.model.architecture = arch;
            cfg.model.sequence_length = arch.default_sequence_length();
        }
        if let Some(t) = self.sequence_length {
            cfg.model.sequence_length = t;
        }
        if let Some(c) = self.input_channels {
            cfg.model.input_channels = c;
        }
        if let Some(kind) = self.loss {
            cfg.loss.kind = kind;
        }
        if let Some(kind) = self.optimizer {
            cfg.optim.optimizer = kind;
        }
        if let Some(n) = self.epochs {
            cfg.optim.epochs = n;
        }
        if let Some(n) = self.batch_size {
            cfg.optim.batch_size = n;
        }
        if let Some(lr) = self.lr {
            cfg.optim.learning_rate = lr;
        }
        if let Some(dir) = &self.image_dir {
            cfg.data.image_dir = dir.clone();
        }
        if let Some(dir) = &self.label_dir {
            cfg.data.label_dir = dir.clone();
        }
        if let Some(dir) = &self.checkpoint_dir {
            cfg.output.checkpoint_dir = dir.clone();
        }
        if let Some(dir) = &self.log_dir {
            cfg.output.log_dir = dir.clone();
        }
        if let Some(name) = &self.experiment_name {
            cfg.output.experiment_name = Some(name.clone());
        }
        if let Some(seed) = self.seed {
            cfg.data.seed = seed;
        }
    }
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    if let Some(kind) = args.backend {
        validate_backend_choice(kind)?;
    }
    let mut cfg = ExperimentConfig::load(args.config.as_deref())?;
    args.apply(&mut cfg);
    let report = train(&cfg, args.max_batches)?;
    tracing::info!(
        "finished {}: best val loss {:.4} at epoch {}",
        cfg.experiment_name(),
        report.best_val_loss,
        report.best_epoch
    );
    Ok(())
}

/// One line of `training_log.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub learning_rate: f64,
    pub train_loss: f32,
    pub val_loss: f32,
    pub val_metrics: SegmentationMetrics,
    pub improved: bool,
}

#[derive(Debug, Clone)]
pub struct TrainReport {
    pub epochs: Vec<EpochRecord>,
    pub best_epoch: usize,
    pub best_val_loss: f32,
    pub checkpoint_dir: PathBuf,
}

/// Train the configured architecture end to end.
pub fn train(cfg: &ExperimentConfig, max_batches: Option<usize>) -> anyhow::Result<TrainReport> {
    cfg.validate()?;
    let loader = SampleLoader::new(
        cfg.data.image_width,
        cfg.data.image_height,
        cfg.model.input_channels,
    )?;
    let dataset = SegmentationDataset::open(
        &cfg.data.image_dir,
        &cfg.data.label_dir,
        cfg.model.sequence_length,
        loader,
    )?;
    let (train_set, val_set) = dataset.split(cfg.data.val_split, cfg.data.seed);
    tracing::info!(
        "experiment {}: {} train / {} val samples",
        cfg.experiment_name(),
        train_set.len(),
        val_set.len()
    );

    let device = <ADBackend as Backend>::Device::default();
    match cfg.model.architecture {
        Architecture::ResNet18Unet | Architecture::ResNet34Unet => {
            let model = ResUNet::<ADBackend>::new(&cfg.model, &device)?;
            train_with_optimizer(cfg, model, &train_set, &val_set, max_batches, &device)
        }
        Architecture::ConvLstmUnet => {
            let model = ConvLstmUNet::<ADBackend>::new(&cfg.model, &device)?;
            train_with_optimizer(cfg, model, &train_set, &val_set, max_batches, &device)
        }
    }
}

fn train_with_optimizer<M>(
    cfg: &ExperimentConfig,
    model: M,
    train_set: &SegmentationDataset,
    val_set: &SegmentationDataset,
    max_batches: Option<usize>,
    device: &<ADBackend as Backend>::Device,
) -> anyhow::Result<TrainReport>
where
    M: AutodiffModule<ADBackend> + SegmentationModel<ADBackend>,
    M::InnerModule: SegmentationModel<TrainBackend>,
{
    let decay = WeightDecayConfig::new(cfg.optim.weight_decay);
    match cfg.optim.optimizer {
        OptimizerKind::Adam => {
            let optim = AdamConfig::new().with_weight_decay(Some(decay)).init();
            fit(cfg, model, optim, train_set, val_set, max_batches, device)
        }
        OptimizerKind::Sgd => {
            let optim = SgdConfig::new()
                .with_weight_decay(Some(decay))
                .with_momentum(Some(MomentumConfig::new().with_momentum(cfg.optim.momentum)))
                .init();
            fit(cfg, model, optim, train_set, val_set, max_batches, device)
        }
    }
}

/// Read a one-element loss tensor back to the host.
pub(crate) fn scalar<B: Backend>(t: Tensor<B, 1>) -> anyhow::Result<f32> {
    let values = t
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("failed to read loss value: {e:?}"))?;
    match values.as_slice() {
        [value] => Ok(*value),
        other => anyhow::bail!("expected a scalar loss, got {} values", other.len()),
    }
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f32>() / values.len() as f32
    }
}

/// Epoch loop. Parameters change only at `optim.step`, once per batch, so
/// stopping between batches leaves a consistent model.
pub fn fit<M, O>(
    cfg: &ExperimentConfig,
    mut model: M,
    mut optim: O,
    train_set: &SegmentationDataset,
    val_set: &SegmentationDataset,
    max_batches: Option<usize>,
    device: &<ADBackend as Backend>::Device,
) -> anyhow::Result<TrainReport>
where
    M: AutodiffModule<ADBackend> + SegmentationModel<ADBackend>,
    M::InnerModule: SegmentationModel<TrainBackend>,
    O: Optimizer<M, ADBackend>,
{
    let loss_fn = cfg.loss.init();
    let ckpt_dir = cfg.checkpoint_dir();
    let log_dir = cfg.log_dir();
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log dir {}", log_dir.display()))?;
    if cfg.output.save_model {
        fs::create_dir_all(&ckpt_dir)
            .with_context(|| format!("failed to create checkpoint dir {}", ckpt_dir.display()))?;
    }
    let log_path = log_dir.join(TRAINING_LOG);

    let mut rng = StdRng::seed_from_u64(cfg.data.seed);
    let batch_size = cfg.optim.batch_size;
    let limit = max_batches.unwrap_or(usize::MAX);
    let mut epochs = Vec::with_capacity(cfg.optim.epochs);
    let mut best: Option<(usize, f32)> = None;

    for epoch in 0..cfg.optim.epochs {
        let lr = cfg.optim.lr_at(epoch);
        let mut losses = Vec::new();
        let mut batches = train_set.batches(Some(&mut rng));
        while losses.len() < limit {
            let Some(batch) = batches.next_batch::<ADBackend>(batch_size, device)? else {
                break;
            };
            let logits = model.forward(batch.images)?;
            let loss = loss_fn.forward(logits, batch.masks);
            let loss_detached = loss.clone().detach();
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(lr, model, grads);

            let loss_val = scalar(loss_detached)?;
            tracing::debug!("epoch {epoch} batch {}: loss {loss_val:.4}", losses.len());
            losses.push(loss_val);
        }
        let train_loss = mean(&losses);

        let (val_loss, val_metrics) = if val_set.is_empty() {
            (train_loss, SegmentationMetrics::default())
        } else {
            validate(&model.valid(), &loss_fn, val_set, batch_size, device)?
        };

        let improved = best.map_or(true, |(_, b)| val_loss < b);
        if improved {
            best = Some((epoch, val_loss));
            if cfg.output.save_model {
                save_checkpoint::<ADBackend, _>(&model, &ckpt_dir.join(BEST_CHECKPOINT))?;
            }
        }

        let record = EpochRecord {
            epoch,
            learning_rate: lr,
            train_loss,
            val_loss,
            val_metrics,
            improved,
        };
        append_jsonl(&log_path, &record)?;
        tracing::info!(
            "epoch {epoch}: lr {lr:.2e} train loss {train_loss:.4} val loss {val_loss:.4} dice {:.4} iou {:.4}{}",
            val_metrics.dice,
            val_metrics.iou,
            if improved { " (best)" } else { "" }
        );
        epochs.push(record);
    }

    if cfg.output.save_model {
        let last = ckpt_dir.join(LAST_CHECKPOINT);
        save_checkpoint::<ADBackend, _>(&model, &last)?;
        tracing::info!("saved checkpoints to {}", ckpt_dir.display());
    }

    let (best_epoch, best_val_loss) = best.unwrap_or((0, f32::INFINITY));
    Ok(TrainReport {
        epochs,
        best_epoch,
        best_val_loss,
        checkpoint_dir: ckpt_dir,
    })
}

/// Mean loss and mean per-sample metrics with BatchNorm in inference mode.
pub fn validate<M: SegmentationModel<TrainBackend>>(
    model: &M,
    loss_fn: &SegmentationLoss,
    dataset: &SegmentationDataset,
    batch_size: usize,
    device: &<TrainBackend as Backend>::Device,
) -> anyhow::Result<(f32, SegmentationMetrics)> {
    let mut losses = Vec::new();
    let mut metrics = MetricAccumulator::default();
    let mut batches = dataset.batches(None);
    while let Some(batch) = batches.next_batch::<TrainBackend>(batch_size, device)? {
        let logits = model.forward(batch.images)?;
        losses.push(scalar(loss_fn.forward(logits.clone(), batch.masks.clone()))?);
        metrics.extend(batch_metrics(logits, batch.masks)?);
    }
    Ok((mean(&losses), metrics.mean()))
}

fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> anyhow::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{}", serde_json::to_string(record)?)?;
    Ok(())
}

pub fn save_checkpoint<B: Backend, M: Module<B>>(model: &M, path: &Path) -> anyhow::Result<()> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(path, &recorder)
        .map_err(|e| anyhow::anyhow!("failed to save checkpoint {}: {e}", path.display()))
}

/// Load parameters saved by [`save_checkpoint`] into a freshly built model.
pub fn load_checkpoint<B: Backend, M: Module<B>>(
    model: M,
    path: &Path,
    device: &B::Device,
) -> anyhow::Result<M> {
    if !path.exists() {
        anyhow::bail!("checkpoint not found at {}", path.display());
    }
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .load_file(path, &recorder, device)
        .map_err(|e| anyhow::anyhow!("failed to load checkpoint {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_config() {
        let args = TrainArgs::parse_from([
            "train",
            "--model",
            "conv-lstm-unet",
            "--loss",
            "focal-tversky",
            "--epochs",
            "7",
            "--lr",
            "0.001",
        ]);
        let mut cfg = ExperimentConfig::default();
        args.apply(&mut cfg);
        assert_eq!(cfg.model.architecture, Architecture::ConvLstmUnet);
        assert_eq!(cfg.model.sequence_length, 3);
        assert_eq!(cfg.loss.kind, LossKind::FocalTversky);
        assert_eq!(cfg.optim.epochs, 7);
        assert_eq!(
            cfg.experiment_name(),
            "conv-lstm-unet_focal-tversky_Epochs7_LR0.001"
        );
    }

    #[test]
    fn unknown_model_flag_is_rejected() {
        assert!(TrainArgs::try_parse_from(["train", "--model", "deeplab"]).is_err());
    }

    #[test]
    fn missing_checkpoint_is_fatal() {
        let device = Default::default();
        let model = ResUNet::<TrainBackend>::new(&Default::default(), &device).unwrap();
        let dir = tempfile::tempdir().unwrap();
        assert!(load_checkpoint::<TrainBackend, _>(model, &dir.path().join(BEST_CHECKPOINT), &device).is_err());
    }

    #[test]
    fn scalar_rejects_non_scalar_loss() {
        let device = Default::default();
        let one = Tensor::<TrainBackend, 1>::from_floats([0.25], &device);
        assert_eq!(scalar(one).unwrap(), 0.25);
        let many = Tensor::<TrainBackend, 1>::from_floats([0.25, 0.5], &device);
        assert!(scalar(many).is_err());
    }
}
