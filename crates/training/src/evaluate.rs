//! Held-out evaluation of a trained checkpoint.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use clap::Parser;
use image::{GrayImage, Luma};
use segmentation_models::{Architecture, ConvLstmUNet, ResUNet, SegmentationModel};
use serde::{Deserialize, Serialize};

use crate::config::ExperimentConfig;
use crate::dataset::{SampleLoader, SegmentationDataset};
use crate::loss::SegmentationLoss;
use crate::metrics::{batch_metrics, MetricAccumulator, SegmentationMetrics, THRESHOLD};
use crate::util::{load_checkpoint, scalar, validate_backend_choice, BackendKind, BEST_CHECKPOINT};
use crate::TrainBackend;

pub const TEST_METRICS: &str = "test_metrics.json";

#[derive(Parser, Debug, Default)]
#[command(
    name = "eval",
    about = "Evaluate a trained segmentation checkpoint on the test split"
)]
pub struct EvalArgs {
    /// Experiment TOML (falls back to $SEGMENTATION_CONFIG, then defaults).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Checkpoint to load (defaults to best.bin of the experiment).
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,
    #[arg(long)]
    pub model: Option<Architecture>,
    #[arg(long)]
    pub sequence_length: Option<usize>,
    #[arg(long)]
    pub input_channels: Option<usize>,
    #[arg(long)]
    pub test_image_dir: Option<PathBuf>,
    #[arg(long)]
    pub test_label_dir: Option<PathBuf>,
    #[arg(long)]
    pub results_dir: Option<PathBuf>,
    #[arg(long)]
    pub experiment_name: Option<String>,
    /// Write an image | ground truth | prediction PNG per sample.
    #[arg(long)]
    pub save_visualizations: bool,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,
}

impl EvalArgs {
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
        if let Some(dir) = &self.test_image_dir {
            cfg.data.test_image_dir = dir.clone();
        }
        if let Some(dir) = &self.test_label_dir {
            cfg.data.test_label_dir = dir.clone();
        }
        if let Some(dir) = &self.results_dir {
            cfg.output.results_dir = dir.clone();
        }
        if let Some(name) = &self.experiment_name {
            cfg.output.experiment_name = Some(name.clone());
        }
        if self.save_visualizations {
            cfg.output.save_visualizations = true;
        }
    }
}

/// Contents of `test_metrics.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestMetrics {
    pub experiment: String,
    pub model: String,
    pub loss: String,
    pub sequence_length: usize,
    pub checkpoint: PathBuf,
    pub samples: usize,
    pub test_loss: f32,
    pub metrics: SegmentationMetrics,
}

pub fn run_eval(args: EvalArgs) -> anyhow::Result<TestMetrics> {
    if let Some(kind) = args.backend {
        validate_backend_choice(kind)?;
    }
    let mut cfg = ExperimentConfig::load(args.config.as_deref())?;
    args.apply(&mut cfg);
    let checkpoint = args
        .checkpoint
        .clone()
        .unwrap_or_else(|| cfg.checkpoint_dir().join(BEST_CHECKPOINT));
    evaluate_checkpoint(&cfg, &checkpoint)
}

/// Rebuild the configured model, load `checkpoint`, score the test split and
/// write `test_metrics.json` under the experiment's results directory.
pub fn evaluate_checkpoint(cfg: &ExperimentConfig, checkpoint: &Path) -> anyhow::Result<TestMetrics> {
    cfg.validate()?;
    let loader = SampleLoader::new(
        cfg.data.image_width,
        cfg.data.image_height,
        cfg.model.input_channels,
    )?;
    let dataset = SegmentationDataset::open(
        &cfg.data.test_image_dir,
        &cfg.data.test_label_dir,
        cfg.model.sequence_length,
        loader,
    )?;
    let results_dir = cfg.results_dir();
    fs::create_dir_all(&results_dir)
        .with_context(|| format!("failed to create results dir {}", results_dir.display()))?;
    let vis_dir = cfg.output.save_visualizations.then(|| results_dir.clone());

    let device = <TrainBackend as Backend>::Device::default();
    let model_cfg = cfg.model.for_checkpoint();
    let loss_fn = cfg.loss.init();
    tracing::info!("loading checkpoint {}", checkpoint.display());
    let (test_loss, metrics) = match cfg.model.architecture {
        Architecture::ResNet18Unet | Architecture::ResNet34Unet => {
            let model = ResUNet::<TrainBackend>::new(&model_cfg, &device)?;
            let model = load_checkpoint::<TrainBackend, _>(model, checkpoint, &device)?;
            evaluate(&model, &loss_fn, &dataset, vis_dir.as_deref(), &device)?
        }
        Architecture::ConvLstmUnet => {
            let model = ConvLstmUNet::<TrainBackend>::new(&model_cfg, &device)?;
            let model = load_checkpoint::<TrainBackend, _>(model, checkpoint, &device)?;
            evaluate(&model, &loss_fn, &dataset, vis_dir.as_deref(), &device)?
        }
    };

    let report = TestMetrics {
        experiment: cfg.experiment_name(),
        model: cfg.model.architecture.to_string(),
        loss: cfg.loss.kind.to_string(),
        sequence_length: cfg.model.sequence_length,
        checkpoint: checkpoint.to_path_buf(),
        samples: dataset.len(),
        test_loss,
        metrics,
    };
    let out = results_dir.join(TEST_METRICS);
    fs::write(&out, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("failed to write {}", out.display()))?;
    tracing::info!(
        "test loss {:.4} dice {:.4} iou {:.4} precision {:.4} recall {:.4} accuracy {:.4}",
        report.test_loss,
        metrics.dice,
        metrics.iou,
        metrics.precision,
        metrics.recall,
        metrics.accuracy
    );
    tracing::info!("saved test metrics to {}", out.display());
    Ok(report)
}

/// Batch size 1 pass over `dataset`: mean loss and mean per-sample metrics.
pub fn evaluate<M: SegmentationModel<TrainBackend>>(
    model: &M,
    loss_fn: &SegmentationLoss,
    dataset: &SegmentationDataset,
    vis_dir: Option<&Path>,
    device: &<TrainBackend as Backend>::Device,
) -> anyhow::Result<(f32, SegmentationMetrics)> {
    let mut loss_sum = 0.0f32;
    let mut metrics = MetricAccumulator::default();
    let mut batches = dataset.batches(None);
    let mut idx = 0usize;
    while let Some(batch) = batches.next_batch::<TrainBackend>(1, device)? {
        let logits = model.forward(batch.images.clone())?;
        loss_sum += scalar(loss_fn.forward(logits.clone(), batch.masks.clone()))?;
        metrics.extend(batch_metrics(logits.clone(), batch.masks.clone())?);

        idx += 1;
        if let Some(dir) = vis_dir {
            let path = dir.join(format!("sample_{idx}.png"));
            save_triptych(batch.images, batch.masks, logits, &path)?;
        }
    }
    let mean_loss = if idx == 0 { 0.0 } else { loss_sum / idx as f32 };
    Ok((mean_loss, metrics.mean()))
}

/// Grayscale `image | ground truth | prediction` strip for the first sample
/// of a batch; the image panel shows the last frame averaged over channels.
pub fn save_triptych<B: Backend>(
    images: Tensor<B, 5>,
    masks: Tensor<B, 4>,
    logits: Tensor<B, 4>,
    path: &Path,
) -> anyhow::Result<()> {
    let [_, time, channels, h, w] = images.dims();
    let plane = |x: Tensor<B, 4>, what: &str| -> anyhow::Result<Vec<f32>> {
        x.reshape([h * w])
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("failed to read {what} for {}: {e:?}", path.display()))
    };
    let frame = plane(
        images
            .slice([0..1, time - 1..time, 0..channels, 0..h, 0..w])
            .mean_dim(2)
            .reshape([1, 1, h, w]),
        "image",
    )?;
    let gt = plane(masks.slice([0..1, 0..1, 0..h, 0..w]), "mask")?;
    let pred = plane(sigmoid(logits.slice([0..1, 0..1, 0..h, 0..w])), "prediction")?;

    let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    let strip = GrayImage::from_fn((3 * w) as u32, h as u32, |x, y| {
        let (panel, col) = (x as usize / w, x as usize % w);
        let i = y as usize * w + col;
        Luma([match panel {
            0 => to_u8(frame[i]),
            1 => to_u8(gt[i]),
            _ if pred[i] > THRESHOLD => 255,
            _ => 0,
        }])
    });
    strip
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))
}
