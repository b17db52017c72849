//! Training, validation and evaluation drivers for `segmentation_models`.

#![recursion_limit = "256"]

pub mod config;
pub mod dataset;
pub mod evaluate;
pub mod loss;
pub mod metrics;
pub mod util;

pub use config::{ConfigError, ExperimentConfig, OptimizerKind, CONFIG_ENV};
pub use dataset::{
    index_samples, DatasetError, DatasetResult, SampleLoader, SegmentationBatch,
    SegmentationDataset, SequenceSample,
};
pub use evaluate::{evaluate_checkpoint, run_eval, EvalArgs, TestMetrics};
pub use loss::{
    DiceFocalLoss, DiceLoss, FocalTverskyLoss, LossConfig, LossKind, SegmentationLoss, SoftIouLoss,
};
pub use metrics::{ConfusionCounts, MetricAccumulator, MetricsError, SegmentationMetrics};
pub use util::{run_train, train, EpochRecord, TrainArgs, TrainReport};

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
