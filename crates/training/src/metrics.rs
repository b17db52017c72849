//! Thresholded overlap metrics computed on the host.

use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Probability above which a pixel counts as foreground.
pub const THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfusionCounts {
    pub tp: u64,
    pub fp: u64,
    pub fn_: u64,
    pub tn: u64,
}

impl ConfusionCounts {
    pub fn from_probs(probs: &[f32], targets: &[f32]) -> Self {
        let mut counts = Self::default();
        for (&p, &t) in probs.iter().zip(targets) {
            match (p > THRESHOLD, t > THRESHOLD) {
                (true, true) => counts.tp += 1,
                (true, false) => counts.fp += 1,
                (false, true) => counts.fn_ += 1,
                (false, false) => counts.tn += 1,
            }
        }
        counts
    }

    /// 1.0 when both masks are empty.
    pub fn dice(&self) -> f32 {
        let denom = 2 * self.tp + self.fp + self.fn_;
        if denom == 0 {
            1.0
        } else {
            (2 * self.tp) as f32 / denom as f32
        }
    }

    /// 1.0 when both masks are empty.
    pub fn iou(&self) -> f32 {
        let denom = self.tp + self.fp + self.fn_;
        if denom == 0 {
            1.0
        } else {
            self.tp as f32 / denom as f32
        }
    }

    pub fn precision(&self) -> f32 {
        ratio(self.tp, self.tp + self.fp)
    }

    pub fn recall(&self) -> f32 {
        ratio(self.tp, self.tp + self.fn_)
    }

    pub fn accuracy(&self) -> f32 {
        ratio(self.tp + self.tn, self.tp + self.fp + self.fn_ + self.tn)
    }
}

fn ratio(num: u64, denom: u64) -> f32 {
    if denom == 0 {
        0.0
    } else {
        num as f32 / denom as f32
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentationMetrics {
    pub dice: f32,
    pub iou: f32,
    pub precision: f32,
    pub recall: f32,
    pub accuracy: f32,
}

impl From<ConfusionCounts> for SegmentationMetrics {
    fn from(c: ConfusionCounts) -> Self {
        Self {
            dice: c.dice(),
            iou: c.iou(),
            precision: c.precision(),
            recall: c.recall(),
            accuracy: c.accuracy(),
        }
    }
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("logits {logits:?} and targets {targets:?} differ in shape")]
    ShapeMismatch {
        logits: [usize; 4],
        targets: [usize; 4],
    },
    #[error("failed to read {what} back from the device: {reason}")]
    Data { what: &'static str, reason: String },
}

fn host_values<B: Backend>(x: Tensor<B, 4>, what: &'static str) -> Result<Vec<f32>, MetricsError> {
    x.into_data().to_vec::<f32>().map_err(|e| MetricsError::Data {
        what,
        reason: format!("{e:?}"),
    })
}

/// One entry per sample of a `[B, K, H, W]` logit batch.
pub fn batch_metrics<B: Backend>(
    logits: Tensor<B, 4>,
    targets: Tensor<B, 4>,
) -> Result<Vec<SegmentationMetrics>, MetricsError> {
    let (dims, target_dims) = (logits.dims(), targets.dims());
    if dims != target_dims {
        return Err(MetricsError::ShapeMismatch {
            logits: dims,
            targets: target_dims,
        });
    }
    let batch = dims[0];
    if batch == 0 {
        return Ok(Vec::new());
    }
    let probs = host_values(sigmoid(logits), "probabilities")?;
    let targets = host_values(targets, "targets")?;
    let per_sample = probs.len() / batch;
    Ok(probs
        .chunks(per_sample)
        .zip(targets.chunks(per_sample))
        .map(|(p, t)| ConfusionCounts::from_probs(p, t).into())
        .collect())
}

/// Running mean of per-sample metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    sum: SegmentationMetrics,
    samples: usize,
}

impl MetricAccumulator {
    pub fn push(&mut self, m: SegmentationMetrics) {
        self.sum.dice += m.dice;
        self.sum.iou += m.iou;
        self.sum.precision += m.precision;
        self.sum.recall += m.recall;
        self.sum.accuracy += m.accuracy;
        self.samples += 1;
    }

    pub fn extend(&mut self, batch: impl IntoIterator<Item = SegmentationMetrics>) {
        for m in batch {
            self.push(m);
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn mean(&self) -> SegmentationMetrics {
        if self.samples == 0 {
            return SegmentationMetrics::default();
        }
        let n = self.samples as f32;
        SegmentationMetrics {
            dice: self.sum.dice / n,
            iou: self.sum.iou / n,
            precision: self.sum.precision / n,
            recall: self.sum.recall / n,
            accuracy: self.sum.accuracy / n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type B = NdArray<f32>;

    #[test]
    fn counts_and_ratios() {
        let probs = [0.9, 0.8, 0.2, 0.1, 0.7, 0.3];
        let targets = [1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
        let c = ConfusionCounts::from_probs(&probs, &targets);
        assert_eq!(
            c,
            ConfusionCounts {
                tp: 2,
                fp: 1,
                fn_: 1,
                tn: 2
            }
        );
        assert!((c.dice() - 4.0 / 6.0).abs() < 1e-6);
        assert!((c.iou() - 0.5).abs() < 1e-6);
        assert!((c.precision() - 2.0 / 3.0).abs() < 1e-6);
        assert!((c.accuracy() - 4.0 / 6.0).abs() < 1e-6);
    }

    #[test]
    fn empty_masks() {
        let c = ConfusionCounts::from_probs(&[0.1, 0.2], &[0.0, 0.0]);
        assert_eq!(c.dice(), 1.0);
        assert_eq!(c.iou(), 1.0);
        assert_eq!(c.precision(), 0.0);
        assert_eq!(c.recall(), 0.0);
        assert_eq!(c.accuracy(), 1.0);
    }

    #[test]
    fn batch_metrics_split_per_sample() {
        let device = Default::default();
        let logits = Tensor::<B, 4>::from_data(
            TensorData::new(vec![5.0, 5.0, -5.0, -5.0], [2, 1, 1, 2]),
            &device,
        );
        let targets = Tensor::<B, 4>::from_data(
            TensorData::new(vec![1.0, 1.0, 1.0, 0.0], [2, 1, 1, 2]),
            &device,
        );
        let per_sample = batch_metrics(logits, targets).unwrap();
        assert_eq!(per_sample.len(), 2);
        assert_eq!(per_sample[0].dice, 1.0);
        assert_eq!(per_sample[1].dice, 0.0);

        let mut acc = MetricAccumulator::default();
        acc.extend(per_sample);
        assert_eq!(acc.samples(), 2);
        assert!((acc.mean().dice - 0.5).abs() < 1e-6);
    }

    #[test]
    fn batch_metrics_rejects_class_mismatch() {
        let device = Default::default();
        let logits = Tensor::<B, 4>::zeros([1, 2, 2, 2], &device);
        let targets = Tensor::<B, 4>::zeros([1, 1, 2, 2], &device);
        assert!(matches!(
            batch_metrics(logits, targets),
            Err(MetricsError::ShapeMismatch {
                logits: [1, 2, 2, 2],
                targets: [1, 1, 2, 2]
            })
        ));
    }
}
