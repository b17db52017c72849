//! Segmentation losses. Every loss takes raw logits and applies the sigmoid
//! itself, so models never bake in an activation.

use std::fmt;
use std::str::FromStr;

use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Per-(sample, class) spatial sum of a `[B, K, H, W]` tensor, flattened to
/// `[B * K]`.
fn spatial_sum<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 1> {
    let [batch, classes, _, _] = x.dims();
    x.sum_dim(3).sum_dim(2).reshape([batch * classes])
}

/// Dice region term plus focal pixel term.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiceFocalLoss {
    pub dice_weight: f32,
    pub focal_weight: f32,
    pub gamma: f32,
    pub smooth: f32,
}

impl Default for DiceFocalLoss {
    fn default() -> Self {
        Self {
            dice_weight: 0.5,
            focal_weight: 0.5,
            gamma: 2.0,
            smooth: 1e-5,
        }
    }
}

impl DiceFocalLoss {
    /// `1 - mean(dice)` where dice is taken per sample and class, so large
    /// masks do not dominate small ones.
    pub fn region_term<B: Backend>(&self, probs: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
        dice_region(probs, targets, self.smooth)
    }

    /// Mean over every element of `-(1 - p_t)^gamma * ln(p_t + smooth)`.
    /// Each element is floored at zero: `p_t = 1` would otherwise give
    /// `-ln(1 + smooth) < 0` when `gamma = 0`.
    pub fn pixel_term<B: Backend>(&self, probs: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
        let p_t = targets.clone() * probs.clone()
            + targets.neg().add_scalar(1.0) * probs.neg().add_scalar(1.0);
        let weight = p_t.clone().neg().add_scalar(1.0).powf_scalar(self.gamma);
        (weight * p_t.add_scalar(self.smooth).log())
            .neg()
            .clamp_min(0.0)
            .mean()
    }

    pub fn forward<B: Backend>(&self, logits: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
        let probs = sigmoid(logits);
        let region = self.region_term(probs.clone(), targets.clone());
        let pixel = self.pixel_term(probs, targets);
        region.mul_scalar(self.dice_weight) + pixel.mul_scalar(self.focal_weight)
    }
}

fn dice_region<B: Backend>(probs: Tensor<B, 4>, targets: Tensor<B, 4>, smooth: f32) -> Tensor<B, 1> {
    let intersection = spatial_sum(probs.clone() * targets.clone());
    let union = spatial_sum(probs) + spatial_sum(targets);
    let dice = intersection
        .mul_scalar(2.0)
        .add_scalar(smooth)
        .div(union.add_scalar(smooth));
    dice.mean().neg().add_scalar(1.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiceLoss {
    pub smooth: f32,
}

impl DiceLoss {
    pub fn forward<B: Backend>(&self, logits: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
        dice_region(sigmoid(logits), targets, self.smooth)
    }
}

/// Jaccard loss on soft predictions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftIouLoss {
    pub smooth: f32,
}

impl SoftIouLoss {
    pub fn forward<B: Backend>(&self, logits: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
        let probs = sigmoid(logits);
        let intersection = spatial_sum(probs.clone() * targets.clone());
        let union = spatial_sum(probs) + spatial_sum(targets);
        let iou = intersection
            .clone()
            .add_scalar(self.smooth)
            .div((union - intersection).add_scalar(self.smooth));
        iou.mean().neg().add_scalar(1.0)
    }
}

/// Tversky index with an exponent that sharpens the loss on hard samples.
/// `alpha` weighs false positives, `beta` false negatives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocalTverskyLoss {
    pub alpha: f32,
    pub beta: f32,
    pub gamma: f32,
    pub smooth: f32,
}

impl FocalTverskyLoss {
    pub fn forward<B: Backend>(&self, logits: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
        let probs = sigmoid(logits);
        let tp = spatial_sum(probs.clone() * targets.clone());
        let fp = spatial_sum(probs.clone() * targets.clone().neg().add_scalar(1.0));
        let fn_ = spatial_sum(probs.neg().add_scalar(1.0) * targets);
        let denom = tp.clone() + fp.mul_scalar(self.alpha) + fn_.mul_scalar(self.beta);
        let tversky = tp.add_scalar(self.smooth).div(denom.add_scalar(self.smooth));
        tversky
            .neg()
            .add_scalar(1.0)
            .clamp_min(0.0)
            .powf_scalar(self.gamma)
            .mean()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    #[serde(rename = "dice-focal")]
    DiceFocal,
    #[serde(rename = "dice")]
    Dice,
    #[serde(rename = "soft-iou")]
    SoftIou,
    #[serde(rename = "focal-tversky")]
    FocalTversky,
}

impl LossKind {
    pub const ALL: [LossKind; 4] = [
        LossKind::DiceFocal,
        LossKind::Dice,
        LossKind::SoftIou,
        LossKind::FocalTversky,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::DiceFocal => "dice-focal",
            Self::Dice => "dice",
            Self::SoftIou => "soft-iou",
            Self::FocalTversky => "focal-tversky",
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LossKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| format!("unknown loss `{s}`"))
    }
}

/// The `[loss]` section of an experiment file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub kind: LossKind,
    pub dice_weight: f32,
    pub focal_weight: f32,
    /// Focal exponent of the dice-focal pixel term.
    pub gamma: f32,
    pub smooth: f32,
    pub tversky_alpha: f32,
    pub tversky_beta: f32,
    pub tversky_gamma: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        let dice_focal = DiceFocalLoss::default();
        Self {
            kind: LossKind::DiceFocal,
            dice_weight: dice_focal.dice_weight,
            focal_weight: dice_focal.focal_weight,
            gamma: dice_focal.gamma,
            smooth: dice_focal.smooth,
            tversky_alpha: 0.3,
            tversky_beta: 0.7,
            tversky_gamma: 0.75,
        }
    }
}

impl LossConfig {
    pub fn init(&self) -> SegmentationLoss {
        match self.kind {
            LossKind::DiceFocal => SegmentationLoss::DiceFocal(DiceFocalLoss {
                dice_weight: self.dice_weight,
                focal_weight: self.focal_weight,
                gamma: self.gamma,
                smooth: self.smooth,
            }),
            LossKind::Dice => SegmentationLoss::Dice(DiceLoss { smooth: self.smooth }),
            LossKind::SoftIou => SegmentationLoss::SoftIou(SoftIouLoss { smooth: self.smooth }),
            LossKind::FocalTversky => SegmentationLoss::FocalTversky(FocalTverskyLoss {
                alpha: self.tversky_alpha,
                beta: self.tversky_beta,
                gamma: self.tversky_gamma,
                smooth: self.smooth,
            }),
        }
    }
}

/// Loss selected once from [`LossKind`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SegmentationLoss {
    DiceFocal(DiceFocalLoss),
    Dice(DiceLoss),
    SoftIou(SoftIouLoss),
    FocalTversky(FocalTverskyLoss),
}

impl SegmentationLoss {
    pub fn forward<B: Backend>(&self, logits: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
        match self {
            Self::DiceFocal(loss) => loss.forward(logits, targets),
            Self::Dice(loss) => loss.forward(logits, targets),
            Self::SoftIou(loss) => loss.forward(logits, targets),
            Self::FocalTversky(loss) => loss.forward(logits, targets),
        }
    }
}
