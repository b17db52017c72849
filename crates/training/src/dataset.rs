//! Frame/label pairing, sequence windows and batch loading.
//!
//! Images and labels live in two flat directories and are paired by a frame
//! ID embedded in the file name (`scan_12_0345.jpg` pairs with
//! `mask_12_0345.png`). Sequence samples are sliding windows over the sorted
//! image list; a window is usable only when every frame has a label.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use burn::tensor::{backend::Backend, Tensor, TensorData};
use image::imageops::FilterType;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use regex::Regex;
use thiserror::Error;

pub const FRAME_ID_PATTERN: &str = r"_(\d+_\d+)";
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("no `<series>_<index>` frame id in file name {path}")]
    FrameId { path: PathBuf },
    #[error("no usable samples under {dir}")]
    Empty { dir: PathBuf },
    #[error("{0}")]
    InvalidConfig(String),
}

/// Extracts the `<series>_<index>` frame ID from file names.
#[derive(Debug, Clone)]
pub struct FrameIdMatcher {
    pattern: Regex,
}

impl FrameIdMatcher {
    pub fn new() -> DatasetResult<Self> {
        let pattern = Regex::new(FRAME_ID_PATTERN)
            .map_err(|e| DatasetError::InvalidConfig(format!("frame id pattern: {e}")))?;
        Ok(Self { pattern })
    }

    pub fn frame_id(&self, path: &Path) -> DatasetResult<String> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| DatasetError::FrameId {
                path: path.to_path_buf(),
            })?;
        self.pattern
            .captures(name)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| DatasetError::FrameId {
                path: path.to_path_buf(),
            })
    }
}

/// `T` consecutive frames and the label of the last one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceSample {
    pub frames: Vec<PathBuf>,
    pub label: PathBuf,
}

fn list_images(dir: &Path) -> DatasetResult<Vec<PathBuf>> {
    let io = |source| DatasetError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io)? {
        let path = entry.map_err(io)?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if path.is_file() && is_image {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Pair every image window of `sequence_length` frames with its label.
pub fn index_samples(
    image_dir: &Path,
    label_dir: &Path,
    sequence_length: usize,
) -> DatasetResult<Vec<SequenceSample>> {
    if sequence_length == 0 {
        return Err(DatasetError::InvalidConfig(
            "sequence_length must be at least 1".into(),
        ));
    }
    let matcher = FrameIdMatcher::new()?;
    let images = list_images(image_dir)?;

    let mut labels = HashMap::new();
    for path in list_images(label_dir)? {
        labels.insert(matcher.frame_id(&path)?, path);
    }

    let mut frame_labels = Vec::with_capacity(images.len());
    for image in &images {
        let id = matcher.frame_id(image)?;
        frame_labels.push(labels.get(&id).cloned());
    }

    let mut samples = Vec::new();
    let mut skipped = 0usize;
    if images.len() >= sequence_length {
        for start in 0..=images.len() - sequence_length {
            let window = start..start + sequence_length;
            if frame_labels[window.clone()].iter().any(Option::is_none) {
                skipped += 1;
                continue;
            }
            let Some(label) = frame_labels[window.end - 1].clone() else {
                skipped += 1;
                continue;
            };
            samples.push(SequenceSample {
                frames: images[window].to_vec(),
                label,
            });
        }
    }
    if skipped > 0 {
        tracing::warn!(
            "skipped {skipped} windows under {} with unlabeled frames",
            image_dir.display()
        );
    }
    if samples.is_empty() {
        return Err(DatasetError::Empty {
            dir: image_dir.to_path_buf(),
        });
    }
    tracing::info!(
        "indexed {} samples (sequence length {sequence_length}) from {}",
        samples.len(),
        image_dir.display()
    );
    Ok(samples)
}

/// Decodes and resizes files into normalized CHW buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleLoader {
    pub width: u32,
    pub height: u32,
    /// 1 for grayscale, 3 for RGB.
    pub channels: usize,
}

/// Host-side sample: `frames` is `[T, C, H, W]`, `mask` is `[H, W]`.
#[derive(Debug, Clone)]
pub struct LoadedSample {
    pub frames: Vec<f32>,
    pub mask: Vec<f32>,
}

impl SampleLoader {
    pub fn new(width: u32, height: u32, channels: usize) -> DatasetResult<Self> {
        if width == 0 || height == 0 {
            return Err(DatasetError::InvalidConfig(format!(
                "image size {width}x{height} must be non-zero"
            )));
        }
        if channels != 1 && channels != 3 {
            return Err(DatasetError::InvalidConfig(format!(
                "frames must have 1 or 3 channels, got {channels}"
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
        })
    }

    fn open(path: &Path) -> DatasetResult<image::DynamicImage> {
        image::open(path).map_err(|source| DatasetError::Image {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Bilinear resize, channel conversion, CHW layout scaled to `[0, 1]`.
    pub fn load_frame(&self, path: &Path) -> DatasetResult<Vec<f32>> {
        let img = Self::open(path)?.resize_exact(self.width, self.height, FilterType::Triangle);
        let pixels = (self.width * self.height) as usize;
        if self.channels == 1 {
            return Ok(img
                .to_luma8()
                .as_raw()
                .iter()
                .map(|&v| v as f32 / 255.0)
                .collect());
        }
        let rgb = img.to_rgb8();
        let raw = rgb.as_raw();
        let mut chw = vec![0.0f32; 3 * pixels];
        for (i, px) in raw.chunks_exact(3).enumerate() {
            for c in 0..3 {
                chw[c * pixels + i] = px[c] as f32 / 255.0;
            }
        }
        Ok(chw)
    }

    /// Nearest-neighbour resize, binarized at 0.5.
    pub fn load_mask(&self, path: &Path) -> DatasetResult<Vec<f32>> {
        let img = Self::open(path)?.resize_exact(self.width, self.height, FilterType::Nearest);
        Ok(img
            .to_luma8()
            .as_raw()
            .iter()
            .map(|&v| if v as f32 / 255.0 > 0.5 { 1.0 } else { 0.0 })
            .collect())
    }

    pub fn load(&self, sample: &SequenceSample) -> DatasetResult<LoadedSample> {
        let mut frames = Vec::new();
        for frame in &sample.frames {
            frames.extend(self.load_frame(frame)?);
        }
        Ok(LoadedSample {
            frames,
            mask: self.load_mask(&sample.label)?,
        })
    }
}

/// `images` is `[B, T, C, H, W]`; `masks` is `[B, 1, H, W]`.
#[derive(Debug, Clone)]
pub struct SegmentationBatch<B: Backend> {
    pub images: Tensor<B, 5>,
    pub masks: Tensor<B, 4>,
}

#[derive(Debug, Clone)]
pub struct SegmentationDataset {
    samples: Vec<SequenceSample>,
    loader: SampleLoader,
}

impl SegmentationDataset {
    pub fn new(samples: Vec<SequenceSample>, loader: SampleLoader) -> Self {
        Self { samples, loader }
    }

    pub fn open(
        image_dir: &Path,
        label_dir: &Path,
        sequence_length: usize,
        loader: SampleLoader,
    ) -> DatasetResult<Self> {
        Ok(Self::new(
            index_samples(image_dir, label_dir, sequence_length)?,
            loader,
        ))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[SequenceSample] {
        &self.samples
    }

    /// Seeded random split into `(train, val)`; the validation share is
    /// `floor(len * val_split)`.
    pub fn split(self, val_split: f32, seed: u64) -> (Self, Self) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut samples = self.samples;
        samples.shuffle(&mut rng);
        let val_len = (samples.len() as f32 * val_split) as usize;
        let val = samples.split_off(samples.len() - val_len);
        (
            Self::new(samples, self.loader),
            Self::new(val, self.loader),
        )
    }

    /// Iterate in index order, or shuffled with `rng`.
    pub fn batches(&self, rng: Option<&mut StdRng>) -> BatchIter<'_> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if let Some(rng) = rng {
            order.shuffle(rng);
        }
        BatchIter {
            dataset: self,
            order,
            cursor: 0,
        }
    }
}

pub struct BatchIter<'a> {
    dataset: &'a SegmentationDataset,
    order: Vec<usize>,
    cursor: usize,
}

impl BatchIter<'_> {
    pub fn remaining(&self) -> usize {
        self.order.len() - self.cursor
    }

    /// Load the next `batch_size` samples in parallel. The final batch may be
    /// short; `None` once exhausted.
    pub fn next_batch<B: Backend>(
        &mut self,
        batch_size: usize,
        device: &B::Device,
    ) -> DatasetResult<Option<SegmentationBatch<B>>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + batch_size.max(1)).min(self.order.len());
        let slice = &self.order[self.cursor..end];
        self.cursor = end;

        let loader = self.dataset.loader;
        let samples = &self.dataset.samples;
        let loaded = slice
            .par_iter()
            .map(|&i| loader.load(&samples[i]))
            .collect::<DatasetResult<Vec<_>>>()?;

        let batch = loaded.len();
        let time = samples[slice[0]].frames.len();
        let (h, w) = (loader.height as usize, loader.width as usize);
        let mut images = Vec::with_capacity(batch * time * loader.channels * h * w);
        let mut masks = Vec::with_capacity(batch * h * w);
        for sample in loaded {
            images.extend(sample.frames);
            masks.extend(sample.mask);
        }
        tracing::debug!("loaded batch of {batch} samples");

        Ok(Some(SegmentationBatch {
            images: Tensor::from_data(
                TensorData::new(images, [batch, time, loader.channels, h, w]),
                device,
            ),
            masks: Tensor::from_data(TensorData::new(masks, [batch, 1, h, w]), device),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_id_from_name() {
        let m = FrameIdMatcher::new().unwrap();
        assert_eq!(m.frame_id(Path::new("dir/scan_12_0345.jpg")).unwrap(), "12_0345");
        assert_eq!(m.frame_id(Path::new("mask_a_12_0345_v2.png")).unwrap(), "12_0345");
        assert!(matches!(
            m.frame_id(Path::new("scan12.jpg")),
            Err(DatasetError::FrameId { .. })
        ));
    }

    #[test]
    fn loader_rejects_unsupported_channels() {
        assert!(SampleLoader::new(32, 32, 2).is_err());
        assert!(SampleLoader::new(0, 32, 1).is_err());
        assert!(SampleLoader::new(32, 32, 3).is_ok());
    }

    #[test]
    fn split_is_seeded_and_disjoint() {
        let samples: Vec<_> = (0..10)
            .map(|i| SequenceSample {
                frames: vec![PathBuf::from(format!("f_{i}_0.png"))],
                label: PathBuf::from(format!("l_{i}_0.png")),
            })
            .collect();
        let loader = SampleLoader::new(32, 32, 1).unwrap();
        let ds = SegmentationDataset::new(samples.clone(), loader);
        let (train, val) = ds.clone().split(0.2, 7);
        assert_eq!((train.len(), val.len()), (8, 2));
        assert!(val.samples().iter().all(|s| !train.samples().contains(s)));

        let (train_again, _) = ds.split(0.2, 7);
        assert_eq!(train.samples(), train_again.samples());
    }
}
