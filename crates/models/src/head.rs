use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::decoder::upsample_to;

/// 1×1 projection to class logits followed by a 2× bilinear upsample
/// reconciled to the input resolution. No activation is applied.
#[derive(Module, Debug)]
pub struct OutputHead<B: Backend> {
    conv: Conv2d<B>,
}

impl<B: Backend> OutputHead<B> {
    pub fn new(in_channels: usize, num_classes: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, num_classes], [1, 1]).init(device),
        }
    }

    pub fn forward(&self, features: Tensor<B, 4>, output_size: [usize; 2]) -> Tensor<B, 4> {
        let logits = self.conv.forward(features);
        let [_, _, h, w] = logits.dims();
        if [h, w] == output_size {
            return logits;
        }
        upsample_to(logits, output_size)
    }
}
