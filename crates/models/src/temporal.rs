//! ConvLSTM reduction of a fixed-length frame sequence to a single
//! feature map (many-to-one).

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::{sigmoid, tanh};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::error::{ModelError, ModelResult};

/// Hidden and cell state, both shaped like the feature maps they summarize.
#[derive(Debug, Clone)]
pub struct LstmState<B: Backend> {
    pub hidden: Tensor<B, 4>,
    pub cell: Tensor<B, 4>,
}

impl<B: Backend> LstmState<B> {
    pub fn zeros(shape: [usize; 4], device: &B::Device) -> Self {
        Self {
            hidden: Tensor::zeros(shape, device),
            cell: Tensor::zeros(shape, device),
        }
    }
}

#[derive(Module, Debug)]
pub struct ConvLstmCell<B: Backend> {
    /// Produces the input, forget, output and candidate gates in that order.
    gates: Conv2d<B>,
    input_channels: usize,
    hidden_channels: usize,
}

impl<B: Backend> ConvLstmCell<B> {
    pub fn new(
        input_channels: usize,
        hidden_channels: usize,
        kernel_size: usize,
        device: &B::Device,
    ) -> Self {
        let padding = kernel_size / 2;
        Self {
            gates: Conv2dConfig::new(
                [input_channels + hidden_channels, 4 * hidden_channels],
                [kernel_size, kernel_size],
            )
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .init(device),
            input_channels,
            hidden_channels,
        }
    }

    pub fn hidden_channels(&self) -> usize {
        self.hidden_channels
    }

    pub fn forward(&self, x: Tensor<B, 4>, state: LstmState<B>) -> ModelResult<LstmState<B>> {
        let [_, channels, _, _] = x.dims();
        if channels != self.input_channels {
            return Err(ModelError::shape(
                "conv-lstm cell",
                format!("input has {channels} channels, cell expects {}", self.input_channels),
            ));
        }
        let hd = self.hidden_channels;
        let gates = self.gates.forward(Tensor::cat(vec![x, state.hidden], 1));
        let input = sigmoid(gates.clone().narrow(1, 0, hd));
        let forget = sigmoid(gates.clone().narrow(1, hd, hd));
        let output = sigmoid(gates.clone().narrow(1, 2 * hd, hd));
        let candidate = tanh(gates.narrow(1, 3 * hd, hd));

        let cell = forget * state.cell + input * candidate;
        let hidden = output * tanh(cell.clone());
        Ok(LstmState { hidden, cell })
    }
}

/// Stacked ConvLSTM layers run over exactly `sequence_length` frames.
///
/// Only the final hidden state of the last layer is returned. A sequence of
/// one frame is passed through untouched.
#[derive(Module, Debug)]
pub struct TemporalAggregator<B: Backend> {
    layers: Vec<ConvLstmCell<B>>,
    sequence_length: usize,
}

impl<B: Backend> TemporalAggregator<B> {
    pub fn new(
        channels: usize,
        layers: usize,
        kernel_size: usize,
        sequence_length: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            layers: (0..layers)
                .map(|_| ConvLstmCell::new(channels, channels, kernel_size, device))
                .collect(),
            sequence_length,
        }
    }

    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    pub fn forward(&self, frames: Vec<Tensor<B, 4>>) -> ModelResult<Tensor<B, 4>> {
        if frames.len() != self.sequence_length {
            return Err(ModelError::shape(
                "temporal aggregator",
                format!(
                    "received {} frames, configured for {}",
                    frames.len(),
                    self.sequence_length
                ),
            ));
        }
        if self.sequence_length == 1 {
            return frames
                .into_iter()
                .next()
                .ok_or_else(|| ModelError::shape("temporal aggregator", "empty sequence"));
        }

        let mut sequence = frames;
        for layer in &self.layers {
            let [batch, _, h, w] = sequence[0].dims();
            let device = sequence[0].device();
            let mut state = LstmState::zeros([batch, layer.hidden_channels(), h, w], &device);
            let mut outputs = Vec::with_capacity(sequence.len());
            for frame in sequence {
                state = layer.forward(frame, state)?;
                outputs.push(state.hidden.clone());
            }
            sequence = outputs;
        }
        sequence
            .pop()
            .ok_or_else(|| ModelError::shape("temporal aggregator", "empty sequence"))
    }
}
