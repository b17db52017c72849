use burn::backend::NdArray;
use burn::tensor::Tensor;
use segmentation_models::prelude::*;
use segmentation_models::TOTAL_STRIDE;

type B = NdArray<f32>;

fn build(arch: Architecture, channels: usize) -> Box<dyn SegmentationModel<B>> {
    let device = Default::default();
    let cfg = SegmentationConfig::new(arch, channels);
    match arch {
        Architecture::ResNet18Unet | Architecture::ResNet34Unet => {
            Box::new(ResUNet::<B>::new(&cfg, &device).expect("build single-frame model"))
        }
        Architecture::ConvLstmUnet => {
            Box::new(ConvLstmUNet::<B>::new(&cfg, &device).expect("build sequence model"))
        }
    }
}

#[test]
fn logits_match_input_resolution_for_every_variant() {
    let device = Default::default();
    let sizes = [(64, 64), (96, 64), (64, 128)];
    for arch in Architecture::ALL {
        let model = build(arch, 1);
        for (h, w) in sizes {
            assert_eq!(h % TOTAL_STRIDE, 0);
            assert_eq!(w % TOTAL_STRIDE, 0);
            let frames = Tensor::<B, 5>::zeros([1, model.sequence_length(), 1, h, w], &device);
            let logits = model.forward(frames).unwrap();
            assert_eq!(logits.dims(), [1, 1, h, w], "{arch} at {h}x{w}");
        }
    }
}

#[test]
fn multi_class_rgb_output() {
    let device = Default::default();
    let cfg = SegmentationConfig::new(Architecture::ResNet18Unet, 3).with_num_classes(5);
    let model = ResUNet::<B>::new(&cfg, &device).unwrap();
    let logits = model
        .forward_image(Tensor::ones([2, 3, 64, 96], &device))
        .unwrap();
    assert_eq!(logits.dims(), [2, 5, 64, 96]);
}

#[test]
fn odd_resolution_is_reconciled_to_input_size() {
    let device = Default::default();
    let model = ResUNet::<B>::new(&SegmentationConfig::default(), &device).unwrap();
    let logits = model
        .forward_image(Tensor::zeros([1, 1, 75, 50], &device))
        .unwrap();
    assert_eq!(logits.dims(), [1, 1, 75, 50]);
}

#[test]
fn wrong_channel_count_is_a_shape_error() {
    let device = Default::default();
    let model = ResUNet::<B>::new(&SegmentationConfig::default(), &device).unwrap();
    let err = model
        .forward(Tensor::zeros([1, 1, 3, 64, 64], &device))
        .unwrap_err();
    assert!(matches!(err, ModelError::ShapeMismatch { .. }));
}

#[test]
fn wrong_sequence_length_is_a_shape_error() {
    let device = Default::default();
    let cfg = SegmentationConfig::new(Architecture::ConvLstmUnet, 1).with_sequence_length(3);
    let model = ConvLstmUNet::<B>::new(&cfg, &device).unwrap();
    let err = model
        .forward(Tensor::zeros([1, 2, 1, 64, 64], &device))
        .unwrap_err();
    assert!(matches!(err, ModelError::ShapeMismatch { .. }));
}

#[test]
fn forward_is_deterministic() {
    let device = Default::default();
    let model = ResUNet::<B>::new(&SegmentationConfig::default(), &device).unwrap();
    let input = Tensor::<B, 4>::random(
        [1, 1, 64, 64],
        burn::tensor::Distribution::Uniform(0.0, 1.0),
        &device,
    );
    let a = model.forward_image(input.clone()).unwrap();
    let b = model.forward_image(input).unwrap();
    a.into_data().assert_eq(&b.into_data(), true);
}

#[test]
fn variants_are_not_interchangeable_at_construction() {
    let device = Default::default();
    let seq = SegmentationConfig::new(Architecture::ConvLstmUnet, 1);
    assert!(matches!(
        ResUNet::<B>::new(&seq, &device),
        Err(ModelError::Configuration(_))
    ));
    let single = SegmentationConfig::new(Architecture::ResNet18Unet, 1);
    assert!(matches!(
        ConvLstmUNet::<B>::new(&single, &device),
        Err(ModelError::Configuration(_))
    ));
}
