use burn::backend::NdArray;
use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::{Distribution, Tensor};
use segmentation_models::prelude::*;
use segmentation_models::{BackboneDepth, ResNetBackbone};

type B = NdArray<f32>;

fn saved_backbone(dir: &std::path::Path) -> (ResNetBackbone<B>, std::path::PathBuf) {
    let device = Default::default();
    let backbone = ResNetBackbone::<B>::new(BackboneDepth::ResNet18, 3, &device);
    let path = dir.join("resnet18_backbone.bin");
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    backbone
        .clone()
        .save_file(path.clone(), &recorder)
        .expect("save backbone record");
    (backbone, path)
}

#[test]
fn pretrained_encoder_reproduces_saved_backbone() {
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();
    let (reference, path) = saved_backbone(dir.path());

    let cfg = SegmentationConfig::new(Architecture::ResNet18Unet, 3).with_pretrained(&path);
    let model = ResUNet::<B>::new(&cfg, &device).unwrap();

    let input = Tensor::<B, 4>::random([1, 3, 64, 64], Distribution::Uniform(0.0, 1.0), &device);
    let expected = reference.forward(input.clone());
    let actual = model.encoder_decoder().backbone().forward(input);
    assert_eq!(expected.len(), actual.len());
    for (e, a) in expected.into_iter().zip(actual) {
        e.into_data().assert_eq(&a.into_data(), true);
    }
}

#[test]
fn pretrained_with_single_channel_input_is_rejected() {
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();
    let (_, path) = saved_backbone(dir.path());

    let cfg = SegmentationConfig::new(Architecture::ResNet18Unet, 1).with_pretrained(&path);
    assert!(matches!(
        ResUNet::<B>::new(&cfg, &device),
        Err(ModelError::Configuration(_))
    ));
}
