use burn::prelude::*;

#[cfg(feature = "training")]
use crate::{
    dataset::SegmentationBatch,
    training::{SegmentationLoss, SegmentationLossConfig, SegmentationOutput},
};
#[cfg(feature = "training")]
use burn::{
    tensor::backend::AutodiffBackend,
    train::{TrainOutput, TrainStep, ValidStep},
};

use super::{
    BackboneKind, DoubleUNet, DoubleUNetConfig, ModelError, UNet, UNetConfig, XNet, XNetConfig,
};

/// Any of the segmentation architectures.
#[derive(Module, Debug)]
pub enum SegmentationNet<B: Backend> {
    UNet(UNet<B>),
    DoubleUNet(DoubleUNet<B>),
    XNet(XNet<B>),
}

impl<B: Backend> SegmentationNet<B> {
    pub fn num_classes(&self) -> usize {
        match self {
            SegmentationNet::UNet(model) => model.num_classes(),
            SegmentationNet::DoubleUNet(model) => model.num_classes(),
            SegmentationNet::XNet(model) => model.num_classes(),
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            SegmentationNet::UNet(model) => model.forward(images),
            SegmentationNet::DoubleUNet(model) => model.forward(images),
            SegmentationNet::XNet(model) => model.forward(images),
        }
    }

    /// Every prediction head, each `[batch, classes, height, width]`.
    ///
    /// The Double U-Net yields its two outputs; the last head is the one
    /// used for evaluation.
    pub fn forward_heads(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        match self {
            SegmentationNet::DoubleUNet(model) => {
                let (output_1, output_2) = model.forward_outputs(images);
                vec![output_1, output_2]
            }
            other => vec![other.forward(images)],
        }
    }
}

#[derive(Config, Debug)]
pub enum SegmentationNetConfig {
    UNet(UNetConfig),
    DoubleUNet(DoubleUNetConfig),
    XNet(XNetConfig),
}

impl SegmentationNetConfig {
    pub fn backbone(&self) -> &BackboneKind {
        match self {
            SegmentationNetConfig::UNet(config) => &config.backbone,
            SegmentationNetConfig::DoubleUNet(config) => &config.backbone,
            SegmentationNetConfig::XNet(config) => &config.backbone,
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            SegmentationNetConfig::UNet(config) => config.num_classes,
            SegmentationNetConfig::DoubleUNet(config) => config.num_classes,
            SegmentationNetConfig::XNet(config) => config.num_classes,
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<SegmentationNet<B>, ModelError> {
        Ok(match self {
            SegmentationNetConfig::UNet(config) => SegmentationNet::UNet(config.init(device)?),
            SegmentationNetConfig::DoubleUNet(config) => {
                SegmentationNet::DoubleUNet(config.init(device)?)
            }
            SegmentationNetConfig::XNet(config) => SegmentationNet::XNet(config.init(device)?),
        })
    }
}

/// A segmentation network paired with its training loss.
#[cfg(feature = "training")]
#[derive(Module, Debug)]
pub struct SegmentationModel<B: Backend> {
    net: SegmentationNet<B>,
    loss: SegmentationLoss<B>,
}

#[cfg(feature = "training")]
#[derive(Config, Debug)]
pub struct SegmentationModelConfig {
    pub net: SegmentationNetConfig,
    #[config(default = "SegmentationLossConfig::new()")]
    pub loss: SegmentationLossConfig,
}

#[cfg(feature = "training")]
impl SegmentationModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<SegmentationModel<B>, ModelError> {
        self.loss.check_classes(self.net.num_classes())?;

        Ok(SegmentationModel {
            net: self.net.init(device)?,
            loss: self.loss.init(device),
        })
    }
}

#[cfg(feature = "training")]
impl<B: Backend> SegmentationModel<B> {
    pub fn net(&self) -> &SegmentationNet<B> {
        &self.net
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        self.net.forward(images)
    }

    /// Loss averaged over every head, metrics on the last one.
    pub fn forward_segmentation(&self, item: SegmentationBatch<B>) -> SegmentationOutput<B> {
        let targets = item.masks;
        let mut heads = self.net.forward_heads(item.images);
        let num_heads = heads.len();

        let loss = heads
            .iter()
            .map(|head| self.loss.forward(head.clone(), targets.clone()))
            .reduce(|total, loss| total + loss)
            .expect("Every network has at least one head")
            .div_scalar(num_heads as f32);
        let output = heads.pop().expect("Every network has at least one head");

        SegmentationOutput {
            loss,
            output,
            targets,
        }
    }
}

#[cfg(feature = "training")]
impl<B: AutodiffBackend> TrainStep<SegmentationBatch<B>, SegmentationOutput<B>> for SegmentationModel<B> {
    fn step(&self, batch: SegmentationBatch<B>) -> TrainOutput<SegmentationOutput<B>> {
        let item = self.forward_segmentation(batch);
        TrainOutput::new(self, item.loss.backward(), item)
    }
}

#[cfg(feature = "training")]
impl<B: Backend> ValidStep<SegmentationBatch<B>, SegmentationOutput<B>> for SegmentationModel<B> {
    fn step(&self, batch: SegmentationBatch<B>) -> SegmentationOutput<B> {
        self.forward_segmentation(batch)
    }
}

#[cfg(all(test, feature = "training"))]
mod tests {
    use super::*;
    use crate::model::{BackboneKind, OutputActivation};
    use crate::training::{DiceLossConfig, STROKE_CLASS_WEIGHTS};
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_double_unet() -> DoubleUNetConfig {
        DoubleUNetConfig::new()
            .with_backbone(BackboneKind::ResNet18)
            .with_num_classes(1)
            .with_activation(OutputActivation::Sigmoid)
            .with_aspp_filters(8)
            .with_encoder_filters(vec![4, 4, 4, 4, 4])
            .with_decoder_filters(vec![8, 8, 4, 4, 4])
    }

    #[test]
    fn double_unet_loss_covers_both_heads() {
        let device = Default::default();
        let net = SegmentationNetConfig::DoubleUNet(small_double_unet());
        let model = SegmentationModelConfig::new(net)
            .init::<TestBackend>(&device)
            .unwrap();

        let batch = SegmentationBatch {
            images: Tensor::ones([1, 3, 32, 32], &device),
            masks: Tensor::ones([1, 1, 32, 32], &device),
        };
        let output = model.forward_segmentation(batch);

        assert_eq!(output.output.dims(), [1, 1, 32, 32]);
        let loss = output.loss.into_scalar();
        assert!(loss.is_finite() && loss >= 0.0);
    }

    #[test]
    fn class_weights_must_match_the_network() {
        let loss = SegmentationLossConfig::new()
            .with_dice(DiceLossConfig::new().with_class_weights(STROKE_CLASS_WEIGHTS.to_vec()));
        let net = SegmentationNetConfig::DoubleUNet(small_double_unet());
        let result = SegmentationModelConfig::new(net)
            .with_loss(loss)
            .init::<TestBackend>(&Default::default());

        assert!(matches!(
            result,
            Err(ModelError::ClassWeights {
                expected: 1,
                got: 3,
                ..
            })
        ));
    }
}
