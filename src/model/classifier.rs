use burn::{
    nn::{
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
    },
    prelude::*,
    tensor::activation::sigmoid,
};
use tracing::info;

#[cfg(feature = "training")]
use crate::{dataset::ClassificationBatch, training::ClassificationOutput};
#[cfg(feature = "training")]
use burn::{
    nn::loss::BinaryCrossEntropyLossConfig,
    tensor::backend::AutodiffBackend,
    train::{TrainOutput, TrainStep, ValidStep},
};

use super::{
    ModelError,
    backbone::{Backbone, BackboneConfig, BackboneKind, LayerRef, Preprocessing},
    load_weights,
};

/// Training schedule of the stroke classifier.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum ClassifierPhase {
    /// Only the head learns.
    Frozen,
    /// Layers from the fine-tuning boundary learn, batch-norm stays frozen.
    FineTune,
    /// Same trainable set as `FineTune`, trained on augmented data.
    Full,
}

impl ClassifierPhase {
    pub const ALL: [ClassifierPhase; 3] = [
        ClassifierPhase::Frozen,
        ClassifierPhase::FineTune,
        ClassifierPhase::Full,
    ];

    pub fn augments(&self) -> bool {
        *self == ClassifierPhase::Full
    }
}

/// Binary image classifier: backbone features, global average pooling and a
/// single sigmoid unit.
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    backbone: Backbone<B>,
    pool: AdaptiveAvgPool2d,
    norm: BatchNorm<B, 2>,
    dropout: Dropout,
    head: Linear<B>,
    fine_tune_from: usize,
}

#[derive(Config, Debug)]
pub struct ClassifierConfig {
    #[config(default = "BackboneKind::EfficientNetB4")]
    pub backbone: BackboneKind,
    #[config(default = "3")]
    pub input_channels: usize,
    #[config(default = "0.2")]
    pub dropout: f64,
    /// First layer unfrozen by the fine-tuning phases.
    ///
    /// An MBConv block is a single table layer named after its output, so
    /// `block6a_project_bn` unfreezes the depthwise, squeeze-excite and
    /// projection weights of block 6a together. Its expansion
    /// (`block6a_expand_activation`) stays frozen.
    #[config(default = "LayerRef::Name(\"block6a_project_bn\".to_string())")]
    pub fine_tune_from: LayerRef,
    #[config(default = "Preprocessing::Torch")]
    pub preprocessing: Preprocessing,
    #[config(default = "None")]
    pub weights: Option<String>,
}

impl ClassifierConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Classifier<B>, ModelError> {
        let backbone_config =
            BackboneConfig::new(self.backbone.clone()).with_input_channels(self.input_channels);
        let table = backbone_config.table();
        let fine_tune_from = table.resolve(&self.fine_tune_from)?;
        let features = table.output().channels;

        let model = Classifier {
            backbone: backbone_config.init(device).freeze(),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            norm: BatchNormConfig::new(features).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            head: LinearConfig::new(features, 1).init(device),
            fine_tune_from,
        };
        info!(
            "Classifier initialized on {} ({} features)",
            self.backbone.name(),
            features
        );

        match &self.weights {
            Some(path) => load_weights(model, path, device),
            None => Ok(model),
        }
    }
}

impl<B: Backend> Classifier<B> {
    /// Sets which backbone layers learn during `phase`.
    pub fn into_phase(mut self, phase: &ClassifierPhase) -> Self {
        self.backbone = match phase {
            ClassifierPhase::Frozen => self.backbone.freeze(),
            ClassifierPhase::FineTune | ClassifierPhase::Full => {
                self.backbone.unfreeze_from(self.fine_tune_from, true)
            }
        };
        self
    }

    pub fn backbone(&self) -> &Backbone<B> {
        &self.backbone
    }

    pub fn forward_logits(&self, images: Tensor<B, 4>) -> Tensor<B, 1> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.backbone.forward(images);
        let x = self.norm.forward(self.pool.forward(x));
        let [_, channels, _, _] = x.dims();
        let x = self.dropout.forward(x.reshape([batch_size, channels]));

        self.head.forward(x).reshape([batch_size])
    }

    /// Probability of the positive class for every image.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 1> {
        sigmoid(self.forward_logits(images))
    }

    #[cfg(feature = "training")]
    pub fn forward_classification(&self, batch: ClassificationBatch<B>) -> ClassificationOutput<B> {
        let logits = self.forward_logits(batch.images);
        let loss = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&logits.device())
            .forward(logits.clone(), batch.targets.clone().int());

        ClassificationOutput {
            loss,
            output: sigmoid(logits),
            targets: batch.targets,
        }
    }
}

#[cfg(feature = "training")]
impl<B: AutodiffBackend> TrainStep<ClassificationBatch<B>, ClassificationOutput<B>> for Classifier<B> {
    fn step(&self, batch: ClassificationBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch);
        TrainOutput::new(self, item.loss.backward(), item)
    }
}

#[cfg(feature = "training")]
impl<B: Backend> ValidStep<ClassificationBatch<B>, ClassificationOutput<B>> for Classifier<B> {
    fn step(&self, batch: ClassificationBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn phases_move_the_trainable_boundary() {
        let device = Default::default();
        let model = ClassifierConfig::new()
            .with_backbone(BackboneKind::EfficientNetB0)
            .init::<TestBackend>(&device)
            .unwrap();
        assert!(model.backbone().is_frozen());

        let model = model.into_phase(&ClassifierPhase::FineTune);
        assert!(!model.backbone().is_frozen());
        assert!(model.backbone().trainable_from() > 0);

        let model = model.into_phase(&ClassifierPhase::Frozen);
        assert!(model.backbone().is_frozen());
    }

    #[test]
    fn fine_tune_boundary_follows_the_block_6a_expansion() {
        let device = Default::default();
        let table = BackboneConfig::new(BackboneKind::EfficientNetB0).table();
        let expansion = table
            .resolve(&LayerRef::from("block6a_expand_activation"))
            .unwrap();

        let config = ClassifierConfig::new().with_backbone(BackboneKind::EfficientNetB0);
        assert_eq!(table.resolve(&config.fine_tune_from).unwrap(), expansion + 1);

        let model = config
            .init::<TestBackend>(&device)
            .unwrap()
            .into_phase(&ClassifierPhase::FineTune);
        assert_eq!(model.backbone().trainable_from(), expansion + 1);
    }

    #[test]
    fn unknown_boundary_is_an_error() {
        let result = ClassifierConfig::new()
            .with_backbone(BackboneKind::EfficientNetB0)
            .with_fine_tune_from(LayerRef::from("block9z_add"))
            .init::<TestBackend>(&Default::default());

        assert!(matches!(result, Err(ModelError::UnknownLayer { .. })));
    }

    #[test]
    fn outputs_one_probability_per_image() {
        let device = Default::default();
        let model = ClassifierConfig::new()
            .with_backbone(BackboneKind::EfficientNetB0)
            .init::<TestBackend>(&device)
            .unwrap();
        let images = Tensor::<TestBackend, 4>::ones([2, 3, 32, 32], &device);

        let probabilities = model.forward(images).into_data().to_vec::<f32>().unwrap();
        assert_eq!(probabilities.len(), 2);
        assert!(probabilities.iter().all(|p| (0.0..=1.0).contains(p)));
    }
}
