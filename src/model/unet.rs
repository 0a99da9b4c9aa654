use burn::prelude::*;
use tracing::info;

use super::{
    ModelError,
    backbone::{Backbone, BackboneConfig, BackboneKind, LayerRef, LayerTable},
    blocks::{
        ConvBnRelu, ConvBnReluConfig, DecoderBlock, DecoderBlockConfig, DecoderBlockType,
        OutputActivation, OutputBlock, OutputBlockConfig,
    },
    double_unet::CENTER_FILTERS,
    load_weights,
    plan::{FeatureShape, StagePlan, ensure_full_resolution, upsample_stage},
};

/// U-Net decoder over a pretrained-style backbone.
#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    backbone: Backbone<B>,
    skip_layers: Vec<usize>,
    center: Vec<ConvBnRelu<B>>,
    decoder: Vec<DecoderBlock<B>>,
    final_block: OutputBlock<B>,
    num_classes: usize,
}

#[derive(Config, Debug)]
pub struct UNetConfig {
    #[config(default = "BackboneKind::EfficientNetB3")]
    pub backbone: BackboneKind,
    #[config(default = "3")]
    pub input_channels: usize,
    #[config(default = "3")]
    pub num_classes: usize,
    #[config(default = "OutputActivation::Softmax")]
    pub activation: OutputActivation,
    #[config(default = "None")]
    pub encoder_features: Option<Vec<LayerRef>>,
    #[config(default = "DecoderBlockType::Upsampling")]
    pub decoder_block_type: DecoderBlockType,
    #[config(default = "vec![256, 128, 64, 32, 16]")]
    pub decoder_filters: Vec<usize>,
    #[config(default = "true")]
    pub decoder_use_batchnorm: bool,
    #[config(default = "false")]
    pub encoder_freeze: bool,
    #[config(default = "None")]
    pub weights: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UNetPlan {
    pub skip_layers: Vec<usize>,
    pub center_block: bool,
    pub decoder: Vec<StagePlan>,
}

impl UNetConfig {
    pub fn backbone_config(&self) -> BackboneConfig {
        BackboneConfig::new(self.backbone.clone()).with_input_channels(self.input_channels)
    }

    pub fn plan(&self, table: &LayerTable) -> Result<UNetPlan, ModelError> {
        let features = self
            .encoder_features
            .clone()
            .unwrap_or_else(|| self.backbone.default_feature_layers(4));
        let skip_layers = table.resolve_all(&features)?;
        let center_block = table.ends_with_max_pool();

        let mut x = FeatureShape::of_layer(table, table.output_index());
        if center_block {
            x.channels = CENTER_FILTERS;
        }

        let mut decoder = Vec::with_capacity(self.decoder_filters.len());
        for (i, &filters) in self.decoder_filters.iter().enumerate() {
            let skips: Vec<FeatureShape> = skip_layers
                .get(i)
                .map(|&layer| FeatureShape::of_layer(table, layer))
                .into_iter()
                .collect();
            let stage = upsample_stage(&format!("decoder stage {i}"), x, &skips, filters)?;
            x = stage.output();
            decoder.push(stage);
        }
        ensure_full_resolution("unet", x)?;

        Ok(UNetPlan {
            skip_layers,
            center_block,
            decoder,
        })
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<UNet<B>, ModelError> {
        let backbone_config = self.backbone_config();
        let table = backbone_config.table();
        let plan = self.plan(&table)?;

        let mut backbone = backbone_config.init(device);
        if self.encoder_freeze {
            backbone = backbone.freeze();
        }

        let center = if plan.center_block {
            vec![
                ConvBnReluConfig::new(table.output().channels, CENTER_FILTERS)
                    .with_use_batchnorm(self.decoder_use_batchnorm)
                    .init(device),
                ConvBnReluConfig::new(CENTER_FILTERS, CENTER_FILTERS)
                    .with_use_batchnorm(self.decoder_use_batchnorm)
                    .init(device),
            ]
        } else {
            Vec::new()
        };

        let decoder = plan
            .decoder
            .iter()
            .map(|stage| {
                DecoderBlockConfig::new(stage.input_channels, stage.skip_channels, stage.filters)
                    .with_block_type(self.decoder_block_type.clone())
                    .with_use_batchnorm(self.decoder_use_batchnorm)
                    .init(device)
            })
            .collect();

        let last = plan.decoder.last().map(|stage| stage.filters).unwrap_or_default();
        let model = UNet {
            backbone,
            skip_layers: plan.skip_layers,
            center,
            decoder,
            final_block: OutputBlockConfig::new(last, self.num_classes)
                .with_kernel_size(3)
                .with_activation(self.activation.clone())
                .init(device),
            num_classes: self.num_classes,
        };
        info!("U-Net initialized on {}", self.backbone.name());

        match &self.weights {
            Some(path) => load_weights(model, path, device),
            None => Ok(model),
        }
    }
}

impl<B: Backend> UNet<B> {
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let (mut x, skip_features) = self.backbone.forward_taps(images, &self.skip_layers);

        for block in &self.center {
            x = block.forward(x);
        }

        for (i, block) in self.decoder.iter().enumerate() {
            x = block.forward(x, skip_features.get(i).cloned().into_iter().collect());
        }

        self.final_block.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn vgg_unet_gets_a_center_block() {
        let config = UNetConfig::new().with_backbone(BackboneKind::Vgg16);
        let plan = config.plan(&config.backbone_config().table()).unwrap();

        assert!(plan.center_block);
        assert_eq!(plan.decoder[0].input_channels, CENTER_FILTERS);
        assert_eq!(plan.decoder[4].skip_channels, 0);
    }

    #[test]
    fn efficientnet_unet_plan() {
        let config = UNetConfig::new();
        let plan = config.plan(&config.backbone_config().table()).unwrap();

        assert!(!plan.center_block);
        assert_eq!(plan.decoder[0].input_channels, 1536);
        assert_eq!(plan.decoder[0].skip_channels, 816);
    }

    #[test]
    fn forward_shape() {
        let device = Default::default();
        let model = UNetConfig::new()
            .with_backbone(BackboneKind::ResNet18)
            .with_decoder_filters(vec![16, 16, 8, 8, 4])
            .init::<TestBackend>(&device)
            .unwrap();
        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);

        assert_eq!(model.forward(images).dims(), [2, 3, 32, 32]);
    }
}
