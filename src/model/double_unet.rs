use std::str::FromStr;

use burn::prelude::*;
use tracing::{debug, info};

use super::{
    ModelError,
    aspp::{Aspp, AsppConfig},
    backbone::{Backbone, BackboneConfig, BackboneKind, LayerRef, LayerTable},
    blocks::{
        ConvBlockSeConfig, ConvBnRelu, ConvBnReluConfig, DecoderBlock, DecoderBlockConfig,
        DecoderBlockType, EncoderBlock, EncoderBlockConfig, OutputActivation, OutputBlock,
        OutputBlockConfig,
    },
    load_weights,
    plan::{FeatureShape, StagePlan, ensure_full_resolution, upsample_stage},
};

pub(crate) const CENTER_FILTERS: usize = 512;

/// Block used by the second, from-scratch encoder.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum EncoderBlockType {
    ConvBlockSe,
}

impl FromStr for EncoderBlockType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ConvBlock_SE" | "conv_block_se" => Ok(EncoderBlockType::ConvBlockSe),
            other => Err(ModelError::UnknownBlockType {
                which: "encoder",
                got: other.to_string(),
            }),
        }
    }
}

#[derive(Config, Debug)]
pub struct DoubleUNetConfig {
    #[config(default = "BackboneKind::Vgg19")]
    pub backbone: BackboneKind,
    #[config(default = "3")]
    pub input_channels: usize,
    #[config(default = "3")]
    pub num_classes: usize,
    #[config(default = "OutputActivation::Softmax")]
    pub activation: OutputActivation,
    /// Backbone layers feeding the first decoder, deepest first. The
    /// backbone defaults are used when unset.
    #[config(default = "None")]
    pub encoder_features: Option<Vec<LayerRef>>,
    #[config(default = "true")]
    pub use_center_block: bool,
    #[config(default = "64")]
    pub aspp_filters: usize,
    #[config(default = "EncoderBlockType::ConvBlockSe")]
    pub encoder_2_block_type: EncoderBlockType,
    #[config(default = "DecoderBlockType::Upsampling")]
    pub decoder_1_block_type: DecoderBlockType,
    #[config(default = "DecoderBlockType::Upsampling")]
    pub decoder_2_block_type: DecoderBlockType,
    #[config(default = "vec![16, 32, 64, 128, 256]")]
    pub encoder_filters: Vec<usize>,
    #[config(default = "vec![256, 128, 64, 32, 16]")]
    pub decoder_filters: Vec<usize>,
    #[config(default = "true")]
    pub use_batchnorm: bool,
    #[config(default = "false")]
    pub encoder_freeze: bool,
    /// Weights file in burn's compact record format.
    #[config(default = "None")]
    pub weights: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncoderStage {
    pub input_channels: usize,
    pub filters: usize,
}

/// Wiring of a Double U-Net over a given backbone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DoubleUNetPlan {
    /// Backbone layers feeding the first decoder, deepest first.
    pub skip_layers: Vec<usize>,
    /// Layer whose output enters the center block or ASPP-1.
    pub bottleneck_layer: usize,
    pub center_block: bool,
    pub aspp_1_input: usize,
    pub decoder_1: Vec<StagePlan>,
    pub encoder_2: Vec<EncoderStage>,
    pub aspp_2_input: usize,
    pub decoder_2: Vec<StagePlan>,
}

impl DoubleUNetConfig {
    pub fn backbone_config(&self) -> BackboneConfig {
        BackboneConfig::new(self.backbone.clone()).with_input_channels(self.input_channels)
    }

    pub fn feature_layers(&self) -> Vec<LayerRef> {
        self.encoder_features.clone().unwrap_or_else(|| {
            self.backbone
                .default_feature_layers(self.backbone.default_skip_count())
        })
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.num_classes != 1 && self.num_classes != self.input_channels {
            return Err(ModelError::MaskChannels {
                classes: self.num_classes,
                input_channels: self.input_channels,
            });
        }
        if self.decoder_filters.is_empty() || self.encoder_filters.is_empty() {
            return Err(ModelError::InvalidConfig(
                "encoder and decoder filter lists must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolves every layer and checks channels and scales of every merge.
    pub fn plan(&self, table: &LayerTable) -> Result<DoubleUNetPlan, ModelError> {
        self.validate()?;

        let mut skip_layers = table.resolve_all(&self.feature_layers())?;
        let mut bottleneck_layer = table.output_index();
        let mut center_block = false;

        if table.ends_with_max_pool() {
            if self.use_center_block {
                center_block = true;
            } else {
                bottleneck_layer = bottleneck_layer.checked_sub(1).ok_or_else(|| {
                    ModelError::InvalidConfig("backbone has no layer before its pooling".to_string())
                })?;
                if !skip_layers.is_empty() {
                    skip_layers.remove(0);
                }
            }
        }

        let skips_1: Vec<FeatureShape> = skip_layers
            .iter()
            .map(|&index| FeatureShape::of_layer(table, index))
            .collect();

        let mut x = FeatureShape::of_layer(table, bottleneck_layer);
        if center_block {
            x.channels = CENTER_FILTERS;
        }
        let aspp_1_input = x.channels;
        x.channels = self.aspp_filters;

        let mut decoder_1 = Vec::with_capacity(self.decoder_filters.len());
        for (i, &filters) in self.decoder_filters.iter().enumerate() {
            let skips: Vec<FeatureShape> = skips_1.get(i).copied().into_iter().collect();
            let stage = upsample_stage(&format!("decoder 1 stage {i}"), x, &skips, filters)?;
            x = stage.output();
            decoder_1.push(stage);
        }
        ensure_full_resolution("double-unet decoder 1", x)?;

        let mut x = FeatureShape::new(self.input_channels, 0);
        let mut encoder_2 = Vec::with_capacity(self.encoder_filters.len());
        let mut skips_2 = Vec::with_capacity(self.encoder_filters.len());
        for &filters in &self.encoder_filters {
            encoder_2.push(EncoderStage {
                input_channels: x.channels,
                filters,
            });
            skips_2.push(FeatureShape::new(filters, x.level));
            x = FeatureShape::new(filters, x.level + 1);
        }
        skips_2.reverse();

        let aspp_2_input = x.channels;
        x.channels = self.aspp_filters;

        let stage_skips = (0..self.decoder_filters.len())
            .map(|i| decoder_2_skips(i, &skips_1, &skips_2))
            .collect::<Result<Vec<_>, _>>()?;

        let mut decoder_2 = Vec::with_capacity(self.decoder_filters.len());
        for (i, (&filters, skips)) in self.decoder_filters.iter().zip(&stage_skips).enumerate() {
            let stage = upsample_stage(&format!("decoder 2 stage {i}"), x, skips, filters)?;
            x = stage.output();
            decoder_2.push(stage);
        }
        ensure_full_resolution("double-unet decoder 2", x)?;

        Ok(DoubleUNetPlan {
            skip_layers,
            bottleneck_layer,
            center_block,
            aspp_1_input,
            decoder_1,
            encoder_2,
            aspp_2_input,
            decoder_2,
        })
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<DoubleUNet<B>, ModelError> {
        info!("Building Double U-Net on {}", self.backbone.name());

        let backbone_config = self.backbone_config();
        let plan = self.plan(&backbone_config.table())?;
        debug!(?plan, "Double U-Net wiring");

        let mut backbone = backbone_config.init(device);
        if self.encoder_freeze {
            backbone = backbone.freeze();
        }

        let center = if plan.center_block {
            let input = backbone_config.table().output().channels;
            vec![
                ConvBnReluConfig::new(input, CENTER_FILTERS)
                    .with_use_batchnorm(self.use_batchnorm)
                    .init(device),
                ConvBnReluConfig::new(CENTER_FILTERS, CENTER_FILTERS)
                    .with_use_batchnorm(self.use_batchnorm)
                    .init(device),
            ]
        } else {
            Vec::new()
        };

        let aspp_1 = AsppConfig::new(plan.aspp_1_input)
            .with_filters(self.aspp_filters)
            .init(device);
        info!("ASPP-1 initialized");
        let decoder_1 = self.decoder(&plan.decoder_1, &self.decoder_1_block_type, device);
        info!("Decoder-1 initialized");
        let output_1 = self.output_block(device);

        let encoder_2 = match self.encoder_2_block_type {
            EncoderBlockType::ConvBlockSe => plan
                .encoder_2
                .iter()
                .map(|stage| {
                    EncoderBlockConfig::new(
                        ConvBlockSeConfig::new(stage.input_channels, stage.filters)
                            .with_use_batchnorm(self.use_batchnorm),
                    )
                    .init(device)
                })
                .collect(),
        };
        info!("Encoder-2 initialized");
        let aspp_2 = AsppConfig::new(plan.aspp_2_input)
            .with_filters(self.aspp_filters)
            .init(device);
        info!("ASPP-2 initialized");
        let decoder_2 = self.decoder(&plan.decoder_2, &self.decoder_2_block_type, device);
        info!("Decoder-2 initialized");
        let output_2 = self.output_block(device);

        let mut taps = plan.skip_layers.clone();
        taps.push(plan.bottleneck_layer);

        let model = DoubleUNet {
            backbone,
            taps,
            center,
            aspp_1,
            decoder_1,
            output_1,
            encoder_2,
            aspp_2,
            decoder_2,
            output_2,
            num_classes: self.num_classes,
        };

        let model = match &self.weights {
            Some(path) => load_weights(model, path, device)?,
            None => model,
        };
        info!("Model initialization complete");

        Ok(model)
    }

    fn decoder<B: Backend>(
        &self,
        stages: &[StagePlan],
        block_type: &DecoderBlockType,
        device: &B::Device,
    ) -> Vec<DecoderBlock<B>> {
        stages
            .iter()
            .map(|stage| {
                DecoderBlockConfig::new(stage.input_channels, stage.skip_channels, stage.filters)
                    .with_block_type(block_type.clone())
                    .with_use_batchnorm(self.use_batchnorm)
                    .with_squeeze_excite(true)
                    .init(device)
            })
            .collect()
    }

    fn output_block<B: Backend>(&self, device: &B::Device) -> OutputBlock<B> {
        let last = self.decoder_filters.last().copied().unwrap_or_default();

        OutputBlockConfig::new(last, self.num_classes)
            .with_activation(self.activation.clone())
            .init(device)
    }
}

/// Stage `i` of the second decoder merges both encoders' skips at that
/// depth, but only while the backbone still provides one.
fn decoder_2_skips<T: Clone>(i: usize, skips_1: &[T], skips_2: &[T]) -> Result<Vec<T>, ModelError> {
    let Some(skip_1) = skips_1.get(i) else {
        return Ok(Vec::new());
    };
    let skip_2 = skips_2.get(i).ok_or(ModelError::MissingSkip {
        stage: i,
        available: skips_2.len(),
    })?;

    Ok(vec![skip_1.clone(), skip_2.clone()])
}

#[derive(Module, Debug)]
pub struct DoubleUNet<B: Backend> {
    backbone: Backbone<B>,
    /// Skip layers followed by the bottleneck layer.
    taps: Vec<usize>,
    center: Vec<ConvBnRelu<B>>,
    aspp_1: Aspp<B>,
    decoder_1: Vec<DecoderBlock<B>>,
    output_1: OutputBlock<B>,
    encoder_2: Vec<EncoderBlock<B>>,
    aspp_2: Aspp<B>,
    decoder_2: Vec<DecoderBlock<B>>,
    output_2: OutputBlock<B>,
    num_classes: usize,
}

impl<B: Backend> DoubleUNet<B> {
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn backbone(&self) -> &Backbone<B> {
        &self.backbone
    }

    /// Concatenation of both outputs, `[batch, 2 * classes, height, width]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let (output_1, output_2) = self.forward_outputs(images);

        Tensor::cat(vec![output_1, output_2], 1)
    }

    pub fn forward_outputs(&self, images: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let (_, mut features) = self.backbone.forward_taps(images.clone(), &self.taps);
        let mut x = features
            .pop()
            .expect("The bottleneck is always the last tap");
        let skips_1 = features;

        for block in &self.center {
            x = block.forward(x);
        }
        let mut x = self.aspp_1.forward(x);
        for (i, block) in self.decoder_1.iter().enumerate() {
            x = block.forward(x, skips_1.get(i).cloned().into_iter().collect());
        }
        let output_1 = self.output_1.forward(x);

        let mut x = mask_input(images, output_1.clone());
        let mut skips_2 = Vec::with_capacity(self.encoder_2.len());
        for block in &self.encoder_2 {
            let (pooled, skip) = block.forward(x);
            skips_2.push(skip);
            x = pooled;
        }
        skips_2.reverse();

        let mut x = self.aspp_2.forward(x);
        for (i, block) in self.decoder_2.iter().enumerate() {
            let skips = decoder_2_skips(i, &skips_1, &skips_2)
                .expect("Second-encoder skips are checked when planning");
            x = block.forward(x, skips);
        }
        let output_2 = self.output_2.forward(x);

        (output_1, output_2)
    }
}

/// `input * mask`, broadcasting a single-channel mask over every channel.
fn mask_input<B: Backend>(input: Tensor<B, 4>, mask: Tensor<B, 4>) -> Tensor<B, 4> {
    let channels = input.dims()[1];

    if mask.dims()[1] == 1 && channels != 1 {
        input.mul(mask.repeat_dim(1, channels))
    } else {
        input.mul(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn table(config: &DoubleUNetConfig) -> LayerTable {
        config.backbone_config().table()
    }

    #[test]
    fn vgg19_defaults_use_a_center_block() {
        let config = DoubleUNetConfig::new();
        let plan = config.plan(&table(&config)).unwrap();

        assert!(plan.center_block);
        assert_eq!(plan.skip_layers.len(), 5);
        assert_eq!(plan.aspp_1_input, CENTER_FILTERS);
        assert_eq!(plan.decoder_1[0].skip_channels, 512);
        assert_eq!(plan.decoder_1[4].skip_channels, 64);
        assert_eq!(plan.aspp_2_input, 256);
        // backbone skip + encoder-2 skip
        assert_eq!(plan.decoder_2[0].skip_channels, 512 + 256);
        assert_eq!(plan.decoder_2[4].skip_channels, 64 + 16);
    }

    #[test]
    fn without_center_block_the_pool_is_skipped() {
        let config = DoubleUNetConfig::new()
            .with_use_center_block(false)
            .with_encoder_filters(vec![16, 32, 64, 128])
            .with_decoder_filters(vec![128, 64, 32, 16]);
        let table = table(&config);
        let plan = config.plan(&table).unwrap();

        assert!(!plan.center_block);
        assert_eq!(table.layers()[plan.bottleneck_layer].name, "block5_conv4");
        assert_eq!(plan.skip_layers.len(), 4);
        assert_eq!(table.layers()[plan.skip_layers[0]].name, "block4_conv4");
    }

    #[test]
    fn without_center_block_five_stages_overshoot() {
        let config = DoubleUNetConfig::new().with_use_center_block(false);
        let err = config.plan(&table(&config)).unwrap_err();

        assert!(matches!(err, ModelError::OutputScale { level: -1, .. }));
    }

    #[test]
    fn resnet_last_stages_have_no_backbone_skip() {
        let config = DoubleUNetConfig::new()
            .with_backbone(BackboneKind::ResNet34)
            .with_num_classes(1)
            .with_activation(OutputActivation::Sigmoid);
        let plan = config.plan(&table(&config)).unwrap();

        assert!(!plan.center_block);
        assert_eq!(plan.skip_layers.len(), 4);
        assert_eq!(plan.decoder_1[4].skip_channels, 0);
        // The encoder-2 skip at full resolution is dropped with the backbone one.
        assert_eq!(plan.decoder_2[4].skip_channels, 0);
        assert_eq!(plan.decoder_2[3].skip_channels, 64 + 32);
    }

    #[test]
    fn every_backbone_plans() {
        for kind in BackboneKind::ALL {
            let config = DoubleUNetConfig::new().with_backbone(kind.clone());
            assert!(config.plan(&table(&config)).is_ok(), "{}", kind.name());
        }
    }

    #[test]
    fn mask_needs_compatible_classes() {
        let config = DoubleUNetConfig::new().with_num_classes(2);
        assert_eq!(
            config.plan(&table(&config)),
            Err(ModelError::MaskChannels {
                classes: 2,
                input_channels: 3
            })
        );
    }

    #[test]
    fn unknown_skip_layer() {
        let config =
            DoubleUNetConfig::new().with_encoder_features(Some(vec![LayerRef::from("block9_conv1")]));
        assert!(matches!(
            config.plan(&table(&config)),
            Err(ModelError::UnknownLayer { .. })
        ));
    }

    #[test]
    fn decoder_2_skip_rule() {
        let skips_1 = [1, 2];
        let skips_2 = [10, 20, 30];
        assert_eq!(decoder_2_skips(0, &skips_1, &skips_2), Ok(vec![1, 10]));
        assert_eq!(decoder_2_skips(1, &skips_1, &skips_2), Ok(vec![2, 20]));
        assert_eq!(decoder_2_skips(2, &skips_1, &skips_2), Ok(Vec::new()));
        assert_eq!(
            decoder_2_skips(1, &skips_1, &skips_2[..1]),
            Err(ModelError::MissingSkip {
                stage: 1,
                available: 1
            })
        );
    }

    #[test]
    fn short_second_encoder_is_rejected() {
        let config = DoubleUNetConfig::new().with_encoder_filters(vec![16, 32, 64, 128]);

        assert_eq!(
            config.plan(&table(&config)),
            Err(ModelError::MissingSkip {
                stage: 4,
                available: 4
            })
        );
    }

    #[test]
    fn forward_concatenates_both_outputs() {
        let device = Default::default();
        let model = DoubleUNetConfig::new()
            .with_backbone(BackboneKind::ResNet18)
            .with_num_classes(1)
            .with_activation(OutputActivation::Sigmoid)
            .with_aspp_filters(8)
            .with_encoder_filters(vec![4, 4, 8, 8, 8])
            .with_decoder_filters(vec![16, 8, 8, 4, 4])
            .init::<TestBackend>(&device)
            .unwrap();
        let images = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);

        let (output_1, output_2) = model.forward_outputs(images.clone());
        assert_eq!(output_1.dims(), [1, 1, 32, 32]);
        assert_eq!(output_2.dims(), [1, 1, 32, 32]);
        assert_eq!(model.forward(images).dims(), [1, 2, 32, 32]);
    }
}
