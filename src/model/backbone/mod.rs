mod efficientnet;
mod layers;
mod preprocess;
mod resnet;
mod vgg;

use std::str::FromStr;

use burn::prelude::*;

use super::ModelError;

pub use layers::{BackboneLayer, Features, NormMode};
pub use preprocess::Preprocessing;

pub(crate) use layers::{Activation, LayerOp};

/// Reference to a backbone layer, either by its name or by its position.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum LayerRef {
    Name(String),
    Index(usize),
}

impl From<&str> for LayerRef {
    fn from(name: &str) -> Self {
        LayerRef::Name(name.to_string())
    }
}

impl From<usize> for LayerRef {
    fn from(index: usize) -> Self {
        LayerRef::Index(index)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerKind {
    Convolution,
    MaxPool,
    Activation,
    Merge,
    Norm,
}

/// Static description of a backbone layer output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerInfo {
    pub name: String,
    pub channels: usize,
    /// Spatial down-sampling factor relative to the network input.
    pub reduction: usize,
    pub kind: LayerKind,
}

impl LayerInfo {
    /// `log2(reduction)`, the scale the decoders reason about.
    pub fn level(&self) -> i32 {
        self.reduction.trailing_zeros() as i32
    }
}

/// The ordered list of named layers of a backbone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerTable {
    backbone: String,
    layers: Vec<LayerInfo>,
}

impl LayerTable {
    pub fn backbone(&self) -> &str {
        &self.backbone
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[LayerInfo] {
        &self.layers
    }

    pub fn get(&self, index: usize) -> Option<&LayerInfo> {
        self.layers.get(index)
    }

    pub fn output_index(&self) -> usize {
        self.layers.len().saturating_sub(1)
    }

    pub fn output(&self) -> &LayerInfo {
        &self.layers[self.output_index()]
    }

    pub fn ends_with_max_pool(&self) -> bool {
        self.layers
            .last()
            .is_some_and(|layer| layer.kind == LayerKind::MaxPool)
    }

    /// Position of a layer in the table.
    pub fn resolve(&self, layer: &LayerRef) -> Result<usize, ModelError> {
        match layer {
            LayerRef::Name(name) => self
                .layers
                .iter()
                .position(|info| &info.name == name)
                .ok_or_else(|| ModelError::UnknownLayer {
                    backbone: self.backbone.clone(),
                    name: name.clone(),
                }),
            LayerRef::Index(index) if *index < self.layers.len() => Ok(*index),
            LayerRef::Index(index) => Err(ModelError::LayerIndexOutOfRange {
                backbone: self.backbone.clone(),
                index: *index,
                len: self.layers.len(),
            }),
        }
    }

    pub fn resolve_all(&self, layers: &[LayerRef]) -> Result<Vec<usize>, ModelError> {
        layers.iter().map(|layer| self.resolve(layer)).collect()
    }
}

pub(crate) struct LayerSpec {
    pub info: LayerInfo,
    pub op: LayerOp,
}

/// Accumulates layer specs while tracking channels and reduction.
pub(crate) struct TableBuilder {
    specs: Vec<LayerSpec>,
    channels: usize,
    reduction: usize,
}

impl TableBuilder {
    pub fn new(input_channels: usize) -> Self {
        Self {
            specs: Vec::new(),
            channels: input_channels,
            reduction: 1,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn push(
        &mut self,
        name: impl Into<String>,
        kind: LayerKind,
        op: LayerOp,
        channels: usize,
        stride: usize,
    ) {
        self.reduction *= stride;
        self.channels = channels;
        self.specs.push(LayerSpec {
            info: LayerInfo {
                name: name.into(),
                channels,
                reduction: self.reduction,
                kind,
            },
            op,
        });
    }

    pub fn finish(self) -> Vec<LayerSpec> {
        self.specs
    }
}

#[derive(Config, Debug, PartialEq, Eq)]
pub enum BackboneKind {
    Vgg16,
    Vgg19,
    ResNet18,
    ResNet34,
    EfficientNetB0,
    EfficientNetB1,
    EfficientNetB2,
    EfficientNetB3,
    EfficientNetB4,
}

impl BackboneKind {
    pub const ALL: [BackboneKind; 9] = [
        BackboneKind::Vgg16,
        BackboneKind::Vgg19,
        BackboneKind::ResNet18,
        BackboneKind::ResNet34,
        BackboneKind::EfficientNetB0,
        BackboneKind::EfficientNetB1,
        BackboneKind::EfficientNetB2,
        BackboneKind::EfficientNetB3,
        BackboneKind::EfficientNetB4,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BackboneKind::Vgg16 => "vgg16",
            BackboneKind::Vgg19 => "vgg19",
            BackboneKind::ResNet18 => "resnet18",
            BackboneKind::ResNet34 => "resnet34",
            BackboneKind::EfficientNetB0 => "efficientnetb0",
            BackboneKind::EfficientNetB1 => "efficientnetb1",
            BackboneKind::EfficientNetB2 => "efficientnetb2",
            BackboneKind::EfficientNetB3 => "efficientnetb3",
            BackboneKind::EfficientNetB4 => "efficientnetb4",
        }
    }

    fn is_vgg(&self) -> bool {
        matches!(self, BackboneKind::Vgg16 | BackboneKind::Vgg19)
    }

    fn is_resnet(&self) -> bool {
        matches!(self, BackboneKind::ResNet18 | BackboneKind::ResNet34)
    }

    /// Layers whose outputs feed the decoder skips, deepest first.
    pub fn default_feature_layers(&self, n: usize) -> Vec<LayerRef> {
        let names: &[&str] = match self {
            BackboneKind::Vgg16 => &[
                "block5_conv3",
                "block4_conv3",
                "block3_conv3",
                "block2_conv2",
                "block1_conv2",
            ],
            BackboneKind::Vgg19 => &[
                "block5_conv4",
                "block4_conv4",
                "block3_conv4",
                "block2_conv2",
                "block1_conv2",
            ],
            BackboneKind::ResNet18 | BackboneKind::ResNet34 => &[
                "stage4_unit1_relu1",
                "stage3_unit1_relu1",
                "stage2_unit1_relu1",
                "relu0",
            ],
            _ => &[
                "block6a_expand_activation",
                "block4a_expand_activation",
                "block3a_expand_activation",
                "block2a_expand_activation",
            ],
        };

        names.iter().take(n).map(|name| LayerRef::from(*name)).collect()
    }

    /// Number of skip layers the segmentation decoders use by default.
    pub fn default_skip_count(&self) -> usize {
        if self.is_vgg() { 5 } else { 4 }
    }

    /// Skip and down-sampling layers the X-Net lattice is wired on.
    pub fn default_xnet_skip_connections(&self) -> Vec<LayerRef> {
        if self.is_vgg() {
            let mut layers = self.default_feature_layers(5);
            layers.extend(
                (1..=5)
                    .rev()
                    .map(|block| LayerRef::Name(format!("block{block}_pool"))),
            );
            layers
        } else if self.is_resnet() {
            [
                "stage4_unit1_relu1",
                "stage3_unit1_relu1",
                "stage2_unit1_relu1",
                "relu0",
                "relu1",
                "stage3_unit2_relu1",
                "stage2_unit2_relu1",
                "stage1_unit2_relu1",
            ]
            .into_iter()
            .map(LayerRef::from)
            .collect()
        } else {
            self.default_feature_layers(4)
        }
    }

    pub fn preprocessing(&self) -> Preprocessing {
        if self.is_vgg() {
            Preprocessing::Caffe
        } else if self.is_resnet() {
            Preprocessing::Identity
        } else {
            Preprocessing::Torch
        }
    }

    pub(crate) fn specs(&self, input_channels: usize) -> Vec<LayerSpec> {
        match self {
            BackboneKind::Vgg16 => vgg::specs(input_channels, &[2, 2, 3, 3, 3]),
            BackboneKind::Vgg19 => vgg::specs(input_channels, &[2, 2, 4, 4, 4]),
            BackboneKind::ResNet18 => resnet::specs(input_channels, &[2, 2, 2, 2]),
            BackboneKind::ResNet34 => resnet::specs(input_channels, &[3, 4, 6, 3]),
            BackboneKind::EfficientNetB0 => efficientnet::specs(input_channels, 1.0, 1.0),
            BackboneKind::EfficientNetB1 => efficientnet::specs(input_channels, 1.0, 1.1),
            BackboneKind::EfficientNetB2 => efficientnet::specs(input_channels, 1.1, 1.2),
            BackboneKind::EfficientNetB3 => efficientnet::specs(input_channels, 1.2, 1.4),
            BackboneKind::EfficientNetB4 => efficientnet::specs(input_channels, 1.4, 1.8),
        }
    }
}

impl FromStr for BackboneKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| ModelError::UnknownBackbone(s.to_string()))
    }
}

#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    layers: Vec<BackboneLayer<B>>,
    /// Layers before this index neither update nor pass gradients.
    trainable_from: usize,
    norm_frozen: bool,
}

#[derive(Config, Debug)]
pub struct BackboneConfig {
    pub kind: BackboneKind,
    #[config(default = "3")]
    pub input_channels: usize,
}

impl BackboneConfig {
    pub fn table(&self) -> LayerTable {
        LayerTable {
            backbone: self.kind.name().to_string(),
            layers: self
                .kind
                .specs(self.input_channels)
                .into_iter()
                .map(|spec| spec.info)
                .collect(),
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        let layers = self
            .kind
            .specs(self.input_channels)
            .iter()
            .map(|spec| spec.op.init(device))
            .collect();

        Backbone {
            layers,
            trainable_from: 0,
            norm_frozen: false,
        }
    }
}

impl<B: Backend> Backbone<B> {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Freezes every layer, normalization included.
    pub fn freeze(mut self) -> Self {
        self.trainable_from = self.layers.len();
        self.norm_frozen = true;
        self
    }

    pub fn unfreeze(self) -> Self {
        self.unfreeze_from(0, false)
    }

    /// Makes the layers from `index` onward trainable.
    ///
    /// With `keep_norm_frozen`, batch-norm layers in the trainable part keep
    /// using their running statistics and do not learn their affine terms.
    pub fn unfreeze_from(mut self, index: usize, keep_norm_frozen: bool) -> Self {
        self.trainable_from = index.min(self.layers.len());
        self.norm_frozen = keep_norm_frozen;
        self
    }

    pub fn is_frozen(&self) -> bool {
        self.trainable_from >= self.layers.len()
    }

    pub fn trainable_from(&self) -> usize {
        self.trainable_from
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward_taps(x, &[]).0
    }

    /// Runs the network once and returns its output together with the
    /// outputs of the `taps` layers, in the order requested.
    pub fn forward_taps(&self, x: Tensor<B, 4>, taps: &[usize]) -> (Tensor<B, 4>, Vec<Tensor<B, 4>>) {
        let mut tapped: Vec<Option<Tensor<B, 4>>> = vec![None; taps.len()];
        let mut features = Features::new(x);

        for (index, layer) in self.layers.iter().enumerate() {
            let frozen = index < self.trainable_from;
            let mode = if frozen || self.norm_frozen {
                NormMode::Frozen
            } else {
                NormMode::Batch
            };

            features = layer.forward(features, mode);
            if frozen {
                features = features.detach();
            }

            for (slot, tap) in taps.iter().enumerate() {
                if *tap == index {
                    tapped[slot] = Some(features.x.clone());
                }
            }
        }

        let tapped = tapped
            .into_iter()
            .map(|tap| tap.expect("Tap indices are resolved against the layer table"))
            .collect();

        (features.x, tapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn table(kind: BackboneKind) -> LayerTable {
        BackboneConfig::new(kind).table()
    }

    #[test]
    fn layer_names_are_unique_and_end_at_stride_32() {
        for kind in BackboneKind::ALL {
            let table = table(kind.clone());
            let mut names: Vec<_> = table.layers().iter().map(|l| l.name.clone()).collect();
            names.sort();
            names.dedup();
            assert_eq!(names.len(), table.len(), "{}", kind.name());
            assert_eq!(table.output().reduction, 32, "{}", kind.name());

            let reductions: Vec<_> = table.layers().iter().map(|l| l.reduction).collect();
            assert!(reductions.windows(2).all(|w| w[0] <= w[1]), "{}", kind.name());
            assert!(reductions.iter().all(|r| r.is_power_of_two()), "{}", kind.name());
        }
    }

    #[test]
    fn default_feature_layers_resolve() {
        for kind in BackboneKind::ALL {
            let table = table(kind.clone());
            let layers = kind.default_feature_layers(kind.default_skip_count());
            let indices = table.resolve_all(&layers).unwrap();
            let levels: Vec<_> = indices.iter().map(|i| table.layers()[*i].level()).collect();
            assert!(levels.windows(2).all(|w| w[0] == w[1] + 1), "{}: {levels:?}", kind.name());

            table
                .resolve_all(&kind.default_xnet_skip_connections())
                .unwrap();
        }
    }

    #[test]
    fn vgg_levels() {
        let table = table(BackboneKind::Vgg19);
        let conv = table.resolve(&"block5_conv4".into()).unwrap();
        assert_eq!(table.layers()[conv].reduction, 16);
        assert_eq!(table.layers()[conv].channels, 512);
        assert!(table.ends_with_max_pool());
        assert_eq!(table.output().name, "block5_pool");
    }

    #[test]
    fn resnet_preactivation_sits_at_unit_input() {
        let table = table(BackboneKind::ResNet34);
        let relu = table.resolve(&"stage4_unit1_relu1".into()).unwrap();
        assert_eq!(table.layers()[relu].reduction, 16);
        assert_eq!(table.layers()[relu].channels, 256);
        assert_eq!(table.output().name, "relu1");
        assert!(!table.ends_with_max_pool());
    }

    #[test]
    fn efficientnet_expand_taps() {
        let table = table(BackboneKind::EfficientNetB0);
        let index = table.resolve(&"block6a_expand_activation".into()).unwrap();
        assert_eq!(table.layers()[index].reduction, 16);
        assert_eq!(table.layers()[index].channels, 672);
        assert_eq!(table.output().channels, 1280);

        let b3 = BackboneConfig::new(BackboneKind::EfficientNetB3).table();
        assert_eq!(b3.output().channels, 1536);
    }

    #[test]
    fn resolve_errors() {
        let table = table(BackboneKind::Vgg16);
        assert_eq!(
            table.resolve(&"nope".into()),
            Err(ModelError::UnknownLayer {
                backbone: "vgg16".to_string(),
                name: "nope".to_string(),
            })
        );
        assert!(matches!(
            table.resolve(&LayerRef::Index(1000)),
            Err(ModelError::LayerIndexOutOfRange { .. })
        ));
        assert_eq!(table.resolve(&LayerRef::Index(3)), Ok(3));
    }

    #[test]
    fn parse_backbone_names() {
        assert_eq!("EfficientNetB3".parse::<BackboneKind>(), Ok(BackboneKind::EfficientNetB3));
        assert!("mobilenet".parse::<BackboneKind>().is_err());
    }

    #[test]
    fn forward_taps_shapes() {
        let device = Default::default();
        let config = BackboneConfig::new(BackboneKind::ResNet18);
        let table = config.table();
        let backbone = config.init::<TestBackend>(&device);

        let taps = table
            .resolve_all(&BackboneKind::ResNet18.default_feature_layers(4))
            .unwrap();
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 64, 64], &device);
        let (output, tapped) = backbone.forward_taps(x, &taps);

        assert_eq!(output.dims(), [1, 512, 2, 2]);
        assert_eq!(tapped[0].dims(), [1, 256, 4, 4]);
        assert_eq!(tapped[3].dims(), [1, 64, 32, 32]);
    }

    #[test]
    fn freeze_state() {
        let device = Default::default();
        let backbone = BackboneConfig::new(BackboneKind::Vgg16).init::<TestBackend>(&device);
        let len = backbone.num_layers();

        let backbone = backbone.freeze();
        assert!(backbone.is_frozen());

        let backbone = backbone.unfreeze_from(5, true);
        assert!(!backbone.is_frozen());
        assert_eq!(backbone.trainable_from(), 5);

        let backbone = backbone.unfreeze_from(len + 10, false);
        assert!(backbone.is_frozen());
        assert_eq!(backbone.unfreeze().trainable_from(), 0);
    }
}
