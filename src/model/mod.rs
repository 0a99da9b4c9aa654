mod aspp;
pub mod backbone;
mod blocks;
mod classifier;
mod double_unet;
mod error;
pub mod plan;
mod segmentation;
mod unet;
mod xnet;

use burn::{
    prelude::*,
    record::{CompactRecorder, Recorder},
};

pub use aspp::{Aspp, AsppConfig};
pub use backbone::{
    Backbone, BackboneConfig, BackboneKind, LayerInfo, LayerKind, LayerRef, LayerTable,
    Preprocessing,
};
pub use blocks::{
    ConvBlockSe, ConvBlockSeConfig, ConvBnRelu, ConvBnReluConfig, DecoderBlock,
    DecoderBlockConfig, DecoderBlockType, EncoderBlock, EncoderBlockConfig, OutputActivation,
    OutputBlock, OutputBlockConfig, SqueezeExcite, SqueezeExciteConfig,
};
pub use classifier::{Classifier, ClassifierConfig, ClassifierPhase};
pub use double_unet::{
    DoubleUNet, DoubleUNetConfig, DoubleUNetPlan, EncoderBlockType, EncoderStage,
};
pub use error::ModelError;
pub use segmentation::{SegmentationNet, SegmentationNetConfig};
#[cfg(feature = "training")]
pub use segmentation::{SegmentationModel, SegmentationModelConfig};
pub use unet::{UNet, UNetConfig, UNetPlan};
pub use xnet::{LatticeNode, NodeInput, NodePlan, XNet, XNetConfig, XNetPlan};

/// Loads a record saved with [`CompactRecorder`] into `module`.
pub fn load_weights<B: Backend, M: Module<B>>(
    module: M,
    path: &str,
    device: &B::Device,
) -> Result<M, ModelError> {
    let record = CompactRecorder::new()
        .load(path.into(), device)
        .map_err(|err| ModelError::Weights {
            path: path.to_string(),
            reason: format!("{err:?}"),
        })?;

    Ok(module.load_record(record))
}
