pub mod model;

#[cfg(feature = "dataset")]
pub mod dataset;

#[cfg(feature = "training")]
pub mod training;

pub use model::{
    BackboneKind, Classifier, ClassifierConfig, ClassifierPhase, DoubleUNet, DoubleUNetConfig,
    ModelError, SegmentationNet, SegmentationNetConfig, UNet, UNetConfig, XNet, XNetConfig,
};

#[cfg(feature = "training")]
pub use model::{SegmentationModel, SegmentationModelConfig};

#[cfg(feature = "dataset")]
pub use dataset::{
    Compression, DatasetError, RecordSet, SegmentationBatcher, SegmentationItem,
    create_segmentation_records,
};

#[cfg(feature = "training")]
pub use training::{
    EvaluationReport, FScoreMetric, IoUScoreMetric, SegmentationLossConfig, SegmentationOutput,
    evaluate,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
