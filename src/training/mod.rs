pub mod evaluate;
pub mod learner;
pub mod loss;
pub mod metrics;

pub use evaluate::{EvaluationReport, evaluate, evaluate_classifier};
pub use learner::{ClassificationOutput, SegmentationOutput};
pub use loss::{
    CategoricalFocalLoss, CategoricalFocalLossConfig, ComboLoss, ComboLossConfig, DiceLoss,
    DiceLossConfig, FocalTverskyLoss, FocalTverskyLossConfig, JaccardLoss, JaccardLossConfig,
    STROKE_CLASS_WEIGHTS, SegmentationLoss, SegmentationLossConfig, SegmentationLossKind,
};
pub use metrics::{
    BinaryAccuracyInput, BinaryAccuracyMetric, FScoreInput, FScoreMetric, IoUScoreInput,
    IoUScoreMetric,
};
