use thiserror::Error;

/// Errors raised while wiring a segmentation network onto a backbone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("No layer with name `{name}` in backbone `{backbone}`")]
    UnknownLayer { backbone: String, name: String },

    #[error("Layer index {index} is out of range for backbone `{backbone}` ({len} layers)")]
    LayerIndexOutOfRange {
        backbone: String,
        index: usize,
        len: usize,
    },

    #[error("Unknown {which} block type `{got}`")]
    UnknownBlockType { which: &'static str, got: String },

    #[error("Unknown backbone `{0}`")]
    UnknownBackbone(String),

    #[error("{stage}: skip at level {found} cannot be merged with features at level {expected}")]
    ScaleMismatch {
        stage: String,
        expected: i32,
        found: i32,
    },

    #[error("{model}: decoder output lands at level {level} instead of the input resolution")]
    OutputScale { model: &'static str, level: i32 },

    #[error(
        "Cannot mask a {input_channels}-channel input with a {classes}-class output; use 1 class or as many classes as input channels"
    )]
    MaskChannels {
        classes: usize,
        input_channels: usize,
    },

    #[error("Decoder 2 stage {stage} has a backbone skip but the second encoder only has {available}")]
    MissingSkip { stage: usize, available: usize },

    #[error("Lattice node ({row}, {col}) has no input feature")]
    MissingLatticeNode { row: usize, col: usize },

    #[error("Index {index} wraps outside a sequence of length {len}")]
    WrappedIndex { index: isize, len: usize },

    #[error("{loss} loss has {got} class weights for a {expected}-class output")]
    ClassWeights {
        loss: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Failed to load weights from `{path}`: {reason}")]
    Weights { path: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
