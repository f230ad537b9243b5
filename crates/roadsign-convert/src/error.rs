use core::fmt;

use crate::state_dict::Layout;

/// Check that compares two forward passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Channel-first model against the float channel-last graph.
    Float,
    /// Float channel-last graph against the decoded int8 artifact.
    Quantized,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Float => f.write_str("channel-last graph"),
            Stage::Quantized => f.write_str("quantized artifact"),
        }
    }
}

/// Errors raised while converting a model. Every variant aborts the conversion
/// before anything is written to disk.
#[derive(thiserror::Error, Debug)]
pub enum ConversionError {
    #[error("Parameter names do not match: missing {missing:?}, unexpected {unexpected:?}")]
    NameMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("Parameter `{name}` has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Expected a {expected:?} state dict, got {actual:?}")]
    LayoutMismatch { expected: Layout, actual: Layout },

    #[error(
        "{stage} output differs from its reference by {max_diff:e}, above the tolerance of {tolerance:e}"
    )]
    Equivalence {
        stage: Stage,
        max_diff: f32,
        tolerance: f32,
    },

    #[error("Invalid graph: {0}")]
    Graph(String),

    #[error("Invalid interchange file: {0}")]
    Interchange(String),

    #[error("Tensor data error: {0}")]
    TensorData(String),

    #[error("Layout error: {0}")]
    Layout(#[from] ndarray::ShapeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Model(#[from] roadsign::Error),
}

/// Errors raised while encoding or decoding a `.rsq` artifact.
#[derive(thiserror::Error, Debug)]
pub enum ArtifactError {
    #[error("Not a roadsign artifact, found magic bytes {0:?}")]
    BadMagic([u8; 4]),

    #[error("Artifact is truncated: {needed} bytes needed, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid artifact header: {0}")]
    Header(#[from] serde_json::Error),

    #[error("Tensor `{0}` is not stored in the artifact")]
    MissingTensor(String),

    #[error("Tensor `{name}` is malformed: {reason}")]
    InvalidTensor { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
