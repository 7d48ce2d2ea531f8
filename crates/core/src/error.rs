//! Error taxonomy for a tiled run.
//!
//! Configuration problems are user-facing and carry enough detail to fix the
//! model description or the run options. Internal errors are invariant
//! failures inside the engine. Inference errors come from the per-patch call.
//! Cancellation is not an error; see [`crate::controller::RunOutcome`].

use thiserror::Error;

use crate::axis::Axis;
use crate::inference::InferenceError;

pub type TilingResult<T> = Result<T, TilingError>;

#[derive(Debug, Error)]
pub enum TilingError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("inference failed on patch {patch}: {source}")]
    Inference {
        patch: usize,
        #[source]
        source: InferenceError,
    },
}

impl TilingError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Short label used as the `kind` field when the error is logged.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration",
            Self::Internal(_) => "internal",
            Self::Inference { .. } => "inference",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid axis layout '{layout}': {reason}")]
    InvalidLayout { layout: String, reason: String },

    #[error("tensor '{tensor}': {reason}")]
    InvalidTensorSpec { tensor: String, reason: String },

    #[error("tensor name '{0}' is declared more than once")]
    DuplicateTensor(String),

    #[error("model declares no image input")]
    NoImageInput,

    #[error("model declares more than one image input: {0:?}")]
    MultipleImageInputs(Vec<String>),

    #[error("no value supplied for input '{0}'")]
    MissingInput(String),

    #[error("input '{name}' expects {expected} data")]
    WrongInputKind { name: String, expected: &'static str },

    #[error(
        "model only accepts a fixed input size; maximum accepted size is {} but the image is {}",
        format_sizes(maximum),
        format_sizes(image)
    )]
    FixedInputTooSmall {
        maximum: Vec<(Axis, usize)>,
        image: Vec<(Axis, usize)>,
    },

    #[error("patch size {patch} on {axis} exceeds three times the image size {extent}")]
    PatchTooLarge {
        axis: Axis,
        patch: usize,
        extent: usize,
    },

    #[error(
        "patch size {patch} on {axis} leaves no region of interest after padding {padding} on each side"
    )]
    HaloExceedsPatch {
        axis: Axis,
        patch: usize,
        padding: usize,
    },

    #[error("image has {actual} channels but the model expects {expected}")]
    ChannelMismatch { expected: usize, actual: usize },

    #[error("image has extent {extent} on {axis}, which the input layout '{layout}' does not contain")]
    AxisNotInLayout {
        axis: Axis,
        extent: usize,
        layout: String,
    },

    #[error("tensor '{tensor}' with layout '{layout}' cannot carry {axis} of size {extent}")]
    LayoutMismatch {
        tensor: String,
        layout: String,
        axis: Axis,
        extent: usize,
    },

    #[error(
        "output '{tensor}' does not match the configured axis order and sizes: expected {} (XYCZB), got {} (XYCZB)",
        format_dims(expected),
        format_dims(actual)
    )]
    OutputShapeMismatch {
        tensor: String,
        expected: [usize; 5],
        actual: [usize; 5],
    },

    #[error("inference result is missing output '{0}'")]
    MissingOutput(String),
}

fn format_sizes(sizes: &[(Axis, usize)]) -> String {
    sizes
        .iter()
        .map(|(axis, size)| format!("{}={size}", axis.symbol()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_dims(dims: &[usize; 5]) -> String {
    dims.iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("x")
}
