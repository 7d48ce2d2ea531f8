//! The per-patch inference seam.
//!
//! The controller only needs "tensors in, tensors out". Real backends
//! ([`crate::backend::OrtInference`]) and test stubs both implement
//! [`PatchInference`]; closures get an implementation for free.

use std::collections::HashMap;

use ndarray::ArrayD;
use thiserror::Error;

pub type TensorMap = HashMap<String, ArrayD<f32>>;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error(
        "input dimensions do not match what the model accepts: {0}. \
         Check the axis layout and patch size of the model description"
    )]
    DimensionMismatch(String),

    #[error(
        "model weights are not initialized: {0}. \
         Re-export the model with its variables included"
    )]
    UninitializedWeights(String),

    #[error("inference backend failed: {0}")]
    Backend(String),
}

impl InferenceError {
    pub fn category(&self) -> &'static str {
        match self {
            Self::DimensionMismatch(_) => "dimension_mismatch",
            Self::UninitializedWeights(_) => "uninitialized_weights",
            Self::Backend(_) => "unknown",
        }
    }

    /// Sorts a backend message into a category by what it says.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        let mentions = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

        if mentions(&[
            "uninitialized",
            "not initialized",
            "initializer",
            "missing weight",
        ]) {
            Self::UninitializedWeights(message)
        } else if mentions(&[
            "dimension",
            "shape",
            "rank",
            "invalid_argument",
            "invalid argument",
        ]) {
            Self::DimensionMismatch(message)
        } else {
            Self::Backend(message)
        }
    }
}

/// Runs the model on one patch.
///
/// `inputs` holds the image patch and any parameter tensors under their
/// declared names, already in each tensor's axis layout. The result must
/// contain one entry per declared output.
pub trait PatchInference {
    fn infer(&mut self, inputs: &TensorMap) -> Result<TensorMap, InferenceError>;
}

impl<F> PatchInference for F
where
    F: FnMut(&TensorMap) -> Result<TensorMap, InferenceError>,
{
    fn infer(&mut self, inputs: &TensorMap) -> Result<TensorMap, InferenceError> {
        self(inputs)
    }
}
