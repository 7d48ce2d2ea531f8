//! Tensor and model descriptions.
//!
//! A [`ModelSpec`] is loaded once (usually from TOML) and validated before a
//! run. Nothing in a run writes back into it; values derived from the image,
//! like the final patch size, live in [`crate::planner::PatchPlan`].

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::axis::{Axis, AxisLayout};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorKind {
    #[default]
    Image,
    Parameter,
    List,
}

/// Per-axis vectors are indexed by layout position; an empty vector means "use the default".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TensorSpec {
    pub name: String,
    pub kind: TensorKind,
    pub layout: AxisLayout,
    /// Declared tensor shape, `-1` for dynamic dimensions.
    pub shape: Vec<i64>,
    pub recommended_patch: Vec<usize>,
    /// `0` means the axis must match the image extent exactly.
    pub step: Vec<usize>,
    pub minimum_size: Vec<usize>,
    pub halo: Vec<usize>,
    pub offset: Vec<usize>,
    pub scale: Vec<f64>,
    pub pyramid_output_size: Vec<usize>,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, kind: TensorKind, layout: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            name: name.into(),
            kind,
            layout: AxisLayout::parse(layout)?,
            ..Self::default()
        })
    }

    pub fn with_patch(mut self, patch: Vec<usize>) -> Self {
        self.recommended_patch = patch;
        self
    }

    pub fn with_step(mut self, step: Vec<usize>) -> Self {
        self.step = step;
        self
    }

    pub fn with_minimum_size(mut self, minimum_size: Vec<usize>) -> Self {
        self.minimum_size = minimum_size;
        self
    }

    pub fn with_halo(mut self, halo: Vec<usize>) -> Self {
        self.halo = halo;
        self
    }

    pub fn with_offset(mut self, offset: Vec<usize>) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_scale(mut self, scale: Vec<f64>) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_shape(mut self, shape: Vec<i64>) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_pyramid_output_size(mut self, size: Vec<usize>) -> Self {
        self.pyramid_output_size = size;
        self
    }

    fn per_axis<T: Copy>(&self, values: &[T], axis: Axis, default: T) -> T {
        self.layout
            .index_of(axis)
            .and_then(|index| values.get(index).copied())
            .unwrap_or(default)
    }

    pub fn patch_for(&self, axis: Axis) -> usize {
        self.per_axis(&self.recommended_patch, axis, 1)
    }

    pub fn step_for(&self, axis: Axis) -> usize {
        self.per_axis(&self.step, axis, 1)
    }

    pub fn minimum_for(&self, axis: Axis) -> usize {
        self.per_axis(&self.minimum_size, axis, 1)
    }

    pub fn halo_for(&self, axis: Axis) -> usize {
        self.per_axis(&self.halo, axis, 0)
    }

    pub fn offset_for(&self, axis: Axis) -> usize {
        self.per_axis(&self.offset, axis, 0)
    }

    pub fn scale_for(&self, axis: Axis) -> f64 {
        self.per_axis(&self.scale, axis, 1.0)
    }

    /// Fixed dimension declared in `shape`, `None` when dynamic or undeclared.
    pub fn declared_dim(&self, axis: Axis) -> Option<usize> {
        let value = self.per_axis(&self.shape, axis, -1);
        usize::try_from(value).ok().filter(|dim| *dim > 0)
    }

    pub fn pyramid_size_for(&self, axis: Axis) -> Option<usize> {
        let index = self.layout.index_of(axis)?;
        self.pyramid_output_size.get(index).copied()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidTensorSpec {
            tensor: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("tensor name must not be empty".to_string()));
        }
        if self.kind == TensorKind::Image && self.layout.is_empty() {
            return Err(invalid("image tensors need a non-empty layout".to_string()));
        }

        let rank = self.layout.len();
        let lengths = [
            ("shape", self.shape.len()),
            ("recommended_patch", self.recommended_patch.len()),
            ("step", self.step.len()),
            ("minimum_size", self.minimum_size.len()),
            ("halo", self.halo.len()),
            ("offset", self.offset.len()),
            ("scale", self.scale.len()),
            ("pyramid_output_size", self.pyramid_output_size.len()),
        ];
        for (field, len) in lengths {
            if len != 0 && len != rank {
                return Err(invalid(format!(
                    "{field} has {len} entries but layout '{}' has {rank} axes",
                    self.layout
                )));
            }
        }

        if self.recommended_patch.contains(&0) {
            return Err(invalid("recommended_patch entries must be positive".to_string()));
        }
        if self.scale.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(invalid("scale entries must be finite and positive".to_string()));
        }
        Ok(())
    }
}

/// Mode flags for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    pub allow_patching: bool,
    /// The model consumes and produces the whole image in one call.
    pub pyramidal: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            allow_patching: true,
            pyramidal: false,
        }
    }
}

impl RunOptions {
    /// Whole-image runs skip tiling entirely.
    pub fn is_whole_image(&self) -> bool {
        self.pyramidal || !self.allow_patching
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSpec {
    pub name: String,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

impl ModelSpec {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read model description: {}", path.display()))?;
        let spec: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse model description: {}", path.display()))?;
        spec.validate()
            .with_context(|| format!("invalid model description: {}", path.display()))?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for tensor in self.inputs.iter().chain(&self.outputs) {
            tensor.validate()?;
            if !seen.insert(tensor.name.as_str()) {
                return Err(ConfigError::DuplicateTensor(tensor.name.clone()));
            }
        }

        if let Some(bad) = self.inputs.iter().find(|t| t.kind == TensorKind::List) {
            return Err(ConfigError::InvalidTensorSpec {
                tensor: bad.name.clone(),
                reason: "inputs must be image or parameter tensors".to_string(),
            });
        }
        if let Some(bad) = self.outputs.iter().find(|t| t.kind == TensorKind::Parameter) {
            return Err(ConfigError::InvalidTensorSpec {
                tensor: bad.name.clone(),
                reason: "outputs must be image or list tensors".to_string(),
            });
        }

        let images: Vec<&TensorSpec> = self
            .inputs
            .iter()
            .filter(|t| t.kind == TensorKind::Image)
            .collect();
        match images.len() {
            0 => Err(ConfigError::NoImageInput),
            1 => Ok(()),
            _ => Err(ConfigError::MultipleImageInputs(
                images.iter().map(|t| t.name.clone()).collect(),
            )),
        }
    }

    /// The single image input. Call after [`ModelSpec::validate`].
    pub fn image_input(&self) -> Result<&TensorSpec, ConfigError> {
        self.inputs
            .iter()
            .find(|t| t.kind == TensorKind::Image)
            .ok_or(ConfigError::NoImageInput)
    }

    pub fn image_outputs(&self) -> impl Iterator<Item = &TensorSpec> {
        self.outputs.iter().filter(|t| t.kind == TensorKind::Image)
    }
}
