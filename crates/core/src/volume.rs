//! Dense image volumes and conversion to and from model tensors.

use ndarray::{Array5, ArrayD, ArrayView5, Axis as NdAxis, Ix5, IxDyn};
use serde::{Deserialize, Serialize};

use crate::axis::{Axis, VOLUME_RANK};
use crate::error::{ConfigError, TilingError, TilingResult};
use crate::model_spec::TensorSpec;

/// Physical pixel size; passed through to outputs, never used by the tiling math.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub pixel_width: f64,
    pub pixel_height: f64,
    pub pixel_depth: f64,
    pub unit: String,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            pixel_width: 1.0,
            pixel_height: 1.0,
            pixel_depth: 1.0,
            unit: "pixel".to_string(),
        }
    }
}

/// A volume indexed `[x, y, c, z, t]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageVolume {
    data: Array5<f32>,
    title: String,
    calibration: Calibration,
}

impl ImageVolume {
    pub fn new(data: Array5<f32>) -> Self {
        Self {
            data,
            title: String::new(),
            calibration: Calibration::default(),
        }
    }

    pub fn zeros(dims: [usize; VOLUME_RANK]) -> Self {
        Self::new(Array5::zeros(dims))
    }

    pub fn from_fn(dims: [usize; VOLUME_RANK], mut f: impl FnMut([usize; VOLUME_RANK]) -> f32) -> Self {
        Self::new(Array5::from_shape_fn(dims, |(x, y, c, z, t)| f([x, y, c, z, t])))
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_calibration(mut self, calibration: Calibration) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn dims(&self) -> [usize; VOLUME_RANK] {
        let shape = self.data.shape();
        [shape[0], shape[1], shape[2], shape[3], shape[4]]
    }

    pub fn extent(&self, axis: Axis) -> usize {
        self.data.len_of(NdAxis(axis.volume_slot()))
    }

    pub fn data(&self) -> &Array5<f32> {
        &self.data
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn byte_size(&self) -> u64 {
        (self.data.len() * std::mem::size_of::<f32>()) as u64
    }

    /// Human-readable size, e.g. `512x512x3x1x1`.
    pub fn size_label(&self) -> String {
        self.dims()
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("x")
    }
}

pub fn array_byte_size(array: &ArrayD<f32>) -> u64 {
    (array.len() * std::mem::size_of::<f32>()) as u64
}

/// Reorders a `[x, y, c, z, t]` block into the tensor's layout. Frames ride on the B axis.
pub fn volume_to_tensor(volume: ArrayView5<'_, f32>, tensor: &TensorSpec) -> TilingResult<ArrayD<f32>> {
    let layout = &tensor.layout;
    let mut order: Vec<usize> = layout.axes().iter().map(|axis| axis.volume_slot()).collect();

    for slot in 0..VOLUME_RANK {
        if order.contains(&slot) {
            continue;
        }
        let extent = volume.len_of(NdAxis(slot));
        if extent > 1 {
            let axis = Axis::from_volume_slot(slot)
                .ok_or_else(|| TilingError::internal(format!("volume slot {slot} out of range")))?;
            return Err(ConfigError::LayoutMismatch {
                tensor: tensor.name.clone(),
                layout: layout.to_string(),
                axis,
                extent,
            }
            .into());
        }
        order.push(slot);
    }

    let tensor_shape: Vec<usize> = layout
        .axes()
        .iter()
        .map(|axis| volume.len_of(NdAxis(axis.volume_slot())))
        .collect();

    volume
        .permuted_axes(into_ix5(&order)?)
        .as_standard_layout()
        .into_owned()
        .into_dyn()
        .into_shape_with_order(IxDyn(&tensor_shape))
        .map_err(|error| {
            TilingError::internal(format!("failed to reshape '{}' patch: {error}", tensor.name))
        })
}

/// Brings a raw model result back into `[x, y, c, z, t]` order. Axes missing from
/// the layout come back with extent 1.
pub fn tensor_to_volume(array: ArrayD<f32>, tensor: &TensorSpec) -> TilingResult<Array5<f32>> {
    let layout = &tensor.layout;
    if array.ndim() != layout.len() {
        return Err(ConfigError::InvalidTensorSpec {
            tensor: tensor.name.clone(),
            reason: format!(
                "result has rank {} but layout '{layout}' has {} axes",
                array.ndim(),
                layout.len()
            ),
        }
        .into());
    }

    let mut current: Vec<usize> = layout.axes().iter().map(|axis| axis.volume_slot()).collect();
    let mut expanded = array;
    for slot in 0..VOLUME_RANK {
        if !current.contains(&slot) {
            let ndim = expanded.ndim();
            expanded = expanded.insert_axis(NdAxis(ndim));
            current.push(slot);
        }
    }

    let mut permutation = Vec::with_capacity(VOLUME_RANK);
    for slot in 0..VOLUME_RANK {
        let position = current
            .iter()
            .position(|s| *s == slot)
            .ok_or_else(|| TilingError::internal(format!("volume slot {slot} missing")))?;
        permutation.push(position);
    }

    let ordered = expanded
        .permuted_axes(IxDyn(&permutation))
        .into_dimensionality::<Ix5>()
        .map_err(|error| {
            TilingError::internal(format!("failed to reorder '{}' result: {error}", tensor.name))
        })?;
    Ok(ordered.as_standard_layout().into_owned())
}

/// Flattens a list-kind result into rows. A vector is one column; higher ranks keep
/// the first axis as rows and flatten the rest into columns.
pub fn tensor_to_rows(array: &ArrayD<f32>) -> Vec<Vec<f32>> {
    match array.ndim() {
        0 => vec![array.iter().copied().collect()],
        1 => array.iter().map(|value| vec![*value]).collect(),
        _ => array
            .outer_iter()
            .map(|row| row.iter().copied().collect())
            .collect(),
    }
}

fn into_ix5(order: &[usize]) -> TilingResult<[usize; VOLUME_RANK]> {
    order
        .try_into()
        .map_err(|_| TilingError::internal(format!("axis order {order:?} is not 5-dimensional")))
}
