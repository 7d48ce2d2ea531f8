//! Stitching per-patch results back into full-size outputs.
//!
//! How each declared output is handled is decided once, when the
//! reconstructor is built: tiled image outputs are stitched into a lazily
//! allocated accumulator, whole-image outputs are shape-checked and kept as
//! they are, and list outputs are collected per patch.

use std::collections::HashMap;
use std::ops::Range;

use ndarray::{s, Array5, ArrayD};
use tracing::trace;

use crate::axis::{Axis, LOGICAL_AXES, SPATIAL_AXES, VOLUME_RANK};
use crate::error::{ConfigError, TilingError, TilingResult};
use crate::model_spec::{ModelSpec, RunOptions, TensorKind, TensorSpec};
use crate::planner::{PatchPlan, PatchRegion};
use crate::volume::{array_byte_size, tensor_to_rows, tensor_to_volume, Calibration, ImageVolume};

/// Rows produced by one patch for a list output.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchRows {
    pub patch_index: usize,
    pub rows: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputValue {
    Image(ImageVolume),
    Rows(Vec<PatchRows>),
}

impl OutputValue {
    pub fn as_image(&self) -> Option<&ImageVolume> {
        match self {
            Self::Image(volume) => Some(volume),
            Self::Rows(_) => None,
        }
    }

    pub fn as_rows(&self) -> Option<&[PatchRows]> {
        match self {
            Self::Image(_) => None,
            Self::Rows(rows) => Some(rows),
        }
    }
}

/// Output strategy, resolved once per tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputPlan {
    Tiled,
    /// Expected extents along X, Y, C, Z; `None` is not checked.
    Whole { expected: [Option<usize>; 4] },
    Rows,
}

impl OutputPlan {
    pub fn resolve(output: &TensorSpec, plan: &PatchPlan, options: RunOptions) -> Self {
        if output.kind == TensorKind::List {
            return Self::Rows;
        }
        if !options.is_whole_image() {
            return Self::Tiled;
        }

        let mut expected = [None; 4];
        for axis in LOGICAL_AXES {
            let slot = axis.volume_slot();
            if !output.layout.contains(axis) {
                expected[slot] = Some(1);
                continue;
            }
            expected[slot] = if options.pyramidal {
                output.pyramid_size_for(axis)
            } else if axis == Axis::Channel {
                output.declared_dim(Axis::Channel)
            } else {
                plan.axis(axis).map(|axis_plan| {
                    let scaled = (axis_plan.patch as f64 * output.scale_for(axis)).floor() as usize;
                    scaled.saturating_sub(output.offset_for(axis))
                })
            };
        }
        Self::Whole { expected }
    }
}

/// Placement of patch results inside a tiled output, fixed by the first patch.
#[derive(Debug, Clone, Copy, PartialEq)]
struct OutputGeometry {
    dims: [usize; VOLUME_RANK],
    /// Output extent over input extent per spatial axis, kept as integers so
    /// the last window always lands on the output edge.
    ratio: [(usize, usize); 3],
    offset: [usize; 3],
}

impl OutputGeometry {
    fn resolve(
        output: &TensorSpec,
        input: &TensorSpec,
        plan: &PatchPlan,
        first_patch: &Array5<f32>,
    ) -> Self {
        let patch_dims = first_patch.shape();
        let mut dims = [
            0,
            0,
            patch_dims[Axis::Channel.volume_slot()],
            0,
            patch_dims[Axis::Batch.volume_slot()],
        ];
        let mut ratio = [(1, 1); 3];
        let mut offset = [0; 3];

        for (i, axis) in SPATIAL_AXES.into_iter().enumerate() {
            let slot = axis.volume_slot();
            let extent = plan.axis(axis).map_or(1, |axis_plan| axis_plan.extent);
            let out_extent = match (output.layout.contains(axis), input.layout.contains(axis)) {
                (true, true) => (extent as f64 * output.scale_for(axis)).floor() as usize,
                (true, false) => patch_dims[slot],
                (false, false) => extent,
                (false, true) => 1,
            };
            dims[slot] = out_extent;
            ratio[i] = (out_extent, extent.max(1));
            offset[i] = output.offset_for(axis);
        }

        Self {
            dims,
            ratio,
            offset,
        }
    }

    fn to_output(&self, i: usize, position: usize) -> usize {
        let (out_extent, extent) = self.ratio[i];
        position * out_extent / extent
    }

    fn factors(&self) -> [f64; 3] {
        self.ratio
            .map(|(out_extent, extent)| out_extent as f64 / extent as f64)
    }
}

struct OutputAccumulator {
    title: String,
    geometry: Option<OutputGeometry>,
    buffer: Option<Array5<f32>>,
}

impl OutputAccumulator {
    fn new(title: String) -> Self {
        Self {
            title,
            geometry: None,
            buffer: None,
        }
    }

    fn write(
        &mut self,
        output: &TensorSpec,
        input: &TensorSpec,
        plan: &PatchPlan,
        region: &PatchRegion,
        result: Array5<f32>,
    ) -> TilingResult<()> {
        let geometry = *self
            .geometry
            .get_or_insert_with(|| OutputGeometry::resolve(output, input, plan, &result));
        let buffer = self
            .buffer
            .get_or_insert_with(|| Array5::zeros(geometry.dims));

        let result_dims = result.shape();
        for axis in [Axis::Channel, Axis::Batch] {
            let slot = axis.volume_slot();
            if result_dims[slot] != geometry.dims[slot] {
                return Err(TilingError::internal(format!(
                    "output '{}' changed {axis} extent from {} to {} between patches",
                    output.name, geometry.dims[slot], result_dims[slot]
                )));
            }
        }

        let mut dest: [Range<usize>; 3] = [0..0, 0..0, 0..0];
        let mut src: [Range<usize>; 3] = [0..0, 0..0, 0..0];
        for (i, axis) in SPATIAL_AXES.into_iter().enumerate() {
            let window = region
                .window(axis)
                .ok_or_else(|| TilingError::internal(format!("{axis} has no patch window")))?;
            let dest_start = geometry.to_output(i, window.image_start);
            let dest_end = geometry.to_output(i, window.image_end);
            let len = dest_end.saturating_sub(dest_start);
            let src_start = geometry
                .to_output(i, window.leftover)
                .checked_sub(geometry.offset[i])
                .ok_or_else(|| {
                    TilingError::internal(format!(
                        "output '{}' offset {} on {axis} exceeds the patch context",
                        output.name, geometry.offset[i]
                    ))
                })?;

            let slot = axis.volume_slot();
            if dest_start + len > geometry.dims[slot] || src_start + len > result_dims[slot] {
                return Err(TilingError::internal(format!(
                    "output '{}' on {axis}: copying {src_start}..{} into {dest_start}..{dest_end} \
                     is out of bounds (patch {}, output {})",
                    output.name,
                    src_start + len,
                    result_dims[slot],
                    geometry.dims[slot]
                )));
            }
            dest[i] = dest_start..dest_start + len;
            src[i] = src_start..src_start + len;
        }

        trace!(output = %output.name, ?dest, ?src, "Writing patch region");

        let [dx, dy, dz] = dest;
        let [sx, sy, sz] = src;
        buffer
            .slice_mut(s![dx, dy, .., dz, ..])
            .assign(&result.slice(s![sx, sy, .., sz, ..]));
        Ok(())
    }

    fn byte_size(&self) -> u64 {
        self.buffer
            .as_ref()
            .map_or(0, |buffer| (buffer.len() * std::mem::size_of::<f32>()) as u64)
    }
}

enum OutputSlot {
    Tiled(OutputAccumulator),
    Whole {
        expected: [Option<usize>; 4],
        result: Option<Array5<f32>>,
    },
    Rows(Vec<PatchRows>),
}

struct DeclaredOutput {
    spec: TensorSpec,
    slot: OutputSlot,
}

pub struct PatchReconstructor {
    plan: PatchPlan,
    input: TensorSpec,
    outputs: Vec<DeclaredOutput>,
    model_name: String,
    image_title: String,
    calibration: Calibration,
}

impl PatchReconstructor {
    pub fn new(
        model: &ModelSpec,
        plan: &PatchPlan,
        options: RunOptions,
        image: &ImageVolume,
    ) -> TilingResult<Self> {
        let input = model.image_input()?.clone();
        let image_title = if image.title().is_empty() {
            "image"
        } else {
            image.title()
        };

        let outputs = model
            .outputs
            .iter()
            .map(|spec| {
                let slot = match OutputPlan::resolve(spec, plan, options) {
                    OutputPlan::Tiled => OutputSlot::Tiled(OutputAccumulator::new(output_title(
                        &spec.name,
                        &model.name,
                        image_title,
                    ))),
                    OutputPlan::Whole { expected } => OutputSlot::Whole {
                        expected,
                        result: None,
                    },
                    OutputPlan::Rows => OutputSlot::Rows(Vec::new()),
                };
                DeclaredOutput {
                    spec: spec.clone(),
                    slot,
                }
            })
            .collect();

        Ok(Self {
            plan: plan.clone(),
            input,
            outputs,
            model_name: model.name.clone(),
            image_title: image_title.to_string(),
            calibration: image.calibration().clone(),
        })
    }

    /// Consumes the raw results of one patch.
    pub fn accept(
        &mut self,
        patch_index: usize,
        region: &PatchRegion,
        mut results: HashMap<String, ArrayD<f32>>,
    ) -> TilingResult<()> {
        for declared in &mut self.outputs {
            let raw = results
                .remove(&declared.spec.name)
                .ok_or_else(|| ConfigError::MissingOutput(declared.spec.name.clone()))?;

            match &mut declared.slot {
                OutputSlot::Tiled(accumulator) => {
                    let result = tensor_to_volume(raw, &declared.spec)?;
                    accumulator.write(&declared.spec, &self.input, &self.plan, region, result)?;
                }
                OutputSlot::Whole { expected, result } => {
                    let volume = tensor_to_volume(raw, &declared.spec)?;
                    check_whole_shape(&declared.spec.name, expected, &volume)?;
                    *result = Some(volume);
                }
                OutputSlot::Rows(collected) => collected.push(PatchRows {
                    patch_index,
                    rows: tensor_to_rows(&raw),
                }),
            }
        }
        Ok(())
    }

    /// Bytes currently held for outputs.
    pub fn buffer_bytes(&self) -> u64 {
        self.outputs
            .iter()
            .map(|declared| match &declared.slot {
                OutputSlot::Tiled(accumulator) => accumulator.byte_size(),
                OutputSlot::Whole { result, .. } => result
                    .as_ref()
                    .map_or(0, |r| (r.len() * std::mem::size_of::<f32>()) as u64),
                OutputSlot::Rows(rows) => rows
                    .iter()
                    .flat_map(|patch| &patch.rows)
                    .map(|row| (row.len() * std::mem::size_of::<f32>()) as u64)
                    .sum(),
            })
            .sum()
    }

    pub fn finish(self) -> TilingResult<HashMap<String, OutputValue>> {
        let mut finished = HashMap::with_capacity(self.outputs.len());
        for declared in self.outputs {
            let name = declared.spec.name;
            let value = match declared.slot {
                OutputSlot::Tiled(accumulator) => {
                    let (Some(buffer), Some(geometry)) = (accumulator.buffer, accumulator.geometry)
                    else {
                        return Err(TilingError::internal(format!(
                            "output '{name}' received no patches"
                        )));
                    };
                    OutputValue::Image(
                        ImageVolume::new(buffer)
                            .with_title(accumulator.title)
                            .with_calibration(scaled_calibration(&self.calibration, &geometry.factors())),
                    )
                }
                OutputSlot::Whole { result, .. } => {
                    let buffer = result.ok_or_else(|| {
                        TilingError::internal(format!("output '{name}' received no result"))
                    })?;
                    OutputValue::Image(
                        ImageVolume::new(buffer)
                            .with_title(output_title(&name, &self.model_name, &self.image_title))
                            .with_calibration(self.calibration.clone()),
                    )
                }
                OutputSlot::Rows(rows) => OutputValue::Rows(rows),
            };
            finished.insert(name, value);
        }
        Ok(finished)
    }
}

pub fn output_title(output: &str, model: &str, image: &str) -> String {
    format!("{output} {model} of {image}")
}

fn check_whole_shape(
    name: &str,
    expected: &[Option<usize>; 4],
    volume: &Array5<f32>,
) -> TilingResult<()> {
    let shape = volume.shape();
    let actual = [shape[0], shape[1], shape[2], shape[3], shape[4]];
    let mismatch = expected
        .iter()
        .zip(actual)
        .any(|(want, got)| want.is_some_and(|want| want != got));
    if mismatch {
        let mut declared = actual;
        for (slot, want) in expected.iter().enumerate() {
            if let Some(want) = want {
                declared[slot] = *want;
            }
        }
        return Err(ConfigError::OutputShapeMismatch {
            tensor: name.to_string(),
            expected: declared,
            actual,
        }
        .into());
    }
    Ok(())
}

fn scaled_calibration(calibration: &Calibration, factor: &[f64; 3]) -> Calibration {
    let scale = |pixel: f64, f: f64| if f > 0.0 { pixel / f } else { pixel };
    Calibration {
        pixel_width: scale(calibration.pixel_width, factor[0]),
        pixel_height: scale(calibration.pixel_height, factor[1]),
        pixel_depth: scale(calibration.pixel_depth, factor[2]),
        unit: calibration.unit.clone(),
    }
}

/// Bytes held by one patch's raw results.
pub fn results_byte_size(results: &HashMap<String, ArrayD<f32>>) -> u64 {
    results.values().map(array_byte_size).sum()
}
