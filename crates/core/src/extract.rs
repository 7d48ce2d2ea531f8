use std::ops::Range;

use ndarray::s;

use crate::axis::{Axis, SPATIAL_AXES};
use crate::error::{TilingError, TilingResult};
use crate::planner::{PatchPlan, PatchRegion};
use crate::volume::ImageVolume;

/// Copies one patch out of the mirrored image, across all channels and frames.
///
/// A window outside the mirrored extent means the plan and the mirror disagree;
/// that is reported as an internal error.
pub fn extract_patch(
    mirrored: &ImageVolume,
    plan: &PatchPlan,
    region: &PatchRegion,
) -> TilingResult<ImageVolume> {
    let mut ranges: [Range<usize>; 3] = [0..0, 0..0, 0..0];
    for (slot, axis) in SPATIAL_AXES.into_iter().enumerate() {
        ranges[slot] = source_range(mirrored, plan, region, axis)?;
    }
    let [xs, ys, zs] = ranges;

    let patch = mirrored
        .data()
        .slice(s![xs, ys, .., zs, ..])
        .to_owned();
    Ok(ImageVolume::new(patch))
}

fn source_range(
    mirrored: &ImageVolume,
    plan: &PatchPlan,
    region: &PatchRegion,
    axis: Axis,
) -> TilingResult<Range<usize>> {
    let (Some(axis_plan), Some(window)) = (plan.axis(axis), region.window(axis)) else {
        return Err(TilingError::internal(format!("{axis} has no patch window")));
    };

    let start = window
        .mirror_start
        .checked_sub(axis_plan.overlap)
        .ok_or_else(|| {
            TilingError::internal(format!(
                "patch window on {axis} starts before the mirrored image (start {}, overlap {})",
                window.mirror_start, axis_plan.overlap
            ))
        })?;
    let end = start + axis_plan.patch;
    let available = mirrored.extent(axis);
    if end > available {
        return Err(TilingError::internal(format!(
            "patch window {start}..{end} on {axis} exceeds mirrored extent {available}"
        )));
    }
    Ok(start..end)
}
