//! Patch planning: patch size, padding, region of interest and grid per axis.
//!
//! Planning is pure and happens once per run. The resulting [`PatchPlan`] is
//! never mutated; the controller only asks it for windows.

use serde::Serialize;
use tracing::debug;

use crate::axis::{Axis, LOGICAL_AXES, SPATIAL_AXES};
use crate::error::ConfigError;
use crate::mirror::{AxisPadding, MirrorPadding};
use crate::model_spec::{ModelSpec, RunOptions, TensorSpec};

/// Patches may not exceed this multiple of the image extent.
const MAX_PATCH_TO_IMAGE_RATIO: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AxisPlan {
    pub axis: Axis,
    pub extent: usize,
    pub patch: usize,
    /// Context discarded on each side of a patch's output.
    pub padding: usize,
    pub roi: usize,
    pub count: usize,
    #[serde(skip)]
    pub mirror: AxisPadding,
    /// Samples read before the ROI start of every window.
    pub overlap: usize,
}

/// One patch along one axis. `mirror_start` is in mirrored-image coordinates,
/// `image_start..image_end` in input coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchWindow {
    pub mirror_start: usize,
    pub image_start: usize,
    pub image_end: usize,
    /// Offset of `image_start` inside the patch.
    pub leftover: usize,
}

impl PatchWindow {
    pub fn roi_len(&self) -> usize {
        self.image_end - self.image_start
    }
}

impl AxisPlan {
    fn whole(axis: Axis, extent: usize) -> Self {
        Self {
            axis,
            extent,
            patch: extent,
            padding: 0,
            roi: extent,
            count: 1,
            mirror: AxisPadding::default(),
            overlap: 0,
        }
    }

    /// The patch covers the whole extent; the surplus becomes mirrored context.
    fn single(axis: Axis, extent: usize, patch: usize) -> Self {
        let surplus = patch.saturating_sub(extent);
        let before = surplus.div_ceil(2);
        Self {
            axis,
            extent,
            patch,
            padding: 0,
            roi: extent,
            count: 1,
            mirror: AxisPadding::new(before, surplus - before),
            overlap: before,
        }
    }

    /// One sample per patch, for axes the model does not see.
    fn slices(axis: Axis, extent: usize) -> Self {
        Self {
            axis,
            extent,
            patch: 1,
            padding: 0,
            roi: 1,
            count: extent,
            mirror: AxisPadding::default(),
            overlap: 0,
        }
    }

    /// The last window shrinks its ROI to the remaining samples; it is never padded.
    pub fn window(&self, index: usize) -> PatchWindow {
        let image_start = self.roi * index;
        if index + 1 < self.count || self.count == 1 {
            PatchWindow {
                mirror_start: self.overlap + image_start,
                image_start,
                image_end: (image_start + self.roi).min(self.extent),
                leftover: self.overlap,
            }
        } else {
            let image_end = self.extent;
            PatchWindow {
                mirror_start: self.extent + self.overlap - self.roi,
                image_start,
                image_end,
                leftover: self.overlap + self.roi - (image_end - image_start),
            }
        }
    }
}

/// The windows of one patch along the spatial axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchRegion {
    pub width: PatchWindow,
    pub height: PatchWindow,
    pub depth: PatchWindow,
}

impl PatchRegion {
    pub fn window(&self, axis: Axis) -> Option<&PatchWindow> {
        match axis {
            Axis::Width => Some(&self.width),
            Axis::Height => Some(&self.height),
            Axis::Depth => Some(&self.depth),
            Axis::Channel | Axis::Batch => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchPlan {
    pub width: AxisPlan,
    pub height: AxisPlan,
    pub channel: AxisPlan,
    pub depth: AxisPlan,
    pub whole_image: bool,
}

impl PatchPlan {
    pub fn axis(&self, axis: Axis) -> Option<&AxisPlan> {
        match axis {
            Axis::Width => Some(&self.width),
            Axis::Height => Some(&self.height),
            Axis::Channel => Some(&self.channel),
            Axis::Depth => Some(&self.depth),
            Axis::Batch => None,
        }
    }

    pub fn axes(&self) -> [&AxisPlan; 4] {
        [&self.width, &self.height, &self.channel, &self.depth]
    }

    /// Patch counts along X, Y, C, Z.
    pub fn grid(&self) -> [usize; 4] {
        [
            self.width.count,
            self.height.count,
            self.channel.count,
            self.depth.count,
        ]
    }

    pub fn total_patches(&self) -> usize {
        self.width.count * self.height.count * self.depth.count
    }

    /// Windows for grid position `(ix, iy, iz)`.
    pub fn region(&self, ix: usize, iy: usize, iz: usize) -> PatchRegion {
        PatchRegion {
            width: self.width.window(ix),
            height: self.height.window(iy),
            depth: self.depth.window(iz),
        }
    }

    pub fn mirror_padding(&self) -> MirrorPadding {
        MirrorPadding {
            width: self.width.mirror,
            height: self.height.mirror,
            depth: self.depth.mirror,
        }
    }
}

pub struct PatchPlanner<'a> {
    model: &'a ModelSpec,
    options: RunOptions,
}

impl<'a> PatchPlanner<'a> {
    pub fn new(model: &'a ModelSpec, options: RunOptions) -> Self {
        Self { model, options }
    }

    /// `extents` are the image sizes along X, Y, C, Z.
    pub fn plan(&self, extents: [usize; 4]) -> Result<PatchPlan, ConfigError> {
        let input = self.model.image_input()?;
        let extent_of = |axis: Axis| extents[axis.volume_slot()];

        check_channels(input, extent_of(Axis::Channel))?;

        let mut patches = [1usize; 4];
        for axis in LOGICAL_AXES {
            if input.layout.contains(axis) {
                patches[axis.volume_slot()] = input.patch_for(axis);
            }
        }

        if self.options.is_whole_image() {
            grow_to_image(input, extents, &mut patches)?;
        }

        for axis in SPATIAL_AXES {
            let extent = extent_of(axis);
            let patch = patches[axis.volume_slot()];
            if patch > MAX_PATCH_TO_IMAGE_RATIO * extent {
                return Err(ConfigError::PatchTooLarge {
                    axis,
                    patch,
                    extent,
                });
            }
        }

        let mut plans = [AxisPlan::whole(Axis::Width, 0); 3];
        for (slot, axis) in SPATIAL_AXES.into_iter().enumerate() {
            let extent = extent_of(axis);
            let patch = patches[axis.volume_slot()];
            plans[slot] = if self.options.is_whole_image() {
                if !input.layout.contains(axis) && extent > 1 {
                    return Err(ConfigError::AxisNotInLayout {
                        axis,
                        extent,
                        layout: input.layout.to_string(),
                    });
                }
                AxisPlan::single(axis, extent, patch)
            } else if !input.layout.contains(axis) {
                AxisPlan::slices(axis, extent)
            } else {
                self.tile_axis(axis, extent, patch)?
            };
        }
        let [width, height, depth] = plans;

        let plan = PatchPlan {
            width,
            height,
            channel: AxisPlan::whole(Axis::Channel, extent_of(Axis::Channel)),
            depth,
            whole_image: self.options.is_whole_image(),
        };

        debug!(
            grid = ?plan.grid(),
            total = plan.total_patches(),
            patch = ?[plan.width.patch, plan.height.patch, plan.channel.patch, plan.depth.patch],
            roi = ?[plan.width.roi, plan.height.roi, plan.channel.roi, plan.depth.roi],
            whole_image = plan.whole_image,
            "Planned patch grid"
        );

        Ok(plan)
    }

    fn tile_axis(&self, axis: Axis, extent: usize, patch: usize) -> Result<AxisPlan, ConfigError> {
        let padding = self.required_padding(axis);
        if patch <= 2 * padding {
            return Err(ConfigError::HaloExceedsPatch {
                axis,
                patch,
                padding,
            });
        }

        let roi = patch - 2 * padding;
        if roi > extent {
            let plan = AxisPlan::single(axis, extent, patch);
            return Ok(AxisPlan {
                padding: plan.overlap,
                ..plan
            });
        }

        Ok(AxisPlan {
            axis,
            extent,
            patch,
            padding,
            roi,
            count: extent.div_ceil(roi),
            mirror: AxisPadding::new(padding, padding),
            overlap: padding,
        })
    }

    /// Context needed by the most demanding image output on `axis`.
    fn required_padding(&self, axis: Axis) -> usize {
        self.model
            .image_outputs()
            .filter(|output| output.layout.contains(axis))
            .map(|output| {
                let scale = output.scale_for(axis);
                let offset = (output.offset_for(axis) as f64 / scale).ceil() as usize;
                let halo = (output.halo_for(axis) as f64 / scale).ceil() as usize;
                offset + halo
            })
            .max()
            .unwrap_or(0)
    }
}

fn check_channels(input: &TensorSpec, channels: usize) -> Result<(), ConfigError> {
    if !input.layout.contains(Axis::Channel) && channels > 1 {
        return Err(ConfigError::AxisNotInLayout {
            axis: Axis::Channel,
            extent: channels,
            layout: input.layout.to_string(),
        });
    }
    match input.declared_dim(Axis::Channel) {
        Some(expected) if expected != channels => Err(ConfigError::ChannelMismatch {
            expected,
            actual: channels,
        }),
        _ => Ok(()),
    }
}

/// Whole-image runs need a patch at least as large as the image, reachable from
/// the minimum size in whole steps. Fixed-size axes (step 0) cannot grow.
fn grow_to_image(
    input: &TensorSpec,
    extents: [usize; 4],
    patches: &mut [usize; 4],
) -> Result<(), ConfigError> {
    let mut too_small = false;
    for axis in SPATIAL_AXES {
        if !input.layout.contains(axis) {
            continue;
        }
        let slot = axis.volume_slot();
        let extent = extents[slot];
        let step = input.step_for(axis);
        if step == 0 {
            too_small |= patches[slot] < extent;
        } else if patches[slot] != extent {
            let minimum = input.minimum_for(axis);
            let steps = extent.saturating_sub(minimum).div_ceil(step);
            patches[slot] = steps * step + minimum;
        }
    }

    if too_small {
        let present: Vec<Axis> = SPATIAL_AXES
            .into_iter()
            .filter(|axis| input.layout.contains(*axis))
            .collect();
        return Err(ConfigError::FixedInputTooSmall {
            maximum: present
                .iter()
                .map(|axis| (*axis, patches[axis.volume_slot()]))
                .collect(),
            image: present
                .iter()
                .map(|axis| (*axis, extents[axis.volume_slot()]))
                .collect(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_spec::TensorKind;

    fn model(input: TensorSpec, outputs: Vec<TensorSpec>) -> ModelSpec {
        ModelSpec {
            name: "test".to_string(),
            inputs: vec![input],
            outputs,
        }
    }

    fn halo_model(patch: usize, step: usize, halo: usize) -> ModelSpec {
        let input = TensorSpec::new("input", TensorKind::Image, "BYXC")
            .expect("layout")
            .with_patch(vec![1, patch, patch, 1])
            .with_step(vec![1, step, step, 1]);
        let output = TensorSpec::new("output", TensorKind::Image, "BYXC")
            .expect("layout")
            .with_halo(vec![0, halo, halo, 0]);
        model(input, vec![output])
    }

    #[test]
    fn ten_by_ten_with_halo_one() {
        let spec = halo_model(6, 2, 1);
        let plan = PatchPlanner::new(&spec, RunOptions::default())
            .plan([10, 10, 1, 1])
            .expect("plan");

        assert_eq!(plan.width.padding, 1);
        assert_eq!(plan.width.roi, 4);
        assert_eq!(plan.height.roi, 4);
        assert_eq!(plan.grid(), [3, 3, 1, 1]);
        assert_eq!(plan.total_patches(), 9);

        let windows: Vec<PatchWindow> = (0..3).map(|i| plan.width.window(i)).collect();
        assert_eq!(
            windows[0],
            PatchWindow {
                mirror_start: 1,
                image_start: 0,
                image_end: 4,
                leftover: 1
            }
        );
        assert_eq!(
            windows[2],
            PatchWindow {
                mirror_start: 7,
                image_start: 8,
                image_end: 10,
                leftover: 3
            }
        );
        assert_eq!(plan.mirror_padding().width, AxisPadding::new(1, 1));
    }

    #[test]
    fn roi_contributions_cover_extent_exactly() {
        for extent in 1..40usize {
            for patch in [4usize, 6, 9, 16] {
                for halo in 0..2usize {
                    let spec = halo_model(patch, 1, halo);
                    let Ok(plan) = PatchPlanner::new(&spec, RunOptions::default())
                        .plan([extent, extent, 1, 1])
                    else {
                        continue;
                    };
                    let axis = &plan.width;
                    let rois: Vec<usize> =
                        (0..axis.count).map(|i| axis.window(i).roi_len()).collect();
                    assert_eq!(rois.iter().sum::<usize>(), extent, "n={extent} p={patch}");
                    let last = *rois.last().expect("at least one patch");
                    assert!(rois.iter().all(|roi| last <= *roi));

                    // windows stay inside the mirrored extent
                    let mirrored = extent + axis.mirror.total();
                    for i in 0..axis.count {
                        let window = axis.window(i);
                        assert!(window.mirror_start >= axis.overlap);
                        assert!(window.mirror_start - axis.overlap + axis.patch <= mirrored);
                    }
                }
            }
        }
    }

    #[test]
    fn planning_is_idempotent() {
        let spec = halo_model(16, 4, 3);
        let planner = PatchPlanner::new(&spec, RunOptions::default());
        let first = planner.plan([37, 21, 1, 1]).expect("plan");
        let second = planner.plan([37, 21, 1, 1]).expect("plan");
        assert_eq!(first, second);
    }

    #[test]
    fn exact_fit_needs_no_mirroring() {
        let spec = halo_model(8, 1, 0);
        let plan = PatchPlanner::new(&spec, RunOptions::default())
            .plan([8, 8, 1, 1])
            .expect("plan");
        assert_eq!(plan.grid(), [1, 1, 1, 1]);
        assert!(plan.mirror_padding().is_zero());
    }

    #[test]
    fn small_image_turns_surplus_into_context() {
        let spec = halo_model(16, 1, 2);
        let plan = PatchPlanner::new(&spec, RunOptions::default())
            .plan([6, 6, 1, 1])
            .expect("plan");
        assert_eq!(plan.width.roi, 6);
        assert_eq!(plan.width.count, 1);
        assert_eq!(plan.width.mirror, AxisPadding::new(5, 5));
        assert_eq!(plan.width.overlap, 5);
        assert_eq!(plan.width.padding, 5);
    }

    #[test]
    fn odd_surplus_puts_extra_sample_before() {
        let spec = halo_model(16, 1, 2);
        let plan = PatchPlanner::new(&spec, RunOptions::default())
            .plan([7, 7, 1, 1])
            .expect("plan");
        assert_eq!(plan.width.mirror, AxisPadding::new(5, 4));
        assert_eq!(plan.width.window(0).mirror_start, 5);
    }

    #[test]
    fn fixed_size_model_rejects_larger_image_in_whole_mode() {
        let input = TensorSpec::new("input", TensorKind::Image, "YX")
            .expect("layout")
            .with_patch(vec![64, 64])
            .with_step(vec![0, 0]);
        let spec = model(input, vec![]);
        let options = RunOptions {
            allow_patching: false,
            pyramidal: false,
        };

        let error = PatchPlanner::new(&spec, options)
            .plan([100, 80, 1, 1])
            .expect_err("fixed input");
        assert_eq!(
            error,
            ConfigError::FixedInputTooSmall {
                maximum: vec![(Axis::Width, 64), (Axis::Height, 64)],
                image: vec![(Axis::Width, 100), (Axis::Height, 80)],
            }
        );
    }

    #[test]
    fn whole_mode_grows_patch_by_step() {
        let input = TensorSpec::new("input", TensorKind::Image, "XY")
            .expect("layout")
            .with_patch(vec![64, 100])
            .with_step(vec![16, 16])
            .with_minimum_size(vec![16, 16]);
        let spec = model(input, vec![]);
        let plan = PatchPlanner::new(
            &spec,
            RunOptions {
                allow_patching: false,
                pyramidal: false,
            },
        )
        .plan([100, 100, 1, 1])
        .expect("plan");

        assert_eq!(plan.width.patch, 112);
        // already equal to the extent, left alone
        assert_eq!(plan.height.patch, 100);
        assert_eq!(plan.width.mirror, AxisPadding::new(6, 6));
        assert_eq!(plan.total_patches(), 1);
        assert!(plan.whole_image);
    }

    #[test]
    fn pyramidal_mode_ignores_output_halo() {
        let spec = halo_model(8, 8, 4);
        let plan = PatchPlanner::new(
            &spec,
            RunOptions {
                allow_patching: true,
                pyramidal: true,
            },
        )
        .plan([32, 32, 1, 1])
        .expect("plan");
        assert_eq!(plan.width.padding, 0);
        // grown from the default minimum of 1 in steps of 8
        assert_eq!(plan.width.patch, 33);
        assert_eq!(plan.width.mirror, AxisPadding::new(1, 0));
        assert_eq!(plan.total_patches(), 1);
    }

    #[test]
    fn oversized_patch_is_rejected() {
        let spec = halo_model(64, 1, 0);
        let error = PatchPlanner::new(&spec, RunOptions::default())
            .plan([16, 16, 1, 1])
            .expect_err("patch too large");
        assert!(matches!(error, ConfigError::PatchTooLarge { patch: 64, extent: 16, .. }));
    }

    #[test]
    fn halo_consuming_whole_patch_is_rejected() {
        let spec = halo_model(6, 1, 3);
        let error = PatchPlanner::new(&spec, RunOptions::default())
            .plan([20, 20, 1, 1])
            .expect_err("no roi left");
        assert!(matches!(error, ConfigError::HaloExceedsPatch { padding: 3, .. }));
    }

    #[test]
    fn padding_divides_offset_and_halo_by_scale() {
        let input = TensorSpec::new("input", TensorKind::Image, "XY")
            .expect("layout")
            .with_patch(vec![32, 32]);
        let output = TensorSpec::new("output", TensorKind::Image, "XY")
            .expect("layout")
            .with_offset(vec![2, 0])
            .with_halo(vec![4, 3])
            .with_scale(vec![2.0, 2.0]);
        let plan = PatchPlanner::new(&model(input, vec![output]), RunOptions::default())
            .plan([64, 64, 1, 1])
            .expect("plan");
        assert_eq!(plan.width.padding, 3);
        assert_eq!(plan.height.padding, 2);
    }

    #[test]
    fn roi_equal_to_extent_keeps_halo_mirror() {
        let spec = halo_model(6, 1, 1);
        let plan = PatchPlanner::new(&spec, RunOptions::default())
            .plan([4, 4, 1, 1])
            .expect("plan");
        assert_eq!(plan.width.roi, 4);
        assert_eq!(plan.width.count, 1);
        assert_eq!(plan.width.mirror, AxisPadding::new(1, 1));
        assert_eq!(plan.width.overlap, 1);
    }

    #[test]
    fn downscaling_output_widens_padding() {
        let input = TensorSpec::new("input", TensorKind::Image, "XY")
            .expect("layout")
            .with_patch(vec![32, 32]);
        let output = TensorSpec::new("output", TensorKind::Image, "XY")
            .expect("layout")
            .with_offset(vec![1, 0])
            .with_halo(vec![2, 1])
            .with_scale(vec![0.5, 0.5]);
        let plan = PatchPlanner::new(&model(input, vec![output]), RunOptions::default())
            .plan([64, 64, 1, 1])
            .expect("plan");
        assert_eq!(plan.width.padding, 6);
        assert_eq!(plan.width.roi, 20);
        assert_eq!(plan.height.padding, 2);
    }

    #[test]
    fn padding_takes_most_demanding_output() {
        let input = TensorSpec::new("input", TensorKind::Image, "XY")
            .expect("layout")
            .with_patch(vec![32, 32]);
        let small = TensorSpec::new("a", TensorKind::Image, "XY")
            .expect("layout")
            .with_halo(vec![2, 2]);
        let large = TensorSpec::new("b", TensorKind::Image, "X")
            .expect("layout")
            .with_halo(vec![5]);
        let plan = PatchPlanner::new(&model(input, vec![small, large]), RunOptions::default())
            .plan([64, 64, 1, 1])
            .expect("plan");
        assert_eq!(plan.width.padding, 5);
        // output "b" has no Y axis, so it does not contribute there
        assert_eq!(plan.height.padding, 2);
    }

    #[test]
    fn depth_outside_layout_is_iterated_slice_by_slice() {
        let spec = halo_model(8, 1, 0);
        let plan = PatchPlanner::new(&spec, RunOptions::default())
            .plan([8, 8, 1, 5])
            .expect("plan");
        assert_eq!(plan.depth.count, 5);
        assert_eq!(plan.depth.patch, 1);
        assert_eq!(plan.total_patches(), 5);
        let last = plan.depth.window(4);
        assert_eq!((last.image_start, last.image_end, last.mirror_start), (4, 5, 4));
        assert_eq!(last.leftover, 0);
    }

    #[test]
    fn whole_mode_rejects_axis_outside_layout() {
        let spec = halo_model(8, 1, 0);
        let error = PatchPlanner::new(
            &spec,
            RunOptions {
                allow_patching: false,
                pyramidal: false,
            },
        )
        .plan([8, 8, 1, 3])
        .expect_err("depth not in layout");
        assert!(matches!(error, ConfigError::AxisNotInLayout { axis: Axis::Depth, .. }));
    }

    #[test]
    fn channel_is_always_whole_and_checked() {
        let input = TensorSpec::new("input", TensorKind::Image, "YXC")
            .expect("layout")
            .with_patch(vec![8, 8, 1])
            .with_shape(vec![-1, -1, 3]);
        let spec = model(input, vec![]);
        let planner = PatchPlanner::new(&spec, RunOptions::default());

        let plan = planner.plan([16, 16, 3, 1]).expect("plan");
        assert_eq!(plan.channel.patch, 3);
        assert_eq!(plan.channel.count, 1);

        let error = planner.plan([16, 16, 1, 1]).expect_err("wrong channels");
        assert_eq!(
            error,
            ConfigError::ChannelMismatch {
                expected: 3,
                actual: 1
            }
        );
    }
}
