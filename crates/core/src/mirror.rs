//! Border extension by whole-sample symmetric reflection.

use ndarray::{Array5, Axis as NdAxis};

use crate::axis::{Axis, SPATIAL_AXES};
use crate::volume::ImageVolume;

/// Maps a virtual coordinate onto `[0, n)` by reflecting about the borders.
///
/// The reflection has period `2(n-1)` and never repeats the border sample, so
/// `-1 -> 1` and `n -> n-2`. Any amount of padding is handled, including
/// padding larger than `n`.
pub fn mirror_index(a: isize, n: usize) -> usize {
    if n <= 1 {
        return 0;
    }
    let period = 2 * (n as isize - 1);
    let wrapped = a.rem_euclid(period);
    if wrapped < n as isize {
        wrapped as usize
    } else {
        (period - wrapped) as usize
    }
}

/// Samples added before and after the image on one axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AxisPadding {
    pub before: usize,
    pub after: usize,
}

impl AxisPadding {
    pub fn new(before: usize, after: usize) -> Self {
        Self { before, after }
    }

    pub fn total(&self) -> usize {
        self.before + self.after
    }
}

/// Padding on the spatial axes; channels and frames are never mirrored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorPadding {
    pub width: AxisPadding,
    pub height: AxisPadding,
    pub depth: AxisPadding,
}

impl MirrorPadding {
    pub fn for_axis(&self, axis: Axis) -> AxisPadding {
        match axis {
            Axis::Width => self.width,
            Axis::Height => self.height,
            Axis::Depth => self.depth,
            Axis::Channel | Axis::Batch => AxisPadding::default(),
        }
    }

    pub fn is_zero(&self) -> bool {
        SPATIAL_AXES.iter().all(|axis| self.for_axis(*axis).total() == 0)
    }
}

/// Builds the extended image. Output extents are `n + before + after` per spatial axis.
pub fn mirror_volume(volume: &ImageVolume, padding: &MirrorPadding) -> ImageVolume {
    if padding.is_zero() {
        return volume.clone();
    }

    let source = volume.data();
    let [nx, ny, nc, nz, nt] = volume.dims();
    let source_index = |axis: Axis, extent: usize| -> Vec<usize> {
        let pad = padding.for_axis(axis);
        (0..extent + pad.total())
            .map(|i| mirror_index(i as isize - pad.before as isize, extent))
            .collect()
    };
    let xs = source_index(Axis::Width, nx);
    let ys = source_index(Axis::Height, ny);
    let zs = source_index(Axis::Depth, nz);

    let mut extended = Array5::<f32>::zeros((xs.len(), ys.len(), nc, zs.len(), nt));
    for (ez, sz) in zs.iter().enumerate() {
        let src_slab = source.index_axis(NdAxis(3), *sz);
        let mut dst_slab = extended.index_axis_mut(NdAxis(3), ez);
        for (ey, sy) in ys.iter().enumerate() {
            let src_row = src_slab.index_axis(NdAxis(1), *sy);
            let mut dst_row = dst_slab.index_axis_mut(NdAxis(1), ey);
            for (ex, sx) in xs.iter().enumerate() {
                dst_row
                    .index_axis_mut(NdAxis(0), ex)
                    .assign(&src_row.index_axis(NdAxis(0), *sx));
            }
        }
    }

    ImageVolume::new(extended)
        .with_title(volume.title())
        .with_calibration(volume.calibration().clone())
}
