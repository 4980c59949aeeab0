//! Incremental line/voxel-grid intersection and the absorption deposition
//! that follows it.
//!
//! A ray is parametrised as P(a) = source + a * (pixel - source) with
//! a in [0, 1]. The traversal clips the ray against the outermost grid
//! planes, enumerates every plane crossing inside the clipped interval in
//! ascending order of the parameter, and the deposition step turns each
//! pair of consecutive crossings into a length-weighted contribution to
//! the voxel containing the segment midpoint.

use nalgebra::{Point3, Vector3};

use crate::geometry::{Geometry, Micron, X, Y, Z};
use crate::volume::coefficient_index;
use crate::ReconError;

/// A single source-to-detector-pixel line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub source: Point3<Micron>,
    pub pixel: Point3<Micron>,
}

impl Ray {
    pub fn new(source: Point3<Micron>, pixel: Point3<Micron>) -> Self {
        Self { source, pixel }
    }

    /// Direction deltas from source to detector pixel.
    pub fn delta(&self) -> Vector3<Micron> {
        self.pixel - self.source
    }

    pub fn length(&self) -> Micron {
        self.delta().norm()
    }
}

/// Reusable per-worker buffers for the plane-crossing lists.
///
/// The per-axis lists are bounded by the plane count of their axis and
/// the merged list by the sum of all three plus the two endpoints, so a
/// single allocation up front serves every ray the worker will trace.
pub struct Scratch {
    axis: [Vec<f64>; 3],
    merged: Vec<f64>,
}

impl Scratch {
    pub fn for_geometry(geometry: &Geometry) -> Result<Self, ReconError> {
        let mut axis: [Vec<f64>; 3] = [Vec::new(), Vec::new(), Vec::new()];
        let mut total = 2;
        for a in [X, Y, Z] {
            axis[a]
                .try_reserve_exact(geometry.nplanes(a))
                .map_err(|_| ReconError::AllocationFailure("traversal scratch"))?;
            total += geometry.nplanes(a);
        }
        let mut merged = Vec::new();
        merged
            .try_reserve_exact(total)
            .map_err(|_| ReconError::AllocationFailure("traversal scratch"))?;
        Ok(Self { axis, merged })
    }

    /// The merged crossing list produced by the last traversal.
    pub fn merged(&self) -> &[f64] {
        &self.merged
    }
}

/// Clip the ray against the voxel bounding box and enumerate, in
/// ascending order, the parameters at which it crosses any grid plane.
///
/// Returns `false` when the ray misses the volume, leaving the merged
/// list empty. On success the merged list starts at the entry parameter
/// and ends at the exit parameter; a plane crossing that coincides with
/// an endpoint shows up as a zero-length segment, which the deposition
/// step skips.
pub fn plane_crossings(geometry: &Geometry, ray: &Ray, scratch: &mut Scratch) -> bool {
    for a in [X, Y, Z] {
        scratch.axis[a].clear();
    }
    scratch.merged.clear();

    let d = ray.delta();

    let mut alpha_min = 0.0_f64;
    let mut alpha_max = 1.0_f64;
    for a in [X, Y, Z] {
        if d[a] == 0.0 {
            // Parallel to this axis' planes: no crossings along it, but a
            // ray running outside the slab can never enter the volume.
            if ray.source[a] < geometry.first_plane(a) || ray.source[a] > geometry.last_plane(a)
            {
                return false;
            }
            continue;
        }
        let entry = (geometry.first_plane(a) - ray.source[a]) / d[a];
        let exit = (geometry.last_plane(a) - ray.source[a]) / d[a];
        alpha_min = alpha_min.max(entry.min(exit));
        alpha_max = alpha_max.min(entry.max(exit));
    }
    if alpha_min >= alpha_max {
        return false;
    }

    for a in [X, Y, Z] {
        if d[a] != 0.0 {
            fill_axis_crossings(geometry, a, ray.source[a], d[a], alpha_min, alpha_max, &mut scratch.axis[a]);
        }
    }

    merge_crossings(scratch, alpha_min, alpha_max);
    true
}

/// Crossing parameters for the planes of one axis whose crossing lies
/// inside the clipped interval, in ascending parameter order.
///
/// Only the first parameter is computed from a plane coordinate; the rest
/// advance by the constant per-voxel increment, which keeps the list
/// monotonic and avoids one division per plane.
fn fill_axis_crossings(
    geometry: &Geometry,
    axis: usize,
    source: Micron,
    d: Micron,
    alpha_min: f64,
    alpha_max: f64,
    out: &mut Vec<f64>,
) {
    let first = geometry.first_plane(axis);
    let last = geometry.last_plane(axis);
    let size = geometry.voxel_size(axis);
    let nplanes = geometry.nplanes(axis) as isize;

    let (i_min, i_max) = if d >= 0.0 {
        (
            nplanes - ((last - alpha_min * d - source) / size).ceil() as isize,
            ((source + alpha_max * d - first) / size).floor() as isize,
        )
    } else {
        (
            nplanes - ((last - alpha_max * d - source) / size).ceil() as isize,
            ((source + alpha_min * d - first) / size).floor() as isize,
        )
    };
    let i_min = i_min.max(0);
    let i_max = i_max.min(nplanes - 1);
    if i_min > i_max {
        return;
    }

    let count = (i_max - i_min + 1) as usize;
    let step = size / d;
    if d >= 0.0 {
        let mut alpha = (first + i_min as f64 * size - source) / d;
        for _ in 0..count {
            out.push(alpha);
            alpha += step;
        }
    } else {
        // Travelling towards lower plane indices; the highest-index plane
        // in range is crossed first.
        let mut alpha = (first + i_max as f64 * size - source) / d;
        for _ in 0..count {
            out.push(alpha);
            alpha -= step;
        }
    }
}

/// Three-way merge of the per-axis lists, bracketed by the entry and exit
/// parameters. Each per-axis list is already sorted, so one pass with
/// three cursors suffices.
fn merge_crossings(scratch: &mut Scratch, alpha_min: f64, alpha_max: f64) {
    let mut cursor = [0usize; 3];
    scratch.merged.push(alpha_min);
    let mut prev = alpha_min;
    loop {
        let mut next: Option<usize> = None;
        let mut next_val = f64::INFINITY;
        for a in [X, Y, Z] {
            if let Some(&v) = scratch.axis[a].get(cursor[a]) {
                if v < next_val {
                    next_val = v;
                    next = Some(a);
                }
            }
        }
        let a = match next {
            Some(a) => a,
            None => break,
        };
        cursor[a] += 1;
        // A crossing can undershoot its predecessor by an ulp.
        let v = next_val.max(prev);
        scratch.merged.push(v);
        prev = v;
    }
    scratch.merged.push(alpha_max.max(prev));
}

/// Walk consecutive crossing pairs, locate the voxel containing each
/// segment midpoint and hand the weighted contribution to `sink`.
///
/// `value` is the normalised detector sample for this ray; a segment of
/// length l contributes value * l / (dos + dod) to its voxel.
pub fn deposit<F>(geometry: &Geometry, ray: &Ray, value: f64, merged: &[f64], mut sink: F)
where
    F: FnMut(usize, f64),
{
    if merged.len() < 2 {
        return;
    }
    let d = ray.delta();
    let length = ray.length();
    let normalisation = geometry.dos() + geometry.dod();
    for pair in merged.windows(2) {
        let segment = pair[1] - pair[0];
        if segment <= 0.0 {
            continue;
        }
        let mid = 0.5 * (pair[0] + pair[1]);
        let mut voxel = [0usize; 3];
        for a in [X, Y, Z] {
            let offset = ray.source[a] + mid * d[a] - geometry.first_plane(a);
            let index = (offset / geometry.voxel_size(a)).floor() as isize;
            // The floor can land one voxel out on either boundary.
            voxel[a] = index.clamp(0, geometry.nvoxels(a) as isize - 1) as usize;
        }
        let contribution = value * length * segment / normalisation;
        sink(
            coefficient_index(geometry.grid(), voxel[X], voxel[Y], voxel[Z]),
            contribution,
        );
    }
}

/// Backproject one ray end to end. A ray that misses the volume or whose
/// sample normalises to zero deposits nothing.
pub fn backproject_ray<F>(
    geometry: &Geometry,
    ray: &Ray,
    value: f64,
    scratch: &mut Scratch,
    sink: F,
) where
    F: FnMut(usize, f64),
{
    if value == 0.0 {
        return;
    }
    if !plane_crossings(geometry, ray, scratch) {
        return;
    }
    deposit(geometry, ray, value, scratch.merged(), sink);
}
