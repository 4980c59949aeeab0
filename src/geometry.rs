//! The acquisition geometry shared by every worker: source and detector
//! positions per projection angle and the outermost voxel-grid planes.

use std::f64::consts::PI;

use nalgebra::Point3;

use crate::configuration::ReconConfig;

/// All lengths in the reconstruction are micrometres.
pub type Micron = f64;

/// Axis indices into the per-axis tables.
pub const X: usize = 0;
pub const Y: usize = 1;
pub const Z: usize = 2;

/// Precomputed tables describing one angular sweep around the volume.
///
/// Built once before the compute phase starts and only ever read
/// afterwards, so sharing it by reference with any number of workers is
/// safe. All per-projection trigonometry lives in the sine/cosine tables;
/// the traversal itself never calls into `sin`/`cos`.
#[derive(Debug, Clone)]
pub struct Geometry {
    sin_table: Vec<f64>,
    cos_table: Vec<f64>,
    first_plane: [Micron; 3],
    last_plane: [Micron; 3],
    voxel_size: [Micron; 3],
    nvoxels: [usize; 3],
    pixel_size: Micron,
    dod: Micron,
    dos: Micron,
}

impl Geometry {
    /// Build the tables for an explicit list of projection angles, given
    /// in degrees. The voxel grid is centred on the origin.
    pub fn new(
        voxel_size: [Micron; 3],
        nvoxels: [usize; 3],
        pixel_size: Micron,
        dod: Micron,
        dos: Micron,
        angles_deg: &[f64],
    ) -> Self {
        let mut sin_table = Vec::with_capacity(angles_deg.len());
        let mut cos_table = Vec::with_capacity(angles_deg.len());
        for angle in angles_deg {
            let theta = angle * PI / 180.0;
            sin_table.push(theta.sin());
            cos_table.push(theta.cos());
        }
        let mut first_plane = [0.0; 3];
        let mut last_plane = [0.0; 3];
        for a in [X, Y, Z] {
            last_plane[a] = voxel_size[a] * nvoxels[a] as f64 / 2.0;
            first_plane[a] = -last_plane[a];
        }
        Self {
            sin_table,
            cos_table,
            first_plane,
            last_plane,
            voxel_size,
            nvoxels,
            pixel_size,
            dod,
            dos,
        }
    }

    /// Build the tables from a run configuration, placing the projections
    /// evenly over the configured sweep.
    pub fn from_config(config: &ReconConfig) -> Self {
        let angles: Vec<f64> = (0..config.ntheta())
            .map(|i| config.aperture_deg / 2.0 + i as f64 * config.step_deg)
            .collect();
        Self::new(
            config.voxel_size,
            config.nvoxels,
            config.pixel_size,
            config.dod(),
            config.dos(),
            &angles,
        )
    }

    pub fn ntheta(&self) -> usize {
        self.sin_table.len()
    }

    pub fn nvoxels(&self, axis: usize) -> usize {
        self.nvoxels[axis]
    }

    pub fn grid(&self) -> &[usize; 3] {
        &self.nvoxels
    }

    /// Plane count along an axis, one more than the voxel count.
    pub fn nplanes(&self, axis: usize) -> usize {
        self.nvoxels[axis] + 1
    }

    pub fn voxel_size(&self, axis: usize) -> Micron {
        self.voxel_size[axis]
    }

    pub fn voxel_sizes(&self) -> &[Micron; 3] {
        &self.voxel_size
    }

    pub fn first_plane(&self, axis: usize) -> Micron {
        self.first_plane[axis]
    }

    pub fn last_plane(&self, axis: usize) -> Micron {
        self.last_plane[axis]
    }

    pub fn dod(&self) -> Micron {
        self.dod
    }

    pub fn dos(&self) -> Micron {
        self.dos
    }

    /// Position of the X-ray source for the given projection.
    pub fn source(&self, index: usize) -> Point3<Micron> {
        Point3::new(
            -self.sin_table[index] * self.dos,
            self.cos_table[index] * self.dos,
            0.0,
        )
    }

    /// Position of detector pixel (row, col) for the given projection.
    ///
    /// Rows run along the detector's z axis, columns along its in-plane
    /// axis. The detector is square with `n_side_pixels` per side and is
    /// centred on the projection of the volume centre.
    pub fn detector_pixel(
        &self,
        index: usize,
        row: usize,
        col: usize,
        n_side_pixels: usize,
    ) -> Point3<Micron> {
        let half_width =
            n_side_pixels as f64 * self.pixel_size / 2.0 - self.pixel_size / 2.0;
        let in_plane = -half_width + col as f64 * self.pixel_size;
        let sin = self.sin_table[index];
        let cos = self.cos_table[index];
        Point3::new(
            self.dod * sin + cos * in_plane,
            -self.dod * cos + sin * in_plane,
            -half_width + row as f64 * self.pixel_size,
        )
    }

    /// Resolve a projection angle, possibly outside [-180, 180), to its
    /// slot in the sweep.
    pub fn projection_index(&self, angle_deg: f64) -> usize {
        let mut normalised = angle_deg % 360.0;
        if normalised >= 180.0 {
            normalised -= 360.0;
        }
        if normalised < -180.0 {
            normalised += 360.0;
        }
        let slot = ((normalised + 180.0) / 360.0 * self.ntheta() as f64).floor();
        slot as usize % self.ntheta()
    }
}
