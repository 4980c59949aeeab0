//! All things related to user-facing reconstruction parameters.

use std::fs::read_to_string;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::geometry::{Micron, X};

/// The detector-distance scale is derived from the work-unit count with
/// this fixed ratio, so that one work unit corresponds to a fraction of
/// the volume edge rather than to an absolute length.
const WORK_UNIT_SCALE: f64 = 125.0 / 294.0;

/// Encoding of the voxel array inside an NRRD container. A headerless RAW
/// output is always binary and ignores this choice.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Ascii,
    Binary,
}

/// How concurrent workers combine their contributions into the volume.
///
/// `Shared` lets every worker update one common grid with lock-free
/// additions. `Shadow` gives each worker a private grid and sums them in
/// worker order once the stream is exhausted, trading memory for a fixed
/// reduction order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accumulation {
    Shared,
    Shadow,
}

/// Configuration for a reconstruction run.
///
/// This struct contains all parameters needed to reconstruct a volume
/// from a projection stream: the voxel grid, the detector pixel pitch,
/// the angular sweep and the execution knobs. It can be serialized so
/// that it can be saved on disk as a configuration file.
///
/// All lengths are micrometres.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconConfig {
    pub(crate) voxel_size: [Micron; 3],
    pub(crate) nvoxels: [usize; 3],
    pub(crate) pixel_size: Micron,
    pub(crate) work_units: u32,
    pub(crate) aperture_deg: f64,
    pub(crate) step_deg: f64,
    pub(crate) workers: usize,
    pub(crate) accumulation: Accumulation,
    pub(crate) output_format: OutputFormat,
}

impl ReconConfig {
    pub fn try_from_config_path(config_path: &Path) -> Result<Self> {
        let cfg: ReconConfig = toml::from_str(&read_to_string(config_path)?)?;
        if cfg.voxel_size.iter().any(|&s| s <= 0.0) || cfg.pixel_size <= 0.0 {
            panic!("Voxel and pixel sizes must be positive (got {:?})", cfg);
        }
        if cfg.nvoxels.iter().any(|&n| n == 0) {
            panic!("The voxel grid must hold at least one voxel per axis");
        }
        let ratio = cfg.aperture_deg / cfg.step_deg;
        if cfg.step_deg <= 0.0 || (ratio - ratio.round()).abs() > 1e-9 {
            panic!(
                "step_deg must be positive and divide aperture_deg (got {} / {})",
                cfg.step_deg, cfg.aperture_deg
            );
        }
        Ok(cfg)
    }

    /// Edge length of the scanned region, as scaled by the work units.
    pub fn voxel_matrix_size(&self) -> Micron {
        self.work_units as f64 * self.voxel_size[X] * WORK_UNIT_SCALE
    }

    /// Distance from the volume centre to the detector plane.
    pub fn dod(&self) -> Micron {
        1.5 * self.voxel_matrix_size()
    }

    /// Distance from the volume centre to the X-ray source.
    pub fn dos(&self) -> Micron {
        6.0 * self.voxel_matrix_size()
    }

    /// Number of projections in the angular sweep.
    pub fn ntheta(&self) -> usize {
        (self.aperture_deg / self.step_deg).round() as usize + 1
    }

    pub fn output_format(&self) -> OutputFormat {
        self.output_format
    }

    pub fn accumulation(&self) -> Accumulation {
        self.accumulation
    }

    /// The worker count to run with; zero in the config means one worker
    /// per available core.
    pub fn resolved_workers(&self) -> usize {
        match self.workers {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        }
    }
}

#[derive(Clone)]
pub struct ReconConfigBuilder {
    voxel_size: [Micron; 3],
    nvoxels: [usize; 3],
    pixel_size: Micron,
    work_units: u32,
    aperture_deg: f64,
    step_deg: f64,
    workers: usize,
    accumulation: Accumulation,
    output_format: OutputFormat,
}

impl ReconConfigBuilder {
    /// Generate an instance with default values. Useful mainly for quick
    /// testing.
    pub fn default() -> ReconConfigBuilder {
        ReconConfigBuilder {
            voxel_size: [100.0; 3],
            nvoxels: [125; 3],
            pixel_size: 150.0,
            work_units: 294,
            aperture_deg: 90.0,
            step_deg: 15.0,
            workers: 0,
            accumulation: Accumulation::Shared,
            output_format: OutputFormat::Binary,
        }
    }

    pub fn build(&self) -> ReconConfig {
        let ratio = self.aperture_deg / self.step_deg;
        assert!(
            (ratio - ratio.round()).abs() < 1e-9,
            "step_deg must divide aperture_deg"
        );
        ReconConfig {
            voxel_size: self.voxel_size,
            nvoxels: self.nvoxels,
            pixel_size: self.pixel_size,
            work_units: self.work_units,
            aperture_deg: self.aperture_deg,
            step_deg: self.step_deg,
            workers: self.workers,
            accumulation: self.accumulation,
            output_format: self.output_format,
        }
    }

    pub fn with_voxel_size(&mut self, voxel_size: [Micron; 3]) -> &mut Self {
        assert!(voxel_size.iter().all(|&s| s > 0.0));
        self.voxel_size = voxel_size;
        self
    }

    pub fn with_nvoxels(&mut self, nvoxels: [usize; 3]) -> &mut Self {
        assert!(nvoxels.iter().all(|&n| n >= 1));
        self.nvoxels = nvoxels;
        self
    }

    pub fn with_pixel_size(&mut self, pixel_size: Micron) -> &mut Self {
        assert!(pixel_size > 0.0);
        self.pixel_size = pixel_size;
        self
    }

    pub fn with_work_units(&mut self, work_units: u32) -> &mut Self {
        assert!(work_units >= 1);
        self.work_units = work_units;
        self
    }

    pub fn with_aperture_deg(&mut self, aperture_deg: f64) -> &mut Self {
        assert!(aperture_deg > 0.0);
        self.aperture_deg = aperture_deg;
        self
    }

    pub fn with_step_deg(&mut self, step_deg: f64) -> &mut Self {
        assert!(step_deg > 0.0);
        self.step_deg = step_deg;
        self
    }

    pub fn with_workers(&mut self, workers: usize) -> &mut Self {
        self.workers = workers;
        self
    }

    pub fn with_accumulation(&mut self, accumulation: Accumulation) -> &mut Self {
        self.accumulation = accumulation;
        self
    }

    pub fn with_output_format(&mut self, output_format: OutputFormat) -> &mut Self {
        self.output_format = output_format;
        self
    }
}
