//! Ray-driven backprojection of cone-beam X-ray projections into a 3D
//! absorption-coefficient volume.
//!
//! Every detector pixel of every projection defines a line from the
//! X-ray source through the voxel grid. The traversal in [`siddon`]
//! enumerates the grid planes that line crosses, and each crossed voxel
//! receives a contribution proportional to the pixel's sample and the
//! length of the line segment inside it. Summed over all projections
//! this approximates the linear attenuation at each voxel.

#[macro_use]
extern crate log;

pub mod configuration;
pub mod geometry;
pub mod projections;
pub mod scheduler;
pub mod serialize;
pub mod siddon;
pub mod volume;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::configuration::ReconConfig;
use crate::geometry::Geometry;

/// Errors that terminate a reconstruction run.
///
/// Geometric degeneracies are deliberately absent: a ray that misses the
/// volume or runs parallel to a grid axis is routine, handled locally by
/// the traversal, and never surfaces to the caller.
#[derive(Debug, Error)]
pub enum ReconError {
    #[error("Failed reading projections from {0:?}: {1}")]
    InputUnavailable(PathBuf, #[source] std::io::Error),
    #[error("Malformed projection data: {0}")]
    InputMalformed(String),
    #[error("Failed writing the volume to {0:?}: {1}")]
    OutputUnavailable(PathBuf, #[source] std::io::Error),
    #[error("Allocation of the {0} buffer failed")]
    AllocationFailure(&'static str),
}

/// Reconstruct the volume described by `config` from the projections at
/// `input` and serialize it to `output`. Formats on both sides are
/// picked by file extension.
pub fn start_reconstruction(
    config: &ReconConfig,
    input: &Path,
    output: &Path,
) -> Result<(), ReconError> {
    let geometry = Geometry::from_config(config);
    info!(
        "Reconstructing a {:?} voxel grid from {} projections",
        geometry.grid(),
        geometry.ntheta()
    );
    let source = projections::open_source(input)?;
    let volume = scheduler::reconstruct(&geometry, source, config)?;
    info!(
        "Backprojection finished, total absorption {:.6}",
        volume.total_absorption()
    );
    serialize::write_volume(&volume, output, config.output_format())
}

/// Route log records to stderr and, when given, a log file. Called once
/// by the binaries before anything else happens.
pub fn setup_logger(fname: Option<PathBuf>) {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stderr());
    if let Some(fname) = fname {
        if let Ok(logfile) = fern::log_file(fname) {
            dispatch = dispatch.chain(logfile);
        }
    }
    // Tests may install the logger more than once; later calls lose.
    let _ = dispatch.apply();
}
