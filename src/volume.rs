//! The dense absorption volume and its concurrent accumulation wrapper.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::geometry::{Geometry, Micron, X, Y, Z};
use crate::ReconError;

/// Flat index of voxel (x, y, z).
///
/// The layout is part of the on-disk format contract: X is the fastest
/// axis, then Z, then Y.
pub fn coefficient_index(nvoxels: &[usize; 3], x: usize, y: usize, z: usize) -> usize {
    y * (nvoxels[X] * nvoxels[Z]) + z * nvoxels[Z] + x
}

/// The reconstructed volume of linear attenuation coefficients.
///
/// Coefficients start at zero and only ever grow while the scheduler
/// deposits ray contributions into them.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    nvoxels: [usize; 3],
    voxel_size: [Micron; 3],
    coefficients: Vec<f64>,
}

impl Volume {
    pub fn zeroed(geometry: &Geometry) -> Result<Self, ReconError> {
        let len = geometry.grid().iter().product();
        let mut coefficients = Vec::new();
        coefficients
            .try_reserve_exact(len)
            .map_err(|_| ReconError::AllocationFailure("volume"))?;
        coefficients.resize(len, 0.0);
        Ok(Self {
            nvoxels: *geometry.grid(),
            voxel_size: *geometry.voxel_sizes(),
            coefficients,
        })
    }

    pub fn nvoxels(&self) -> &[usize; 3] {
        &self.nvoxels
    }

    pub fn voxel_size(&self) -> &[Micron; 3] {
        &self.voxel_size
    }

    pub fn voxel_index(&self, x: usize, y: usize, z: usize) -> usize {
        coefficient_index(&self.nvoxels, x, y, z)
    }

    pub fn value(&self, x: usize, y: usize, z: usize) -> f64 {
        self.coefficients[self.voxel_index(x, y, z)]
    }

    pub fn add(&mut self, index: usize, delta: f64) {
        self.coefficients[index] += delta;
    }

    /// The coefficients in their fixed serialization order.
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn total_absorption(&self) -> f64 {
        self.coefficients.iter().sum()
    }

    /// Fold another grid of the same shape into this one. Used to reduce
    /// per-worker shadow volumes in a fixed order.
    pub fn merge(&mut self, other: &Volume) {
        assert_eq!(self.nvoxels, other.nvoxels);
        for (cell, contribution) in self.coefficients.iter_mut().zip(&other.coefficients) {
            *cell += contribution;
        }
    }
}

/// A volume whose cells accept additive updates from any number of
/// concurrent writers.
///
/// Every cell is an `AtomicU64` holding the bit pattern of its `f64`
/// value; additions go through a compare-exchange loop, so no two writers
/// can lose each other's contribution and no lock is ever taken.
pub struct SharedVolume {
    nvoxels: [usize; 3],
    voxel_size: [Micron; 3],
    cells: Vec<AtomicU64>,
}

impl SharedVolume {
    pub fn zeroed(geometry: &Geometry) -> Result<Self, ReconError> {
        let len = geometry.grid().iter().product();
        let mut cells = Vec::new();
        cells
            .try_reserve_exact(len)
            .map_err(|_| ReconError::AllocationFailure("volume"))?;
        cells.extend((0..len).map(|_| AtomicU64::new(0f64.to_bits())));
        Ok(Self {
            nvoxels: *geometry.grid(),
            voxel_size: *geometry.voxel_sizes(),
            cells,
        })
    }

    /// Lock-free addition into one cell.
    pub fn add(&self, index: usize, delta: f64) {
        let cell = &self.cells[index];
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Unwrap into a plain volume once all writers are done.
    pub fn into_volume(self) -> Volume {
        Volume {
            nvoxels: self.nvoxels,
            voxel_size: self.voxel_size,
            coefficients: self
                .cells
                .into_iter()
                .map(|cell| f64::from_bits(cell.into_inner()))
                .collect(),
        }
    }
}
