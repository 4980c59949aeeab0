//! Drives every (projection, row, column) triple through the traversal
//! and accumulates the contributions into the volume.
//!
//! One reader owns the projection stream and parses it sequentially; the
//! parsed projections travel over a bounded channel to the compute
//! workers, which distribute whole projections among themselves. Each
//! contribution is deposited exactly once, either into one shared grid
//! with lock-free additions or into per-worker shadow grids that are
//! reduced in worker order at the end.

use crossbeam::channel;

use crate::configuration::{Accumulation, ReconConfig};
use crate::geometry::Geometry;
use crate::projections::{Projection, ProjectionSource};
use crate::siddon::{self, Ray, Scratch};
use crate::volume::{SharedVolume, Volume};
use crate::ReconError;

/// How many parsed projections may sit between the reader and the
/// workers before the reader blocks.
const PROJECTION_QUEUE_DEPTH: usize = 4;

/// Reconstruct the volume from the given projection stream.
///
/// With a single worker no threads are spawned and the run is fully
/// deterministic; otherwise the accumulation strategy from the config
/// decides how concurrent deposits are combined.
pub fn reconstruct(
    geometry: &Geometry,
    mut source: Box<dyn ProjectionSource>,
    config: &ReconConfig,
) -> Result<Volume, ReconError> {
    if source.declared_count() != geometry.ntheta() {
        return Err(ReconError::InputMalformed(format!(
            "container holds {} projections but the sweep expects {}",
            source.declared_count(),
            geometry.ntheta()
        )));
    }
    let workers = config.resolved_workers();
    info!(
        "Backprojecting {} projections with {} worker(s)",
        geometry.ntheta(),
        workers
    );
    if workers <= 1 {
        reconstruct_serial(geometry, source.as_mut())
    } else {
        match config.accumulation() {
            Accumulation::Shared => reconstruct_shared(geometry, source.as_mut(), workers),
            Accumulation::Shadow => reconstruct_shadow(geometry, source.as_mut(), workers),
        }
    }
}

/// Backproject one projection's full fan of rays into `sink`.
pub fn backproject_projection<F>(
    geometry: &Geometry,
    projection: &Projection,
    scratch: &mut Scratch,
    mut sink: F,
) where
    F: FnMut(usize, f64),
{
    let source = geometry.source(projection.index);
    for row in 0..projection.n_side_pixels {
        for col in 0..projection.n_side_pixels {
            let pixel =
                geometry.detector_pixel(projection.index, row, col, projection.n_side_pixels);
            let ray = Ray::new(source, pixel);
            siddon::backproject_ray(
                geometry,
                &ray,
                projection.normalised(row, col),
                scratch,
                &mut sink,
            );
        }
    }
    debug!(
        "Projection {} (angle {:.3} rad) backprojected",
        projection.index, projection.angle_rad
    );
}

/// Pull, resolve and slot-check the next projection. The reader is the
/// only caller, so the slot ledger needs no synchronisation.
fn next_projection(
    source: &mut dyn ProjectionSource,
    geometry: &Geometry,
    seen: &mut [bool],
) -> Option<Result<Projection, ReconError>> {
    let raw = source.next()?;
    Some(raw.and_then(|raw| {
        let projection = Projection::from_raw(raw, geometry)?;
        if std::mem::replace(&mut seen[projection.index], true) {
            return Err(ReconError::InputMalformed(format!(
                "two projections resolve to sweep slot {}",
                projection.index
            )));
        }
        Ok(projection)
    }))
}

fn reconstruct_serial(
    geometry: &Geometry,
    source: &mut dyn ProjectionSource,
) -> Result<Volume, ReconError> {
    let mut volume = Volume::zeroed(geometry)?;
    let mut scratch = Scratch::for_geometry(geometry)?;
    let mut seen = vec![false; geometry.ntheta()];
    while let Some(next) = next_projection(source, geometry, &mut seen) {
        let projection = next?;
        backproject_projection(geometry, &projection, &mut scratch, |index, delta| {
            volume.add(index, delta)
        });
    }
    Ok(volume)
}

fn reconstruct_shared(
    geometry: &Geometry,
    source: &mut dyn ProjectionSource,
    workers: usize,
) -> Result<Volume, ReconError> {
    let shared = SharedVolume::zeroed(geometry)?;
    let mut seen = vec![false; geometry.ntheta()];
    let (tx, rx) = channel::bounded::<Projection>(PROJECTION_QUEUE_DEPTH);

    let mut reader_result: Result<(), ReconError> = Ok(());
    let worker_results: Result<Vec<()>, ReconError> = crossbeam::scope(|s| {
        let shared = &shared;
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let rx = rx.clone();
            handles.push(s.spawn(move |_| -> Result<(), ReconError> {
                let mut scratch = Scratch::for_geometry(geometry)?;
                for projection in rx.iter() {
                    backproject_projection(geometry, &projection, &mut scratch, |index, delta| {
                        shared.add(index, delta)
                    });
                }
                Ok(())
            }));
        }
        drop(rx);

        // Single-reader critical section: this thread owns the stream.
        while let Some(next) = next_projection(source, geometry, &mut seen) {
            match next {
                // A send only fails once every worker is gone; the error
                // that killed them is picked up at join below.
                Ok(projection) => {
                    if tx.send(projection).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    reader_result = Err(e);
                    break;
                }
            }
        }
        drop(tx);

        handles
            .into_iter()
            .map(|handle| handle.join().expect("compute worker panicked"))
            .collect()
    })
    .expect("scheduler scope panicked");

    reader_result?;
    worker_results?;
    Ok(shared.into_volume())
}

fn reconstruct_shadow(
    geometry: &Geometry,
    source: &mut dyn ProjectionSource,
    workers: usize,
) -> Result<Volume, ReconError> {
    let mut seen = vec![false; geometry.ntheta()];
    let (tx, rx) = channel::bounded::<Projection>(PROJECTION_QUEUE_DEPTH);

    let mut reader_result: Result<(), ReconError> = Ok(());
    let shadows: Result<Vec<Volume>, ReconError> = crossbeam::scope(|s| {
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let rx = rx.clone();
            handles.push(s.spawn(move |_| -> Result<Volume, ReconError> {
                let mut shadow = Volume::zeroed(geometry)?;
                let mut scratch = Scratch::for_geometry(geometry)?;
                for projection in rx.iter() {
                    backproject_projection(geometry, &projection, &mut scratch, |index, delta| {
                        shadow.add(index, delta)
                    });
                }
                Ok(shadow)
            }));
        }
        drop(rx);

        while let Some(next) = next_projection(source, geometry, &mut seen) {
            match next {
                Ok(projection) => {
                    if tx.send(projection).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    reader_result = Err(e);
                    break;
                }
            }
        }
        drop(tx);

        handles
            .into_iter()
            .map(|handle| handle.join().expect("compute worker panicked"))
            .collect()
    })
    .expect("scheduler scope panicked");

    reader_result?;
    let mut shadows = shadows?;
    // Reduce in spawn order so the result does not depend on timing.
    let mut volume = shadows.remove(0);
    for shadow in &shadows {
        volume.merge(shadow);
    }
    Ok(volume)
}
