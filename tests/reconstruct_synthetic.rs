//! End-to-end reconstructions over synthetic projection data.

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use assert_approx_eq::assert_approx_eq;

use libconerec::configuration::{Accumulation, ReconConfig, ReconConfigBuilder};
use libconerec::geometry::Geometry;
use libconerec::projections::{RawProjection, StoredSource};
use libconerec::scheduler;
use libconerec::start_reconstruction;

/// An 8x8x8 grid of 100 um voxels with a detector fine enough for every
/// voxel to be crossed by several rays per projection.
fn setup_config(workers: usize) -> ReconConfig {
    ReconConfigBuilder::default()
        .with_voxel_size([100.0; 3])
        .with_nvoxels([8; 3])
        .with_pixel_size(60.0)
        .with_work_units(10)
        .with_aperture_deg(90.0)
        .with_step_deg(45.0)
        .with_workers(workers)
        .clone()
        .build()
}

/// Stacked-raster PGM with one uniform sample value per projection. The
/// three angles land in the three distinct sweep slots.
fn write_uniform_pgm(name: &str, width: usize, value: u32) -> PathBuf {
    let path = PathBuf::from(format!("target/{}", name));
    let mut body = format!("P2\n{} {}\n255\n", width, 3 * width);
    for angle in [-120.0, 0.0, 120.0] {
        body.push_str(&format!("# angle: {:.1}\n", angle));
        for _ in 0..width {
            let row = vec![value.to_string(); width].join(" ");
            body.push_str(&row);
            body.push('\n');
        }
    }
    File::create(&path)
        .unwrap()
        .write_all(body.as_bytes())
        .unwrap();
    path
}

fn uniform_raw(angle_deg: f64, n_side_pixels: usize, value: f64) -> RawProjection {
    RawProjection {
        angle_deg,
        n_side_pixels,
        min_val: 0.0,
        max_val: 255.0,
        pixels: vec![value; n_side_pixels * n_side_pixels],
    }
}

fn read_raw_volume(path: &PathBuf) -> Vec<f64> {
    fs::read(path)
        .unwrap()
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

#[test]
fn blank_projections_give_a_blank_volume() {
    let config = setup_config(1);
    let input = write_uniform_pgm("blank.pgm", 24, 0);
    let output = PathBuf::from("target/blank.raw");
    start_reconstruction(&config, &input, &output).unwrap();
    let volume = read_raw_volume(&output);
    assert_eq!(volume.len(), 8 * 8 * 8);
    assert!(volume.iter().all(|&c| c == 0.0));
}

#[test]
fn saturated_projections_fill_the_interior() {
    let config = setup_config(1);
    let input = write_uniform_pgm("saturated.pgm", 24, 255);
    let output = PathBuf::from("target/saturated.raw");
    start_reconstruction(&config, &input, &output).unwrap();
    let volume = read_raw_volume(&output);
    assert!(volume.iter().all(|&c| c >= 0.0));
    // Every voxel away from the faces is crossed by rays of every view.
    let n = 8usize;
    for y in 1..n - 1 {
        for z in 1..n - 1 {
            for x in 1..n - 1 {
                let idx = y * n * n + z * n + x;
                assert!(volume[idx] > 0.0, "voxel ({}, {}, {}) was never hit", x, y, z);
            }
        }
    }
}

#[test]
fn single_ray_deposits_the_centre_chord() {
    // One 1x1 projection at 0 deg: the sole ray runs from the source
    // through the single 100 um voxel to the detector centre.
    let geometry = Geometry::new([100.0; 3], [1, 1, 1], 100.0, 150.0, 600.0, &[0.0]);
    let source = StoredSource::new(vec![uniform_raw(0.0, 1, 255.0)]);
    let config = ReconConfigBuilder::default().with_workers(1).clone().build();
    let volume = scheduler::reconstruct(&geometry, Box::new(source), &config).unwrap();
    assert_eq!(volume.coefficients().len(), 1);
    assert_approx_eq!(volume.coefficients()[0], 100.0 / 750.0);
}

#[test]
fn mirrored_views_give_a_mirrored_volume() {
    // Angles closed under negation and uniform samples: the volume must
    // be symmetric about the x = 0 plane.
    let geometry = Geometry::new([100.0; 3], [6, 6, 6], 90.0, 600.0, 2400.0, &[-90.0, 0.0, 90.0]);
    let source = StoredSource::new(vec![
        uniform_raw(-90.0, 16, 200.0),
        uniform_raw(0.0, 16, 200.0),
        uniform_raw(90.0, 16, 200.0),
    ]);
    let config = ReconConfigBuilder::default().with_workers(1).clone().build();
    let volume = scheduler::reconstruct(&geometry, Box::new(source), &config).unwrap();
    for y in 0..6 {
        for z in 0..6 {
            for x in 0..6 {
                let value = volume.value(x, y, z);
                let mirrored = volume.value(5 - x, y, z);
                assert_approx_eq!(value, mirrored, value.abs() * 1e-9 + 1e-12);
            }
        }
    }
}

#[test]
fn serial_reruns_are_byte_identical() {
    let config = setup_config(1);
    let input = write_uniform_pgm("determinism.pgm", 24, 137);
    let first = PathBuf::from("target/determinism_first.raw");
    let second = PathBuf::from("target/determinism_second.raw");
    start_reconstruction(&config, &input, &first).unwrap();
    start_reconstruction(&config, &input, &second).unwrap();
    assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
}

#[test]
fn parallel_sum_matches_serial_sum() {
    let input = write_uniform_pgm("parallel.pgm", 24, 201);
    let serial_out = PathBuf::from("target/parallel_serial.raw");
    let shared_out = PathBuf::from("target/parallel_shared.raw");
    start_reconstruction(&setup_config(1), &input, &serial_out).unwrap();
    let shared_config = ReconConfigBuilder::default()
        .with_voxel_size([100.0; 3])
        .with_nvoxels([8; 3])
        .with_pixel_size(60.0)
        .with_work_units(10)
        .with_aperture_deg(90.0)
        .with_step_deg(45.0)
        .with_workers(4)
        .with_accumulation(Accumulation::Shared)
        .clone()
        .build();
    start_reconstruction(&shared_config, &input, &shared_out).unwrap();
    let serial: f64 = read_raw_volume(&serial_out).iter().sum();
    let shared: f64 = read_raw_volume(&shared_out).iter().sum();
    assert_approx_eq!(shared, serial, serial.abs() * 1e-9);
}

#[test]
fn accumulated_total_matches_the_per_segment_sum() {
    use libconerec::projections::Projection;
    use libconerec::siddon::Scratch;
    use libconerec::volume::Volume;

    let geometry = Geometry::new([100.0; 3], [6, 6, 6], 90.0, 600.0, 2400.0, &[0.0]);
    let projection =
        Projection::from_raw(uniform_raw(0.0, 16, 180.0), &geometry).unwrap();
    let mut scratch = Scratch::for_geometry(&geometry).unwrap();
    let mut volume = Volume::zeroed(&geometry).unwrap();
    let mut running_total = 0.0;
    scheduler::backproject_projection(&geometry, &projection, &mut scratch, |index, delta| {
        volume.add(index, delta);
        running_total += delta;
    });
    assert!(running_total > 0.0);
    assert_approx_eq!(
        volume.total_absorption(),
        running_total,
        running_total.abs() * 1e-9
    );
}

#[test]
fn nrrd_output_is_recognisable() {
    use libconerec::configuration::OutputFormat;

    let config = ReconConfigBuilder::default()
        .with_voxel_size([100.0; 3])
        .with_nvoxels([8; 3])
        .with_pixel_size(60.0)
        .with_work_units(10)
        .with_aperture_deg(90.0)
        .with_step_deg(45.0)
        .with_workers(1)
        .with_output_format(OutputFormat::Ascii)
        .clone()
        .build();
    let input = write_uniform_pgm("nrrd_e2e.pgm", 24, 90);
    let output = PathBuf::from("target/nrrd_e2e.nrrd");
    start_reconstruction(&config, &input, &output).unwrap();
    let text = fs::read_to_string(&output).unwrap();
    assert!(text.starts_with("NRRD0005\n"));
    assert!(text.contains("type: double\n"));
    assert!(text.contains("sizes: 8 8 8\n"));
    assert!(text.contains("encoding: ascii\n"));
    let payload = text.split("\n\n").nth(1).unwrap();
    assert_eq!(payload.split_whitespace().count(), 8 * 8 * 8);
}
