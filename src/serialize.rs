//! Serialization of the reconstructed volume to NRRD and RAW containers.
//!
//! Both containers carry the coefficients in the volume's fixed index
//! order, X fastest, then Z, then Y, which is why the NRRD header lists
//! the axes in that order.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::configuration::OutputFormat;
use crate::geometry::{X, Y, Z};
use crate::volume::Volume;
use crate::ReconError;

/// Serialize the volume to `path`, picking the container by extension.
pub fn write_volume(volume: &Volume, path: &Path, format: OutputFormat) -> Result<(), ReconError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("nrrd") => write_nrrd(volume, path, format),
        Some("raw") => write_raw(volume, path),
        other => Err(ReconError::OutputUnavailable(
            path.to_path_buf(),
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unrecognised output extension {:?}", other),
            ),
        )),
    }
}

fn write_nrrd(volume: &Volume, path: &Path, format: OutputFormat) -> Result<(), ReconError> {
    let file =
        File::create(path).map_err(|e| ReconError::OutputUnavailable(path.to_path_buf(), e))?;
    let mut writer = BufWriter::new(file);
    nrrd_to_writer(volume, &mut writer, format)
        .and_then(|_| writer.flush())
        .map_err(|e| ReconError::OutputUnavailable(path.to_path_buf(), e))?;
    info!("NRRD volume written to {:?}", path);
    Ok(())
}

fn nrrd_to_writer<W: Write>(volume: &Volume, writer: &mut W, format: OutputFormat) -> io::Result<()> {
    let n = volume.nvoxels();
    let s = volume.voxel_size();
    let encoding = match format {
        OutputFormat::Binary => "raw",
        OutputFormat::Ascii => "ascii",
    };
    writeln!(writer, "NRRD0005")?;
    writeln!(writer, "# Complete NRRD file format specification at:")?;
    writeln!(writer, "# http://teem.sourceforge.net/nrrd/format.html")?;
    writeln!(writer, "type: double")?;
    writeln!(writer, "dimension: 3")?;
    writeln!(writer, "sizes: {} {} {}", n[X], n[Z], n[Y])?;
    writeln!(writer, "spacings: {} {} {}", s[X], s[Z], s[Y])?;
    writeln!(
        writer,
        "axis mins: {} {} {}",
        axis_min(volume, X),
        axis_min(volume, Z),
        axis_min(volume, Y)
    )?;
    writeln!(writer, "endian: little")?;
    writeln!(writer, "encoding: {}", encoding)?;
    writeln!(writer)?;
    match format {
        OutputFormat::Binary => {
            for &coefficient in volume.coefficients() {
                writer.write_f64::<LittleEndian>(coefficient)?;
            }
        }
        OutputFormat::Ascii => {
            for &coefficient in volume.coefficients() {
                writeln!(writer, "{}", coefficient)?;
            }
        }
    }
    Ok(())
}

/// Coordinate of the first grid plane along an axis; the grid is centred
/// on the origin.
fn axis_min(volume: &Volume, axis: usize) -> f64 {
    -(volume.voxel_size()[axis] * volume.nvoxels()[axis] as f64) / 2.0
}

/// Headerless dump of the coefficient array. The metadata an external
/// viewer needs to reassemble the volume goes to the log instead.
fn write_raw(volume: &Volume, path: &Path) -> Result<(), ReconError> {
    let file =
        File::create(path).map_err(|e| ReconError::OutputUnavailable(path.to_path_buf(), e))?;
    let mut writer = BufWriter::new(file);
    let result: io::Result<()> = volume
        .coefficients()
        .iter()
        .try_for_each(|&coefficient| writer.write_f64::<LittleEndian>(coefficient))
        .and_then(|_| writer.flush());
    result.map_err(|e| ReconError::OutputUnavailable(path.to_path_buf(), e))?;
    let n = volume.nvoxels();
    let s = volume.voxel_size();
    info!(
        "RAW volume written to {:?}: sizes {} {} {} (x z y, x fastest), spacings {} {} {}, little-endian f64",
        path, n[X], n[Z], n[Y], s[X], s[Z], s[Y]
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::*;
    use crate::configuration::ReconConfigBuilder;
    use crate::geometry::Geometry;

    fn setup_volume() -> Volume {
        let config = ReconConfigBuilder::default()
            .with_voxel_size([100.0, 50.0, 25.0])
            .with_nvoxels([2, 3, 4])
            .clone()
            .build();
        let geometry = Geometry::from_config(&config);
        let mut volume = Volume::zeroed(&geometry).unwrap();
        volume.add(0, 1.5);
        volume.add(23, 0.25);
        volume
    }

    #[test]
    fn nrrd_header_lists_axes_fastest_first() {
        let volume = setup_volume();
        let mut buffer = Vec::new();
        nrrd_to_writer(&volume, &mut buffer, OutputFormat::Ascii).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.starts_with("NRRD0005\n"));
        assert!(text.contains("sizes: 2 4 3\n"));
        assert!(text.contains("spacings: 100 25 50\n"));
        assert!(text.contains("axis mins: -100 -50 -75\n"));
        assert!(text.contains("encoding: ascii\n"));
    }

    #[test]
    fn nrrd_ascii_payload_follows_a_blank_line() {
        let volume = setup_volume();
        let mut buffer = Vec::new();
        nrrd_to_writer(&volume, &mut buffer, OutputFormat::Ascii).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let payload = text.split("\n\n").nth(1).unwrap();
        let values: Vec<f64> = payload
            .split_whitespace()
            .map(|t| t.parse().unwrap())
            .collect();
        assert_eq!(values.len(), 24);
        assert_eq!(values[0], 1.5);
        assert_eq!(values[23], 0.25);
    }

    #[test]
    fn nrrd_binary_payload_is_little_endian() {
        let volume = setup_volume();
        let mut buffer = Vec::new();
        nrrd_to_writer(&volume, &mut buffer, OutputFormat::Binary).unwrap();
        let header_end = buffer.windows(2).position(|w| w == b"\n\n").unwrap() + 2;
        let payload = &buffer[header_end..];
        assert_eq!(payload.len(), 24 * 8);
        assert_eq!(f64::from_le_bytes(payload[..8].try_into().unwrap()), 1.5);
    }

    #[test]
    fn raw_dump_has_no_header() {
        let volume = setup_volume();
        let path = PathBuf::from("target/volume_dump.raw");
        write_volume(&volume, &path, OutputFormat::Binary).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 24 * 8);
        assert_eq!(f64::from_le_bytes(bytes[..8].try_into().unwrap()), 1.5);
    }

    #[test]
    fn unrecognised_extension_is_rejected() {
        let volume = setup_volume();
        assert!(matches!(
            write_volume(&volume, Path::new("target/volume.tiff"), OutputFormat::Binary),
            Err(ReconError::OutputUnavailable(_, _))
        ));
    }
}
