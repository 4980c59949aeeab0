//! Objects and functions that deal directly with the projection stream.
//!
//! Two container formats are understood, picked by file extension: a
//! textual PGM raster that stacks all projections vertically and carries
//! the projection angles in comment lines, and a little-endian binary DAT
//! stream. Both yield [`RawProjection`] records that are resolved to a
//! sweep slot by [`Projection::from_raw`].

use std::fs::{read_to_string, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::geometry::Geometry;
use crate::ReconError;

/// A projection as it appears in the container, before its angle has been
/// resolved to a slot in the angular sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct RawProjection {
    pub angle_deg: f64,
    pub n_side_pixels: usize,
    pub min_val: f64,
    pub max_val: f64,
    pub pixels: Vec<f64>,
}

/// A single cone-beam projection, resolved and ready for backprojection.
#[derive(Debug, Clone)]
pub struct Projection {
    /// Slot of this projection in the sweep, in [0, ntheta).
    pub index: usize,
    pub angle_rad: f64,
    pub n_side_pixels: usize,
    pub min_val: f64,
    pub max_val: f64,
    /// Row-major samples, `n_side_pixels` squared of them.
    pub pixels: Vec<f64>,
}

impl Projection {
    /// Validate a raw record and resolve its angle against the sweep.
    pub fn from_raw(raw: RawProjection, geometry: &Geometry) -> Result<Self, ReconError> {
        if !(-360.0..=360.0).contains(&raw.angle_deg) {
            return Err(ReconError::InputMalformed(format!(
                "projection angle {} outside [-360, 360]",
                raw.angle_deg
            )));
        }
        if raw.max_val <= raw.min_val {
            return Err(ReconError::InputMalformed(format!(
                "sample range [{}, {}] is empty",
                raw.min_val, raw.max_val
            )));
        }
        if raw.n_side_pixels == 0 || raw.pixels.len() != raw.n_side_pixels * raw.n_side_pixels {
            return Err(ReconError::InputMalformed(format!(
                "expected {} samples for a {}-pixel detector side, found {}",
                raw.n_side_pixels * raw.n_side_pixels,
                raw.n_side_pixels,
                raw.pixels.len()
            )));
        }
        let mut normalised = raw.angle_deg % 360.0;
        if normalised >= 180.0 {
            normalised -= 360.0;
        }
        if normalised < -180.0 {
            normalised += 360.0;
        }
        Ok(Self {
            index: geometry.projection_index(raw.angle_deg),
            angle_rad: normalised.to_radians(),
            n_side_pixels: raw.n_side_pixels,
            min_val: raw.min_val,
            max_val: raw.max_val,
            pixels: raw.pixels,
        })
    }

    /// Detector sample at (row, col), rescaled into [0, 1].
    pub fn normalised(&self, row: usize, col: usize) -> f64 {
        let sample = self.pixels[row * self.n_side_pixels + col];
        (sample - self.min_val) / (self.max_val - self.min_val)
    }
}

/// A source of raw projections together with the count the container
/// claims to hold. The scheduler checks that count against the sweep
/// before any ray is traced.
pub trait ProjectionSource: Iterator<Item = Result<RawProjection, ReconError>> {
    fn declared_count(&self) -> usize;
}

/// Open the container at `path`, picking the reader by extension.
pub fn open_source(path: &Path) -> Result<Box<dyn ProjectionSource>, ReconError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("pgm") => Ok(Box::new(StoredSource::from_pgm_path(path)?)),
        Some("dat") => Ok(Box::new(DatSource::open(path)?)),
        other => Err(ReconError::InputMalformed(format!(
            "unrecognised input extension {:?}",
            other
        ))),
    }
}

/// An eagerly parsed projection container held fully in memory.
///
/// The PGM reader produces one of these; tests construct them directly
/// from synthetic records.
pub struct StoredSource {
    declared: usize,
    raw: std::vec::IntoIter<RawProjection>,
}

impl StoredSource {
    pub fn new(raw: Vec<RawProjection>) -> Self {
        Self {
            declared: raw.len(),
            raw: raw.into_iter(),
        }
    }

    /// Parse a stacked-raster PGM file.
    ///
    /// The header is the usual `P2` / width height / maxVal triple; the
    /// raster holds all projections stacked vertically, so the height is
    /// a multiple of the width. Every projection is preceded by a comment
    /// line carrying its angle in degrees, e.g. `# angle: 15.0`. PGM
    /// samples have no offset, so `min_val` is zero.
    pub fn from_pgm_path(path: &Path) -> Result<Self, ReconError> {
        let content = read_to_string(path)
            .map_err(|e| ReconError::InputUnavailable(path.to_path_buf(), e))?;

        let mut angles = Vec::new();
        let mut tokens = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if let Some(comment) = line.strip_prefix('#') {
                if comment.contains("angle") {
                    let angle = comment
                        .split_whitespace()
                        .last()
                        .and_then(|t| t.parse::<f64>().ok())
                        .ok_or_else(|| {
                            ReconError::InputMalformed(format!(
                                "unparsable angle comment {:?}",
                                line
                            ))
                        })?;
                    angles.push(angle);
                }
                continue;
            }
            tokens.extend(line.split_whitespace().map(str::to_owned));
        }

        if tokens.first().map(String::as_str) != Some("P2") {
            return Err(ReconError::InputMalformed(format!(
                "wrong magic {:?}, expected P2",
                tokens.first()
            )));
        }
        let mut header = tokens[1..].iter().take(3).map(|t| t.parse::<f64>());
        let (width, height, max_val) = match (header.next(), header.next(), header.next()) {
            (Some(Ok(w)), Some(Ok(h)), Some(Ok(m))) => (w as usize, h as usize, m),
            _ => {
                return Err(ReconError::InputMalformed(
                    "truncated or non-numeric PGM header".to_owned(),
                ))
            }
        };
        if width == 0 || height % width != 0 {
            return Err(ReconError::InputMalformed(format!(
                "raster height {} is not a multiple of width {}",
                height, width
            )));
        }
        let nprojections = height / width;
        let samples = &tokens[4..];
        if samples.len() != nprojections * width * width {
            return Err(ReconError::InputMalformed(format!(
                "expected {} samples, found {}",
                nprojections * width * width,
                samples.len()
            )));
        }
        if angles.len() != nprojections {
            return Err(ReconError::InputMalformed(format!(
                "expected {} angle annotations, found {}",
                nprojections,
                angles.len()
            )));
        }

        let mut raw = Vec::with_capacity(nprojections);
        for (projection, angle_deg) in angles.into_iter().enumerate() {
            let mut pixels = Vec::new();
            pixels
                .try_reserve_exact(width * width)
                .map_err(|_| {
                    ReconError::InputMalformed("projection pixel buffer allocation failed".to_owned())
                })?;
            for token in &samples[projection * width * width..(projection + 1) * width * width] {
                let sample = token.parse::<f64>().map_err(|_| {
                    ReconError::InputMalformed(format!("non-numeric sample {:?}", token))
                })?;
                pixels.push(sample);
            }
            raw.push(RawProjection {
                angle_deg,
                n_side_pixels: width,
                min_val: 0.0,
                max_val,
                pixels,
            });
        }
        Ok(Self::new(raw))
    }
}

impl Iterator for StoredSource {
    type Item = Result<RawProjection, ReconError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.raw.next().map(Ok)
    }
}

impl ProjectionSource for StoredSource {
    fn declared_count(&self) -> usize {
        self.declared
    }
}

/// A lazily read little-endian binary container.
///
/// Layout: `i32` projection count, `i32` detector side, `f64` maxVal,
/// `f64` minVal, then per projection an `f64` angle in degrees followed
/// by side-squared `f64` samples. Projections are pulled off the stream
/// one at a time, so only a single projection is resident while the
/// workers drain the previous ones.
pub struct DatSource {
    path: PathBuf,
    reader: BufReader<File>,
    declared: usize,
    n_side_pixels: usize,
    min_val: f64,
    max_val: f64,
    remaining: usize,
}

impl DatSource {
    pub fn open(path: &Path) -> Result<Self, ReconError> {
        let file =
            File::open(path).map_err(|e| ReconError::InputUnavailable(path.to_path_buf(), e))?;
        let mut reader = BufReader::new(file);
        let unavailable =
            |e: std::io::Error| ReconError::InputUnavailable(path.to_path_buf(), e);
        let nprojections = reader.read_i32::<LittleEndian>().map_err(unavailable)?;
        let n_side_pixels = reader.read_i32::<LittleEndian>().map_err(unavailable)?;
        let max_val = reader.read_f64::<LittleEndian>().map_err(unavailable)?;
        let min_val = reader.read_f64::<LittleEndian>().map_err(unavailable)?;
        if nprojections < 1 || n_side_pixels < 1 {
            return Err(ReconError::InputMalformed(format!(
                "container declares {} projections of side {}",
                nprojections, n_side_pixels
            )));
        }
        if max_val <= min_val {
            return Err(ReconError::InputMalformed(format!(
                "sample range [{}, {}] is empty",
                min_val, max_val
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            declared: nprojections as usize,
            n_side_pixels: n_side_pixels as usize,
            min_val,
            max_val,
            remaining: nprojections as usize,
        })
    }

    fn read_projection(&mut self) -> Result<RawProjection, ReconError> {
        let angle_deg = self
            .reader
            .read_f64::<LittleEndian>()
            .map_err(|e| ReconError::InputUnavailable(self.path.clone(), e))?;
        let count = self.n_side_pixels * self.n_side_pixels;
        let mut pixels = Vec::new();
        pixels.try_reserve_exact(count).map_err(|_| {
            ReconError::InputMalformed("projection pixel buffer allocation failed".to_owned())
        })?;
        for _ in 0..count {
            let sample = self
                .reader
                .read_f64::<LittleEndian>()
                .map_err(|e| ReconError::InputUnavailable(self.path.clone(), e))?;
            pixels.push(sample);
        }
        Ok(RawProjection {
            angle_deg,
            n_side_pixels: self.n_side_pixels,
            min_val: self.min_val,
            max_val: self.max_val,
            pixels,
        })
    }
}

impl Iterator for DatSource {
    type Item = Result<RawProjection, ReconError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let projection = self.read_projection();
        if projection.is_err() {
            // Do not keep pulling from a stream that already failed.
            self.remaining = 0;
        }
        Some(projection)
    }
}

impl ProjectionSource for DatSource {
    fn declared_count(&self) -> usize {
        self.declared
    }
}
