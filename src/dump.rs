//! Debug dumps of intermediate activations.
//!
//! Every buffer is written twice: as an 8-bit binary PGM raster for a quick
//! look, and as raw little-endian `f32` for exact comparison. Feature stacks
//! are written as one tall image, channels stacked vertically; vectors are a
//! single row.
//!
//! Only compiled with the `dump` feature and only used when a dump directory
//! is requested; the forward pass itself never writes files.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::network::Activation;
use crate::tensors::{FeatureMap, TensorFloat};

/// Writes `data` (`height × width`, row-major) as a binary PGM, min–max
/// normalised to `0..=255`. A constant buffer becomes all black.
///
/// # Errors
/// [`Error::LengthMismatch`] if `data` is not `height × width` long,
/// [`Error::Io`] if writing fails.
pub fn write_pgm(
    path: impl AsRef<Path>,
    data: &[TensorFloat],
    height: usize,
    width: usize,
) -> Result<()> {
    if data.len() != height * width {
        return Err(Error::LengthMismatch {
            op: "write_pgm",
            expected: height * width,
            got: data.len(),
        });
    }
    let (lo, hi) = data
        .iter()
        .filter(|v| v.is_finite())
        .fold((TensorFloat::INFINITY, TensorFloat::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = hi - lo;

    let mut out = BufWriter::new(File::create(path)?);
    write!(out, "P5\n{width} {height}\n255\n")?;
    let pixels: Vec<u8> = data
        .iter()
        .map(|&v| {
            if range > 0.0 && v.is_finite() {
                ((v - lo) / range * 255.0).round().clamp(0.0, 255.0) as u8
            } else {
                0
            }
        })
        .collect();
    out.write_all(&pixels)?;
    out.flush()?;
    Ok(())
}

/// Writes `data` as raw little-endian `f32`.
///
/// # Errors
/// [`Error::Io`] if writing fails.
pub fn write_float(path: impl AsRef<Path>, data: &[TensorFloat]) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for v in data {
        out.write_all(&v.to_le_bytes())?;
    }
    out.flush()?;
    Ok(())
}

/// Lays an activation out as one plane: `(samples, height, width)`.
#[must_use]
pub fn activation_plane(act: &Activation) -> (Vec<TensorFloat>, usize, usize) {
    match act {
        Activation::Maps(maps) => {
            let shape = maps.map_shape();
            let data = maps
                .channels()
                .iter()
                .flat_map(|c| c.data().iter().copied())
                .collect();
            (data, maps.len() * shape.height, shape.width)
        }
        Activation::Vector(v) => (v.data().to_vec(), 1, v.len()),
    }
}

/// Writes the input and every stage output of one forward pass into a
/// directory.
///
/// Files are named `input.{pgm,float}` and `NN_<stage>.{pgm,float}` where
/// `NN` is the stage index.
#[derive(Debug, Clone)]
pub struct StageDumper {
    dir: PathBuf,
}

impl StageDumper {
    /// Creates `dir` if needed.
    ///
    /// # Errors
    /// [`Error::Io`] if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Dumps the network input.
    ///
    /// # Errors
    /// [`Error::Io`] if writing fails.
    pub fn input(&self, image: &FeatureMap) -> Result<()> {
        self.write("input", image.data(), image.height(), image.width())
    }

    /// Dumps one stage output; pass this to
    /// [`Network::forward_observed`](crate::network::Network::forward_observed).
    ///
    /// # Errors
    /// [`Error::Io`] if writing fails.
    pub fn observe(&self, index: usize, name: &str, act: &Activation) -> Result<()> {
        let (data, height, width) = activation_plane(act);
        self.write(&format!("{index:02}_{name}"), &data, height, width)
    }

    fn write(&self, stem: &str, data: &[TensorFloat], height: usize, width: usize) -> Result<()> {
        write_pgm(self.dir.join(format!("{stem}.pgm")), data, height, width)?;
        write_float(self.dir.join(format!("{stem}.float")), data)?;
        debug!(dir = %self.dir.display(), stem, height, width, "dumped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_map;
    use crate::tensors::FeatureStack;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pico_cnn_dump_{name}_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn pgm_is_min_max_normalised() {
        let dir = scratch("pgm");
        let path = dir.join("a.pgm");
        write_pgm(&path, &[-1.0, 0.0, 1.0, 1.0], 2, 2).unwrap();
        let bytes = fs::read(&path).unwrap();
        let header = b"P5\n2 2\n255\n";
        assert_eq!(&bytes[..header.len()], header);
        assert_eq!(&bytes[header.len()..], &[0, 128, 255, 255]);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn channels_stack_vertically() {
        let a = feature_map!([[1, 2], [3, 4]]);
        let b = feature_map!([[5, 6], [7, 8]]);
        let act = Activation::Maps(FeatureStack::new(vec![a, b]).unwrap());
        let (data, h, w) = activation_plane(&act);
        assert_eq!((h, w), (4, 2));
        assert_eq!(data, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn float_dump_is_raw_le() {
        let dir = scratch("float");
        let path = dir.join("a.float");
        write_float(&path, &[1.5, -2.0]).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(f32::from_le_bytes(bytes[..4].try_into().unwrap()), 1.5);
        fs::remove_dir_all(dir).unwrap();
    }
}
