//! Saving and loading of model weights.
//!
//! # `pcnw` Weights Container
//!
//! A small little-endian binary container holding one [`LayerWeights`] per
//! layer, in the order stages reference them.
//!
//! ```text
//! ┌────────────┬──────────────────────────────────────┐
//! │ Header     │ Layer 0, Layer 1 …                   │
//! ├────────────┼──────────────────────────────────────┤
//! │ "pcnw"[4]  │ u64: ndim                            │
//! │ u8: count  │ [u64; ndim] kernel shape             │
//! │            │ u64: bias_len                        │
//! │            │ [f32; prod(shape)] kernels           │
//! │            │ [f32; bias_len] bias                 │
//! └────────────┴──────────────────────────────────────┘
//! ```
//!
//! # Limitations
//! - At most 255 layers per file (`u8` count)
//! - No names or per-layer metadata; stages address layers by position
//!
//! A truncated or inconsistent file is an [`Error::Load`]; nothing is padded.
//!
//! # Example
//!
//! ```rust
//! use pico_cnn::modelio::{read_weights, write_weights};
//! use pico_cnn::weights::{LayerWeights, WeightSet};
//!
//! let set = WeightSet::new(vec![
//!     LayerWeights::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0], vec![0.5, -0.5]).unwrap(),
//! ]);
//! let mut bytes = Vec::new();
//! write_weights(&mut bytes, &set).unwrap();
//! assert_eq!(read_weights(bytes.as_slice()).unwrap(), set);
//! ```

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use tracing::info;

use crate::error::{Error, Result};
use crate::tensors::TensorFloat;
use crate::weights::{LayerWeights, WeightSet};

const PCNW_MAGIC: &[u8; 4] = b"pcnw";

/// Upper bound on tensor rank; anything larger is a corrupt header.
const MAX_NDIM: u64 = 8;

/// Writes `set` to `w`.
///
/// # Errors
/// [`Error::Config`] for more than 255 layers, [`Error::Io`] if writing fails.
pub fn write_weights<W: Write>(mut w: W, set: &WeightSet) -> Result<()> {
    let count = u8::try_from(set.len())
        .map_err(|_| Error::Config(format!("{} layers exceed the 255 layer limit", set.len())))?;
    w.write_all(PCNW_MAGIC)?;
    w.write_all(&[count])?;

    for layer in set.layers() {
        w.write_all(&(layer.shape().len() as u64).to_le_bytes())?;
        for &dim in layer.shape() {
            w.write_all(&(dim as u64).to_le_bytes())?;
        }
        w.write_all(&(layer.bias().len() as u64).to_le_bytes())?;
        for &v in layer.kernels().iter().chain(layer.bias()) {
            w.write_all(&v.to_le_bytes())?;
        }
    }
    w.flush()?;
    Ok(())
}

/// Reads a weight set from `r`.
///
/// # Errors
/// [`Error::Load`] for a bad magic, a truncated stream or inconsistent shapes.
pub fn read_weights<R: Read>(mut r: R) -> Result<WeightSet> {
    let mut magic = [0u8; 4];
    read_exact(&mut r, &mut magic, "header")?;
    if &magic != PCNW_MAGIC {
        return Err(Error::load("weights", "invalid magic header"));
    }
    let mut count = [0u8; 1];
    read_exact(&mut r, &mut count, "header")?;

    let mut layers = Vec::with_capacity(usize::from(count[0]));
    for index in 0..count[0] {
        let ndim = read_u64(&mut r, "layer rank")?;
        if ndim == 0 || ndim > MAX_NDIM {
            return Err(Error::load(
                "weights",
                format!("layer {index} has rank {ndim}"),
            ));
        }
        let shape = (0..ndim)
            .map(|_| read_u64(&mut r, "layer shape").and_then(to_usize))
            .collect::<Result<Vec<_>>>()?;
        let bias_len = read_u64(&mut r, "bias length").and_then(to_usize)?;
        let len = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| Error::load("weights", format!("layer {index} shape overflows")))?;

        let kernels = read_floats(&mut r, len, "kernels")?;
        let bias = read_floats(&mut r, bias_len, "bias")?;
        layers.push(LayerWeights::new(shape, kernels, bias)?);
    }

    Ok(WeightSet::new(layers))
}

/// Saves `set` to a file at `path`.
///
/// # Errors
/// Same as [`write_weights`], plus [`Error::Io`] if the file cannot be created.
pub fn save_weights(path: impl AsRef<Path>, set: &WeightSet) -> Result<()> {
    let file = BufWriter::new(File::create(path)?);
    write_weights(file, set)
}

/// Loads a weight set from the file at `path`.
///
/// # Errors
/// [`Error::Load`] naming the path if the file cannot be opened or decoded.
pub fn load_weights(path: impl AsRef<Path>) -> Result<WeightSet> {
    let path = path.as_ref();
    let what = format!("weights from '{}'", path.display());
    let file = File::open(path).map_err(|e| Error::load(what.clone(), e.to_string()))?;
    let set = read_weights(BufReader::new(file)).map_err(|e| match e {
        Error::Load { reason, .. } => Error::load(what.clone(), reason),
        Error::Io(io) => Error::load(what.clone(), io.to_string()),
        other => other,
    })?;
    info!(path = %path.display(), layers = set.len(), "weights loaded");
    Ok(set)
}

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::load("weights", format!("truncated {what}")),
        _ => Error::Io(e),
    })
}

fn read_u64<R: Read>(r: &mut R, what: &str) -> Result<u64> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf, what)?;
    Ok(u64::from_le_bytes(buf))
}

fn to_usize(v: u64) -> Result<usize> {
    usize::try_from(v)
        .map_err(|_| Error::load("weights", format!("extent {v} does not fit in memory")))
}

/// Reads `len` floats without trusting `len` for the allocation size.
fn read_floats<R: Read>(r: &mut R, len: usize, what: &str) -> Result<Vec<TensorFloat>> {
    let bytes = len
        .checked_mul(size_of::<TensorFloat>())
        .ok_or_else(|| Error::load("weights", format!("{what} length overflows")))?;
    let mut buf = Vec::new();
    r.by_ref().take(bytes as u64).read_to_end(&mut buf)?;
    if buf.len() != bytes {
        return Err(Error::load(
            "weights",
            format!("truncated {what}: expected {bytes} bytes, got {}", buf.len()),
        ));
    }
    Ok(buf
        .chunks_exact(size_of::<TensorFloat>())
        .map(|b| TensorFloat::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WeightSet {
        WeightSet::new(vec![
            LayerWeights::new(vec![2, 1, 2, 2], (0..8).map(|v| v as f32).collect(), vec![1.0, 2.0])
                .unwrap(),
            LayerWeights::new(vec![3, 2], vec![0.5; 6], vec![0.0, 0.1, 0.2]).unwrap(),
        ])
    }

    #[test]
    fn header_layout() {
        let mut bytes = Vec::new();
        write_weights(&mut bytes, &sample()).unwrap();
        assert_eq!(&bytes[..4], b"pcnw");
        assert_eq!(bytes[4], 2);
        assert_eq!(u64::from_le_bytes(bytes[5..13].try_into().unwrap()), 4);
    }

    #[test]
    fn rejects_bad_magic() {
        let err = read_weights(&b"nope\x00"[..]).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut bytes = Vec::new();
        write_weights(&mut bytes, &sample()).unwrap();
        bytes.truncate(bytes.len() - 3);
        let err = read_weights(bytes.as_slice()).unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn load_names_missing_file() {
        let err = load_weights("/definitely/not/here.pcnw").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.pcnw"));
    }
}
