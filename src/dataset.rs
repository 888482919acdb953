//! Image/Label Provider for IDX files (the MNIST distribution format).
//!
//! Images are decoded into [`FeatureMap`]s with pixels scaled from `0..=255`
//! to `[0, 1]`; labels become class indices. A [`Dataset`] pairs the two and
//! refuses to exist unless the counts agree.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use tracing::info;

use crate::error::{Error, Result};
use crate::tensors::{FeatureMap, Shape2, TensorFloat};

/// Test-set image file name inside an MNIST directory.
pub const IMAGES_FILE: &str = "t10k-images.idx3-ubyte";
/// Test-set label file name inside an MNIST directory.
pub const LABELS_FILE: &str = "t10k-labels.idx1-ubyte";

const IMAGES_MAGIC: u32 = 2051;
const LABELS_MAGIC: u32 = 2049;

/// Headers are untrusted; never reserve more images than this up front.
const PREALLOC_LIMIT: usize = 1 << 12;

/// Reads up to `limit` images from an IDX3 stream.
///
/// # Errors
/// [`Error::Load`] for a wrong magic number, a zero extent or a truncated body.
pub fn read_idx_images<R: Read>(mut r: R, limit: Option<usize>) -> Result<Vec<FeatureMap>> {
    let magic = read_be_u32(&mut r, "images")?;
    if magic != IMAGES_MAGIC {
        return Err(Error::load(
            "images",
            format!("magic number {magic}, expected {IMAGES_MAGIC}"),
        ));
    }
    let count = read_be_u32(&mut r, "images")? as usize;
    let height = read_be_u32(&mut r, "images")? as usize;
    let width = read_be_u32(&mut r, "images")? as usize;
    let shape = Shape2::new(height, width);
    if shape.is_empty() {
        return Err(Error::load("images", format!("image shape {shape}")));
    }

    let plane = height
        .checked_mul(width)
        .ok_or_else(|| Error::load("images", format!("image shape {shape} overflows")))?;

    let count = limit.map_or(count, |l| l.min(count));
    let mut images = Vec::with_capacity(count.min(PREALLOC_LIMIT));
    for i in 0..count {
        let pixels = read_block(&mut r, plane, "images", || format!("image {i} of {count}"))?;
        let data = pixels
            .iter()
            .map(|&p| TensorFloat::from(p) / 255.0)
            .collect();
        images.push(FeatureMap::new(height, width, data)?);
    }
    Ok(images)
}

/// Reads up to `limit` labels from an IDX1 stream.
///
/// # Errors
/// [`Error::Load`] for a wrong magic number or a truncated body.
pub fn read_idx_labels<R: Read>(mut r: R, limit: Option<usize>) -> Result<Vec<usize>> {
    let magic = read_be_u32(&mut r, "labels")?;
    if magic != LABELS_MAGIC {
        return Err(Error::load(
            "labels",
            format!("magic number {magic}, expected {LABELS_MAGIC}"),
        ));
    }
    let count = read_be_u32(&mut r, "labels")? as usize;
    let count = limit.map_or(count, |l| l.min(count));
    let raw = read_block(&mut r, count, "labels", || format!("{count} labels"))?;
    Ok(raw.into_iter().map(usize::from).collect())
}

fn read_be_u32<R: Read>(r: &mut R, what: &str) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|e| truncated(what, &e, "header".into()))?;
    Ok(u32::from_be_bytes(buf))
}

/// Reads exactly `len` bytes without trusting `len` for the allocation size.
fn read_block<R: Read>(
    r: &mut R,
    len: usize,
    what: &str,
    part: impl Fn() -> String,
) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.by_ref()
        .take(len as u64)
        .read_to_end(&mut buf)
        .map_err(|e| truncated(what, &e, part()))?;
    if buf.len() != len {
        return Err(Error::load(
            what,
            format!("truncated while reading {}: got {} of {len} bytes", part(), buf.len()),
        ));
    }
    Ok(buf)
}

fn truncated(what: &str, e: &io::Error, part: String) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::load(what, format!("truncated while reading {part}"))
    } else {
        Error::load(what, e.to_string())
    }
}

/// Images and their labels, index-aligned.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    images: Vec<FeatureMap>,
    labels: Vec<usize>,
}

impl Dataset {
    /// Pairs `images` with `labels`.
    ///
    /// # Errors
    /// [`Error::CountMismatch`] if the counts differ, [`Error::ShapeMismatch`]
    /// if the images do not share one shape.
    pub fn new(images: Vec<FeatureMap>, labels: Vec<usize>) -> Result<Self> {
        if images.len() != labels.len() {
            return Err(Error::CountMismatch {
                images: images.len(),
                labels: labels.len(),
            });
        }
        if let Some(first) = images.first() {
            if let Some(bad) = images.iter().find(|m| m.shape() != first.shape()) {
                return Err(Error::ShapeMismatch {
                    op: "dataset",
                    expected: first.shape().to_string(),
                    got: bad.shape().to_string(),
                });
            }
        }
        Ok(Self { images, labels })
    }

    /// Loads the MNIST test split from `dir`, keeping at most `limit` samples.
    ///
    /// # Errors
    /// [`Error::Load`] naming the file that failed, or
    /// [`Error::CountMismatch`] if the two files disagree.
    pub fn load_mnist(dir: impl AsRef<Path>, limit: Option<usize>) -> Result<Self> {
        let dir = dir.as_ref();
        let images_path = dir.join(IMAGES_FILE);
        let labels_path = dir.join(LABELS_FILE);

        info!(path = %images_path.display(), "reading images");
        let images = read_idx_images(open(&images_path)?, limit)
            .map_err(|e| with_path(e, &images_path))?;
        info!(path = %labels_path.display(), "reading labels");
        let labels = read_idx_labels(open(&labels_path)?, limit)
            .map_err(|e| with_path(e, &labels_path))?;

        let set = Self::new(images, labels)?;
        info!(samples = set.len(), "dataset loaded");
        Ok(set)
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// `true` if there are no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Shape shared by every image, if there is at least one.
    #[must_use]
    pub fn image_shape(&self) -> Option<Shape2> {
        self.images.first().map(FeatureMap::shape)
    }

    /// All images.
    #[must_use]
    pub fn images(&self) -> &[FeatureMap] {
        &self.images
    }

    /// All labels.
    #[must_use]
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// `(image, label)` pairs in order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&FeatureMap, usize)> + '_ {
        self.images.iter().zip(self.labels.iter().copied())
    }
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::load(format!("'{}'", path.display()), e.to_string()))
}

fn with_path(e: Error, path: &Path) -> Error {
    match e {
        Error::Load { what, reason } => {
            Error::load(format!("{what} from '{}'", path.display()), reason)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx_images(count: u32, h: u32, w: u32, pixels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for v in [IMAGES_MAGIC, count, h, w] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        bytes.extend_from_slice(pixels);
        bytes
    }

    #[test]
    fn images_are_scaled_to_unit_range() {
        let bytes = idx_images(1, 2, 2, &[0, 255, 51, 102]);
        let images = read_idx_images(bytes.as_slice(), None).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].data(), &[0.0, 1.0, 0.2, 0.4]);
    }

    #[test]
    fn limit_caps_sample_count() {
        let bytes = idx_images(3, 1, 2, &[1, 2, 3, 4, 5, 6]);
        assert_eq!(read_idx_images(bytes.as_slice(), Some(2)).unwrap().len(), 2);
        assert_eq!(read_idx_images(bytes.as_slice(), Some(9)).unwrap().len(), 3);
    }

    #[test]
    fn truncated_images_fail() {
        let bytes = idx_images(2, 2, 2, &[1, 2, 3, 4, 5]);
        let err = read_idx_images(bytes.as_slice(), None).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn huge_header_count_is_a_load_error() {
        let bytes = idx_images(u32::MAX, 1, 1, &[1, 2, 3]);
        let err = read_idx_images(bytes.as_slice(), None).unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
        assert!(err.to_string().contains("image 3 of"));

        let bytes = idx_images(1, u32::MAX, u32::MAX, &[0; 16]);
        let err = read_idx_images(bytes.as_slice(), None).unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
    }

    #[test]
    fn huge_label_count_is_a_load_error() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&LABELS_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        bytes.extend_from_slice(&[4, 5]);
        let err = read_idx_labels(bytes.as_slice(), None).unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
        assert!(err.to_string().contains("got 2 of"));
    }

    #[test]
    fn labels_check_magic() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&LABELS_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(&[7, 2, 1]);
        assert_eq!(read_idx_labels(bytes.as_slice(), None).unwrap(), vec![7, 2, 1]);
        assert!(read_idx_labels(idx_images(0, 1, 1, &[]).as_slice(), None).is_err());
    }

    #[test]
    fn dataset_requires_equal_counts() {
        let images = vec![FeatureMap::zeros(2, 2).unwrap(); 3];
        let err = Dataset::new(images, vec![0, 1]).unwrap_err();
        assert_eq!(err.to_string(), "3 images != 2 labels");
    }
}
