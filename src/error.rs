//! Crate-wide error type.
//!
//! Every failure surfaces as one [`Error`] value carrying enough context
//! (expected vs actual shapes and counts) to diagnose it without re-running.
//! Nothing is coerced: a mismatched shape is never cropped or padded.
//!
//! The variants fall into four families:
//!
//! - **Shape**: a buffer does not satisfy a kernel's contract.
//! - **Load**: weights, images or labels are unreadable or inconsistent.
//! - **Resource**: an intermediate buffer could not be allocated.
//! - **Backend**: the requested backend is missing or failed at runtime.

use crate::backend::Backend;
use crate::tensors::{FlattenOrder, Shape2};

/// All errors produced by `pico_cnn`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A buffer was declared with a zero or inconsistent extent.
    #[error("{op}: invalid shape {height}x{width} ({len} elements)")]
    InvalidShape {
        /// Operation that rejected the shape.
        op: &'static str,
        /// Declared height.
        height: usize,
        /// Declared width.
        width: usize,
        /// Number of elements actually supplied.
        len: usize,
    },

    /// Two buffers that must agree in shape do not.
    #[error("{op}: shape mismatch, expected {expected}, got {got}")]
    ShapeMismatch {
        /// Operation that detected the mismatch.
        op: &'static str,
        /// Shape the operation required.
        expected: String,
        /// Shape it was given.
        got: String,
    },

    /// A convolution filter does not fit inside its input.
    #[error("{op}: {kernel}x{kernel} kernel does not fit a {input} input")]
    KernelTooLarge {
        /// Operation that rejected the filter.
        op: &'static str,
        /// Filter edge length.
        kernel: usize,
        /// Input shape.
        input: Shape2,
    },

    /// Two flat buffers that must have equal length do not.
    #[error("{op}: length mismatch, expected {expected}, got {got}")]
    LengthMismatch {
        /// Operation that detected the mismatch.
        op: &'static str,
        /// Required length.
        expected: usize,
        /// Supplied length.
        got: usize,
    },

    /// A dense layer received features flattened in an order its weights do not use.
    #[error("dense: input flattened {got}, weights expect {expected}")]
    LayoutMismatch {
        /// Order the weight matrix columns follow.
        expected: FlattenOrder,
        /// Order the input was flattened in.
        got: FlattenOrder,
    },

    /// A weight, image or label source could not be used.
    #[error("failed to load {what}: {reason}")]
    Load {
        /// What was being loaded.
        what: String,
        /// Why it failed.
        reason: String,
    },

    /// The image and label sources disagree on the sample count.
    #[error("{images} images != {labels} labels")]
    CountMismatch {
        /// Number of images read.
        images: usize,
        /// Number of labels read.
        labels: usize,
    },

    /// An intermediate buffer could not be allocated.
    #[error("failed to allocate {bytes} bytes for {what}")]
    Allocation {
        /// Buffer being allocated.
        what: &'static str,
        /// Requested size in bytes.
        bytes: usize,
    },

    /// The requested backend is not compiled in or has no usable device.
    #[error("backend `{backend}` is unavailable: {reason}")]
    BackendUnavailable {
        /// Backend that was requested.
        backend: Backend,
        /// Why it cannot run.
        reason: String,
    },

    /// The accelerator failed while executing a kernel.
    #[error("device failure: {0}")]
    Device(String),

    /// A class index outside the configured range was recorded.
    #[error("class {class} is out of range for {classes} classes")]
    ClassOutOfRange {
        /// Offending class index.
        class: usize,
        /// Configured class count.
        classes: usize,
    },

    /// A network description or run configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Malformed JSON network description.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a [`Error::Load`] failure.
    pub fn load(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Load {
            what: what.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for the shape family of errors.
    #[must_use]
    pub const fn is_shape_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidShape { .. }
                | Self::ShapeMismatch { .. }
                | Self::KernelTooLarge { .. }
                | Self::LengthMismatch { .. }
                | Self::LayoutMismatch { .. }
        )
    }
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
