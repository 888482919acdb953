//! # Kernel Library
//!
//! Stateless numeric kernels and the backends that implement them.
//!
//! ## Submodules
//!
//! - [`naive`]: scalar reference kernels, the numeric baseline
//! - [`cpu`]: the same kernels parallelised with `rayon`
//! - [`wgpu`] *(opt-in)*: GPU compute shader offload using `wgpu`
//! - [`dispatch`]: backend selection and layer-level fan-out
//!
//! ## Contract
//!
//! Every backend implements [`Kernels`]. All implementations compute the same
//! function over the same shapes; they may differ only by floating-point
//! reduction order, so results agree within
//! [`BACKEND_TOLERANCE`](crate::approx::BACKEND_TOLERANCE).
//!
//! Shape validation lives here, in backend-agnostic helpers that every
//! implementation calls before touching data. A kernel therefore either
//! rejects its inputs before computing anything or produces an output of
//! exactly the declared shape.
//!
//! ## Extending the Backend
//!
//! To add a new operation:
//!
//! 1. Add the method to [`Kernels`] and a shape check to this module
//! 2. Implement it in every backend
//! 3. Expose it on [`Executor`](dispatch::Executor)
//!
//! ## Feature Flags
//!
//! - `wgpu`: Enables the `wgpu` (WebGPU) offload backend

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::tensors::{FeatureMap, Flattened, Shape2, TensorFloat};
use crate::weights::DenseParams;

pub mod cpu;
pub mod dispatch;
pub mod naive;
#[cfg(feature = "wgpu")]
pub mod wgpu;

/// How softmax treats large inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftmaxMode {
    /// `exp(x) / Σ exp(x)` exactly as written. Overflows to `inf`/`NaN` once
    /// any input exceeds roughly 88; kept as the reference baseline.
    #[default]
    Naive,
    /// Subtracts the maximum before exponentiating. Mathematically identical,
    /// numerically different for large-magnitude inputs.
    Stable,
}

/// The capability set every backend provides.
///
/// Multi-channel accumulation is not a kernel concern: callers convolve each
/// input channel separately and sum the partial outputs with
/// [`add_assign`](Kernels::add_assign), adding the bias on the first call only.
pub trait Kernels: Send + Sync {
    /// Tag of the backend implementing this set.
    fn backend(&self) -> Backend;

    /// Valid (unpadded, stride 1) 2-D correlation plus `bias`.
    ///
    /// `out[y][x] = bias + Σᵢⱼ input[y+i][x+j] · filter[i][j]`, output shape
    /// `(H-k+1) × (W-k+1)`.
    ///
    /// # Errors
    /// Shape errors if the filter is not square or larger than the input.
    fn conv2d(
        &self,
        input: &FeatureMap,
        filter: &FeatureMap,
        bias: TensorFloat,
    ) -> Result<FeatureMap>;

    /// Non-overlapping max pooling with stride `window`.
    ///
    /// Output shape is `⌊H/p⌋ × ⌊W/p⌋`. Rows and columns that do not fill a
    /// whole window are dropped on purpose (explicit truncation).
    ///
    /// # Errors
    /// Shape error if `window` is zero or exceeds either extent.
    fn max_pool2d(&self, input: &FeatureMap, window: usize) -> Result<FeatureMap>;

    /// `acc += other`, elementwise.
    ///
    /// # Errors
    /// Shape error if the planes differ in shape.
    fn add_assign(&self, acc: &mut FeatureMap, other: &FeatureMap) -> Result<()>;

    /// Fully-connected projection `out[m] = bias[m] + Σₙ input[n] · w[m][n]`.
    ///
    /// # Errors
    /// Length or layout errors if the input does not match the weight matrix.
    fn dense(&self, input: &Flattened, layer: &DenseParams) -> Result<Vec<TensorFloat>>;

    /// `output[i] = max(0, input[i])`.
    ///
    /// # Errors
    /// Length error if the buffers differ in length.
    fn relu(&self, input: &[TensorFloat], output: &mut [TensorFloat]) -> Result<()>;

    /// Softmax over the whole vector.
    ///
    /// # Errors
    /// Length error if the buffers differ in length or are empty.
    fn softmax(
        &self,
        input: &[TensorFloat],
        output: &mut [TensorFloat],
        mode: SoftmaxMode,
    ) -> Result<()>;
}

/// Output shape of a valid convolution, or the reason there is none.
pub(crate) fn conv2d_shape(input: Shape2, filter: Shape2) -> Result<Shape2> {
    if filter.height != filter.width || filter.is_empty() {
        return Err(Error::ShapeMismatch {
            op: "conv2d",
            expected: "a square filter".into(),
            got: filter.to_string(),
        });
    }
    let k = filter.height;
    if k > input.height || k > input.width {
        return Err(Error::KernelTooLarge {
            op: "conv2d",
            kernel: k,
            input,
        });
    }
    Ok(Shape2::new(input.height - k + 1, input.width - k + 1))
}

/// Output shape of max pooling, or the reason there is none.
pub(crate) fn pool_shape(input: Shape2, window: usize) -> Result<Shape2> {
    if window == 0 || window > input.height || window > input.width {
        return Err(Error::ShapeMismatch {
            op: "max_pool2d",
            expected: format!("a window between 1 and {}", input.height.min(input.width)),
            got: window.to_string(),
        });
    }
    Ok(Shape2::new(input.height / window, input.width / window))
}

pub(crate) fn check_same_shape(op: &'static str, a: Shape2, b: Shape2) -> Result<()> {
    if a == b {
        Ok(())
    } else {
        Err(Error::ShapeMismatch {
            op,
            expected: a.to_string(),
            got: b.to_string(),
        })
    }
}

pub(crate) fn check_same_len(op: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(Error::LengthMismatch { op, expected, got })
    }
}

/// Verifies that `input` can be projected through `layer`.
pub(crate) fn check_dense(input: &Flattened, layer: &DenseParams) -> Result<()> {
    if let Some(got) = input.order() {
        if got != layer.order() {
            return Err(Error::LayoutMismatch {
                expected: layer.order(),
                got,
            });
        }
    }
    check_same_len("dense", layer.in_features(), input.len())
}

pub(crate) fn check_softmax(input: &[TensorFloat], output: &[TensorFloat]) -> Result<()> {
    if input.is_empty() {
        return Err(Error::LengthMismatch {
            op: "softmax",
            expected: 1,
            got: 0,
        });
    }
    check_same_len("softmax", input.len(), output.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_shape_shrinks_by_kernel_minus_one() {
        let out = conv2d_shape(Shape2::new(28, 28), Shape2::new(5, 5)).unwrap();
        assert_eq!(out, Shape2::new(24, 24));
        let out = conv2d_shape(Shape2::new(5, 7), Shape2::new(5, 5)).unwrap();
        assert_eq!(out, Shape2::new(1, 3));
    }

    #[test]
    fn conv_shape_rejects_oversized_and_rectangular_filters() {
        let err = conv2d_shape(Shape2::new(4, 8), Shape2::new(5, 5)).unwrap_err();
        assert!(matches!(err, Error::KernelTooLarge { kernel: 5, .. }));
        assert!(conv2d_shape(Shape2::new(8, 8), Shape2::new(3, 2)).is_err());
    }

    #[test]
    fn pool_shape_truncates_remainder() {
        assert_eq!(
            pool_shape(Shape2::new(5, 7), 2).unwrap(),
            Shape2::new(2, 3)
        );
        assert!(pool_shape(Shape2::new(4, 4), 0).is_err());
        assert!(pool_shape(Shape2::new(4, 4), 5).is_err());
    }
}
