//! Scalar reference kernels.
//!
//! Straight loops over row-major buffers, single threaded and in a fixed
//! summation order. Every other backend is measured against these.

use crate::backend::Backend;
use crate::error::Result;
use crate::ops::{
    Kernels, SoftmaxMode, check_dense, check_same_len, check_same_shape, check_softmax,
    conv2d_shape, pool_shape,
};
use crate::tensors::{FeatureMap, Flattened, TensorFloat, alloc_buffer};
use crate::weights::DenseParams;

/// The scalar reference backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct Naive;

impl Kernels for Naive {
    fn backend(&self) -> Backend {
        Backend::Naive
    }

    fn conv2d(
        &self,
        input: &FeatureMap,
        filter: &FeatureMap,
        bias: TensorFloat,
    ) -> Result<FeatureMap> {
        let out = conv2d_shape(input.shape(), filter.shape())?;
        let k = filter.height();
        let in_w = input.width();
        let src = input.data();
        let taps = filter.data();

        let mut data = alloc_buffer("conv2d output", out.len(), 0.0)?;
        for y in 0..out.height {
            for x in 0..out.width {
                let mut acc = 0.0;
                for i in 0..k {
                    let row = &src[(y + i) * in_w + x..][..k];
                    for (s, t) in row.iter().zip(&taps[i * k..(i + 1) * k]) {
                        acc += s * t;
                    }
                }
                data[y * out.width + x] = acc + bias;
            }
        }
        FeatureMap::new(out.height, out.width, data)
    }

    fn max_pool2d(&self, input: &FeatureMap, window: usize) -> Result<FeatureMap> {
        let out = pool_shape(input.shape(), window)?;
        let mut data = alloc_buffer("max_pool2d output", out.len(), 0.0)?;
        for y in 0..out.height {
            for x in 0..out.width {
                data[y * out.width + x] = window_max(input, y * window, x * window, window);
            }
        }
        FeatureMap::new(out.height, out.width, data)
    }

    fn add_assign(&self, acc: &mut FeatureMap, other: &FeatureMap) -> Result<()> {
        check_same_shape("add", acc.shape(), other.shape())?;
        for (a, b) in acc.data_mut().iter_mut().zip(other.data()) {
            *a += b;
        }
        Ok(())
    }

    fn dense(&self, input: &Flattened, layer: &DenseParams) -> Result<Vec<TensorFloat>> {
        check_dense(input, layer)?;
        let mut out = alloc_buffer("dense output", layer.out_features(), 0.0)?;
        for (m, o) in out.iter_mut().enumerate() {
            *o = dot(input.data(), layer.row(m)) + layer.bias()[m];
        }
        Ok(out)
    }

    fn relu(&self, input: &[TensorFloat], output: &mut [TensorFloat]) -> Result<()> {
        check_same_len("relu", input.len(), output.len())?;
        for (y, &x) in output.iter_mut().zip(input) {
            *y = if x > 0.0 { x } else { 0.0 };
        }
        Ok(())
    }

    fn softmax(
        &self,
        input: &[TensorFloat],
        output: &mut [TensorFloat],
        mode: SoftmaxMode,
    ) -> Result<()> {
        check_softmax(input, output)?;
        let shift = match mode {
            SoftmaxMode::Naive => 0.0,
            SoftmaxMode::Stable => input
                .iter()
                .copied()
                .fold(TensorFloat::NEG_INFINITY, TensorFloat::max),
        };
        let mut sum = 0.0;
        for (y, &x) in output.iter_mut().zip(input) {
            *y = (x - shift).exp();
            sum += *y;
        }
        for y in output.iter_mut() {
            *y /= sum;
        }
        Ok(())
    }
}

/// Maximum of the `window × window` block whose top-left corner is `(y0, x0)`.
pub(crate) fn window_max(input: &FeatureMap, y0: usize, x0: usize, window: usize) -> TensorFloat {
    let mut best = TensorFloat::NEG_INFINITY;
    for y in y0..y0 + window {
        for &v in &input.row(y)[x0..x0 + window] {
            if v > best {
                best = v;
            }
        }
    }
    best
}

pub(crate) fn dot(a: &[TensorFloat], b: &[TensorFloat]) -> TensorFloat {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_map;

    #[test]
    fn conv2d_identity_filter_copies_window() {
        let input = feature_map!([[1, 2, 3], [4, 5, 6], [7, 8, 9]]);
        let filter = feature_map!([[0, 0], [0, 1]]);
        let out = Naive.conv2d(&input, &filter, 0.5).unwrap();
        assert_eq!(out.data(), &[5.5, 6.5, 8.5, 9.5]);
    }

    #[test]
    fn max_pool_takes_block_maximum() {
        let input = feature_map!([
            [1, 2, 3, 4],
            [5, 6, 7, 8],
            [9, 10, 11, 12],
            [13, 14, 15, 16]
        ]);
        let out = Naive.max_pool2d(&input, 2).unwrap();
        assert_eq!(out, feature_map!([[6, 8], [14, 16]]));
    }

    #[test]
    fn max_pool_drops_partial_windows() {
        let input = feature_map!([[1, 2, 99], [3, 4, 99], [99, 99, 99]]);
        let out = Naive.max_pool2d(&input, 2).unwrap();
        assert_eq!(out.data(), &[4.0]);
    }

    #[test]
    fn relu_clamps_negatives() {
        let mut out = [0.0; 4];
        Naive.relu(&[-1.0, 0.0, 2.5, -0.0], &mut out).unwrap();
        assert_eq!(out, [0.0, 0.0, 2.5, 0.0]);
    }

    #[test]
    fn softmax_of_equal_inputs_is_uniform() {
        let mut out = [0.0; 3];
        Naive.softmax(&[0.0; 3], &mut out, SoftmaxMode::Naive).unwrap();
        for p in out {
            assert!((p - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn stable_softmax_survives_large_inputs() {
        let mut naive = [0.0; 2];
        let mut stable = [0.0; 2];
        Naive.softmax(&[1000.0, 1000.0], &mut naive, SoftmaxMode::Naive).unwrap();
        Naive.softmax(&[1000.0, 1000.0], &mut stable, SoftmaxMode::Stable).unwrap();
        assert!(naive[0].is_nan());
        assert_eq!(stable, [0.5, 0.5]);
    }

    #[test]
    fn softmax_rejects_empty_input() {
        assert!(Naive.softmax(&[], &mut [], SoftmaxMode::Stable).is_err());
    }
}
