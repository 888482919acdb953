//! Parallel CPU backend kernels
//!
//! # CPU Backend
//!
//! The same kernels as [`naive`](crate::ops::naive), with the independent
//! outputs computed in parallel using [`rayon`](https://docs.rs/rayon).
//!
//! Work is split by output rows (convolution, pooling), output units (dense)
//! or elements (add, ReLU, softmax). Each output value is still reduced
//! sequentially, so convolution, pooling and dense agree with the reference
//! bit for bit; only the softmax denominator is summed in a different order.
//!
//! These kernels run on whatever `rayon` pool is current. The
//! [`Executor`](crate::ops::dispatch::Executor) installs its own bounded pool
//! around every call, so the worker count is the one from
//! [`RunConfig::threads`](crate::config::RunConfig::threads).

use rayon::prelude::*;

use crate::backend::Backend;
use crate::error::Result;
use crate::ops::naive::{dot, window_max};
use crate::ops::{
    Kernels, SoftmaxMode, check_dense, check_same_len, check_same_shape, check_softmax,
    conv2d_shape, pool_shape,
};
use crate::tensors::{FeatureMap, Flattened, TensorFloat, alloc_buffer};
use crate::weights::DenseParams;

/// The `rayon` backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct Parallel;

impl Kernels for Parallel {
    fn backend(&self) -> Backend {
        Backend::Cpu
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
        data.par_chunks_mut(out.width)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, o) in row.iter_mut().enumerate() {
                    let mut acc = 0.0;
                    for i in 0..k {
                        let window = &src[(y + i) * in_w + x..][..k];
                        for (s, t) in window.iter().zip(&taps[i * k..(i + 1) * k]) {
                            acc += s * t;
                        }
                    }
                    *o = acc + bias;
                }
            });
        FeatureMap::new(out.height, out.width, data)
    }

    fn max_pool2d(&self, input: &FeatureMap, window: usize) -> Result<FeatureMap> {
        let out = pool_shape(input.shape(), window)?;
        let mut data = alloc_buffer("max_pool2d output", out.len(), 0.0)?;
        data.par_chunks_mut(out.width)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, o) in row.iter_mut().enumerate() {
                    *o = window_max(input, y * window, x * window, window);
                }
            });
        FeatureMap::new(out.height, out.width, data)
    }

    fn add_assign(&self, acc: &mut FeatureMap, other: &FeatureMap) -> Result<()> {
        check_same_shape("add", acc.shape(), other.shape())?;
        acc.data_mut()
            .par_iter_mut()
            .zip(other.data().par_iter())
            .for_each(|(a, b)| *a += b);
        Ok(())
    }

    fn dense(&self, input: &Flattened, layer: &DenseParams) -> Result<Vec<TensorFloat>> {
        check_dense(input, layer)?;
        let mut out = alloc_buffer("dense output", layer.out_features(), 0.0)?;
        out.par_iter_mut().enumerate().for_each(|(m, o)| {
            *o = dot(input.data(), layer.row(m)) + layer.bias()[m];
        });
        Ok(out)
    }

    fn relu(&self, input: &[TensorFloat], output: &mut [TensorFloat]) -> Result<()> {
        check_same_len("relu", input.len(), output.len())?;
        output
            .par_iter_mut()
            .zip(input.par_iter())
            .for_each(|(y, &x)| {
                *y = if x > 0.0 { x } else { 0.0 };
            });
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
                .par_iter()
                .copied()
                .reduce(|| TensorFloat::NEG_INFINITY, TensorFloat::max),
        };
        output
            .par_iter_mut()
            .zip(input.par_iter())
            .for_each(|(y, &x)| *y = (x - shift).exp());
        let sum: TensorFloat = output.par_iter().sum();
        output.par_iter_mut().for_each(|y| *y /= sum);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approx::{BACKEND_TOLERANCE, all_close};
    use crate::feature_map;
    use crate::ops::naive::Naive;

    #[test]
    fn conv2d_matches_reference() {
        let input = feature_map!([
            [0.1, 0.2, 0.3, 0.4, 0.5],
            [0.5, 0.4, 0.3, 0.2, 0.1],
            [1.0, -1.0, 1.0, -1.0, 1.0],
            [0.0, 0.5, 0.0, 0.5, 0.0]
        ]);
        let filter = feature_map!([[1, -1, 0.5], [0.25, 2, -0.5], [0, 1, 1]]);
        let a = Naive.conv2d(&input, &filter, 0.3).unwrap();
        let b = Parallel.conv2d(&input, &filter, 0.3).unwrap();
        assert!(all_close(&a, &b, BACKEND_TOLERANCE));
    }

    #[test]
    fn softmax_matches_reference() {
        let x = [0.3, -2.0, 4.5, 1.25, 0.0];
        let mut a = [0.0; 5];
        let mut b = [0.0; 5];
        Naive.softmax(&x, &mut a, SoftmaxMode::Stable).unwrap();
        Parallel.softmax(&x, &mut b, SoftmaxMode::Stable).unwrap();
        assert!(all_close(&a[..], &b[..], BACKEND_TOLERANCE));
    }

    #[test]
    fn add_rejects_shape_mismatch() {
        let mut a = FeatureMap::zeros(2, 2).unwrap();
        let b = FeatureMap::zeros(2, 3).unwrap();
        assert!(Parallel.add_assign(&mut a, &b).unwrap_err().is_shape_error());
    }
}
