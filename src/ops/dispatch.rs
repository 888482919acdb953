//! Operation Dispatch Layer
//!
//! An [`Executor`] binds one backend tag to its [`Kernels`] implementation
//! and, for the CPU backend, to a bounded `rayon` worker pool.
//!
//! # Design Highlights
//! - **Fail closed**: asking for a backend that is not compiled in, or that
//!   has no usable device, is an error at construction time. There is no
//!   silent fallback to another backend.
//! - **Bounded parallelism**: the CPU backend runs on a private pool of
//!   `threads` workers instead of the global one. Other backends get a pool
//!   only when a worker count is given; it then bounds sample-level
//!   parallelism through [`Executor::install`].
//! - **Layer fan-out**: [`Executor::conv_layer`] and [`Executor::pool_layer`]
//!   apply the per-plane kernels over every channel of a stack, in parallel
//!   across output channels on the CPU backend.
//!
//! # Example
//! ```rust
//! use pico_cnn::{feature_map, backend::Backend, ops::dispatch::Executor};
//!
//! let exec = Executor::new(Backend::Cpu).unwrap();
//! let pooled = exec.max_pool2d(&feature_map!([[1, 2], [3, 4]]), 2).unwrap();
//! assert_eq!(pooled.data(), &[4.0]);
//! ```

use std::sync::Arc;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use crate::backend::{Backend, get_backend};
use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::ops::cpu::Parallel;
use crate::ops::naive::Naive;
use crate::ops::{Kernels, SoftmaxMode};
use crate::tensors::{FeatureMap, FeatureStack, Flattened, TensorFloat};
use crate::weights::{ConvParams, DenseParams};

static NAIVE: Naive = Naive;
static PARALLEL: Parallel = Parallel;
#[cfg(feature = "wgpu")]
static OFFLOAD: super::wgpu::Offload = super::wgpu::Offload;

/// A backend ready to run kernels.
///
/// Cloning is cheap; clones share the worker pool.
#[derive(Clone)]
pub struct Executor {
    backend: Backend,
    kernels: &'static dyn Kernels,
    pool: Option<Arc<ThreadPool>>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("backend", &self.backend)
            .field("threads", &self.threads())
            .finish()
    }
}

impl Executor {
    /// Creates an executor for `backend` with the default worker count.
    ///
    /// # Errors
    /// [`Error::BackendUnavailable`] if the backend cannot run here.
    pub fn new(backend: Backend) -> Result<Self> {
        Self::with_threads(backend, None)
    }

    /// Creates an executor for the process-wide default backend.
    ///
    /// # Errors
    /// Same as [`Executor::new`].
    pub fn from_global() -> Result<Self> {
        Self::new(get_backend())
    }

    /// Creates an executor from a run configuration.
    ///
    /// # Errors
    /// Same as [`Executor::with_threads`].
    pub fn from_config(config: &RunConfig) -> Result<Self> {
        Self::with_threads(config.backend, config.threads)
    }

    /// Creates an executor for `backend`.
    ///
    /// `threads` bounds the worker pool; `None` uses one worker per logical
    /// core. The CPU backend runs its kernels on that pool. The other
    /// backends keep their kernels on the calling thread and only build a
    /// pool when `threads` is given, for work scheduled with
    /// [`Executor::install`].
    ///
    /// # Errors
    /// - [`Error::BackendUnavailable`] if the backend is not compiled in or its
    ///   device cannot be initialised.
    /// - [`Error::Config`] if `threads` is zero or the pool cannot be built.
    pub fn with_threads(backend: Backend, threads: Option<usize>) -> Result<Self> {
        let (kernels, pool): (&'static dyn Kernels, _) = match backend {
            Backend::Naive => (&NAIVE, optional_pool(threads)?),
            Backend::Cpu => (&PARALLEL, Some(Arc::new(build_pool(threads)?))),
            Backend::Wgpu => (wgpu_kernels()?, optional_pool(threads)?),
        };
        let exec = Self {
            backend,
            kernels,
            pool,
        };
        info!(backend = %backend, threads = exec.threads(), "executor ready");
        Ok(exec)
    }

    /// Backend this executor runs on.
    #[must_use]
    pub const fn backend(&self) -> Backend {
        self.backend
    }

    /// Worker count of the private pool, or 1 without one.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.pool.as_ref().map_or(1, |p| p.current_num_threads())
    }

    /// The raw kernel set.
    #[must_use]
    pub fn kernels(&self) -> &'static dyn Kernels {
        self.kernels
    }

    /// Runs `f` inside this executor's worker pool, or on the caller's
    /// thread context if it has none.
    pub fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }

    fn in_kernel_pool<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        if self.backend == Backend::Cpu {
            self.install(f)
        } else {
            f()
        }
    }

    /// See [`Kernels::conv2d`].
    ///
    /// # Errors
    /// Propagates the kernel's shape errors.
    pub fn conv2d(
        &self,
        input: &FeatureMap,
        filter: &FeatureMap,
        bias: TensorFloat,
    ) -> Result<FeatureMap> {
        self.in_kernel_pool(|| self.kernels.conv2d(input, filter, bias))
    }

    /// See [`Kernels::max_pool2d`].
    ///
    /// # Errors
    /// Propagates the kernel's shape errors.
    pub fn max_pool2d(&self, input: &FeatureMap, window: usize) -> Result<FeatureMap> {
        self.in_kernel_pool(|| self.kernels.max_pool2d(input, window))
    }

    /// See [`Kernels::add_assign`].
    ///
    /// # Errors
    /// Propagates the kernel's shape errors.
    pub fn add_assign(&self, acc: &mut FeatureMap, other: &FeatureMap) -> Result<()> {
        self.in_kernel_pool(|| self.kernels.add_assign(acc, other))
    }

    /// See [`Kernels::dense`].
    ///
    /// # Errors
    /// Propagates the kernel's length and layout errors.
    pub fn dense(&self, input: &Flattened, layer: &DenseParams) -> Result<Vec<TensorFloat>> {
        self.in_kernel_pool(|| self.kernels.dense(input, layer))
    }

    /// See [`Kernels::relu`].
    ///
    /// # Errors
    /// Propagates the kernel's length errors.
    pub fn relu(&self, input: &[TensorFloat], output: &mut [TensorFloat]) -> Result<()> {
        self.in_kernel_pool(|| self.kernels.relu(input, output))
    }

    /// See [`Kernels::softmax`].
    ///
    /// # Errors
    /// Propagates the kernel's length errors.
    pub fn softmax(
        &self,
        input: &[TensorFloat],
        output: &mut [TensorFloat],
        mode: SoftmaxMode,
    ) -> Result<()> {
        self.in_kernel_pool(|| self.kernels.softmax(input, output, mode))
    }

    /// Multi-channel convolution.
    ///
    /// Output channel `o` is the sum over `wiring[o]` of `conv2d(input[i],
    /// filter[o][i])`, with `bias[o]` added exactly once. `wiring` must hold
    /// one non-empty row per output channel with indices below
    /// `input.len()`.
    ///
    /// # Errors
    /// [`Error::Config`] if `wiring` does not fit the layer, otherwise the
    /// kernels' shape errors.
    pub fn conv_layer(
        &self,
        input: &FeatureStack,
        params: &ConvParams,
        wiring: &[Vec<usize>],
    ) -> Result<FeatureStack> {
        if input.len() != params.in_channels() || wiring.len() != params.out_channels() {
            return Err(Error::Config(format!(
                "conv layer expects {} -> {} channels, got {} inputs and {} wiring rows",
                params.in_channels(),
                params.out_channels(),
                input.len(),
                wiring.len()
            )));
        }
        let k = self.kernels;
        let channel = |o: usize| conv_channel(k, input, params, o, &wiring[o]);
        let maps = match self.backend {
            Backend::Cpu => self.install(|| {
                (0..wiring.len())
                    .into_par_iter()
                    .map(channel)
                    .collect::<Result<Vec<_>>>()
            })?,
            _ => (0..wiring.len()).map(channel).collect::<Result<Vec<_>>>()?,
        };
        debug!(
            outputs = maps.len(),
            shape = %maps.first().map(FeatureMap::shape).unwrap_or(input.map_shape()),
            "conv layer done"
        );
        FeatureStack::new(maps)
    }

    /// Max-pools every channel of `input` with the same window.
    ///
    /// # Errors
    /// Propagates the kernel's shape errors.
    pub fn pool_layer(&self, input: &FeatureStack, window: usize) -> Result<FeatureStack> {
        let k = self.kernels;
        let maps = match self.backend {
            Backend::Cpu => self.install(|| {
                input
                    .channels()
                    .par_iter()
                    .map(|c| k.max_pool2d(c, window))
                    .collect::<Result<Vec<_>>>()
            })?,
            _ => input
                .channels()
                .iter()
                .map(|c| k.max_pool2d(c, window))
                .collect::<Result<Vec<_>>>()?,
        };
        FeatureStack::new(maps)
    }
}

fn conv_channel(
    k: &dyn Kernels,
    input: &FeatureStack,
    params: &ConvParams,
    o: usize,
    inputs: &[usize],
) -> Result<FeatureMap> {
    let channel = |i: usize| {
        input.channel(i).ok_or_else(|| {
            Error::Config(format!(
                "output channel {o} reads input {i} of {}",
                input.len()
            ))
        })
    };
    let Some((&first, rest)) = inputs.split_first() else {
        return Err(Error::Config(format!(
            "output channel {o} has no connected inputs"
        )));
    };
    let mut acc = k.conv2d(channel(first)?, params.filter(o, first), params.bias()[o])?;
    for &i in rest {
        let partial = k.conv2d(channel(i)?, params.filter(o, i), 0.0)?;
        k.add_assign(&mut acc, &partial)?;
    }
    Ok(acc)
}

fn build_pool(threads: Option<usize>) -> Result<ThreadPool> {
    if threads == Some(0) {
        return Err(Error::Config("thread count must be at least 1".into()));
    }
    ThreadPoolBuilder::new()
        .num_threads(threads.unwrap_or(0))
        .thread_name(|i| format!("pico-cnn-{i}"))
        .build()
        .map_err(|e| Error::Config(format!("cannot build worker pool: {e}")))
}

fn optional_pool(threads: Option<usize>) -> Result<Option<Arc<ThreadPool>>> {
    threads
        .map(|n| build_pool(Some(n)).map(Arc::new))
        .transpose()
}

#[cfg(feature = "wgpu")]
fn wgpu_kernels() -> Result<&'static dyn Kernels> {
    super::wgpu::probe()?;
    Ok(&OFFLOAD)
}

#[cfg(not(feature = "wgpu"))]
fn wgpu_kernels() -> Result<&'static dyn Kernels> {
    Err(Error::BackendUnavailable {
        backend: Backend::Wgpu,
        reason: "compiled without the `wgpu` feature".into(),
    })
}
