//! # `pico_cnn`
//!
//! Forward-pass inference for small LeNet-style convolutional networks, with
//! numerically interchangeable kernel backends.
//!
//! ## Features
//!
//! - **Feature buffers**: shape-checked planes and channel stacks that are
//!   moved, never shared, from stage to stage
//! - **Kernels**: valid convolution, max pooling, elementwise add, dense
//!   projection, `ReLU` and softmax (naive or max-shifted)
//! - **Backends**: a scalar reference, a `rayon` CPU-parallel variant and an
//!   optional `wgpu` compute-shader offload, all agreeing within `1e-5`
//! - **Pipeline**: a declarative stage list compiled once against the
//!   weights, with explicit flattening order and per-layer connectivity masks
//! - **Evaluation**: ranked predictions, confusion matrix and error rate,
//!   sequential or across samples in parallel
//!
//! ## Modules
//!
//! - [`tensors`]: feature buffers and flattening
//! - [`ops`]: the kernel library and backend dispatch
//! - [`backend`]: backend tags and the process-wide default
//! - [`network`]: stage descriptors and the compiled pipeline
//! - [`weights`] / [`modelio`]: coefficient store and its file format
//! - [`dataset`]: IDX image and label reader
//! - [`eval`]: result postprocessing
//! - [`config`]: run and evaluation settings
//! - `dump` *(feature `dump`)*: PGM and raw float dumps of activations
//!
//! ## Example
//!
//! ```rust
//! use pico_cnn::backend::Backend;
//! use pico_cnn::network::{Network, NetworkSpec};
//! use pico_cnn::ops::dispatch::Executor;
//! use pico_cnn::tensors::FeatureMap;
//! use pico_cnn::weights::{LayerWeights, WeightSet};
//!
//! let spec = NetworkSpec::lenet_caffe();
//! let layers = spec
//!     .layer_shapes()
//!     .unwrap()
//!     .into_iter()
//!     .map(|s| LayerWeights::filled(s.kernel, 0.0, vec![0.0; s.bias]).unwrap())
//!     .collect::<Vec<_>>();
//! let exec = Executor::new(Backend::Cpu).unwrap();
//! let net = Network::new(spec, &WeightSet::new(layers), exec).unwrap();
//!
//! let scores = net.forward(FeatureMap::zeros(28, 28).unwrap()).unwrap();
//! assert_eq!(scores.len(), 10);
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::many_single_char_names,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::similar_names,
    clippy::cast_precision_loss,
    clippy::module_name_repetitions
)]
#![deny(unsafe_code)]
#![forbid(unused_must_use)]
#![warn(missing_docs)]

pub mod approx;
pub mod backend;
pub mod config;
pub mod dataset;
#[cfg(feature = "dump")]
pub mod dump;
pub mod error;
pub mod eval;
pub mod modelio;
pub mod network;
pub mod ops;
pub mod tensors;
pub mod weights;

pub use backend::{Backend, get_backend, set_backend};
pub use error::{Error, Result};
pub use network::{Network, NetworkSpec};
pub use ops::dispatch::Executor;
pub use tensors::{FeatureMap, FeatureStack, Flattened};
