//! # Layer Pipeline
//!
//! A network is an ordered list of stage descriptors ([`NetworkSpec`]) that is
//! compiled once, against a [`WeightSet`], into a [`Network`]. Compilation walks
//! the shapes from the declared input through every stage, so a bad kernel
//! size, a missing weight layer or a malformed connectivity table is reported
//! before the first sample runs.
//!
//! Execution is strictly sequential and statically shaped. Each stage consumes
//! the previous [`Activation`] by value and returns a fresh one, so every
//! intermediate buffer is released as soon as its single consumer finishes,
//! including on error paths.
//!
//! Topology is data: [`NetworkSpec`] deserialises from JSON, and two presets
//! are built in.
//!
//! ```rust
//! use pico_cnn::network::{NetworkSpec, StageSpec};
//!
//! let spec = NetworkSpec::lenet_caffe();
//! assert_eq!(spec.stages.len(), 8);
//! assert!(matches!(spec.stages[0], StageSpec::Conv { out_channels: 20, .. }));
//! ```

use core::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::ops::dispatch::Executor;
use crate::ops::{SoftmaxMode, conv2d_shape, pool_shape};
use crate::tensors::{
    FeatureMap, FeatureStack, FlattenOrder, Flattened, Shape2, TensorFloat, alloc_buffer,
};
use crate::weights::{ConvParams, DenseParams, WeightSet};

/// Which input channels feed each output channel of a convolution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    /// Every input channel feeds every output channel.
    #[default]
    Full,
    /// Row `o` lists the input channels summed into output channel `o`.
    Table(Vec<Vec<usize>>),
}

impl Connectivity {
    /// The sparse C3 table of the classic LeNet-5 (6 inputs, 16 outputs).
    #[must_use]
    pub fn lenet5_c3() -> Self {
        Self::Table(vec![
            vec![0, 1, 2],
            vec![1, 2, 3],
            vec![2, 3, 4],
            vec![3, 4, 5],
            vec![4, 5, 0],
            vec![5, 0, 1],
            vec![0, 1, 2, 3],
            vec![1, 2, 3, 4],
            vec![2, 3, 4, 5],
            vec![3, 4, 5, 0],
            vec![4, 5, 0, 1],
            vec![5, 0, 1, 2],
            vec![0, 1, 3, 4],
            vec![1, 2, 4, 5],
            vec![0, 2, 3, 5],
            vec![0, 1, 2, 3, 4, 5],
        ])
    }

    /// Expands the mask into one row of input indices per output channel.
    ///
    /// # Errors
    /// [`Error::Config`] if the table has the wrong number of rows, a row is
    /// empty, or a row holds an out-of-range or repeated index.
    pub fn resolve(&self, inputs: usize, outputs: usize) -> Result<Vec<Vec<usize>>> {
        let rows = match self {
            Self::Full => return Ok(vec![(0..inputs).collect(); outputs]),
            Self::Table(rows) => rows,
        };
        if rows.len() != outputs {
            return Err(Error::Config(format!(
                "connectivity table has {} rows for {outputs} output channels",
                rows.len()
            )));
        }
        for (o, row) in rows.iter().enumerate() {
            if row.is_empty() {
                return Err(Error::Config(format!(
                    "output channel {o} has no connected inputs"
                )));
            }
            let mut seen = vec![false; inputs];
            for &i in row {
                match seen.get_mut(i) {
                    None => {
                        return Err(Error::Config(format!(
                            "output channel {o} reads input {i}, but there are only {inputs}"
                        )));
                    }
                    Some(true) => {
                        return Err(Error::Config(format!(
                            "output channel {o} lists input {i} twice"
                        )));
                    }
                    Some(slot) => *slot = true,
                }
            }
        }
        Ok(rows.clone())
    }
}

/// One stage of a network description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StageSpec {
    /// Multi-channel valid convolution.
    Conv {
        /// Number of output channels.
        out_channels: usize,
        /// Square filter edge.
        kernel_size: usize,
        /// Index of the weight layer, shaped `[out, in, k, k]`.
        weights: usize,
        /// Input-channel mask.
        #[serde(default)]
        connectivity: Connectivity,
    },
    /// Per-channel non-overlapping max pooling.
    MaxPool {
        /// Window edge and stride.
        window: usize,
    },
    /// Fully-connected projection. Feature maps are flattened in `order` first.
    Dense {
        /// Output length.
        out_features: usize,
        /// Index of the weight layer, shaped `[out, in]`.
        weights: usize,
        /// Column order of the weight matrix.
        #[serde(default)]
        order: FlattenOrder,
    },
    /// Elementwise `max(0, x)`.
    Relu,
    /// Normalisation of a score vector.
    Softmax {
        /// Naive or max-shifted.
        #[serde(default)]
        mode: SoftmaxMode,
    },
}

impl StageSpec {
    /// Short operation name used in logs and dump file names.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Conv { .. } => "conv",
            Self::MaxPool { .. } => "max_pool",
            Self::Dense { .. } => "dense",
            Self::Relu => "relu",
            Self::Softmax { .. } => "softmax",
        }
    }
}

/// A whole network description: the input it expects and its stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Human-readable name.
    pub name: String,
    /// Number of input channels.
    #[serde(default = "one")]
    pub input_channels: usize,
    /// Shape of every input channel.
    pub input: Shape2,
    /// Stages in execution order.
    pub stages: Vec<StageSpec>,
}

const fn one() -> usize {
    1
}

/// Shape of the data between two stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extent {
    Maps { channels: usize, shape: Shape2 },
    Vector(usize),
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Maps { channels, shape } => write!(f, "{channels}x{shape}"),
            Self::Vector(len) => write!(f, "vector of {len}"),
        }
    }
}

/// Shape of one weight layer a spec needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerShape {
    /// Index of the weight layer.
    pub weights: usize,
    /// Kernel tensor shape.
    pub kernel: Vec<usize>,
    /// Bias length.
    pub bias: usize,
}

impl NetworkSpec {
    /// The reference pipeline: 28×28 input, C1 (20@5×5), S2, C3 (50@5×5,
    /// fully connected), S4, F5 (500), ReLU, F6 (10), naive softmax.
    #[must_use]
    pub fn lenet_caffe() -> Self {
        Self {
            name: "lenet-caffe".into(),
            input_channels: 1,
            input: Shape2::new(28, 28),
            stages: vec![
                StageSpec::Conv {
                    out_channels: 20,
                    kernel_size: 5,
                    weights: 0,
                    connectivity: Connectivity::Full,
                },
                StageSpec::MaxPool { window: 2 },
                StageSpec::Conv {
                    out_channels: 50,
                    kernel_size: 5,
                    weights: 1,
                    connectivity: Connectivity::Full,
                },
                StageSpec::MaxPool { window: 2 },
                StageSpec::Dense {
                    out_features: 500,
                    weights: 2,
                    order: FlattenOrder::ChannelMajor,
                },
                StageSpec::Relu,
                StageSpec::Dense {
                    out_features: 10,
                    weights: 3,
                    order: FlattenOrder::ChannelMajor,
                },
                StageSpec::Softmax {
                    mode: SoftmaxMode::Naive,
                },
            ],
        }
    }

    /// Classic LeNet-5 topology on a 32×32 input with the sparse C3 table.
    #[must_use]
    pub fn lenet5() -> Self {
        Self {
            name: "lenet-5".into(),
            input_channels: 1,
            input: Shape2::new(32, 32),
            stages: vec![
                StageSpec::Conv {
                    out_channels: 6,
                    kernel_size: 5,
                    weights: 0,
                    connectivity: Connectivity::Full,
                },
                StageSpec::MaxPool { window: 2 },
                StageSpec::Conv {
                    out_channels: 16,
                    kernel_size: 5,
                    weights: 1,
                    connectivity: Connectivity::lenet5_c3(),
                },
                StageSpec::MaxPool { window: 2 },
                StageSpec::Dense {
                    out_features: 120,
                    weights: 2,
                    order: FlattenOrder::ChannelMajor,
                },
                StageSpec::Relu,
                StageSpec::Dense {
                    out_features: 84,
                    weights: 3,
                    order: FlattenOrder::ChannelMajor,
                },
                StageSpec::Relu,
                StageSpec::Dense {
                    out_features: 10,
                    weights: 4,
                    order: FlattenOrder::ChannelMajor,
                },
                StageSpec::Softmax {
                    mode: SoftmaxMode::Stable,
                },
            ],
        }
    }

    /// Parses a JSON description.
    ///
    /// # Errors
    /// [`Error::Json`] on malformed input.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a JSON description from `path`.
    ///
    /// # Errors
    /// [`Error::Load`] if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let what = format!("network from '{}'", path.display());
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::load(what.clone(), e.to_string()))?;
        Self::from_json(&text).map_err(|e| Error::load(what, e.to_string()))
    }

    /// Pretty JSON rendering.
    ///
    /// # Errors
    /// [`Error::Json`] if serialisation fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Weight layers the stages reference, with the shapes they require, in
    /// stage order.
    ///
    /// # Errors
    /// The same shape errors as [`Network::new`].
    pub fn layer_shapes(&self) -> Result<Vec<LayerShape>> {
        let mut shapes = Vec::new();
        self.walk(|_, stage, input, output| {
            match (stage, input, output) {
                (
                    StageSpec::Conv {
                        kernel_size,
                        weights,
                        ..
                    },
                    Extent::Maps { channels, .. },
                    Extent::Maps { channels: out, .. },
                ) => shapes.push(LayerShape {
                    weights: *weights,
                    kernel: vec![out, channels, *kernel_size, *kernel_size],
                    bias: out,
                }),
                (StageSpec::Dense { weights, .. }, input, Extent::Vector(out)) => {
                    shapes.push(LayerShape {
                        weights: *weights,
                        kernel: vec![out, flat_len(input)],
                        bias: out,
                    });
                }
                _ => {}
            }
            Ok(())
        })?;
        Ok(shapes)
    }

    /// Walks the stages, calling `visit(index, stage, input, output)` with the
    /// shape before and after each one. Returns the final shape.
    fn walk<F>(&self, mut visit: F) -> Result<Extent>
    where
        F: FnMut(usize, &StageSpec, Extent, Extent) -> Result<()>,
    {
        if self.input_channels == 0 || self.input.is_empty() {
            return Err(Error::Config(format!(
                "network input {}x{} is empty",
                self.input_channels, self.input
            )));
        }
        let mut extent = Extent::Maps {
            channels: self.input_channels,
            shape: self.input,
        };
        for (index, stage) in self.stages.iter().enumerate() {
            let next = next_extent(index, stage, extent)?;
            visit(index, stage, extent, next)?;
            extent = next;
        }
        Ok(extent)
    }
}

fn flat_len(extent: Extent) -> usize {
    match extent {
        Extent::Maps { channels, shape } => channels * shape.len(),
        Extent::Vector(len) => len,
    }
}

fn next_extent(index: usize, stage: &StageSpec, input: Extent) -> Result<Extent> {
    let mismatch = |expected: &str| {
        Error::Config(format!(
            "stage {index} ({}) expects {expected}, got {input}",
            stage.name()
        ))
    };
    match (stage, input) {
        (
            StageSpec::Conv {
                out_channels,
                kernel_size,
                ..
            },
            Extent::Maps { shape, .. },
        ) => {
            if *out_channels == 0 {
                return Err(mismatch("at least one output channel"));
            }
            let shape = conv2d_shape(shape, Shape2::new(*kernel_size, *kernel_size))?;
            Ok(Extent::Maps {
                channels: *out_channels,
                shape,
            })
        }
        (StageSpec::MaxPool { window }, Extent::Maps { channels, shape }) => {
            let out = pool_shape(shape, *window)?;
            if shape.height % window != 0 || shape.width % window != 0 {
                warn!(
                    stage = index,
                    input = %shape,
                    window,
                    output = %out,
                    "max pool drops the partial windows at the edges"
                );
            }
            Ok(Extent::Maps {
                channels,
                shape: out,
            })
        }
        (StageSpec::Dense { out_features, .. }, _) => {
            if *out_features == 0 {
                return Err(mismatch("at least one output feature"));
            }
            Ok(Extent::Vector(*out_features))
        }
        (StageSpec::Relu, extent) => Ok(extent),
        (StageSpec::Softmax { .. }, Extent::Vector(len)) => Ok(Extent::Vector(len)),
        (StageSpec::Softmax { .. }, _) => Err(mismatch("a vector")),
        (StageSpec::Conv { .. } | StageSpec::MaxPool { .. }, Extent::Vector(_)) => {
            Err(mismatch("feature maps"))
        }
    }
}

/// Data handed from one stage to the next.
#[derive(Debug, Clone, PartialEq)]
pub enum Activation {
    /// A channel stack (before the first dense stage).
    Maps(FeatureStack),
    /// A flat vector (from the first dense stage on).
    Vector(Flattened),
}

impl Activation {
    /// Number of samples held.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Maps(maps) => maps.len() * maps.map_shape().len(),
            Self::Vector(v) => v.len(),
        }
    }

    /// `true` if nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shape summary for logs and errors.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Maps(maps) => format!("{}x{}", maps.len(), maps.map_shape()),
            Self::Vector(v) => format!("vector of {}", v.len()),
        }
    }
}

/// A compiled stage: spec plus validated parameters.
#[derive(Debug)]
enum Stage {
    Conv {
        params: ConvParams,
        wiring: Vec<Vec<usize>>,
    },
    MaxPool {
        window: usize,
    },
    Dense {
        params: DenseParams,
    },
    Relu,
    Softmax {
        mode: SoftmaxMode,
    },
}

/// A network ready to run on one backend.
///
/// `Network` is `Sync`; one instance can serve many threads. Weights are
/// read-only after construction.
#[derive(Debug)]
pub struct Network {
    spec: NetworkSpec,
    stages: Vec<Stage>,
    output_len: usize,
    executor: Executor,
}

impl Network {
    /// Compiles `spec` against `weights`.
    ///
    /// # Errors
    /// - [`Error::Config`] if the stage sequence is inconsistent or a
    ///   connectivity table is malformed.
    /// - Shape errors if a kernel does not fit its input.
    /// - [`Error::Load`] if a referenced weight layer is missing or has the
    ///   wrong shape.
    pub fn new(spec: NetworkSpec, weights: &WeightSet, executor: Executor) -> Result<Self> {
        let mut stages = Vec::with_capacity(spec.stages.len());
        let last = spec.walk(|index, stage, input, output| {
            debug!(stage = index, op = stage.name(), %input, %output, "compiling stage");
            stages.push(compile_stage(stage, input, output, weights)?);
            Ok(())
        })?;
        let Extent::Vector(output_len) = last else {
            return Err(Error::Config(format!(
                "network `{}` ends in {last}, not a score vector",
                spec.name
            )));
        };
        debug!(network = %spec.name, stages = stages.len(), output_len, "network compiled");
        Ok(Self {
            spec,
            stages,
            output_len,
            executor,
        })
    }

    /// The description this network was compiled from.
    #[must_use]
    pub const fn spec(&self) -> &NetworkSpec {
        &self.spec
    }

    /// The executor running the kernels.
    #[must_use]
    pub const fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Length of the score vector.
    #[must_use]
    pub const fn output_len(&self) -> usize {
        self.output_len
    }

    /// Expected shape of each input channel.
    #[must_use]
    pub const fn input_shape(&self) -> Shape2 {
        self.spec.input
    }

    /// Runs one single-channel input through every stage.
    ///
    /// # Errors
    /// Shape errors if `input` does not match the declared input, plus any
    /// kernel or backend error.
    pub fn forward(&self, input: FeatureMap) -> Result<Vec<TensorFloat>> {
        self.forward_observed(input, |_, _, _| Ok(()))
    }

    /// Like [`Network::forward`], calling `observe(stage_index, stage_name,
    /// output)` after every stage.
    ///
    /// # Errors
    /// As [`Network::forward`], plus whatever `observe` returns.
    pub fn forward_observed<F>(&self, input: FeatureMap, observe: F) -> Result<Vec<TensorFloat>>
    where
        F: FnMut(usize, &'static str, &Activation) -> Result<()>,
    {
        self.forward_stack(FeatureStack::single(input), observe)
    }

    /// Runs a multi-channel input through every stage.
    ///
    /// # Errors
    /// As [`Network::forward_observed`].
    pub fn forward_stack<F>(&self, input: FeatureStack, mut observe: F) -> Result<Vec<TensorFloat>>
    where
        F: FnMut(usize, &'static str, &Activation) -> Result<()>,
    {
        if input.len() != self.spec.input_channels || input.map_shape() != self.spec.input {
            return Err(Error::ShapeMismatch {
                op: "forward",
                expected: format!("{}x{}", self.spec.input_channels, self.spec.input),
                got: format!("{}x{}", input.len(), input.map_shape()),
            });
        }
        let mut act = Activation::Maps(input);
        for (index, (stage, spec)) in self.stages.iter().zip(&self.spec.stages).enumerate() {
            act = self.run_stage(stage, act)?;
            trace!(stage = index, op = spec.name(), output = %act.describe(), "stage done");
            observe(index, spec.name(), &act)?;
        }
        match act {
            Activation::Vector(v) => Ok(v.into_vec()),
            other => Err(Error::ShapeMismatch {
                op: "forward",
                expected: "a score vector".into(),
                got: other.describe(),
            }),
        }
    }

    fn run_stage(&self, stage: &Stage, act: Activation) -> Result<Activation> {
        let exec = &self.executor;
        match (stage, act) {
            (Stage::Conv { params, wiring }, Activation::Maps(maps)) => {
                Ok(Activation::Maps(exec.conv_layer(&maps, params, wiring)?))
            }
            (Stage::MaxPool { window }, Activation::Maps(maps)) => {
                Ok(Activation::Maps(exec.pool_layer(&maps, *window)?))
            }
            (Stage::Dense { params }, act) => {
                let flat = match act {
                    Activation::Maps(maps) => maps.flatten(params.order())?,
                    Activation::Vector(v) => v,
                };
                let out = exec.dense(&flat, params)?;
                Ok(Activation::Vector(Flattened::vector(out)))
            }
            (Stage::Relu, Activation::Maps(maps)) => {
                let channels = maps
                    .channels()
                    .iter()
                    .map(|c| {
                        let mut out = alloc_buffer("relu output", c.len(), 0.0)?;
                        exec.relu(c.data(), &mut out)?;
                        FeatureMap::new(c.height(), c.width(), out)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Activation::Maps(FeatureStack::new(channels)?))
            }
            (Stage::Relu, Activation::Vector(v)) => {
                let mut out = alloc_buffer("relu output", v.len(), 0.0)?;
                exec.relu(v.data(), &mut out)?;
                Ok(Activation::Vector(match v.order() {
                    Some(order) => Flattened::with_order(out, order),
                    None => Flattened::vector(out),
                }))
            }
            (Stage::Softmax { mode }, Activation::Vector(v)) => {
                let mut out = alloc_buffer("softmax output", v.len(), 0.0)?;
                exec.softmax(v.data(), &mut out, *mode)?;
                Ok(Activation::Vector(Flattened::vector(out)))
            }
            (_, act) => Err(Error::ShapeMismatch {
                op: "forward",
                expected: "the shape the network was compiled for".into(),
                got: act.describe(),
            }),
        }
    }
}

fn compile_stage(
    spec: &StageSpec,
    input: Extent,
    output: Extent,
    weights: &WeightSet,
) -> Result<Stage> {
    Ok(match (spec, input) {
        (
            StageSpec::Conv {
                out_channels,
                kernel_size,
                weights: index,
                connectivity,
            },
            Extent::Maps { channels, .. },
        ) => Stage::Conv {
            params: ConvParams::from_layer(
                *index,
                weights.layer(*index)?,
                channels,
                *out_channels,
                *kernel_size,
            )?,
            wiring: connectivity.resolve(channels, *out_channels)?,
        },
        (StageSpec::MaxPool { window }, _) => Stage::MaxPool { window: *window },
        (
            StageSpec::Dense {
                out_features,
                weights: index,
                order,
            },
            input,
        ) => Stage::Dense {
            params: DenseParams::from_layer(
                *index,
                weights.layer(*index)?,
                flat_len(input),
                *out_features,
                *order,
            )?,
        },
        (StageSpec::Relu, _) => Stage::Relu,
        (StageSpec::Softmax { mode }, _) => Stage::Softmax { mode: *mode },
        (StageSpec::Conv { .. }, _) => {
            return Err(Error::Config(format!(
                "convolution cannot follow {input} (produces {output})"
            )));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::weights::LayerWeights;

    fn zero_weights(spec: &NetworkSpec, bias: f32) -> WeightSet {
        let mut shapes = spec.layer_shapes().unwrap();
        shapes.sort_by_key(|s| s.weights);
        shapes
            .into_iter()
            .map(|s| LayerWeights::filled(s.kernel, 0.0, vec![bias; s.bias]).unwrap())
            .collect::<Vec<_>>()
            .into()
    }

    #[test]
    fn lenet_caffe_layer_shapes() {
        let shapes = NetworkSpec::lenet_caffe().layer_shapes().unwrap();
        let kernels: Vec<_> = shapes.iter().map(|s| s.kernel.clone()).collect();
        assert_eq!(
            kernels,
            vec![
                vec![20, 1, 5, 5],
                vec![50, 20, 5, 5],
                vec![500, 800],
                vec![10, 500]
            ]
        );
    }

    #[test]
    fn lenet5_layer_shapes() {
        let shapes = NetworkSpec::lenet5().layer_shapes().unwrap();
        assert_eq!(shapes[1].kernel, vec![16, 6, 5, 5]);
        assert_eq!(shapes[2].kernel, vec![120, 400]);
    }

    #[test]
    fn spec_round_trips_through_json() {
        let spec = NetworkSpec::lenet5();
        let back = NetworkSpec::from_json(&spec.to_json().unwrap()).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn json_defaults_apply() {
        let spec = NetworkSpec::from_json(
            r#"{
                "name": "tiny",
                "input": { "height": 4, "width": 4 },
                "stages": [
                    { "op": "conv", "out_channels": 2, "kernel_size": 3, "weights": 0 },
                    { "op": "dense", "out_features": 3, "weights": 1 },
                    { "op": "softmax" }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(spec.input_channels, 1);
        assert!(matches!(
            spec.stages[0],
            StageSpec::Conv {
                connectivity: Connectivity::Full,
                ..
            }
        ));
        assert_eq!(spec.stages[2], StageSpec::Softmax { mode: SoftmaxMode::Naive });
    }

    #[test]
    fn connectivity_rejects_bad_tables() {
        let dup = Connectivity::Table(vec![vec![0, 0]]);
        assert!(dup.resolve(2, 1).is_err());
        let range = Connectivity::Table(vec![vec![2]]);
        assert!(range.resolve(2, 1).is_err());
        let empty = Connectivity::Table(vec![vec![]]);
        assert!(empty.resolve(2, 1).is_err());
        let rows = Connectivity::Table(vec![vec![0]]);
        assert!(rows.resolve(2, 2).is_err());
        assert!(Connectivity::lenet5_c3().resolve(6, 16).is_ok());
    }

    #[test]
    fn oversized_kernel_fails_at_compile_time() {
        let mut spec = NetworkSpec::lenet_caffe();
        spec.input = Shape2::new(4, 4);
        let exec = Executor::new(Backend::Naive).unwrap();
        let err = Network::new(spec, &WeightSet::default(), exec).unwrap_err();
        assert!(err.is_shape_error());
    }

    #[test]
    fn missing_weights_fail_at_compile_time() {
        let spec = NetworkSpec::lenet_caffe();
        let exec = Executor::new(Backend::Naive).unwrap();
        let err = Network::new(spec, &WeightSet::default(), exec).unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
    }

    #[test]
    fn spec_must_end_in_vector() {
        let spec = NetworkSpec {
            name: "maps".into(),
            input_channels: 1,
            input: Shape2::new(4, 4),
            stages: vec![StageSpec::MaxPool { window: 2 }],
        };
        let exec = Executor::new(Backend::Naive).unwrap();
        assert!(matches!(
            Network::new(spec, &WeightSet::default(), exec),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn observer_sees_every_stage() {
        let spec = NetworkSpec::lenet_caffe();
        let weights = zero_weights(&spec, 0.0);
        let net = Network::new(spec, &weights, Executor::new(Backend::Naive).unwrap()).unwrap();
        let mut seen = Vec::new();
        let scores = net
            .forward_observed(FeatureMap::zeros(28, 28).unwrap(), |i, name, act| {
                seen.push((i, name, act.describe()));
                Ok(())
            })
            .unwrap();
        assert_eq!(scores.len(), 10);
        assert_eq!(seen.len(), 8);
        assert_eq!(seen[0], (0, "conv", "20x24x24".to_string()));
        assert_eq!(seen[3], (3, "max_pool", "50x4x4".to_string()));
        assert_eq!(seen[4], (4, "dense", "vector of 500".to_string()));
    }

    #[test]
    fn wrong_input_shape_is_rejected() {
        let spec = NetworkSpec::lenet_caffe();
        let weights = zero_weights(&spec, 0.0);
        let net = Network::new(spec, &weights, Executor::new(Backend::Naive).unwrap()).unwrap();
        let err = net.forward(FeatureMap::zeros(32, 32).unwrap()).unwrap_err();
        assert!(err.is_shape_error());
    }
}
