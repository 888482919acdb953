//! GPU-accelerated kernels using WGPU.
//!
//! Each kernel is a small WGSL compute shader. The device, queue and the six
//! compute pipelines are created once, on first use, behind `lazy_static`.
//! Feature data is uploaded as `f32`, computed on the device and copied back
//! through a staging buffer, so every call is synchronous from the caller's
//! point of view.
//!
//! Initialisation failure is remembered, not retried: every later call
//! reports the same [`Error::BackendUnavailable`]. Nothing here ever falls back
//! to a CPU kernel.
//!
//! Shape validation runs on the host with the same helpers as the other
//! backends before anything is uploaded.

use std::sync::mpsc;

use tracing::{debug, info};
use wgpu::util::DeviceExt;

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::ops::{
    Kernels, SoftmaxMode, check_dense, check_same_len, check_same_shape, check_softmax,
    conv2d_shape, pool_shape,
};
use crate::tensors::{FeatureMap, Flattened, TensorFloat};
use crate::weights::DenseParams;

const CONV2D: &str = include_str!("shaders/conv2d.wgsl");
const MAX_POOL: &str = include_str!("shaders/max_pool.wgsl");
const ADD: &str = include_str!("shaders/add.wgsl");
const DENSE: &str = include_str!("shaders/dense.wgsl");
const RELU: &str = include_str!("shaders/relu.wgsl");
const SOFTMAX: &str = include_str!("shaders/softmax.wgsl");

/// Invocations per workgroup; must match `@workgroup_size` in every shader.
const WORKGROUP: u32 = 64;

/// Why the device could not be brought up.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    /// No adapter matched the request.
    #[error("adapter error: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    /// The adapter refused to create a device.
    #[error("device error: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
}

/// One compiled compute shader and the layout of its bindings.
///
/// Binding 0 is a 16-byte uniform of `u32` parameters, bindings `1..=inputs`
/// are read-only storage buffers and the last binding is the output.
struct Pipeline {
    label: &'static str,
    inputs: u32,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

impl Pipeline {
    fn new(device: &wgpu::Device, label: &'static str, source: &str, inputs: u32) -> Self {
        let buffer = |binding, ty| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let mut entries = Vec::with_capacity(inputs as usize + 2);
        entries.push(buffer(0, wgpu::BufferBindingType::Uniform));
        for b in 1..=inputs {
            entries.push(buffer(b, wgpu::BufferBindingType::Storage { read_only: true }));
        }
        entries.push(buffer(
            inputs + 1,
            wgpu::BufferBindingType::Storage { read_only: false },
        ));

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });
        Self {
            label,
            inputs,
            layout,
            pipeline,
        }
    }
}

/// The device, its queue and every kernel pipeline.
struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    conv2d: Pipeline,
    max_pool: Pipeline,
    add: Pipeline,
    dense: Pipeline,
    relu: Pipeline,
    softmax: Pipeline,
}

impl GpuContext {
    /// Selects the default adapter, creates a device and compiles every shader.
    fn new() -> std::result::Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("pico_cnn"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))?;
        info!(adapter = %adapter.get_info().name, "wgpu device ready");

        Ok(Self {
            conv2d: Pipeline::new(&device, "conv2d", CONV2D, 2),
            max_pool: Pipeline::new(&device, "max_pool", MAX_POOL, 1),
            add: Pipeline::new(&device, "add", ADD, 1),
            dense: Pipeline::new(&device, "dense", DENSE, 3),
            relu: Pipeline::new(&device, "relu", RELU, 1),
            softmax: Pipeline::new(&device, "softmax", SOFTMAX, 1),
            device,
            queue,
        })
    }

    /// Runs `kernel` over `invocations` threads and reads back the output.
    ///
    /// `output` is either the initial contents of the output buffer or its
    /// length, for kernels that overwrite every element.
    fn run(
        &self,
        kernel: &Pipeline,
        params: [u32; 4],
        inputs: &[&[TensorFloat]],
        output: Output<'_>,
        invocations: usize,
    ) -> Result<Vec<TensorFloat>> {
        debug_assert_eq!(inputs.len(), kernel.inputs as usize);
        let device = &self.device;
        let groups = u32::try_from(invocations.div_ceil(WORKGROUP as usize))
            .map_err(|_| Error::Device(format!("{}: {invocations} invocations", kernel.label)))?;

        let uniform = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(kernel.label),
            contents: bytemuck::cast_slice(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let sources: Vec<wgpu::Buffer> = inputs
            .iter()
            .map(|data| {
                device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(kernel.label),
                    contents: bytemuck::cast_slice(data),
                    usage: wgpu::BufferUsages::STORAGE,
                })
            })
            .collect();
        let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC;
        let (target, len) = match output {
            Output::Init(data) => (
                device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(kernel.label),
                    contents: bytemuck::cast_slice(data),
                    usage,
                }),
                data.len(),
            ),
            Output::Len(len) => (
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(kernel.label),
                    size: byte_len(len),
                    usage,
                    mapped_at_creation: false,
                }),
                len,
            ),
        };

        let mut entries = Vec::with_capacity(sources.len() + 2);
        entries.push(wgpu::BindGroupEntry {
            binding: 0,
            resource: uniform.as_entire_binding(),
        });
        for (binding, buf) in (1..).zip(&sources) {
            entries.push(wgpu::BindGroupEntry {
                binding,
                resource: buf.as_entire_binding(),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: kernel.inputs + 1,
            resource: target.as_entire_binding(),
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.label),
            layout: &kernel.layout,
            entries: &entries,
        });

        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size: byte_len(len),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(kernel.label),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.label),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernel.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups, 1, 1);
        }
        encoder.copy_buffer_to_buffer(&target, 0, &staging, 0, byte_len(len));
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| Error::Device(format!("{}: {e}", kernel.label)))?;
        rx.recv()
            .map_err(|e| Error::Device(format!("{}: {e}", kernel.label)))?
            .map_err(|e| Error::Device(format!("{}: {e}", kernel.label)))?;

        let mapped = slice.get_mapped_range();
        let out = mapped
            .chunks_exact(size_of::<TensorFloat>())
            .map(|b| TensorFloat::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        drop(mapped);
        staging.unmap();
        debug!(kernel = kernel.label, invocations, "wgpu dispatch done");
        Ok(out)
    }
}

enum Output<'a> {
    Init(&'a [TensorFloat]),
    Len(usize),
}

fn byte_len(len: usize) -> u64 {
    (len * size_of::<TensorFloat>()) as u64
}

/// Narrows a host extent to a shader parameter.
fn param(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::Device(format!("extent {value} exceeds u32")))
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: std::result::Result<GpuContext, String> =
        GpuContext::new().map_err(|e| e.to_string());
}

fn context() -> Result<&'static GpuContext> {
    GPU_CONTEXT
        .as_ref()
        .map_err(|reason| Error::BackendUnavailable {
            backend: Backend::Wgpu,
            reason: reason.clone(),
        })
}

/// Initialises the device if needed and reports whether it is usable.
///
/// # Errors
/// [`Error::BackendUnavailable`] if no adapter or device could be acquired.
pub fn probe() -> Result<()> {
    context().map(|_| ())
}

/// The `wgpu` backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct Offload;

impl Kernels for Offload {
    fn backend(&self) -> Backend {
        Backend::Wgpu
    }

    fn conv2d(
        &self,
        input: &FeatureMap,
        filter: &FeatureMap,
        bias: TensorFloat,
    ) -> Result<FeatureMap> {
        let out = conv2d_shape(input.shape(), filter.shape())?;
        let gpu = context()?;
        let params = [
            param(input.height())?,
            param(input.width())?,
            param(filter.height())?,
            bias.to_bits(),
        ];
        let data = gpu.run(
            &gpu.conv2d,
            params,
            &[input.data(), filter.data()],
            Output::Len(out.len()),
            out.len(),
        )?;
        FeatureMap::new(out.height, out.width, data)
    }

    fn max_pool2d(&self, input: &FeatureMap, window: usize) -> Result<FeatureMap> {
        let out = pool_shape(input.shape(), window)?;
        let gpu = context()?;
        let params = [
            param(input.height())?,
            param(input.width())?,
            param(window)?,
            0,
        ];
        let data = gpu.run(
            &gpu.max_pool,
            params,
            &[input.data()],
            Output::Len(out.len()),
            out.len(),
        )?;
        FeatureMap::new(out.height, out.width, data)
    }

    fn add_assign(&self, acc: &mut FeatureMap, other: &FeatureMap) -> Result<()> {
        check_same_shape("add", acc.shape(), other.shape())?;
        let gpu = context()?;
        let len = acc.len();
        let data = gpu.run(
            &gpu.add,
            [param(len)?, 0, 0, 0],
            &[other.data()],
            Output::Init(acc.data()),
            len,
        )?;
        acc.data_mut().copy_from_slice(&data);
        Ok(())
    }

    fn dense(&self, input: &Flattened, layer: &DenseParams) -> Result<Vec<TensorFloat>> {
        check_dense(input, layer)?;
        let gpu = context()?;
        let rows = layer.out_features();
        gpu.run(
            &gpu.dense,
            [param(rows)?, param(layer.in_features())?, 0, 0],
            &[input.data(), layer.weights(), layer.bias()],
            Output::Len(rows),
            rows,
        )
    }

    fn relu(&self, input: &[TensorFloat], output: &mut [TensorFloat]) -> Result<()> {
        check_same_len("relu", input.len(), output.len())?;
        let gpu = context()?;
        let data = gpu.run(
            &gpu.relu,
            [param(input.len())?, 0, 0, 0],
            &[input],
            Output::Len(input.len()),
            input.len(),
        )?;
        output.copy_from_slice(&data);
        Ok(())
    }

    fn softmax(
        &self,
        input: &[TensorFloat],
        output: &mut [TensorFloat],
        mode: SoftmaxMode,
    ) -> Result<()> {
        check_softmax(input, output)?;
        let gpu = context()?;
        let stable = u32::from(mode == SoftmaxMode::Stable);
        let data = gpu.run(
            &gpu.softmax,
            [param(input.len())?, stable, 0, 0],
            &[input],
            Output::Len(input.len()),
            input.len(),
        )?;
        output.copy_from_slice(&data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approx::{BACKEND_TOLERANCE, all_close};
    use crate::feature_map;
    use crate::ops::naive::Naive;

    // Machines without an adapter skip; they are covered by the fail-closed test.
    fn device() -> bool {
        probe().is_ok()
    }

    #[test]
    fn conv2d_matches_reference() {
        if !device() {
            return;
        }
        let input = feature_map!([[1, 2, 3, 4], [5, 6, 7, 8], [9, 10, 11, 12]]);
        let filter = feature_map!([[0.5, -1], [2, 0.25]]);
        let a = Naive.conv2d(&input, &filter, -0.75).unwrap();
        let b = Offload.conv2d(&input, &filter, -0.75).unwrap();
        assert!(all_close(&a, &b, BACKEND_TOLERANCE));
    }

    #[test]
    fn add_accumulates_in_place() {
        if !device() {
            return;
        }
        let mut acc = feature_map!([[1, 2], [3, 4]]);
        Offload
            .add_assign(&mut acc, &feature_map!([[10, 20], [30, 40]]))
            .unwrap();
        assert_eq!(acc.data(), &[11.0, 22.0, 33.0, 44.0]);
    }

    #[test]
    fn softmax_matches_reference() {
        if !device() {
            return;
        }
        let x = [0.5, 1.5, -3.0, 2.0];
        let mut a = [0.0; 4];
        let mut b = [0.0; 4];
        Naive.softmax(&x, &mut a, SoftmaxMode::Stable).unwrap();
        Offload.softmax(&x, &mut b, SoftmaxMode::Stable).unwrap();
        assert!(all_close(&a[..], &b[..], BACKEND_TOLERANCE));
    }
}
