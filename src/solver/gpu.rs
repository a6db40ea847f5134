//! wgpu compute device.
//!
//! Runs the Krylov kernels as WGSL compute shaders on whatever adapter wgpu
//! finds (Vulkan, Metal, DX12, GL). Values are f32 on the device; dot
//! products are reduced per workgroup on the device and summed in f64 on the
//! host. Matrix and factor blocks are uploaded column-major.

use std::cell::Cell;

use wgpu::util::DeviceExt;

use crate::convert::{reorder_blocks, BlockOrder, HostStaging};
use crate::error::{BridgeError, Result};
use crate::sparse::MatrixDims;

use super::device::{DeviceCounters, KrylovDevice};
use super::gpu_shaders::{self, WORKGROUP_SIZE};
use super::preconditioner::BlockIlu0;

const MAX_WORKGROUPS_PER_DIM: u32 = 65_535;

/// 2D grid covering `items` threads.
fn workgroup_grid(items: u32) -> (u32, u32) {
    let groups = items.div_ceil(WORKGROUP_SIZE).max(1);
    if groups <= MAX_WORKGROUPS_PER_DIM {
        (groups, 1)
    } else {
        (MAX_WORKGROUPS_PER_DIM, groups.div_ceil(MAX_WORKGROUPS_PER_DIM))
    }
}

// Shader VecParams layout: { alpha: f32, n: u32, _pad0, _pad1 }
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct VecParams {
    alpha: f32,
    n: u32,
    _pad: [u32; 2],
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct SpmvParams {
    nb: u32,
    bs: u32,
    n: u32,
    _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct LevelParams {
    start: u32,
    count: u32,
    bs: u32,
    _pad: u32,
}

/// A device vector of `n` f32 values.
pub struct WgpuBuffer {
    pub(crate) buffer: wgpu::Buffer,
    pub(crate) n: usize,
}

/// BCSR matrix in device buffers.
pub struct WgpuMatrix {
    row_pointers: wgpu::Buffer,
    col_indices: wgpu::Buffer,
    values: wgpu::Buffer,
    params: wgpu::Buffer,
    n: usize,
}

/// ILU(0) factors plus the per-level bind groups of the sweep kernels.
pub struct WgpuFactors {
    values: wgpu::Buffer,
    block_size: usize,
    lower: Vec<(wgpu::BindGroup, u32)>,
    upper: Vec<(wgpu::BindGroup, u32)>,
}

struct Pipelines {
    spmv: wgpu::ComputePipeline,
    dot: wgpu::ComputePipeline,
    axpy: wgpu::ComputePipeline,
    scale: wgpu::ComputePipeline,
    ilu_lower: wgpu::ComputePipeline,
    ilu_upper: wgpu::ComputePipeline,
}

pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipes: Pipelines,
    dispatch_count: Cell<u32>,
    readback_count: Cell<u32>,
}

impl WgpuDevice {
    async fn open_async() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| BridgeError::Backend("no GPU adapter found".into()))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("porelin_gpu"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                ..Default::default()
            })
            .await
            .map_err(|e| BridgeError::Backend(format!("failed to get GPU device: {e}")))?;

        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("porelin_shaders"),
            source: wgpu::ShaderSource::Wgsl(gpu_shaders::SHADER_SOURCE.into()),
        });

        let make_pipeline = |entry_point: &str| -> wgpu::ComputePipeline {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: None,
                module: &shader_module,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            })
        };

        let pipes = Pipelines {
            spmv: make_pipeline("bsr_spmv"),
            dot: make_pipeline("dot_partial"),
            axpy: make_pipeline("vec_axpy"),
            scale: make_pipeline("vec_scale"),
            ilu_lower: make_pipeline("ilu_lower"),
            ilu_upper: make_pipeline("ilu_upper"),
        };

        tracing::info!(adapter = ?adapter.get_info().name, "opened wgpu device");

        Ok(Self {
            device,
            queue,
            pipes,
            dispatch_count: Cell::new(0),
            readback_count: Cell::new(0),
        })
    }

    /// Total compute dispatches and buffer copies since creation.
    pub fn dispatch_count(&self) -> u32 {
        self.dispatch_count.get()
    }

    /// Total host readbacks since creation.
    pub fn readback_count(&self) -> u32 {
        self.readback_count.get()
    }

    fn check_size(&self, label: &str, bytes: u64) -> Result<()> {
        let limits = self.device.limits();
        let max = u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size);
        if bytes > max {
            return Err(BridgeError::Backend(format!(
                "buffer {label} needs {bytes} bytes, device limit is {max}"
            )));
        }
        Ok(())
    }

    /// Storage buffer initialized from `data`. Empty data still gets a
    /// minimal buffer since zero-sized bindings are invalid.
    fn storage_init<T: bytemuck::Pod>(&self, label: &str, data: &[T]) -> Result<wgpu::Buffer> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.check_size(label, bytes.len() as u64)?;
        let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;
        if bytes.is_empty() {
            return Ok(self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: 4,
                usage,
                mapped_at_creation: false,
            }));
        }
        Ok(self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytes,
                usage,
            }))
    }

    /// Zeroed storage buffer holding `count` 4-byte elements.
    fn storage_zeroed(&self, label: &str, count: usize) -> Result<wgpu::Buffer> {
        let size = (count * std::mem::size_of::<f32>()) as u64;
        self.check_size(label, size)?;
        Ok(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: size.max(4),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }))
    }

    fn uniform<T: bytemuck::Pod>(&self, params: &T) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: None,
                contents: bytemuck::bytes_of(params),
                usage: wgpu::BufferUsages::UNIFORM,
            })
    }

    /// Bind `buffers` to consecutive bindings of `group` in `pipeline`'s layout.
    fn bind(
        &self,
        pipeline: &wgpu::ComputePipeline,
        group: u32,
        buffers: &[&wgpu::Buffer],
    ) -> wgpu::BindGroup {
        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(i, buf)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buf.as_entire_binding(),
            })
            .collect();
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &pipeline.get_bind_group_layout(group),
            entries: &entries,
        })
    }

    fn dispatch(&self, pipeline: &wgpu::ComputePipeline, bind_group: &wgpu::BindGroup, items: u32) {
        let (gx, gy) = workgroup_grid(items);
        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, Some(bind_group), &[]);
            pass.dispatch_workgroups(gx, gy, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        self.dispatch_count.set(self.dispatch_count.get() + 1);
    }

    fn vec_params(alpha: f64, n: usize) -> VecParams {
        VecParams {
            alpha: alpha as f32,
            n: n as u32,
            _pad: [0; 2],
        }
    }

    /// One bind group and row count per level, for the given sweep pipeline.
    fn level_groups(
        &self,
        pipeline: &wgpu::ComputePipeline,
        structure: [&wgpu::Buffer; 4],
        rows: &wgpu::Buffer,
        offsets: &[u32],
        block_size: usize,
    ) -> Vec<(wgpu::BindGroup, u32)> {
        let [row_ptr, col, diag, vals] = structure;
        offsets
            .windows(2)
            .map(|w| {
                let count = w[1] - w[0];
                let params = self.uniform(&LevelParams {
                    start: w[0],
                    count,
                    bs: block_size as u32,
                    _pad: 0,
                });
                let group = self.bind(pipeline, 0, &[row_ptr, col, diag, vals, rows, &params]);
                (group, count)
            })
            .collect()
    }
}

/// Read a GPU buffer back to the host as f32 values.
fn read_buffer_f32(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    src: &wgpu::Buffer,
    count: usize,
) -> Result<Vec<f32>> {
    let size = (count * std::mem::size_of::<f32>()) as u64;
    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("read_staging"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = device.create_command_encoder(&Default::default());
    encoder.copy_buffer_to_buffer(src, 0, &staging, 0, size);
    queue.submit(Some(encoder.finish()));

    let slice = staging.slice(..);
    let (sender, receiver) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        let _ = sender.send(r);
    });
    device
        .poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        })
        .map_err(|e| BridgeError::Backend(format!("device poll failed during readback: {e}")))?;
    receiver
        .recv()
        .map_err(|e| BridgeError::Backend(format!("readback callback dropped: {e}")))?
        .map_err(|e| BridgeError::Backend(format!("failed to map readback buffer: {e}")))?;

    let data = slice.get_mapped_range();
    let result: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
    drop(data);
    staging.unmap();
    Ok(result)
}

fn to_f32(values: &[f64]) -> Vec<f32> {
    values.iter().map(|&v| v as f32).collect()
}

impl KrylovDevice for WgpuDevice {
    type Buffer = WgpuBuffer;
    type Matrix = WgpuMatrix;
    type Factors = WgpuFactors;

    const NAME: &'static str = "wgpu";
    const BLOCK_ORDER: BlockOrder = BlockOrder::ColumnMajor;

    fn open() -> Result<Self> {
        pollster::block_on(Self::open_async())
    }

    fn release(self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| BridgeError::Backend(format!("failed to drain GPU queue: {e}")))?;
        self.device.destroy();
        Ok(())
    }

    fn new_buffer(&self, n: usize) -> Result<WgpuBuffer> {
        Ok(WgpuBuffer {
            buffer: self.storage_zeroed("krylov_vector", n)?,
            n,
        })
    }

    fn alloc_matrix(&self, dims: MatrixDims) -> Result<WgpuMatrix> {
        let params = SpmvParams {
            nb: dims.nb as u32,
            bs: dims.block_size as u32,
            n: dims.n() as u32,
            _pad: 0,
        };
        Ok(WgpuMatrix {
            row_pointers: self.storage_zeroed("bsr_row_ptrs", dims.nb + 1)?,
            col_indices: self.storage_zeroed("bsr_col_indices", dims.nnzb)?,
            values: self.storage_zeroed("bsr_values", dims.nnz())?,
            params: self.uniform(&params),
            n: dims.n(),
        })
    }

    fn write_matrix(&self, matrix: &mut WgpuMatrix, staging: &HostStaging) {
        let queue = &self.queue;
        queue.write_buffer(&matrix.row_pointers, 0, bytemuck::cast_slice(&staging.row_pointers));
        queue.write_buffer(&matrix.col_indices, 0, bytemuck::cast_slice(&staging.col_indices));
        queue.write_buffer(&matrix.values, 0, bytemuck::cast_slice(&to_f32(&staging.values)));
    }

    fn alloc_factors(&self, ilu: &BlockIlu0) -> Result<WgpuFactors> {
        let as_u32 = |v: &[usize]| v.iter().map(|&i| i as u32).collect::<Vec<u32>>();
        let row_ptr = self.storage_init("ilu_row_ptrs", &as_u32(&ilu.row_pointers))?;
        let col = self.storage_init("ilu_col_indices", &as_u32(&ilu.col_indices))?;
        let diag = self.storage_init("ilu_diag", &as_u32(&ilu.diag_positions))?;
        let values = self.storage_zeroed("ilu_values", ilu.values.len())?;
        let lower_rows = self.storage_init("ilu_lower_rows", &ilu.lower_levels.rows)?;
        let upper_rows = self.storage_init("ilu_upper_rows", &ilu.upper_levels.rows)?;

        let structure = [&row_ptr, &col, &diag, &values];
        let lower = self.level_groups(
            &self.pipes.ilu_lower,
            structure,
            &lower_rows,
            &ilu.lower_levels.offsets,
            ilu.block_size,
        );
        let upper = self.level_groups(
            &self.pipes.ilu_upper,
            structure,
            &upper_rows,
            &ilu.upper_levels.offsets,
            ilu.block_size,
        );
        Ok(WgpuFactors {
            values,
            block_size: ilu.block_size,
            lower,
            upper,
        })
    }

    fn write_factors(&self, factors: &mut WgpuFactors, ilu: &BlockIlu0) {
        let mut col_major = vec![0.0; ilu.values.len()];
        reorder_blocks(
            &ilu.values,
            &mut col_major,
            factors.block_size,
            BlockOrder::RowMajor,
            Self::BLOCK_ORDER,
        );
        self.queue
            .write_buffer(&factors.values, 0, bytemuck::cast_slice(&to_f32(&col_major)));
    }

    fn apply_preconditioner(&self, factors: &WgpuFactors, input: &WgpuBuffer, output: &WgpuBuffer) {
        let lower_io = self.bind(&self.pipes.ilu_lower, 1, &[&input.buffer, &output.buffer]);
        let upper_io = self.bind(&self.pipes.ilu_upper, 1, &[&output.buffer]);

        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(&self.pipes.ilu_lower);
            pass.set_bind_group(1, Some(&lower_io), &[]);
            for (group, count) in &factors.lower {
                let (gx, gy) = workgroup_grid(*count);
                pass.set_bind_group(0, Some(group), &[]);
                pass.dispatch_workgroups(gx, gy, 1);
            }
            pass.set_pipeline(&self.pipes.ilu_upper);
            pass.set_bind_group(1, Some(&upper_io), &[]);
            for (group, count) in &factors.upper {
                let (gx, gy) = workgroup_grid(*count);
                pass.set_bind_group(0, Some(group), &[]);
                pass.dispatch_workgroups(gx, gy, 1);
            }
        }
        self.queue.submit(Some(encoder.finish()));
        let levels = (factors.lower.len() + factors.upper.len()) as u32;
        self.dispatch_count.set(self.dispatch_count.get() + levels);
    }

    fn spmv(&self, a: &WgpuMatrix, x: &WgpuBuffer, y: &WgpuBuffer) {
        let bg = self.bind(
            &self.pipes.spmv,
            0,
            &[&a.row_pointers, &a.col_indices, &a.values, &x.buffer, &y.buffer, &a.params],
        );
        self.dispatch(&self.pipes.spmv, &bg, a.n as u32);
    }

    fn dot(&self, x: &WgpuBuffer, y: &WgpuBuffer) -> Result<f64> {
        let (gx, gy) = workgroup_grid(x.n as u32);
        let n_partials = (gx * gy) as usize;
        let partials = self.storage_zeroed("dot_partials", n_partials)?;
        let params = self.uniform(&Self::vec_params(0.0, x.n));
        let bg = self.bind(&self.pipes.dot, 0, &[&x.buffer, &y.buffer, &partials, &params]);
        self.dispatch(&self.pipes.dot, &bg, x.n as u32);

        // Read back partial sums and reduce on the host in f64
        let sums = read_buffer_f32(&self.device, &self.queue, &partials, n_partials)?;
        self.readback_count.set(self.readback_count.get() + 1);
        Ok(sums.iter().map(|&v| v as f64).sum())
    }

    fn axpy(&self, alpha: f64, x: &WgpuBuffer, y: &WgpuBuffer) {
        let params = self.uniform(&Self::vec_params(alpha, x.n));
        let bg = self.bind(&self.pipes.axpy, 0, &[&x.buffer, &y.buffer, &params]);
        self.dispatch(&self.pipes.axpy, &bg, x.n as u32);
    }

    fn copy(&self, src: &WgpuBuffer, dst: &WgpuBuffer) {
        let size = (src.n * std::mem::size_of::<f32>()) as u64;
        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(&src.buffer, 0, &dst.buffer, 0, size);
        self.queue.submit(Some(encoder.finish()));
        self.dispatch_count.set(self.dispatch_count.get() + 1);
    }

    fn scale(&self, alpha: f64, x: &WgpuBuffer) {
        let params = self.uniform(&Self::vec_params(alpha, x.n));
        let bg = self.bind(&self.pipes.scale, 0, &[&x.buffer, &params]);
        self.dispatch(&self.pipes.scale, &bg, x.n as u32);
    }

    fn fill_zero(&self, x: &WgpuBuffer) {
        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.clear_buffer(&x.buffer, 0, None);
        self.queue.submit(Some(encoder.finish()));
    }

    fn upload_vec(&self, data: &[f64], buffer: &WgpuBuffer) {
        self.queue
            .write_buffer(&buffer.buffer, 0, bytemuck::cast_slice(&to_f32(data)));
    }

    fn download_vec(&self, buffer: &WgpuBuffer, out: &mut [f64]) -> Result<()> {
        let values = read_buffer_f32(&self.device, &self.queue, &buffer.buffer, buffer.n)?;
        self.readback_count.set(self.readback_count.get() + 1);
        for (dst, src) in out.iter_mut().zip(values) {
            *dst = src as f64;
        }
        Ok(())
    }

    fn counters(&self) -> DeviceCounters {
        DeviceCounters {
            dispatches: self.dispatch_count(),
            readbacks: self.readback_count(),
        }
    }
}
