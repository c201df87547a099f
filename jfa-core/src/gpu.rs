//! Jump flooding on the GPU using wgpu.
//!
//! Sites live in a [`SiteMirror`] backed by [`GpuAllocator`], so edits reach
//! the device one dirty range at a time. Each JFA pass is a compute dispatch
//! over the grid reading one claim buffer and writing the other.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use log::{debug, trace};
use wgpu::util::DeviceExt;

use crate::dispatch::GridShape;
use crate::growable::DeviceAllocator;
use crate::jfa::{step_schedule, AssignmentGrid, Claim, JfaConfig, NO_SITE};
use crate::site::SiteMirror;
use crate::{JfaError, Result};

/// Adapter, device and queue shared by the allocator and the pipelines.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Open the first high-performance adapter available.
    pub fn new() -> Result<Arc<Self>> {
        let instance = wgpu::Instance::default();

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| JfaError::Gpu("No suitable GPU adapter found".into()))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("JFA GPU"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
            },
            None,
        ))
        .map_err(|e| JfaError::Gpu(format!("Failed to create device: {}", e)))?;

        debug!("gpu: using adapter {:?}", adapter.get_info().name);
        Ok(Arc::new(Self { device, queue }))
    }

    /// Copy `len` bytes at `offset` of `src` into host memory.
    fn read_buffer(&self, src: &wgpu::Buffer, offset: u64, len: u64) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size: len,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
        encoder.copy_buffer_to_buffer(src, offset, &staging, 0, len);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| JfaError::Gpu(format!("Buffer map callback dropped: {}", e)))?
            .map_err(|e| JfaError::Gpu(format!("Buffer map failed: {:?}", e)))?;

        let data = slice.get_mapped_range();
        let bytes = data.to_vec();
        drop(data);
        staging.unmap();
        Ok(bytes)
    }
}

fn check_aligned(what: &str, value: u64) -> Result<()> {
    if value % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
        return Err(JfaError::InvalidInput(format!(
            "{} {} is not a multiple of {}",
            what,
            value,
            wgpu::COPY_BUFFER_ALIGNMENT
        )));
    }
    Ok(())
}

/// [`DeviceAllocator`] handing out wgpu storage buffers.
///
/// Offsets and lengths must be multiples of 4 bytes.
#[derive(Clone)]
pub struct GpuAllocator {
    ctx: Arc<GpuContext>,
}

impl GpuAllocator {
    pub fn new(ctx: Arc<GpuContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }
}

impl DeviceAllocator for GpuAllocator {
    type Buffer = wgpu::Buffer;

    fn allocate(&mut self, size: u64) -> Result<wgpu::Buffer> {
        let aligned = size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        if aligned > self.ctx.device.limits().max_buffer_size {
            return Err(JfaError::ResourceExhaustion { requested: size });
        }

        self.ctx.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Growable Buffer"),
            size: aligned,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::VERTEX
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(self.ctx.device.pop_error_scope()) {
            debug!("gpu: allocation of {} bytes failed: {}", aligned, err);
            return Err(JfaError::ResourceExhaustion { requested: size });
        }
        Ok(buffer)
    }

    fn copy(&mut self, src: &wgpu::Buffer, dst: &mut wgpu::Buffer, len: u64) -> Result<()> {
        let len = len.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        if len > src.size() || len > dst.size() {
            return Err(JfaError::InvalidInput(format!(
                "copy of {} bytes exceeds buffers of {} and {} bytes",
                len,
                src.size(),
                dst.size(),
            )));
        }
        if len == 0 {
            return Ok(());
        }
        let mut encoder = self.ctx.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Growth Copy Encoder"),
        });
        encoder.copy_buffer_to_buffer(src, 0, dst, 0, len);
        self.ctx.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn write(&mut self, dst: &mut wgpu::Buffer, offset: u64, bytes: &[u8]) -> Result<()> {
        check_aligned("write offset", offset)?;
        check_aligned("write length", bytes.len() as u64)?;
        if offset + bytes.len() as u64 > dst.size() {
            return Err(JfaError::InvalidInput(format!(
                "write of {} bytes at {} exceeds buffer of {} bytes",
                bytes.len(),
                offset,
                dst.size(),
            )));
        }
        self.ctx.queue.write_buffer(dst, offset, bytes);
        Ok(())
    }

    fn read(&mut self, src: &wgpu::Buffer, offset: u64, len: u64) -> Result<Vec<u8>> {
        check_aligned("read offset", offset)?;
        check_aligned("read length", len)?;
        self.ctx.read_buffer(src, offset, len)
    }

    fn free(&mut self, buffer: wgpu::Buffer) {
        buffer.destroy();
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Params {
    width: u32,
    height: u32,
    step_x: u32,
    step_y: u32,
    site_count: u32,
    _pad: [u32; 3],
}

/// Jump flooding pipelines: splat, seed and one flood pass per step.
pub struct GpuJfa {
    ctx: Arc<GpuContext>,
    config: JfaConfig,
    layout: wgpu::BindGroupLayout,
    splat_pipeline: wgpu::ComputePipeline,
    seed_pipeline: wgpu::ComputePipeline,
    flood_pipeline: wgpu::ComputePipeline,
}

impl GpuJfa {
    pub fn new(ctx: Arc<GpuContext>) -> Result<Self> {
        Self::with_config(ctx, JfaConfig::default())
    }

    pub fn with_config(ctx: Arc<GpuContext>, config: JfaConfig) -> Result<Self> {
        let device = &ctx.device;

        let buffer_entry = |binding: u32, ty: wgpu::BufferBindingType| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let storage = |read_only| wgpu::BufferBindingType::Storage { read_only };

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("JFA Bind Group Layout"),
            entries: &[
                // 0: Params
                buffer_entry(0, wgpu::BufferBindingType::Uniform),
                // 1: Sites
                buffer_entry(1, storage(true)),
                // 2: Seeds (atomic site ids)
                buffer_entry(2, storage(false)),
                // 3: Source claims
                buffer_entry(3, storage(true)),
                // 4: Destination claims
                buffer_entry(4, storage(false)),
            ],
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("JFA Shader"),
            source: wgpu::ShaderSource::Wgsl(JFA_SHADER.into()),
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("JFA Pipeline Layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = |entry: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        };
        let splat_pipeline = pipeline("splat");
        let seed_pipeline = pipeline("seed");
        let flood_pipeline = pipeline("flood");

        Ok(Self {
            ctx,
            config,
            layout,
            splat_pipeline,
            seed_pipeline,
            flood_pipeline,
        })
    }

    pub fn config(&self) -> JfaConfig {
        self.config
    }

    /// Assign every cell of a `width` x `height` grid to a mirrored site.
    pub fn run(
        &self,
        sites: &SiteMirror<GpuAllocator>,
        width: u32,
        height: u32,
    ) -> Result<AssignmentGrid> {
        let shape = GridShape::new(width, height)?;
        let site_count = u32::try_from(sites.len())
            .ok()
            .filter(|&n| n < NO_SITE)
            .ok_or_else(|| JfaError::InvalidInput(format!("too many sites: {}", sites.len())))?;
        let device = &self.ctx.device;

        let claim_bytes = (shape.len() * std::mem::size_of::<Claim>()) as u64;
        if claim_bytes > u64::from(device.limits().max_storage_buffer_binding_size) {
            return Err(JfaError::ResourceExhaustion { requested: claim_bytes });
        }

        let seeds = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Seeds Buffer"),
            contents: bytemuck::cast_slice(&vec![NO_SITE; shape.len()]),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let claims = [0, 1].map(|_| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Claims Buffer"),
                size: claim_bytes,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        });

        let bind = |step: (u32, u32), src: &wgpu::Buffer, dst: &wgpu::Buffer| {
            let params = Params {
                width,
                height,
                step_x: step.0,
                step_y: step.1,
                site_count,
                _pad: [0; 3],
            };
            let uniform = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Params Buffer"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("JFA Bind Group"),
                layout: &self.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: uniform.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: sites.buffer().as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: seeds.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: src.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: dst.as_entire_binding(),
                    },
                ],
            })
        };

        let groups_x = width.div_ceil(16);
        let groups_y = height.div_ceil(16);
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("JFA Encoder"),
        });

        // splat into the seed grid, then expand it into claims in buffer 0
        let setup = bind((0, 0), &claims[1], &claims[0]);
        if site_count > 0 {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("JFA Splat Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.splat_pipeline);
            pass.set_bind_group(0, &setup, &[]);
            pass.dispatch_workgroups(site_count.div_ceil(64), 1, 1);
        }
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("JFA Seed Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.seed_pipeline);
            pass.set_bind_group(0, &setup, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }

        let mut steps = step_schedule(shape);
        steps.extend(std::iter::repeat((1, 1)).take(self.config.extra_passes));
        debug!(
            "gpu jfa: {}x{} grid, {} sites, {} passes",
            width,
            height,
            site_count,
            steps.len()
        );

        let mut current = 0;
        for &step in &steps {
            let group = bind(step, &claims[current], &claims[1 - current]);
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("JFA Flood Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.flood_pipeline);
            pass.set_bind_group(0, &group, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
            trace!("gpu jfa: pass at step {:?}", step);
            current = 1 - current;
        }
        self.ctx.queue.submit(std::iter::once(encoder.finish()));

        let bytes = self.ctx.read_buffer(&claims[current], 0, claim_bytes)?;
        let cells = bytes
            .chunks_exact(std::mem::size_of::<Claim>())
            .map(bytemuck::pod_read_unaligned::<Claim>)
            .map(|claim| if claim.is_valid() { claim } else { Claim::EMPTY })
            .collect();
        AssignmentGrid::new(shape, cells)
    }
}

const JFA_SHADER: &str = r#"
struct Params {
    width: u32,
    height: u32,
    step_x: u32,
    step_y: u32,
    site_count: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

struct Site {
    pos: vec2<f32>,
    _pad0: vec2<f32>,
    color: vec3<f32>,
    _pad1: f32,
}

struct Claim {
    site: u32,
    dist_sq: f32,
}

const NO_SITE: u32 = 0xffffffffu;

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> sites: array<Site>;
@group(0) @binding(2) var<storage, read_write> seeds: array<atomic<u32>>;
@group(0) @binding(3) var<storage, read> current_claims: array<Claim>;
@group(0) @binding(4) var<storage, read_write> next_claims: array<Claim>;

fn site_cell(id: u32) -> vec2<f32> {
    return sites[id].pos * vec2<f32>(f32(params.width), f32(params.height));
}

fn cell_dist_sq(x: u32, y: u32, site: vec2<f32>) -> f32 {
    let dx = f32(x) + 0.5 - site.x;
    let dy = f32(y) + 0.5 - site.y;
    return dx * dx + dy * dy;
}

@compute @workgroup_size(64)
fn splat(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let id = global_id.x;
    if (id >= params.site_count) {
        return;
    }
    let p = floor(site_cell(id));
    let x = u32(clamp(p.x, 0.0, f32(params.width - 1u)));
    let y = u32(clamp(p.y, 0.0, f32(params.height - 1u)));
    atomicMin(&seeds[y * params.width + x], id);
}

@compute @workgroup_size(16, 16)
fn seed(@builtin(global_invocation_id) global_id: vec3<u32>) {
    if (global_id.x >= params.width || global_id.y >= params.height) {
        return;
    }
    let idx = global_id.y * params.width + global_id.x;
    var claim: Claim;
    claim.site = atomicLoad(&seeds[idx]);
    claim.dist_sq = 0.0;
    next_claims[idx] = claim;
}

@compute @workgroup_size(16, 16)
fn flood(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let x = global_id.x;
    let y = global_id.y;
    if (x >= params.width || y >= params.height) {
        return;
    }

    var best_site = NO_SITE;
    var best_dist = 3.402823e+38f;

    for (var dy: i32 = -1; dy <= 1; dy = dy + 1) {
        let sy = i32(y) + dy * i32(params.step_y);
        if (sy < 0 || sy >= i32(params.height)) {
            continue;
        }
        for (var dx: i32 = -1; dx <= 1; dx = dx + 1) {
            let sx = i32(x) + dx * i32(params.step_x);
            if (sx < 0 || sx >= i32(params.width)) {
                continue;
            }
            let candidate = current_claims[u32(sy) * params.width + u32(sx)].site;
            if (candidate == NO_SITE) {
                continue;
            }
            let d = cell_dist_sq(x, y, site_cell(candidate));
            if (d < best_dist || (d == best_dist && candidate < best_site)) {
                best_dist = d;
                best_site = candidate;
            }
        }
    }

    var claim: Claim;
    claim.site = best_site;
    claim.dist_sq = best_dist;
    next_claims[y * params.width + x] = claim;
}
"#;
