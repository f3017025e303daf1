//! Software and hardware cluster rasterization.
//!
//! Each raster bin draws with one pipeline: large clusters go through the
//! hardware path (indirect draws into a depth target plus visibility-buffer
//! writes from the fragment stage), small clusters through the software path
//! (a compute rasterizer writing the same visibility buffer with atomics).
//! Bin setup resolves shader variants per bin before any recording; when the
//! active bin count is large the resolution moves to a detached task joined
//! before the draw pass is recorded.

use bytemuck::{Pod, Zeroable};

use crate::config::CullConfig;
use crate::gpu;
use crate::pipelines::{
    key_for_bin, PrecacheState, RasterBinDesc, RasterShaderTable, ResolvedShaders,
};

/// Visibility-buffer value layout: depth in the high bits so an atomicMax
/// resolves both the depth test and the payload write in one operation.
pub const VISIBILITY_DEPTH_SHIFT: u32 = 7;

/// Packed ordering hint between the two raster paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterScheduling {
    /// Record software dispatches before the hardware draws on one queue.
    SoftwareFirst,
    /// Software dispatches go to a second submission so the driver may
    /// overlap them with the hardware draws.
    Overlapped,
}

impl RasterScheduling {
    /// Pick the schedule from the frozen configuration.
    pub fn from_config(config: &CullConfig) -> Self {
        if config.async_rasterization {
            RasterScheduling::Overlapped
        } else {
            RasterScheduling::SoftwareFirst
        }
    }
}

/// Output surfaces of a rasterization pass.
pub struct RasterTargets {
    /// Visibility buffer: one packed atomic word per pixel.
    pub visibility_buffer: wgpu::Buffer,
    /// Hardware-path depth target.
    pub depth: wgpu::Texture,
    /// View over the depth target.
    pub depth_view: wgpu::TextureView,
    /// Target extent.
    pub width: u32,
    /// Target extent.
    pub height: u32,
}

impl RasterTargets {
    /// Allocate the visibility buffer and depth target.
    pub fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let visibility_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Visibility Buffer"),
            size: width as u64 * height as u64 * 4,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let depth = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Raster Depth Target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Depth32Float,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let depth_view = depth.create_view(&Default::default());
        Self {
            visibility_buffer,
            depth,
            depth_view,
            width,
            height,
        }
    }

    /// Clear the visibility buffer. With fast clear enabled only the rows
    /// covered by the given viewport rects are cleared; otherwise the whole
    /// buffer.
    pub fn clear(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        fast_clear: bool,
        viewport_rects: &[[u32; 4]],
    ) {
        if !fast_clear || viewport_rects.is_empty() {
            encoder.clear_buffer(&self.visibility_buffer, 0, None);
            return;
        }

        let mut first_row = u32::MAX;
        let mut last_row = 0u32;
        for rect in viewport_rects {
            first_row = first_row.min(rect[1]);
            last_row = last_row.max((rect[1] + rect[3]).min(self.height));
        }
        if first_row >= last_row {
            return;
        }
        let offset = first_row as u64 * self.width as u64 * 4;
        let size = (last_row - first_row) as u64 * self.width as u64 * 4;
        encoder.clear_buffer(&self.visibility_buffer, offset, Some(size));
    }

    /// Clear the hardware-path depth target. Recorded once per invocation;
    /// the draw passes themselves load, so split ranges and the post phase
    /// accumulate into one surface.
    pub fn clear_depth(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Raster Depth Clear"),
            color_attachments: &[],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &self.depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(0.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
    }
}

/// Resolved setup for one dense raster bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinSetup {
    /// Dense bin index this pass.
    pub dense_bin: u32,
    /// Stable bin index.
    pub stable_index: u32,
    /// Resolved shader identities.
    pub shaders: ResolvedShaders,
    /// Two-sided rasterization state.
    pub two_sided: bool,
}

/// Owned inputs for bin setup resolution, so the work can move to a detached
/// task.
pub struct BinSetupInputs {
    /// Dense-ordered (descriptor, precache, stable index) triples.
    pub bins: Vec<(RasterBinDesc, PrecacheState, u32)>,
    /// Depth-only output this pass.
    pub depth_only: bool,
    /// Virtual shadow map target this pass.
    pub virtual_target: bool,
    /// Mesh-shader permutations selected.
    pub mesh_shaders: bool,
    /// Programmable raster enabled.
    pub programmable_raster: bool,
    /// Skip-uncached fallback policy.
    pub skip_uncached: bool,
}

/// Resolve shader variants for every dense bin.
pub fn resolve_bin_setups(table: &RasterShaderTable, inputs: &BinSetupInputs) -> Vec<BinSetup> {
    inputs
        .bins
        .iter()
        .enumerate()
        .map(|(dense, (desc, precache, stable))| {
            let key = key_for_bin(
                desc,
                inputs.depth_only,
                inputs.virtual_target,
                inputs.mesh_shaders,
                inputs.programmable_raster,
            );
            BinSetup {
                dense_bin: dense as u32,
                stable_index: *stable,
                shaders: table.select(key, *precache, inputs.skip_uncached),
                two_sided: desc.two_sided,
            }
        })
        .collect()
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RasterUniform {
    target_size: [u32; 2],
    num_views: u32,
    max_mips: u32,
    dense_bin: u32,
    depth_only: u32,
    _pad: [u32; 2],
}

/// GPU resources a raster pass reads.
pub struct RasterBindings<'a> {
    /// Packed view buffer.
    pub views: &'a wgpu::Buffer,
    /// Cluster page payloads.
    pub cluster_pages: &'a wgpu::Buffer,
    /// Visible cluster records.
    pub visible_clusters: &'a wgpu::Buffer,
    /// Binned cluster index ranges.
    pub binned_clusters: &'a wgpu::Buffer,
    /// Dense bin headers.
    pub bin_meta: &'a wgpu::Buffer,
    /// Per-instance transforms.
    pub instances: &'a wgpu::Buffer,
}

/// The software compute rasterizer and the hardware draw pipelines.
///
/// Hardware variants differ only in fixed-function state (cull mode); the
/// material-programmable behavior rides in the bin headers the shaders read.
pub struct Rasterizer {
    sw_pipeline: wgpu::ComputePipeline,
    hw_pipelines: [wgpu::RenderPipeline; 2],
    compute_layout: wgpu::BindGroupLayout,
    render_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
}

impl Rasterizer {
    /// Depth operations for the hardware draw passes. Load rather than
    /// clear: the target is cleared once per invocation and both phases of
    /// every view range deposit into it.
    pub const HW_DEPTH_OPS: wgpu::Operations<f32> = wgpu::Operations {
        load: wgpu::LoadOp::Load,
        store: wgpu::StoreOp::Store,
    };

    /// Create the rasterization pipelines.
    pub fn new(device: &wgpu::Device) -> Self {
        let sw_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("SW Raster Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/sw_raster.wgsl").into()),
        });
        let hw_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("HW Raster Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/hw_raster.wgsl").into()),
        });

        let compute_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("SW Raster Bind Group Layout"),
            entries: &[
                gpu::uniform_entry(0),
                gpu::storage_ro_entry(1), // views
                gpu::storage_ro_entry(2), // cluster pages
                gpu::storage_ro_entry(3), // visible clusters
                gpu::storage_ro_entry(4), // binned clusters
                gpu::storage_ro_entry(5), // bin meta
                gpu::storage_ro_entry(6), // instance data
                gpu::storage_rw_entry(7), // visibility buffer
            ],
        });

        let vis = wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT;
        let render_entry = |binding, read_only| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: vis,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let render_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("HW Raster Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: vis,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                render_entry(1, true),
                render_entry(2, true),
                render_entry(3, true),
                render_entry(4, true),
                render_entry(5, true),
                render_entry(6, true),
                render_entry(7, false),
            ],
        });

        let compute_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("SW Raster Pipeline Layout"),
                bind_group_layouts: &[&compute_layout],
                push_constant_ranges: &[],
            });
        let sw_pipeline = gpu::compute_pipeline(
            device,
            "SW Raster Pipeline",
            &compute_pipeline_layout,
            &sw_shader,
            "sw_raster",
        );

        let render_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("HW Raster Pipeline Layout"),
                bind_group_layouts: &[&render_layout],
                push_constant_ranges: &[],
            });
        let hw_pipeline = |two_sided: bool| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(if two_sided {
                    "HW Raster Pipeline Two Sided"
                } else {
                    "HW Raster Pipeline"
                }),
                layout: Some(&render_pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &hw_shader,
                    entry_point: Some("hw_vertex"),
                    compilation_options: Default::default(),
                    buffers: &[],
                },
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: if two_sided {
                        None
                    } else {
                        Some(wgpu::Face::Back)
                    },
                    unclipped_depth: false,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    conservative: false,
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: wgpu::TextureFormat::Depth32Float,
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::Greater,
                    stencil: Default::default(),
                    bias: Default::default(),
                }),
                multisample: Default::default(),
                fragment: Some(wgpu::FragmentState {
                    module: &hw_shader,
                    entry_point: Some("hw_fragment"),
                    compilation_options: Default::default(),
                    targets: &[],
                }),
                multiview: None,
                cache: None,
            })
        };

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Raster Uniform"),
            size: std::mem::size_of::<RasterUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            sw_pipeline,
            hw_pipelines: [hw_pipeline(false), hw_pipeline(true)],
            compute_layout,
            render_layout,
            uniform_buffer,
        }
    }

    /// Upload the pass uniform and build the bind groups shared by all bins.
    pub fn prepare(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        targets: &RasterTargets,
        bindings: &RasterBindings<'_>,
        num_views: u32,
        max_mips: u32,
        depth_only: bool,
    ) -> (wgpu::BindGroup, wgpu::BindGroup) {
        queue.write_buffer(
            &self.uniform_buffer,
            0,
            bytemuck::cast_slice(&[RasterUniform {
                target_size: [targets.width, targets.height],
                num_views,
                max_mips,
                dense_bin: 0,
                depth_only: depth_only as u32,
                _pad: [0; 2],
            }]),
        );

        let entries = |layout: &wgpu::BindGroupLayout, label| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: self.uniform_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: bindings.views.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: bindings.cluster_pages.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: bindings.visible_clusters.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: bindings.binned_clusters.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 5,
                        resource: bindings.bin_meta.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 6,
                        resource: bindings.instances.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 7,
                        resource: targets.visibility_buffer.as_entire_binding(),
                    },
                ],
            })
        };

        (
            entries(&self.compute_layout, "SW Raster Bind Group"),
            entries(&self.render_layout, "HW Raster Bind Group"),
        )
    }

    /// Record the software rasterizer: one indirect dispatch sweeping the
    /// contiguous software region, one workgroup per cluster. Material
    /// behavior rides in the bin headers the kernel reads per cluster.
    pub fn record_sw(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        bind_group: &wgpu::BindGroup,
        binning: &crate::binning::BinningData,
    ) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("SW Raster"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.sw_pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups_indirect(&binning.sw_dispatch_args, 0);
    }

    /// Record the hardware draws, one indirect draw per bin's hardware range.
    pub fn record_hw(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        bind_group: &wgpu::BindGroup,
        setups: &[BinSetup],
        binning: &crate::binning::BinningData,
        targets: &RasterTargets,
    ) {
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("HW Raster"),
            color_attachments: &[],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &targets.depth_view,
                depth_ops: Some(Self::HW_DEPTH_OPS),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_bind_group(0, bind_group, &[]);
        for setup in setups {
            pass.set_pipeline(&self.hw_pipelines[setup.two_sided as usize]);
            pass.draw_indirect(&binning.indirect_args, binning.draw_args_offset(setup.dense_bin));
        }
    }
}

/// Clamp pass turning the raw visible-cluster counters into bounded indirect
/// dispatch arguments for binning and software rasterization.
pub struct ClampArgsPass {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    params_buffer: wgpu::Buffer,
    /// Dispatch args produced: x/y/z for the visible-cluster sweep.
    pub cluster_dispatch_args: wgpu::Buffer,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ClampUniform {
    max_visible_clusters: u32,
    workgroup_size: u32,
    _pad: [u32; 2],
}

impl ClampArgsPass {
    /// Create the clamp pipeline.
    pub fn new(device: &wgpu::Device) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Clamp Args Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/clamp_indirect_args.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Clamp Args Bind Group Layout"),
            entries: &[
                gpu::uniform_entry(0),
                gpu::storage_rw_entry(1), // visible cluster counters
                gpu::storage_rw_entry(2), // dispatch args
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Clamp Args Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipeline = gpu::compute_pipeline(
            device,
            "Clamp Args Pipeline",
            &pipeline_layout,
            &shader,
            "clamp_args",
        );

        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Clamp Args Params"),
            size: std::mem::size_of::<ClampUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let cluster_dispatch_args = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Cluster Dispatch Args"),
            size: 3 * 4,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::INDIRECT,
            mapped_at_creation: false,
        });

        Self {
            pipeline,
            bind_group_layout,
            params_buffer,
            cluster_dispatch_args,
        }
    }

    /// Record the clamp dispatch.
    pub fn record(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
        config: &CullConfig,
        visible_clusters: &wgpu::Buffer,
    ) {
        queue.write_buffer(
            &self.params_buffer,
            0,
            bytemuck::cast_slice(&[ClampUniform {
                max_visible_clusters: config.max_visible_clusters,
                workgroup_size: 64,
                _pad: [0; 2],
            }]),
        );
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Clamp Args Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: visible_clusters.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.cluster_dispatch_args.as_entire_binding(),
                },
            ],
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Clamp Args"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(1, 1, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FrameInputs, Settings};
    use crate::pipelines::{MaterialAttributes, PlatformCaps, StageKind};

    fn inputs(num_bins: usize) -> BinSetupInputs {
        let bins = (0..num_bins)
            .map(|id| {
                (
                    RasterBinDesc {
                        material_id: id as u32,
                        attributes: MaterialAttributes {
                            masked: id % 2 == 1,
                            ..Default::default()
                        },
                        two_sided: false,
                    },
                    PrecacheState::Ready,
                    id as u32,
                )
            })
            .collect();
        BinSetupInputs {
            bins,
            depth_only: false,
            virtual_target: false,
            mesh_shaders: false,
            programmable_raster: true,
            skip_uncached: true,
        }
    }

    #[test]
    fn setups_follow_dense_order() {
        let table = RasterShaderTable::build(&PlatformCaps::default());
        let setups = resolve_bin_setups(&table, &inputs(4));
        assert_eq!(setups.len(), 4);
        for (dense, setup) in setups.iter().enumerate() {
            assert_eq!(setup.dense_bin, dense as u32);
            assert_eq!(setup.stable_index, dense as u32);
        }
        assert_eq!(setups[0].shaders.pixel, StageKind::FixedFunction);
        assert_eq!(setups[1].shaders.pixel, StageKind::Programmable);
    }

    #[test]
    fn hardware_depth_passes_accumulate() {
        // Split depth-only ranges and the post phase share one depth target,
        // so the draw passes must not clear it.
        assert!(matches!(
            Rasterizer::HW_DEPTH_OPS.load,
            wgpu::LoadOp::Load
        ));
        assert!(matches!(Rasterizer::HW_DEPTH_OPS.store, wgpu::StoreOp::Store));
    }

    #[test]
    fn scheduling_follows_async_capability() {
        let mut settings = Settings::default();
        settings.async_rasterization = true;
        let frame = |async_ok| FrameInputs {
            viewport_height: 1080,
            depth_only: false,
            supports_async_compute: async_ok,
            supports_mesh_shaders: false,
        };

        let serial = CullConfig::freeze(&settings, frame(false));
        assert_eq!(
            RasterScheduling::from_config(&serial),
            RasterScheduling::SoftwareFirst
        );
        let overlapped = CullConfig::freeze(&settings, frame(true));
        assert_eq!(
            RasterScheduling::from_config(&overlapped),
            RasterScheduling::Overlapped
        );
    }
}
