//! Per-frame primitive filtering.
//!
//! Builds a one-bit-per-primitive bitmask (packed into 32-bit words) marking
//! primitives that every subsequent culling pass must skip: members of a
//! hidden list, non-members of a show-only list, and whole categories
//! disabled by view show-flags. When nothing filters, the pass is skipped
//! entirely and the bitmask buffer stays unallocated.

use bytemuck::{Pod, Zeroable};

use crate::gpu;
use crate::scene::GpuScene;

/// Primitive category bits, matching the per-primitive flags in the scene's
/// primitive data buffer.
pub mod category {
    /// Static mesh primitives.
    pub const STATIC_MESH: u32 = 1 << 0;
    /// Instanced static mesh primitives.
    pub const INSTANCED_STATIC_MESH: u32 = 1 << 1;
    /// Foliage primitives.
    pub const FOLIAGE: u32 = 1 << 2;
    /// Grass primitives.
    pub const GRASS: u32 = 1 << 3;
    /// Landscape primitives.
    pub const LANDSCAPE: u32 = 1 << 4;
}

/// Inputs for one frame's primitive filter.
#[derive(Debug, Clone, Default)]
pub struct PrimitiveFilterParams {
    /// Primitive IDs to hide. Order does not matter; uploaded sorted.
    pub hidden: Vec<u32>,
    /// When non-empty, only these primitive IDs stay visible.
    pub show_only: Vec<u32>,
    /// Categories to hide wholesale (see [`category`]).
    pub disabled_categories: u32,
}

impl PrimitiveFilterParams {
    /// True when the filter would not hide anything, so the whole pass can be
    /// skipped. This is an optimization; an all-zero bitmask is equivalent.
    pub fn is_noop(&self) -> bool {
        self.hidden.is_empty() && self.show_only.is_empty() && self.disabled_categories == 0
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FilterUniform {
    num_primitives: u32,
    num_hidden: u32,
    num_show_only: u32,
    disabled_categories: u32,
}

/// GPU pass that builds the per-primitive filter bitmask.
pub struct PrimitiveFilter {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    /// Filter bitmask for the current frame; `None` when the filter is a
    /// no-op (the sentinel consumers check instead of an all-zero buffer).
    bitmask: Option<wgpu::Buffer>,
}

impl PrimitiveFilter {
    /// Create the filter pass.
    pub fn new(device: &wgpu::Device) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Primitive Filter Shader"),
            source: wgpu::ShaderSource::Wgsl(
                include_str!("shaders/primitive_filter.wgsl").into(),
            ),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Primitive Filter Bind Group Layout"),
            entries: &[
                gpu::uniform_entry(0),
                // Primitive data (category flags per primitive)
                gpu::storage_ro_entry(1),
                // Hidden IDs, sorted ascending
                gpu::storage_ro_entry(2),
                // Show-only IDs, sorted ascending
                gpu::storage_ro_entry(3),
                // Output bitmask
                gpu::storage_rw_entry(4),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Primitive Filter Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = gpu::compute_pipeline(
            device,
            "Primitive Filter Pipeline",
            &pipeline_layout,
            &shader,
            "filter_primitives",
        );

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Primitive Filter Uniform Buffer"),
            size: std::mem::size_of::<FilterUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            pipeline,
            bind_group_layout,
            uniform_buffer,
            bitmask: None,
        }
    }

    /// Build the filter bitmask for this frame. Leaves the bitmask `None` and
    /// records nothing when the params are a no-op.
    pub fn build(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
        scene: &GpuScene,
        params: &PrimitiveFilterParams,
    ) {
        self.bitmask = None;
        if params.is_noop() || scene.primitive_count == 0 {
            return;
        }

        // Sorted ascending so the kernel can binary search.
        let mut hidden = params.hidden.clone();
        hidden.sort_unstable();
        let mut show_only = params.show_only.clone();
        show_only.sort_unstable();

        let num_words = scene.primitive_count.div_ceil(32) as u64;
        let bitmask = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Primitive Filter Bitmask"),
            size: num_words * 4,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        // All visible until the kernel sets bits.
        encoder.clear_buffer(&bitmask, 0, None);

        let uniform = FilterUniform {
            num_primitives: scene.primitive_count,
            num_hidden: hidden.len() as u32,
            num_show_only: show_only.len() as u32,
            disabled_categories: params.disabled_categories,
        };
        queue.write_buffer(&self.uniform_buffer, 0, bytemuck::cast_slice(&[uniform]));

        let hidden_buffer = if hidden.is_empty() {
            gpu::dummy_storage(device, "Primitive Filter Hidden (empty)")
        } else {
            gpu::upload_storage(device, "Primitive Filter Hidden", &hidden, wgpu::BufferUsages::empty())
        };
        let show_only_buffer = if show_only.is_empty() {
            gpu::dummy_storage(device, "Primitive Filter Show Only (empty)")
        } else {
            gpu::upload_storage(
                device,
                "Primitive Filter Show Only",
                &show_only,
                wgpu::BufferUsages::empty(),
            )
        };

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Primitive Filter Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: scene.primitive_data.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: hidden_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: show_only_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: bitmask.as_entire_binding(),
                },
            ],
        });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Primitive Filter Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(gpu::dispatch_size(scene.primitive_count, 64), 1, 1);
        }

        self.bitmask = Some(bitmask);
    }

    /// The filter bitmask for the current frame, or `None` when filtering is
    /// inactive.
    pub fn bitmask(&self) -> Option<&wgpu::Buffer> {
        self.bitmask.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_params_are_noop() {
        // Scenario D: no hidden set, no show-only set, no disabled
        // categories; the bitmask must stay unallocated.
        let params = PrimitiveFilterParams::default();
        assert!(params.is_noop());
    }

    #[test]
    fn any_input_activates_the_filter() {
        let hidden = PrimitiveFilterParams {
            hidden: vec![7],
            ..Default::default()
        };
        assert!(!hidden.is_noop());

        let show_only = PrimitiveFilterParams {
            show_only: vec![3],
            ..Default::default()
        };
        assert!(!show_only.is_noop());

        let categories = PrimitiveFilterParams {
            disabled_categories: category::GRASS,
            ..Default::default()
        };
        assert!(!categories.is_noop());
    }
}
