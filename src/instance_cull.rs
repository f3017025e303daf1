//! Instance culling.
//!
//! The first GPU stage of the pipeline: every candidate instance is tested
//! against each view's frustum, draw distance, the primitive filter bitmask
//! and the HZB. Survivors seed the candidate node queue with their BVH roots.
//! In two-pass occlusion the main pass defers HZB-occluded instances to a
//! side list instead of dropping them; the post pass re-tests that list
//! against the freshly built HZB.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::config::{CullConfig, DebugFlags};
use crate::gpu;
use crate::math::Frustum;
use crate::queue::CandidateQueues;
use crate::scene::GpuScene;

/// Which occlusion slot an instance-cull dispatch serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullPhase {
    /// First pass: test against the previous frame's HZB, defer failures.
    Main,
    /// Second pass: re-test the deferred list against the current HZB.
    Post,
    /// Single pass without any HZB test.
    NoOcclusion,
}

impl CullPhase {
    /// Queue-state pass slot this phase produces into.
    pub fn pass_slot(self) -> u32 {
        match self {
            CullPhase::Main | CullPhase::NoOcclusion => 0,
            CullPhase::Post => 1,
        }
    }
}

/// Uniform block shared by the instance-cull entry points.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct InstanceCullParams {
    /// Number of main-phase records: scene instances, or draw-list entries
    /// when one is bound. The post phase reads its count from the
    /// deferred-list header instead.
    pub num_instances: u32,
    /// Packed view count for this pass.
    pub num_views: u32,
    /// Mip views per primary in the packed array.
    pub max_mips: u32,
    /// 0 = main, 1 = post, 2 = no-occlusion.
    pub phase: u32,
    /// Bit flags mirroring [`DebugFlags`]; see the WGSL side.
    pub debug_flags: u32,
    /// Imposter pixel threshold.
    pub imposter_max_pixels: f32,
    /// HZB base mip extent.
    pub hzb_size: [u32; 2],
    /// Candidate node capacity, for clamping queue writes.
    pub max_nodes: u32,
    /// Candidate cluster capacity; fixes the queue buffer region layout.
    pub max_candidate_clusters: u32,
    /// Nonzero when a primitive filter bitmask is bound.
    pub has_filter: u32,
    /// Nonzero when virtual shadow map buffers are bound.
    pub has_vsm: u32,
    /// Nonzero when the stats buffer is bound.
    pub extract_stats: u32,
    /// WPO bounds-inflation cutoff distance (0 = no cutoff).
    pub wpo_disable_distance: f32,
    /// Nonzero when `clip_plane` holds a real plane.
    pub has_clip_plane: u32,
    /// Nonzero when an explicit draw list restricts the main pass.
    pub has_draw_list: u32,
    /// Global clip plane (xyz normal, w offset).
    pub clip_plane: [f32; 4],
    /// Primary-view index of packed view 0, for draw-list view masking when
    /// an invocation is split across multiple culling ranges.
    pub first_primary: u32,
    pub _pad: [u32; 3],
}

/// Debug flag word packing shared with the kernels.
pub fn pack_debug_flags(debug: &DebugFlags) -> u32 {
    let mut flags = 0;
    if debug.disable_frustum {
        flags |= 1 << 0;
    }
    if debug.disable_hzb {
        flags |= 1 << 1;
    }
    if debug.disable_draw_distance {
        flags |= 1 << 2;
    }
    if debug.disable_clip_plane {
        flags |= 1 << 3;
    }
    if debug.disable_wpo_distance {
        flags |= 1 << 4;
    }
    if debug.disable_filter {
        flags |= 1 << 5;
    }
    flags
}

/// GPU resources one instance-cull dispatch reads and writes.
pub struct InstanceCullBindings<'a> {
    /// Packed view buffer.
    pub views: &'a wgpu::Buffer,
    /// Scene instance and primitive data.
    pub scene: &'a GpuScene,
    /// Primitive filter bitmask; `None` binds a placeholder and disables the
    /// test in the kernel.
    pub filter_bitmask: Option<&'a wgpu::Buffer>,
    /// Candidate queues seeded by surviving instances.
    pub queues: &'a CandidateQueues,
    /// Deferred occluded-instance list (main writes, post consumes).
    pub occluded_instances: &'a wgpu::Buffer,
    /// Indirect dispatch args for the post phase, written by main.
    pub post_dispatch_args: &'a wgpu::Buffer,
    /// HZB to test against; `None` for the no-occlusion phase.
    pub hzb: Option<&'a wgpu::TextureView>,
    /// Stats buffer, or a placeholder when extraction is off.
    pub stats: &'a wgpu::Buffer,
    /// Virtual shadow map dirty-page flags side channel, or a placeholder.
    pub vsm_dirty_flags: &'a wgpu::Buffer,
    /// Explicit draw list of (instance id, view mask) pairs; `None` culls
    /// every scene instance against every view.
    pub instance_draws: Option<&'a wgpu::Buffer>,
    /// Virtual shadow map invalidation list collecting primitives that moved
    /// this frame, or `None` when no VSM is attached.
    pub vsm_invalidating: Option<&'a wgpu::Buffer>,
}

/// Instance culling pipelines for all three phases.
pub struct InstanceCuller {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    params_buffer: wgpu::Buffer,
    dummy_texture_view: wgpu::TextureView,
    dummy_buffer: wgpu::Buffer,
}

impl InstanceCuller {
    const WORKGROUP_SIZE: u32 = 64;

    /// Create the instance-cull pipeline and its layout.
    pub fn new(device: &wgpu::Device) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Instance Cull Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/instance_cull.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Instance Cull Bind Group Layout"),
            entries: &[
                gpu::uniform_entry(0),
                gpu::storage_ro_entry(1),  // views
                gpu::storage_ro_entry(2),  // instance data
                gpu::storage_ro_entry(3),  // primitive data
                gpu::storage_ro_entry(4),  // filter bitmask
                gpu::storage_rw_entry(5),  // queue state
                gpu::storage_rw_entry(6),  // nodes and batches
                gpu::storage_rw_entry(7),  // occluded instances
                gpu::storage_rw_entry(8),  // post dispatch args
                gpu::texture2d_entry(9),   // hzb
                gpu::storage_rw_entry(10), // stats
                gpu::storage_rw_entry(11), // vsm dirty flags
                gpu::storage_ro_entry(12), // instance draw list
                gpu::storage_rw_entry(13), // vsm invalidating primitives
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Instance Cull Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = gpu::compute_pipeline(
            device,
            "Instance Cull Pipeline",
            &pipeline_layout,
            &shader,
            "instance_cull",
        );

        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Instance Cull Params"),
            size: std::mem::size_of::<InstanceCullParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        // Placeholder resources bound when an optional input is absent.
        let dummy_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Instance Cull Dummy HZB"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let dummy_texture_view = dummy_texture.create_view(&Default::default());
        let dummy_buffer = gpu::dummy_storage(device, "Instance Cull Dummy Buffer");

        Self {
            pipeline,
            bind_group_layout,
            params_buffer,
            dummy_texture_view,
            dummy_buffer,
        }
    }

    /// Placeholder storage buffer for absent optional bindings, shared with
    /// sibling passes.
    pub fn dummy_buffer(&self) -> &wgpu::Buffer {
        &self.dummy_buffer
    }

    /// Upload the uniform block and build the bind group for one dispatch.
    pub fn prepare(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        params: InstanceCullParams,
        bindings: &InstanceCullBindings<'_>,
    ) -> wgpu::BindGroup {
        queue.write_buffer(&self.params_buffer, 0, bytemuck::cast_slice(&[params]));

        let filter = bindings.filter_bitmask.unwrap_or(&self.dummy_buffer);
        let hzb = bindings.hzb.unwrap_or(&self.dummy_texture_view);
        let draws = bindings.instance_draws.unwrap_or(&self.dummy_buffer);
        let invalidating = bindings.vsm_invalidating.unwrap_or(&self.dummy_buffer);

        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Instance Cull Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: bindings.views.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: bindings.scene.instance_data.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: bindings.scene.primitive_data.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: filter.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: bindings.queues.queue_state.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: bindings.queues.candidates.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 7,
                    resource: bindings.occluded_instances.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 8,
                    resource: bindings.post_dispatch_args.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 9,
                    resource: wgpu::BindingResource::TextureView(hzb),
                },
                wgpu::BindGroupEntry {
                    binding: 10,
                    resource: bindings.stats.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 11,
                    resource: bindings.vsm_dirty_flags.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 12,
                    resource: draws.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 13,
                    resource: invalidating.as_entire_binding(),
                },
            ],
        })
    }

    /// Record the main or no-occlusion dispatch over `num_instances`.
    pub fn record(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        bind_group: &wgpu::BindGroup,
        num_instances: u32,
    ) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Instance Cull Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups(gpu::dispatch_size(num_instances, Self::WORKGROUP_SIZE), 1, 1);
    }

    /// Record the post dispatch, sized indirectly by the main pass's deferred
    /// instance count.
    pub fn record_post(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        bind_group: &wgpu::BindGroup,
        post_dispatch_args: &wgpu::Buffer,
    ) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Instance Cull Post Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups_indirect(post_dispatch_args, 0);
    }
}

/// Whether a draw-list view mask admits the given packed view, mirroring the
/// kernel. Mask bits address primary views of the whole invocation; only the
/// first 32 primaries are maskable, the rest always draw.
pub fn draw_allows_view(view_mask: u32, first_primary: u32, view_index: u32, max_mips: u32) -> bool {
    let primary = first_primary + view_index / max_mips.max(1);
    primary >= 32 || view_mask & (1 << primary) != 0
}

/// Host-side instance bounds mirroring the per-instance GPU record, used by
/// [`classify_instance`].
#[derive(Debug, Clone, Copy)]
pub struct InstanceBounds {
    /// Bounding sphere center in world space.
    pub center: Vec3,
    /// Bounding sphere radius.
    pub radius: f32,
    /// Maximum draw distance, or `None` for unbounded.
    pub max_draw_distance: Option<f32>,
    /// Distance from the view origin for draw-distance evaluation.
    pub view_distance: f32,
    /// Excluded by the primitive filter bitmask.
    pub filtered_out: bool,
    /// The previous-frame HZB reports the sphere fully occluded.
    pub hzb_occluded: bool,
}

/// Outcome of the instance-cull decision for one instance/view pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceClass {
    /// Survives; its BVH root enters the candidate node queue.
    Visible,
    /// Failed only the HZB test in the main pass; re-tested in the post pass.
    Deferred,
    /// Definitively rejected for this pass.
    Culled,
}

/// The instance-cull decision, mirroring the kernel. Every test a debug flag
/// disables is treated as passing, so disabling a test can only let more
/// instances through.
pub fn classify_instance(
    bounds: &InstanceBounds,
    frustum: &Frustum,
    phase: CullPhase,
    config: &CullConfig,
) -> InstanceClass {
    let debug = &config.debug;

    if !debug.disable_filter && bounds.filtered_out {
        return InstanceClass::Culled;
    }

    if !debug.disable_draw_distance {
        if let Some(max) = bounds.max_draw_distance {
            if bounds.view_distance - bounds.radius > max {
                return InstanceClass::Culled;
            }
        }
    }

    if !debug.disable_clip_plane {
        if let Some(plane) = config.global_clip_plane {
            let dist = Vec3::from_slice(&plane[..3]).dot(bounds.center) + plane[3];
            if dist < -bounds.radius {
                return InstanceClass::Culled;
            }
        }
    }

    if !debug.disable_frustum && !frustum.intersects_sphere(bounds.center, bounds.radius) {
        return InstanceClass::Culled;
    }

    if !debug.disable_hzb && bounds.hzb_occluded {
        return match phase {
            // Two-pass: the previous HZB is a guess, so occlusion defers
            // rather than culls.
            CullPhase::Main if config.two_pass_occlusion => InstanceClass::Deferred,
            CullPhase::Main | CullPhase::Post => InstanceClass::Culled,
            CullPhase::NoOcclusion => InstanceClass::Visible,
        };
    }

    InstanceClass::Visible
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FrameInputs, Settings};
    use glam::Mat4;

    fn config(settings: Settings) -> CullConfig {
        CullConfig::freeze(
            &settings,
            FrameInputs {
                viewport_height: 1080,
                depth_only: false,
                supports_async_compute: false,
                supports_mesh_shaders: false,
            },
        )
    }

    fn frustum() -> Frustum {
        Frustum::from_view_proj(&Mat4::perspective_rh(1.0, 1.0, 0.1, 1000.0))
    }

    fn visible_bounds() -> InstanceBounds {
        InstanceBounds {
            center: Vec3::new(0.0, 0.0, -10.0),
            radius: 1.0,
            max_draw_distance: None,
            view_distance: 10.0,
            filtered_out: false,
            hzb_occluded: false,
        }
    }

    #[test]
    fn unobstructed_instance_is_visible() {
        let cfg = config(Settings::default());
        assert_eq!(
            classify_instance(&visible_bounds(), &frustum(), CullPhase::Main, &cfg),
            InstanceClass::Visible
        );
    }

    #[test]
    fn occluded_instance_defers_in_main_and_culls_in_post() {
        let cfg = config(Settings::default());
        let bounds = InstanceBounds {
            hzb_occluded: true,
            ..visible_bounds()
        };
        assert_eq!(
            classify_instance(&bounds, &frustum(), CullPhase::Main, &cfg),
            InstanceClass::Deferred
        );
        assert_eq!(
            classify_instance(&bounds, &frustum(), CullPhase::Post, &cfg),
            InstanceClass::Culled
        );
    }

    #[test]
    fn behind_camera_is_culled() {
        let cfg = config(Settings::default());
        let bounds = InstanceBounds {
            center: Vec3::new(0.0, 0.0, 100.0),
            ..visible_bounds()
        };
        assert_eq!(
            classify_instance(&bounds, &frustum(), CullPhase::Main, &cfg),
            InstanceClass::Culled
        );
    }

    #[test]
    fn past_draw_distance_is_culled() {
        let cfg = config(Settings::default());
        let bounds = InstanceBounds {
            max_draw_distance: Some(50.0),
            view_distance: 100.0,
            ..visible_bounds()
        };
        assert_eq!(
            classify_instance(&bounds, &frustum(), CullPhase::Main, &cfg),
            InstanceClass::Culled
        );
    }

    #[test]
    fn clip_plane_culls_behind_plane() {
        // Plane y = 0, keeping the +y side; the instance sits well below it.
        let mut settings = Settings::default();
        settings.global_clip_plane = Some([0.0, 1.0, 0.0, 0.0]);
        let cfg = config(settings.clone());
        let bounds = InstanceBounds {
            center: Vec3::new(0.0, -5.0, -10.0),
            ..visible_bounds()
        };
        assert_eq!(
            classify_instance(&bounds, &frustum(), CullPhase::Main, &cfg),
            InstanceClass::Culled
        );

        settings.debug.disable_clip_plane = true;
        let relaxed = config(settings);
        assert_eq!(
            classify_instance(&bounds, &frustum(), CullPhase::Main, &relaxed),
            InstanceClass::Visible
        );
    }

    #[test]
    fn disabling_a_test_never_culls_more() {
        // Every failing input must classify at least as visible once its test
        // is disabled.
        let f = frustum();
        let cases = [
            (
                InstanceBounds {
                    center: Vec3::new(0.0, 0.0, 100.0),
                    ..visible_bounds()
                },
                DebugFlags {
                    disable_frustum: true,
                    ..Default::default()
                },
            ),
            (
                InstanceBounds {
                    max_draw_distance: Some(1.0),
                    view_distance: 100.0,
                    ..visible_bounds()
                },
                DebugFlags {
                    disable_draw_distance: true,
                    ..Default::default()
                },
            ),
            (
                InstanceBounds {
                    filtered_out: true,
                    ..visible_bounds()
                },
                DebugFlags {
                    disable_filter: true,
                    ..Default::default()
                },
            ),
            (
                InstanceBounds {
                    hzb_occluded: true,
                    ..visible_bounds()
                },
                DebugFlags {
                    disable_hzb: true,
                    ..Default::default()
                },
            ),
        ];

        for (bounds, debug) in cases {
            let strict = config(Settings::default());
            let relaxed = config(Settings {
                debug,
                ..Settings::default()
            });

            let with_test = classify_instance(&bounds, &f, CullPhase::Main, &strict);
            let without_test = classify_instance(&bounds, &f, CullPhase::Main, &relaxed);

            let rank = |c: InstanceClass| match c {
                InstanceClass::Culled => 0,
                InstanceClass::Deferred => 1,
                InstanceClass::Visible => 2,
            };
            assert!(
                rank(without_test) >= rank(with_test),
                "{bounds:?} {debug:?}"
            );
        }
    }

    #[test]
    fn draw_list_masks_primary_views() {
        // Mask bit 1 set: primary 0 (views 0..3 at 4 mips) is denied, primary
        // 1 (views 4..7) draws.
        for view in 0..4 {
            assert!(!draw_allows_view(0b10, 0, view, 4));
        }
        for view in 4..8 {
            assert!(draw_allows_view(0b10, 0, view, 4));
        }

        // A later range shifts the primary base: its view 0 is primary 1.
        assert!(draw_allows_view(0b10, 1, 0, 4));
        assert!(!draw_allows_view(0b01, 1, 0, 4));

        // Primaries past the maskable range always draw.
        assert!(draw_allows_view(0, 32, 0, 1));
    }

    #[test]
    fn debug_flag_word_packs_each_toggle() {
        let all = DebugFlags {
            disable_frustum: true,
            disable_hzb: true,
            disable_draw_distance: true,
            disable_clip_plane: true,
            disable_wpo_distance: true,
            disable_filter: true,
            extract_stats: true,
        };
        assert_eq!(pack_debug_flags(&all), 0b111111);
        assert_eq!(pack_debug_flags(&DebugFlags::default()), 0);
    }
}
