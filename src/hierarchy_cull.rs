//! Hierarchical BVH node and cluster culling.
//!
//! Surviving instances seed BVH roots into the candidate node queue; node
//! culling walks the hierarchy level by level, each level sized by an
//! indirect-args fixup pass, pushing accepted interior nodes back onto the
//! queue and leaf clusters into cluster batches. Cluster culling then tests
//! each candidate cluster, selects LOD against the per-view error budget,
//! emits streaming requests for missing detail and appends survivors to the
//! visible cluster list tagged with their raster path. An optional
//! persistent-threads kernel replaces the level loop with a single dispatch
//! that spins on the shared queue cursors.

use bytemuck::{Pod, Zeroable};

use crate::config::{CullConfig, MAX_BVH_LEVELS};
use crate::gpu;
use crate::instance_cull::CullPhase;
use crate::queue::CandidateQueues;
use crate::scene::StreamingBuffers;

/// Words per visible cluster record (cluster ref, view index, bin + path).
pub const VISIBLE_CLUSTER_WORDS: u64 = 3;

/// Rasterization path for a visible cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterPath {
    /// Compute rasterizer; small clusters.
    Software,
    /// Draw-based rasterizer; large clusters.
    Hardware,
}

/// Route a cluster by its maximum projected edge length in pixels. At or
/// above the threshold the hardware path wins; software otherwise.
pub fn raster_path_for_edge(projected_edge_pixels: f32, min_pixels_per_edge_hw: f32) -> RasterPath {
    if projected_edge_pixels >= min_pixels_per_edge_hw {
        RasterPath::Hardware
    } else {
        RasterPath::Software
    }
}

/// Number of hierarchy levels the cull loop visits for the given resident
/// geometry.
pub fn cull_level_count(streaming: &StreamingBuffers) -> u32 {
    streaming.max_hierarchy_levels.min(MAX_BVH_LEVELS).max(1)
}

/// Entries a consumer may drain given raw queue cursors, mirroring the
/// kernels. Producers bump the write cursor past capacity on overflow and
/// rounded-up dispatches let the read cursor overshoot, so both clamp.
pub fn drainable_entries(read: u32, write: u32, capacity: u32) -> u32 {
    let write = write.min(capacity);
    write - read.min(write)
}

/// Outcome of the occlusion test for a queued node or cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateClass {
    /// Passed; traversal or LOD selection continues.
    Accepted,
    /// Failed against the previous pyramid; re-queued for the post pass.
    Deferred,
    /// Failed against the rebuilt pyramid; dropped.
    Culled,
}

/// Mirror of the kernels' occlusion routing: main-phase failures defer into
/// the post pass region instead of dropping.
pub fn classify_occluded_candidate(phase: CullPhase, occluded: bool) -> CandidateClass {
    if !occluded || phase == CullPhase::NoOcclusion {
        return CandidateClass::Accepted;
    }
    match phase {
        CullPhase::Main => CandidateClass::Deferred,
        _ => CandidateClass::Culled,
    }
}

/// Uniform block shared by the hierarchy-cull entry points.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct HierarchyCullParams {
    /// Packed view count for this pass.
    pub num_views: u32,
    /// Mip views per primary in the packed array.
    pub max_mips: u32,
    /// 0 = main, 1 = post, 2 = no-occlusion (same encoding as instance cull).
    pub phase: u32,
    /// Debug flag word from [`crate::instance_cull::pack_debug_flags`].
    pub debug_flags: u32,
    /// SW/HW split threshold in projected pixels per edge.
    pub min_pixels_per_edge_hw: f32,
    /// Imposter pixel threshold.
    pub imposter_max_pixels: f32,
    /// Candidate node capacity.
    pub max_nodes: u32,
    /// Candidate cluster capacity.
    pub max_candidate_clusters: u32,
    /// Visible cluster capacity.
    pub max_visible_clusters: u32,
    /// Streaming request capacity.
    pub max_streaming_requests: u32,
    /// Version stamped into streaming requests this frame.
    pub streaming_version: u32,
    /// Page-overlap count above which the large-page-rect stat increments.
    pub page_overlap_stat_threshold: u32,
    /// HZB base mip extent.
    pub hzb_size: [u32; 2],
    /// Nonzero when the stats buffer is bound.
    pub extract_stats: u32,
    /// Nonzero when virtual shadow map page buffers are bound.
    pub has_vsm: u32,
}

impl HierarchyCullParams {
    /// Derive the uniform block from the frozen configuration.
    pub fn from_config(
        config: &CullConfig,
        num_views: u32,
        max_mips: u32,
        phase: u32,
        debug_flags: u32,
        streaming_version: u32,
        hzb_size: [u32; 2],
        has_vsm: bool,
    ) -> Self {
        Self {
            num_views,
            max_mips,
            phase,
            debug_flags,
            min_pixels_per_edge_hw: config.min_pixels_per_edge_hw,
            imposter_max_pixels: config.imposter_max_pixels,
            max_nodes: config.max_nodes,
            max_candidate_clusters: config.max_candidate_clusters,
            max_visible_clusters: config.max_visible_clusters,
            max_streaming_requests: config.max_streaming_requests,
            streaming_version,
            page_overlap_stat_threshold: config.page_overlap_stat_threshold,
            hzb_size,
            extract_stats: config.debug.extract_stats as u32,
            has_vsm: has_vsm as u32,
        }
    }
}

/// GPU resources a hierarchy-cull invocation reads and writes.
pub struct HierarchyCullBindings<'a> {
    /// Packed view buffer.
    pub views: &'a wgpu::Buffer,
    /// Resident geometry from the streaming manager.
    pub streaming: &'a StreamingBuffers,
    /// Candidate queues.
    pub queues: &'a CandidateQueues,
    /// Visible cluster list: one atomic SW counter, one HW counter, then
    /// records appended from both ends.
    pub visible_clusters: &'a wgpu::Buffer,
    /// Streaming request buffer.
    pub streaming_requests: &'a wgpu::Buffer,
    /// HZB to test against; `None` for the no-occlusion phase.
    pub hzb: Option<&'a wgpu::TextureView>,
    /// Stats buffer, or a placeholder when extraction is off.
    pub stats: &'a wgpu::Buffer,
    /// Virtual shadow map page table (physical index per virtual page), or
    /// `None` when no VSM is attached.
    pub vsm_page_table: Option<&'a wgpu::Buffer>,
    /// Virtual shadow map per-page cache flags.
    pub vsm_page_flags: Option<&'a wgpu::Buffer>,
}

/// Hierarchy culling pipelines: args fixup, node cull, cluster cull and the
/// persistent-threads variant.
pub struct HierarchyCuller {
    init_args_pipeline: wgpu::ComputePipeline,
    init_args_layout: wgpu::BindGroupLayout,
    node_pipeline: wgpu::ComputePipeline,
    cluster_pipeline: wgpu::ComputePipeline,
    persistent_pipeline: wgpu::ComputePipeline,
    cull_layout: wgpu::BindGroupLayout,
    params_buffer: wgpu::Buffer,
    args_params_buffer: wgpu::Buffer,
    /// Indirect args: [node dispatch xyz, cluster dispatch xyz].
    dispatch_args: wgpu::Buffer,
    dummy_texture_view: wgpu::TextureView,
    dummy_buffer: wgpu::Buffer,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct InitArgsUniform {
    pass_slot: u32,
    workgroup_size: u32,
    max_nodes: u32,
    max_clusters: u32,
}

impl HierarchyCuller {
    const WORKGROUP_SIZE: u32 = 64;
    /// Workgroups launched for the persistent-threads kernel; sized to keep
    /// every compute unit busy without oversubscribing the queue cursors.
    const PERSISTENT_WORKGROUPS: u32 = 256;

    /// Create all hierarchy-cull pipelines.
    pub fn new(device: &wgpu::Device) -> Self {
        let cull_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Hierarchy Cull Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/node_cluster_cull.wgsl").into()),
        });
        let persistent_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Persistent Cull Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/persistent_cull.wgsl").into()),
        });
        let args_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Cull Args Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/init_cull_args.wgsl").into()),
        });

        let cull_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Hierarchy Cull Bind Group Layout"),
            entries: &[
                gpu::uniform_entry(0),
                gpu::storage_ro_entry(1), // views
                gpu::storage_ro_entry(2), // hierarchy data
                gpu::storage_ro_entry(3), // cluster page data
                gpu::storage_rw_entry(4), // queue state
                gpu::storage_rw_entry(5), // candidate queue
                gpu::storage_rw_entry(6), // visible clusters
                gpu::storage_rw_entry(7), // streaming requests
                gpu::texture2d_entry(8),  // hzb
                gpu::storage_rw_entry(9), // stats
                gpu::storage_ro_entry(10), // vsm page table
                gpu::storage_ro_entry(11), // vsm page flags
            ],
        });

        let cull_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Hierarchy Cull Pipeline Layout"),
            bind_group_layouts: &[&cull_layout],
            push_constant_ranges: &[],
        });

        let node_pipeline = gpu::compute_pipeline(
            device,
            "Node Cull Pipeline",
            &cull_pipeline_layout,
            &cull_shader,
            "node_cull",
        );
        let cluster_pipeline = gpu::compute_pipeline(
            device,
            "Cluster Cull Pipeline",
            &cull_pipeline_layout,
            &cull_shader,
            "cluster_cull",
        );
        let persistent_pipeline = gpu::compute_pipeline(
            device,
            "Persistent Cull Pipeline",
            &cull_pipeline_layout,
            &persistent_shader,
            "persistent_cull",
        );

        let init_args_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Cull Args Bind Group Layout"),
            entries: &[
                gpu::uniform_entry(0),
                gpu::storage_rw_entry(1), // queue state
                gpu::storage_rw_entry(2), // dispatch args
            ],
        });
        let init_args_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Cull Args Pipeline Layout"),
                bind_group_layouts: &[&init_args_layout],
                push_constant_ranges: &[],
            });
        let init_args_pipeline = gpu::compute_pipeline(
            device,
            "Cull Args Pipeline",
            &init_args_pipeline_layout,
            &args_shader,
            "init_cull_args",
        );

        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Hierarchy Cull Params"),
            size: std::mem::size_of::<HierarchyCullParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let args_params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Cull Args Params"),
            size: std::mem::size_of::<InitArgsUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let dispatch_args = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Hierarchy Cull Dispatch Args"),
            size: 6 * 4,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::INDIRECT,
            mapped_at_creation: false,
        });

        let dummy_texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Hierarchy Cull Dummy HZB"),
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
        let dummy_buffer = gpu::dummy_storage(device, "Hierarchy Cull Dummy Buffer");

        Self {
            init_args_pipeline,
            init_args_layout,
            node_pipeline,
            cluster_pipeline,
            persistent_pipeline,
            cull_layout,
            params_buffer,
            args_params_buffer,
            dispatch_args,
            dummy_texture_view,
            dummy_buffer,
        }
    }

    /// Upload the uniform blocks and build the bind groups for one cull
    /// invocation.
    pub fn prepare(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        params: HierarchyCullParams,
        bindings: &HierarchyCullBindings<'_>,
    ) -> (wgpu::BindGroup, wgpu::BindGroup) {
        queue.write_buffer(&self.params_buffer, 0, bytemuck::cast_slice(&[params]));
        queue.write_buffer(
            &self.args_params_buffer,
            0,
            bytemuck::cast_slice(&[InitArgsUniform {
                pass_slot: if params.phase == 1 { 1 } else { 0 },
                workgroup_size: Self::WORKGROUP_SIZE,
                max_nodes: params.max_nodes,
                max_clusters: params.max_candidate_clusters,
            }]),
        );

        let hzb = bindings.hzb.unwrap_or(&self.dummy_texture_view);
        let page_table = bindings.vsm_page_table.unwrap_or(&self.dummy_buffer);
        let page_flags = bindings.vsm_page_flags.unwrap_or(&self.dummy_buffer);
        let cull_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Hierarchy Cull Bind Group"),
            layout: &self.cull_layout,
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
                    resource: bindings.streaming.hierarchy_data.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: bindings.streaming.cluster_page_data.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: bindings.queues.queue_state.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: bindings.queues.candidates.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: bindings.visible_clusters.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 7,
                    resource: bindings.streaming_requests.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 8,
                    resource: wgpu::BindingResource::TextureView(hzb),
                },
                wgpu::BindGroupEntry {
                    binding: 9,
                    resource: bindings.stats.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 10,
                    resource: page_table.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 11,
                    resource: page_flags.as_entire_binding(),
                },
            ],
        });

        let args_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Cull Args Bind Group"),
            layout: &self.init_args_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.args_params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: bindings.queues.queue_state.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.dispatch_args.as_entire_binding(),
                },
            ],
        });

        (cull_bind_group, args_bind_group)
    }

    /// Record the level-by-level cull: for each hierarchy level an args fixup
    /// sizes the node dispatch from the queue cursors, then node culling runs
    /// indirectly. Cluster culling follows once all levels are drained.
    pub fn record_levels(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        cull_bind_group: &wgpu::BindGroup,
        args_bind_group: &wgpu::BindGroup,
        levels: u32,
    ) {
        for level in 0..levels.min(MAX_BVH_LEVELS) {
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(&format!("Node Cull Args Level {}", level)),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.init_args_pipeline);
                pass.set_bind_group(0, args_bind_group, &[]);
                pass.dispatch_workgroups(1, 1, 1);
            }
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(&format!("Node Cull Level {}", level)),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.node_pipeline);
                pass.set_bind_group(0, cull_bind_group, &[]);
                pass.dispatch_workgroups_indirect(&self.dispatch_args, 0);
            }
        }

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Cluster Cull Args"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.init_args_pipeline);
            pass.set_bind_group(0, args_bind_group, &[]);
            pass.dispatch_workgroups(1, 1, 1);
        }
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Cluster Cull"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.cluster_pipeline);
            pass.set_bind_group(0, cull_bind_group, &[]);
            pass.dispatch_workgroups_indirect(&self.dispatch_args, 12);
        }
    }

    /// Record the persistent-threads variant: one dispatch owns the whole
    /// node and cluster traversal.
    pub fn record_persistent(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        cull_bind_group: &wgpu::BindGroup,
    ) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Persistent Cull"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.persistent_pipeline);
        pass.set_bind_group(0, cull_bind_group, &[]);
        pass.dispatch_workgroups(Self::PERSISTENT_WORKGROUPS, 1, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_threshold_routes_to_hardware_at_boundary() {
        assert_eq!(raster_path_for_edge(32.0, 32.0), RasterPath::Hardware);
        assert_eq!(raster_path_for_edge(31.999, 32.0), RasterPath::Software);
        assert_eq!(raster_path_for_edge(1000.0, 32.0), RasterPath::Hardware);
        assert_eq!(raster_path_for_edge(0.0, 32.0), RasterPath::Software);
    }

    #[test]
    fn drainable_entries_clamp_overflowed_cursors() {
        assert_eq!(drainable_entries(0, 10, 64), 10);
        // Overflowed producer: only the slots that hold payload drain.
        assert_eq!(drainable_entries(0, 100, 64), 64);
        // Overshot consumer: nothing left, no wrap.
        assert_eq!(drainable_entries(12, 10, 64), 0);
        assert_eq!(drainable_entries(64, 100, 64), 0);
    }

    #[test]
    fn occluded_candidates_defer_to_the_post_queue() {
        assert_eq!(
            classify_occluded_candidate(CullPhase::Main, true),
            CandidateClass::Deferred
        );
        assert_eq!(
            classify_occluded_candidate(CullPhase::Post, true),
            CandidateClass::Culled
        );
        assert_eq!(
            classify_occluded_candidate(CullPhase::NoOcclusion, true),
            CandidateClass::Accepted
        );
        assert_eq!(
            classify_occluded_candidate(CullPhase::Main, false),
            CandidateClass::Accepted
        );
    }

    #[test]
    fn raising_the_threshold_moves_clusters_to_software() {
        // A cluster on the hardware path never flips to software when the
        // threshold drops.
        let edges = [0.5f32, 8.0, 31.0, 32.0, 64.0, 512.0];
        for &edge in &edges {
            let low = raster_path_for_edge(edge, 16.0);
            let high = raster_path_for_edge(edge, 64.0);
            if high == RasterPath::Hardware {
                assert_eq!(low, RasterPath::Hardware, "edge {edge}");
            }
        }
    }
}
