//! Persistent candidate queues for hierarchical culling.
//!
//! BVH nodes awaiting test and candidate clusters live in one GPU-resident
//! buffer allocated once per process at fixed capacity. The buffer holds
//! separate regions for the main and post occlusion passes; a [`QueueState`]
//! counter block coordinates the producer/consumer cursors between kernels.
//! The host contract is bounded capacity, wrap-never, and a logical reset
//! (not a reallocation) between frames.

use bytemuck::{Pod, Zeroable};

use crate::config::CullConfig;
use crate::gpu;

/// Words per candidate node entry (instance id, node index, view + flags).
pub const NODE_WORDS: u64 = 3;
/// Words per candidate cluster entry (cluster ref, view + flags).
pub const CLUSTER_WORDS: u64 = 2;

/// Producer/consumer cursors for one occlusion pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PassQueueState {
    /// Next candidate cluster to consume.
    pub cluster_read: u32,
    /// Next candidate cluster slot to produce into.
    pub cluster_write: u32,
    /// Next node to consume.
    pub node_read: u32,
    /// Next node slot to produce into.
    pub node_write: u32,
    /// Nodes produced for the current hierarchy level.
    pub node_count: u32,
}

/// Atomic counter block coordinating the hierarchical cull kernels. Uploaded
/// zeroed at context initialization; mutated only by GPU atomics afterwards.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct QueueState {
    /// Total clusters enqueued across both passes.
    pub total_clusters: u32,
    /// Per-pass cursors: index 0 = main (or no-occlusion), 1 = post.
    pub passes: [PassQueueState; 2],
}

/// Byte layout of the candidate buffer. One region per occlusion pass, nodes
/// first, then cluster entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    /// Candidate node capacity per pass.
    pub max_nodes: u32,
    /// Candidate cluster capacity per pass.
    pub max_clusters: u32,
}

impl QueueLayout {
    /// Derive the layout from the frozen configuration.
    pub fn from_config(config: &CullConfig) -> Self {
        Self {
            max_nodes: config.max_nodes,
            max_clusters: config.max_candidate_clusters,
        }
    }

    /// Bytes occupied by one pass region.
    pub fn pass_region_bytes(&self) -> u64 {
        (self.max_nodes as u64 * NODE_WORDS + self.max_clusters as u64 * CLUSTER_WORDS) * 4
    }

    /// Total buffer size for both passes.
    pub fn total_bytes(&self) -> u64 {
        self.pass_region_bytes() * 2
    }

    /// Byte offset of a pass region (0 = main, 1 = post).
    pub fn pass_offset(&self, pass_slot: u32) -> u64 {
        debug_assert!(pass_slot < 2);
        self.pass_region_bytes() * pass_slot as u64
    }

    /// Byte offset of the cluster region within a pass region.
    pub fn cluster_offset_in_pass(&self) -> u64 {
        self.max_nodes as u64 * NODE_WORDS * 4
    }
}

/// The persistent queue buffers plus the compute pass that reverts them to
/// the cleared state between frames.
pub struct CandidateQueues {
    /// Queue cursor block.
    pub queue_state: wgpu::Buffer,
    /// Candidate node and cluster buffer (both pass regions).
    pub candidates: wgpu::Buffer,
    layout: QueueLayout,
    reset_pipeline: wgpu::ComputePipeline,
    reset_bind_group: wgpu::BindGroup,
}

impl CandidateQueues {
    /// Allocate the persistent buffers. Called once per process; per-frame
    /// reuse goes through [`CandidateQueues::reset`].
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue, config: &CullConfig) -> Self {
        let layout = QueueLayout::from_config(config);

        let queue_state = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Cull Queue State"),
            size: std::mem::size_of::<QueueState>() as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let candidates = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Cull Candidate Queue"),
            size: layout.total_bytes(),
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Cull Queue Reset Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/init_queues.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Cull Queue Reset Bind Group Layout"),
            entries: &[gpu::storage_rw_entry(0)],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Cull Queue Reset Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let reset_pipeline = gpu::compute_pipeline(
            device,
            "Cull Queue Reset Pipeline",
            &pipeline_layout,
            &shader,
            "reset_queues",
        );

        let reset_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Cull Queue Reset Bind Group"),
            layout: &bind_group_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: queue_state.as_entire_binding(),
            }],
        });

        // Start from the cleared state without waiting for the first frame.
        queue.write_buffer(
            &queue_state,
            0,
            bytemuck::cast_slice(&[QueueState::default()]),
        );

        Self {
            queue_state,
            candidates,
            layout,
            reset_pipeline,
            reset_bind_group,
        }
    }

    /// Buffer layout descriptor.
    pub fn layout(&self) -> &QueueLayout {
        &self.layout
    }

    /// Revert the queue state to the cleared state. Only the counter words
    /// are touched; node and cluster payloads are logically dead once the
    /// cursors reset.
    pub fn reset(&self, encoder: &mut wgpu::CommandEncoder) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Cull Queue Reset Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.reset_pipeline);
        pass.set_bind_group(0, &self.reset_bind_group, &[]);
        pass.dispatch_workgroups(1, 1, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CullConfig, FrameInputs, Settings};

    fn config() -> CullConfig {
        CullConfig::freeze(
            &Settings::default(),
            FrameInputs {
                viewport_height: 1080,
                depth_only: false,
                supports_async_compute: false,
                supports_mesh_shaders: false,
            },
        )
    }

    #[test]
    fn layout_regions_do_not_overlap() {
        let layout = QueueLayout::from_config(&config());
        assert_eq!(layout.pass_offset(0), 0);
        assert_eq!(layout.pass_offset(1), layout.pass_region_bytes());
        assert_eq!(layout.total_bytes(), 2 * layout.pass_region_bytes());
        // Cluster entries start after the node region.
        assert!(layout.cluster_offset_in_pass() < layout.pass_region_bytes());
    }

    #[test]
    fn layout_covers_configured_capacities() {
        let cfg = config();
        let layout = QueueLayout::from_config(&cfg);
        assert_eq!(layout.max_nodes, cfg.max_nodes);
        assert_eq!(layout.max_clusters, cfg.max_candidate_clusters);
        assert_eq!(
            layout.pass_region_bytes(),
            (cfg.max_nodes as u64 * NODE_WORDS + cfg.max_candidate_clusters as u64 * CLUSTER_WORDS) * 4
        );
    }

    #[test]
    fn queue_state_is_tightly_packed() {
        // The WGSL counterpart indexes this as a flat array of u32.
        assert_eq!(std::mem::size_of::<QueueState>(), 11 * 4);
    }
}
