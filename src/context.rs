//! Shared, per-target and per-invocation culling state.
//!
//! [`SharedContext`] owns everything allocated once per process: the compute
//! pipelines and the fixed-capacity queue, stats and feedback buffers.
//! [`RasterContext`] owns the output surfaces of one render target, and
//! [`CullingContext`] tracks one culling invocation from its first pass to
//! its last; an invocation must finish before the same context is reused.

use crate::binning::RasterBinner;
use crate::config::CullConfig;
use crate::filter::PrimitiveFilter;
use crate::hierarchy_cull::{HierarchyCuller, VISIBLE_CLUSTER_WORDS};
use crate::hzb::HzbBuilder;
use crate::instance_cull::InstanceCuller;
use crate::queue::CandidateQueues;
use crate::rasterize::{ClampArgsPass, Rasterizer, RasterTargets};
use crate::stats::StatsBuffer;
use crate::streaming::StreamingFeedback;

/// What a culling + rasterization invocation produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Full visibility buffer for deferred material evaluation. View
    /// references must stay globally unique, so the view set must fit a
    /// single pass.
    VisibilityBuffer,
    /// Depth only (shadow maps). Over-limit view sets split into multiple
    /// sequential passes.
    DepthOnly,
}

impl OutputMode {
    /// Whether this mode renders depth only.
    pub fn depth_only(self) -> bool {
        matches!(self, OutputMode::DepthOnly)
    }
}

/// Process-lifetime pipelines and buffers shared by every invocation.
pub struct SharedContext {
    /// Device handle.
    pub device: wgpu::Device,
    /// Queue handle.
    pub queue: wgpu::Queue,
    /// Instance culling pipelines.
    pub instance_culler: InstanceCuller,
    /// Node/cluster culling pipelines.
    pub hierarchy_culler: HierarchyCuller,
    /// Binning pipelines.
    pub binner: RasterBinner,
    /// Rasterization pipelines.
    pub rasterizer: Rasterizer,
    /// Indirect-args clamp pass.
    pub clamp_args: ClampArgsPass,
    /// Primitive filter pass.
    pub filter: PrimitiveFilter,
    /// Persistent candidate queues.
    pub queues: CandidateQueues,
    /// HZB builder.
    pub hzb: HzbBuilder,
    /// Streaming feedback buffers.
    pub feedback: StreamingFeedback,
    /// Debug stats, retained only when extraction is enabled.
    pub stats: Option<StatsBuffer>,
}

impl SharedContext {
    /// Allocate all process-lifetime resources for the given configuration
    /// and output extent.
    pub fn new(
        device: wgpu::Device,
        queue: wgpu::Queue,
        config: &CullConfig,
        width: u32,
        height: u32,
    ) -> Self {
        let queues = CandidateQueues::new(&device, &queue, config);
        let stats = config.debug.extract_stats.then(|| StatsBuffer::new(&device));
        let feedback = StreamingFeedback::new(&device, config.max_streaming_requests);
        let hzb = HzbBuilder::new(&device, width, height);

        Self {
            instance_culler: InstanceCuller::new(&device),
            hierarchy_culler: HierarchyCuller::new(&device),
            binner: RasterBinner::new(&device),
            rasterizer: Rasterizer::new(&device),
            clamp_args: ClampArgsPass::new(&device),
            filter: PrimitiveFilter::new(&device),
            queues,
            hzb,
            feedback,
            stats,
            device,
            queue,
        }
    }
}

/// Per-render-target state: the raster output surfaces plus the visible
/// cluster list feeding binning.
pub struct RasterContext {
    /// Output mode.
    pub output_mode: OutputMode,
    /// Raster output surfaces.
    pub targets: RasterTargets,
    /// Visible cluster list: a 4-word counter header (software count,
    /// hardware count, two spares) followed by the records.
    pub visible_clusters: wgpu::Buffer,
}

impl RasterContext {
    /// Counter header size in bytes.
    pub const VISIBLE_HEADER_BYTES: u64 = 16;

    /// Allocate per-target resources.
    pub fn new(
        device: &wgpu::Device,
        config: &CullConfig,
        output_mode: OutputMode,
        width: u32,
        height: u32,
    ) -> Self {
        let visible_clusters = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Visible Clusters"),
            size: Self::VISIBLE_HEADER_BYTES
                + config.max_visible_clusters as u64 * VISIBLE_CLUSTER_WORDS * 4,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            output_mode,
            targets: RasterTargets::new(device, width, height),
            visible_clusters,
        }
    }
}

/// Per-invocation state threading one culling invocation through its passes.
pub struct CullingContext {
    /// A previous-frame HZB exists and may be tested against.
    pub has_prev_hzb: bool,
    /// Deferred occluded-instance list (count header + records).
    pub occluded_instances: wgpu::Buffer,
    /// Indirect dispatch args for the post instance-cull pass.
    pub post_dispatch_args: wgpu::Buffer,
    pass_index: u32,
    in_flight: bool,
}

impl CullingContext {
    /// Allocate per-invocation buffers.
    pub fn new(device: &wgpu::Device, config: &CullConfig, has_prev_hzb: bool) -> Self {
        let occluded_instances = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Occluded Instances"),
            size: 16 + config.max_nodes as u64 * 8,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let post_dispatch_args = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Post Instance Cull Args"),
            size: 3 * 4,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::INDIRECT
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            has_prev_hzb,
            occluded_instances,
            post_dispatch_args,
            pass_index: 0,
            in_flight: false,
        }
    }

    /// Mark a pass as being recorded. Panics if the previous pass on this
    /// context never ended; an invocation is strictly sequential.
    pub fn begin_pass(&mut self) -> u32 {
        assert!(!self.in_flight, "culling pass re-entered before completion");
        self.in_flight = true;
        self.pass_index
    }

    /// Mark the current pass finished.
    pub fn end_pass(&mut self) {
        debug_assert!(self.in_flight);
        self.in_flight = false;
        self.pass_index += 1;
    }

    /// Number of passes recorded so far in this invocation.
    pub fn passes_recorded(&self) -> u32 {
        self.pass_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_mode_depth_only() {
        assert!(OutputMode::DepthOnly.depth_only());
        assert!(!OutputMode::VisibilityBuffer.depth_only());
    }
}
