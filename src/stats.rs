//! Debug statistics and capacity accounting.
//!
//! The culling kernels tally peak occupancy and visible counts into a small
//! stats buffer when stats extraction is enabled. Capacity overruns are not a
//! contracted failure mode on the GPU; the stats buffer exists so the host
//! can detect an overflow-adjacent frame after the fact. Debug builds assert
//! on a detected overflow; release builds rely on the kernels clamping and
//! dropping work at capacity.

use bytemuck::{Pod, Zeroable};

use crate::config::CullConfig;
use crate::error::{Error, Result};

/// Per-invocation counters written by the culling kernels via atomic adds
/// and maxes; append-only across all invocations within a frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct DebugStats {
    /// Instances evaluated by instance culling.
    pub tested_instances: u32,
    /// Instances surviving all tests.
    pub visible_instances: u32,
    /// Peak candidate node occupancy observed.
    pub peak_candidate_nodes: u32,
    /// Peak candidate cluster occupancy observed.
    pub peak_candidate_clusters: u32,
    /// Clusters routed to software rasterization.
    pub visible_clusters_sw: u32,
    /// Clusters routed to hardware rasterization.
    pub visible_clusters_hw: u32,
    /// Primitives excluded by the primitive filter.
    pub filtered_primitives: u32,
    /// Clusters overlapping more virtual shadow map pages than the
    /// configured statistic threshold.
    pub large_page_rects: u32,
    /// Streaming requests emitted.
    pub streaming_requests: u32,
    /// Streaming requests dropped at capacity.
    pub dropped_streaming_requests: u32,
}

/// Result of comparing retained stats against the configured capacities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapacityReport {
    /// Candidate node occupancy reached or exceeded `max_nodes`.
    pub nodes_exceeded: bool,
    /// Candidate cluster occupancy reached or exceeded the configured
    /// candidate capacity.
    pub clusters_exceeded: bool,
    /// Visible cluster output reached or exceeded `max_visible_clusters`.
    pub visible_exceeded: bool,
}

impl CapacityReport {
    /// Compare a stats snapshot against the frozen configuration.
    pub fn check(stats: &DebugStats, config: &CullConfig) -> Self {
        let report = Self {
            nodes_exceeded: stats.peak_candidate_nodes > config.max_nodes,
            clusters_exceeded: stats.peak_candidate_clusters > config.max_candidate_clusters,
            visible_exceeded: stats.visible_clusters_sw + stats.visible_clusters_hw
                > config.max_visible_clusters,
        };
        if report.any() {
            log::warn!("culling capacity exceeded: {report:?}");
        }
        debug_assert!(!report.any(), "culling capacity exceeded: {report:?}");
        report
    }

    /// Any capacity exceeded.
    pub fn any(&self) -> bool {
        self.nodes_exceeded || self.clusters_exceeded || self.visible_exceeded
    }
}

/// GPU stats buffer with a staging-readback path, retained only when stats
/// extraction is enabled.
pub struct StatsBuffer {
    /// Device-local buffer the kernels write into.
    pub buffer: wgpu::Buffer,
    staging: wgpu::Buffer,
}

impl StatsBuffer {
    /// Allocate the stats and staging buffers.
    pub fn new(device: &wgpu::Device) -> Self {
        let size = std::mem::size_of::<DebugStats>() as u64;
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Cull Debug Stats"),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Cull Debug Stats Staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self { buffer, staging }
    }

    /// Zero the stats at the start of a frame.
    pub fn clear(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.clear_buffer(&self.buffer, 0, None);
    }

    /// Record a copy into the staging buffer; call at end of frame before
    /// [`StatsBuffer::read`].
    pub fn copy_to_staging(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.copy_buffer_to_buffer(
            &self.buffer,
            0,
            &self.staging,
            0,
            std::mem::size_of::<DebugStats>() as u64,
        );
    }

    /// Block until the staging copy is mappable and return the snapshot.
    pub fn read(&self, device: &wgpu::Device) -> Result<DebugStats> {
        let slice = self.staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|e| Error::Readback(e.to_string()))?
            .map_err(|e| Error::Readback(e.to_string()))?;

        let stats = *bytemuck::from_bytes::<DebugStats>(&slice.get_mapped_range());
        self.staging.unmap();
        Ok(stats)
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
    fn in_budget_stats_report_clean() {
        let cfg = config();
        let stats = DebugStats {
            peak_candidate_nodes: cfg.max_nodes - 1,
            peak_candidate_clusters: cfg.max_candidate_clusters / 2,
            visible_clusters_sw: 100,
            visible_clusters_hw: 200,
            ..Default::default()
        };
        let report = CapacityReport::check(&stats, &cfg);
        assert!(!report.any());
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn node_overflow_is_reported() {
        let cfg = config();
        let stats = DebugStats {
            peak_candidate_nodes: cfg.max_nodes + 1,
            ..Default::default()
        };
        let report = CapacityReport::check(&stats, &cfg);
        assert!(report.nodes_exceeded);
        assert!(report.any());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "culling capacity exceeded")]
    fn node_overflow_asserts_in_debug() {
        let cfg = config();
        let stats = DebugStats {
            peak_candidate_nodes: cfg.max_nodes + 1,
            ..Default::default()
        };
        let _ = CapacityReport::check(&stats, &cfg);
    }

    #[test]
    fn sw_and_hw_counts_sum_against_visible_capacity() {
        let cfg = config();
        let stats = DebugStats {
            visible_clusters_sw: cfg.max_visible_clusters,
            visible_clusters_hw: 0,
            ..Default::default()
        };
        // Exactly at capacity is in budget; the kernels clamp past it.
        assert!(!CapacityReport::check(&stats, &cfg).any());
    }
}
