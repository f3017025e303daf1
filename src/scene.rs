//! External collaborator interfaces.
//!
//! The culling core consumes these as opaque, read-only GPU buffer views and
//! small host-side predicates; it never mutates collaborator state except for
//! the explicitly write-only side channels (virtual shadow map dirty flags,
//! streaming requests).

use bytemuck::{Pod, Zeroable};

/// Read-only view of the scene's instance and primitive data.
#[derive(Clone)]
pub struct GpuScene {
    /// Per-instance transforms and bounds, as a structured buffer.
    pub instance_data: wgpu::Buffer,
    /// Per-primitive flags and category bits.
    pub primitive_data: wgpu::Buffer,
    /// Number of instances in `instance_data`.
    pub instance_count: u32,
    /// Number of primitives in `primitive_data`.
    pub primitive_count: u32,
    /// Frame-numbered versioning token from the scene collaborator.
    pub frame_version: u64,
}

/// An explicit instance draw, used when the caller restricts culling to a
/// subset of the scene instead of every scene instance.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct InstanceDraw {
    /// Scene instance index.
    pub instance_id: u32,
    /// Bitmask of primary views this instance is drawn into.
    pub view_mask: u32,
}

/// Per-bin and per-instance visibility predicates, computed by an external
/// visibility pass and consumed read-only by binning.
#[derive(Debug, Clone)]
pub struct VisibilityResults {
    bin_visible: Vec<bool>,
    instance_visible: Option<Vec<bool>>,
}

impl VisibilityResults {
    /// All bins and instances visible (no visibility pass ran).
    pub fn all_visible(num_bins: usize) -> Self {
        Self {
            bin_visible: vec![true; num_bins],
            instance_visible: None,
        }
    }

    /// Build from explicit predicates.
    pub fn new(bin_visible: Vec<bool>, instance_visible: Option<Vec<bool>>) -> Self {
        Self {
            bin_visible,
            instance_visible,
        }
    }

    /// Whether the raster bin with the given stable index is visible this
    /// frame. Unknown bins are treated as visible.
    pub fn is_bin_visible(&self, stable_bin: usize) -> bool {
        self.bin_visible.get(stable_bin).copied().unwrap_or(true)
    }

    /// Whether the instance is visible. Absent data means visible.
    pub fn is_instance_visible(&self, instance: usize) -> bool {
        self.instance_visible
            .as_ref()
            .and_then(|v| v.get(instance).copied())
            .unwrap_or(true)
    }

    /// Number of bins with known visibility.
    pub fn num_bins(&self) -> usize {
        self.bin_visible.len()
    }
}

/// Read-only geometry data owned by the external streaming manager.
#[derive(Clone)]
pub struct StreamingBuffers {
    /// BVH hierarchy nodes for all resident pages.
    pub hierarchy_data: wgpu::Buffer,
    /// Cluster page payloads.
    pub cluster_page_data: wgpu::Buffer,
    /// Maximum resident hierarchy depth; bounds the level-by-level cull loop.
    pub max_hierarchy_levels: u32,
    /// Maximum number of streaming pages, used to size dispatches.
    pub max_streaming_pages: u32,
}

/// Virtual shadow map page extent in texels.
pub const VSM_PAGE_SIZE_TEXELS: u32 = 128;
/// Page table entry marking a virtual page with no physical backing.
pub const VSM_INVALID_PAGE: u32 = u32::MAX;
/// Page flag: the physical page holds valid cached depth.
pub const VSM_PAGE_FLAG_CACHED: u32 = 1;
/// Page flag: the cached depth was invalidated this frame.
pub const VSM_PAGE_FLAG_DIRTY: u32 = 2;

/// Whether a virtual shadow map page needs geometry rendered into it this
/// frame, mirroring the cluster-cull kernels: unmapped pages receive nothing,
/// cached-and-clean pages keep last frame's depth.
pub fn vsm_page_needs_render(table_entry: u32, flags: u32) -> bool {
    if table_entry == VSM_INVALID_PAGE {
        return false;
    }
    flags & VSM_PAGE_FLAG_CACHED == 0 || flags & VSM_PAGE_FLAG_DIRTY != 0
}

/// Optional virtual shadow map collaborator. Culling reads page tables and
/// the previous-frame physical page pool, and writes dirty-page flags and
/// invalidating primitives back as side channels feeding the VSM cache
/// invalidation mechanism.
pub struct VirtualShadowMapTargets {
    /// Page table: physical page index per virtual page, or
    /// [`VSM_INVALID_PAGE`]. Read by cluster culling.
    pub page_table: wgpu::Buffer,
    /// Per-page cache flags ([`VSM_PAGE_FLAG_CACHED`] and
    /// [`VSM_PAGE_FLAG_DIRTY`]). Read by cluster culling.
    pub page_flags: wgpu::Buffer,
    /// Previous-frame physical page depth data, the post-pass HZB source for
    /// shadow views.
    pub physical_pages_prev: wgpu::TextureView,
    /// Dirty-page flags written during culling (write-only side channel).
    pub dirty_page_flags: wgpu::Buffer,
    /// Primitives whose instances moved this frame, appended by instance
    /// culling so the VSM cache can invalidate the pages they overlap
    /// (write-only side channel).
    pub invalidating_primitives: wgpu::Buffer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_visible_accepts_unknown_bins() {
        let vis = VisibilityResults::all_visible(2);
        assert!(vis.is_bin_visible(0));
        assert!(vis.is_bin_visible(17));
        assert!(vis.is_instance_visible(5));
    }

    #[test]
    fn vsm_pages_render_only_when_mapped_and_invalid() {
        // Unmapped: nothing to render into.
        assert!(!vsm_page_needs_render(VSM_INVALID_PAGE, 0));
        assert!(!vsm_page_needs_render(
            VSM_INVALID_PAGE,
            VSM_PAGE_FLAG_CACHED | VSM_PAGE_FLAG_DIRTY
        ));
        // Mapped but never cached: render.
        assert!(vsm_page_needs_render(3, 0));
        // Cached and clean: keep last frame's depth.
        assert!(!vsm_page_needs_render(3, VSM_PAGE_FLAG_CACHED));
        // Cached but invalidated: render again.
        assert!(vsm_page_needs_render(
            3,
            VSM_PAGE_FLAG_CACHED | VSM_PAGE_FLAG_DIRTY
        ));
    }

    #[test]
    fn explicit_predicates_are_honored() {
        let vis = VisibilityResults::new(vec![true, false], Some(vec![false, true]));
        assert!(vis.is_bin_visible(0));
        assert!(!vis.is_bin_visible(1));
        assert!(!vis.is_instance_visible(0));
        assert!(vis.is_instance_visible(1));
    }
}
