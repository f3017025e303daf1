//! View packing and multi-pass view splitting.
//!
//! One culling + rasterization pass consumes a single packed GPU buffer of
//! view records: primary views (cameras, shadow projections, cube faces)
//! followed by their derived mip views, laid out primary-view-major and
//! mip-minor. Hardware limits a pass to [`MAX_VIEWS_PER_CULL_PASS`] views;
//! depth-only rendering splits larger sets into multiple sequential passes,
//! while visibility-buffer rendering requires globally unique view references
//! and treats an over-limit set as a caller error.

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::config::MAX_VIEWS_PER_CULL_PASS;
use crate::gpu;
use crate::math;

/// View record flags.
pub mod view_flags {
    /// The view writes into a virtual shadow map target.
    pub const VIRTUAL_TARGET: u32 = 1 << 0;
    /// The view has a valid previous-frame transform for HZB reprojection.
    pub const HAS_PREV_TRANSFORM: u32 = 1 << 1;
    /// A global clip plane is active for this view.
    pub const CLIP_PLANE: u32 = 1 << 2;
}

/// A GPU-resident view record. Immutable once uploaded for a culling pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PackedView {
    /// View-projection matrix.
    pub view_proj: [[f32; 4]; 4],
    /// Previous frame's view-projection matrix, for testing against the
    /// previous HZB. Identity when no history exists.
    pub prev_view_proj: [[f32; 4]; 4],
    /// Viewport rect in the output target: x, y, width, height.
    pub viewport_rect: [u32; 4],
    /// Normalized rect of the HZB this view may test against.
    pub hzb_test_rect: [f32; 4],
    /// Output array layer.
    pub target_layer: u32,
    /// Output mip level.
    pub target_mip: u32,
    /// Number of mip views derived from this primary view (1 when none).
    pub num_mips: u32,
    /// See [`view_flags`].
    pub flags: u32,
    /// World-to-pixel LOD scale for cluster error projection.
    pub lod_scale: f32,
    /// LOD scale applied to the hardware-raster budget.
    pub lod_scale_hw: f32,
    /// Pad to a 16-byte multiple for GPU layout.
    pub _pad: [u32; 2],
}

impl Default for PackedView {
    fn default() -> Self {
        Self {
            view_proj: Mat4::IDENTITY.to_cols_array_2d(),
            prev_view_proj: Mat4::IDENTITY.to_cols_array_2d(),
            viewport_rect: [0; 4],
            hzb_test_rect: [0.0, 0.0, 1.0, 1.0],
            target_layer: 0,
            target_mip: 0,
            num_mips: 1,
            flags: 0,
            lod_scale: 1.0,
            lod_scale_hw: 1.0,
            _pad: [0; 2],
        }
    }
}

/// Host-side parameters for building a [`PackedView`].
#[derive(Debug, Clone)]
pub struct ViewParams {
    /// View-projection matrix.
    pub view_proj: Mat4,
    /// Projection matrix alone, used to derive the LOD scale.
    pub proj: Mat4,
    /// Previous frame's view-projection matrix, when history exists.
    pub prev_view_proj: Option<Mat4>,
    /// Viewport rect: x, y, width, height.
    pub viewport_rect: [u32; 4],
    /// Output array layer.
    pub target_layer: u32,
    /// Output mip level.
    pub target_mip: u32,
    /// Number of derived mip views (1 when none).
    pub num_mips: u32,
    /// The view renders into a virtual shadow map.
    pub virtual_target: bool,
    /// Pixels-per-edge budget from the frozen config.
    pub max_pixels_per_edge: f32,
}

impl PackedView {
    /// Build a packed record, deriving LOD scales from the projection and
    /// viewport.
    pub fn build(params: &ViewParams) -> Self {
        let mut flags = 0;
        if params.virtual_target {
            flags |= view_flags::VIRTUAL_TARGET;
        }
        if params.prev_view_proj.is_some() {
            flags |= view_flags::HAS_PREV_TRANSFORM;
        }

        let scale = math::lod_scale(&params.proj, params.viewport_rect[3]);
        Self {
            view_proj: params.view_proj.to_cols_array_2d(),
            prev_view_proj: params
                .prev_view_proj
                .unwrap_or(Mat4::IDENTITY)
                .to_cols_array_2d(),
            viewport_rect: params.viewport_rect,
            hzb_test_rect: [0.0, 0.0, 1.0, 1.0],
            target_layer: params.target_layer,
            target_mip: params.target_mip,
            num_mips: params.num_mips.max(1),
            flags,
            lod_scale: scale / params.max_pixels_per_edge.max(1e-3),
            lod_scale_hw: scale,
            _pad: [0; 2],
        }
    }
}

/// An ordered set of packed views for one or more culling passes.
///
/// Storage is primary-view-major, mip-minor: view `(p, m)` lives at index
/// `p * max_mips + m`, padded with zeroed records for primaries with fewer
/// mips so every consumer indexes the same way.
#[derive(Debug, Clone)]
pub struct PackedViewArray {
    views: Vec<PackedView>,
    num_primary: u32,
    max_mips: u32,
}

impl PackedViewArray {
    /// Build the padded array from per-primary mip chains. Each inner slice
    /// holds a primary view followed by its derived mip views.
    pub fn from_primary_views(primaries: Vec<Vec<PackedView>>) -> Self {
        let num_primary = primaries.len() as u32;
        let max_mips = primaries
            .iter()
            .map(|mips| mips.len().max(1) as u32)
            .max()
            .unwrap_or(1);

        let mut views = vec![PackedView::zeroed(); (num_primary * max_mips) as usize];
        for (p, mips) in primaries.into_iter().enumerate() {
            let num_mips = mips.len().max(1) as u32;
            for (m, mut view) in mips.into_iter().enumerate() {
                view.num_mips = num_mips;
                views[p * max_mips as usize + m] = view;
            }
        }

        Self {
            views,
            num_primary,
            max_mips,
        }
    }

    /// The packed records, primary-view-major.
    pub fn views(&self) -> &[PackedView] {
        &self.views
    }

    /// Number of primary views.
    pub fn num_primary(&self) -> u32 {
        self.num_primary
    }

    /// Maximum mip count over all primaries.
    pub fn max_mips(&self) -> u32 {
        self.max_mips
    }

    /// Total view count this array occupies in the packed buffer.
    pub fn total_views(&self) -> u32 {
        self.num_primary * self.max_mips
    }

    /// Upload the packed views into a single GPU buffer, padded to the next
    /// power of two record count.
    pub fn upload(&self, device: &wgpu::Device) -> wgpu::Buffer {
        let padded = (self.views.len().max(1)).next_power_of_two();
        let mut records = self.views.clone();
        records.resize(padded, PackedView::zeroed());
        gpu::upload_storage(device, "Packed Views", &records, wgpu::BufferUsages::COPY_DST)
    }

    /// Extract the sub-array for one [`ViewRange`], repacked to the range's
    /// own max mip count.
    pub fn slice_range(&self, range: &ViewRange) -> PackedViewArray {
        let mut views =
            vec![PackedView::zeroed(); (range.num_primary * range.max_mips) as usize];
        for p in 0..range.num_primary {
            let src_primary = (range.first_primary + p) as usize;
            let num_mips = self.views[src_primary * self.max_mips as usize].num_mips;
            for m in 0..num_mips.min(range.max_mips) {
                views[(p * range.max_mips + m) as usize] =
                    self.views[src_primary * self.max_mips as usize + m as usize];
            }
        }
        PackedViewArray {
            views,
            num_primary: range.num_primary,
            max_mips: range.max_mips,
        }
    }
}

/// A contiguous run of primary views assigned to one culling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewRange {
    /// Index of the first primary view in the range.
    pub first_primary: u32,
    /// Number of primary views.
    pub num_primary: u32,
    /// Maximum mip count within the range; bounds the packed view count.
    pub max_mips: u32,
}

impl ViewRange {
    /// Packed view count the range occupies.
    pub fn num_views(&self) -> u32 {
        self.num_primary * self.max_mips
    }
}

/// Split a view array into ranges that each fit within `max_views_per_pass`.
///
/// Greedy: each range takes as many whole primary views (with all their mips)
/// as fit, where the range's view count is bounded by its running maximum mip
/// count times its primary count. A primary view's mips are never split
/// across ranges.
pub fn split_view_ranges(array: &PackedViewArray, max_views_per_pass: u32) -> Vec<ViewRange> {
    let views = array.views();
    let mut ranges = Vec::new();

    let mut next_primary = 0u32;
    while next_primary < array.num_primary() {
        let first_primary = next_primary;
        let mut range_max_mips = 0u32;

        while next_primary < array.num_primary() {
            let num_mips = views[(next_primary * array.max_mips()) as usize].num_mips.max(1);
            let next_num_views =
                range_max_mips.max(num_mips) * (next_primary - first_primary + 1);
            if next_num_views > max_views_per_pass {
                break;
            }
            range_max_mips = range_max_mips.max(num_mips);
            next_primary += 1;
        }

        // A single primary view always fits: its mip count is bounded by the
        // per-pass view limit.
        debug_assert!(next_primary > first_primary, "primary view exceeds view limit");

        ranges.push(ViewRange {
            first_primary,
            num_primary: next_primary - first_primary,
            max_mips: range_max_mips,
        });
    }

    if ranges.len() > 1 {
        log::debug!(
            "split {} primary views into {} culling passes",
            array.num_primary(),
            ranges.len()
        );
    }

    ranges
}

/// Whether the array fits in a single culling pass.
pub fn fits_single_pass(array: &PackedViewArray) -> bool {
    array.total_views() <= MAX_VIEWS_PER_CULL_PASS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primary_with_mips(num_mips: u32) -> Vec<PackedView> {
        (0..num_mips.max(1))
            .map(|m| PackedView {
                target_mip: m,
                num_mips: num_mips.max(1),
                ..Default::default()
            })
            .collect()
    }

    fn array(mip_counts: &[u32]) -> PackedViewArray {
        PackedViewArray::from_primary_views(
            mip_counts.iter().map(|&m| primary_with_mips(m)).collect(),
        )
    }

    #[test]
    fn single_view_is_one_range() {
        // Scenario A: 1 primary view, no mip expansion, limit 64.
        let views = array(&[1]);
        let ranges = split_view_ranges(&views, 64);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].num_primary, 1);
        assert_eq!(ranges[0].num_views(), 1);
    }

    #[test]
    fn many_mipped_views_split_without_breaking_mip_chains() {
        // Scenario B: 100 primary views x 4 mips against a limit of 64.
        let views = array(&[4; 100]);
        let ranges = split_view_ranges(&views, 64);

        assert!(ranges.len() > 1);
        let mut covered = 0u32;
        for range in &ranges {
            // Every range individually respects the limit.
            assert!(range.num_views() <= 64);
            // Ranges are contiguous and non-overlapping.
            assert_eq!(range.first_primary, covered);
            // Mip chains stay whole: the range max mip covers each member.
            assert_eq!(range.max_mips, 4);
            covered += range.num_primary;
        }
        // Exhaustive coverage, each primary exactly once.
        assert_eq!(covered, 100);
        // 16 primaries x 4 mips fill each 64-view pass.
        assert_eq!(ranges.len(), (100 + 15) / 16);
    }

    #[test]
    fn under_limit_input_produces_one_range() {
        // P1: V x M <= limit means exactly one pass.
        for (primaries, mips) in [(1u32, 1u32), (8, 8), (64, 1), (16, 4)] {
            let views = array(&vec![mips; primaries as usize]);
            let ranges = split_view_ranges(&views, 64);
            assert_eq!(ranges.len(), 1, "{primaries}x{mips}");
            assert_eq!(ranges[0].num_primary, primaries);
        }
    }

    #[test]
    fn mixed_mip_counts_bound_by_running_max() {
        // One 32-mip primary forces small ranges even for unmipped neighbors.
        let views = array(&[32, 1, 1, 1]);
        let ranges = split_view_ranges(&views, 64);
        // 32-mip view + one unmipped view = 2 * 32 = 64 views exactly.
        assert_eq!(ranges[0].num_primary, 2);
        assert_eq!(ranges[0].num_views(), 64);
        let total: u32 = ranges.iter().map(|r| r.num_primary).sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn packed_layout_is_primary_major() {
        let views = array(&[2, 3]);
        assert_eq!(views.max_mips(), 3);
        assert_eq!(views.total_views(), 6);
        // (p=1, m=2) lands at 1 * 3 + 2.
        assert_eq!(views.views()[5].target_mip, 2);
        // Padding slot for (p=0, m=2) is zeroed.
        assert_eq!(views.views()[2].num_mips, 0);
    }

    #[test]
    fn slice_range_repacks_to_range_mips() {
        let views = array(&[4, 4, 1]);
        let ranges = split_view_ranges(&views, 8);
        // First range: two 4-mip primaries (8 views).
        assert_eq!(ranges[0].num_primary, 2);
        let sliced = views.slice_range(&ranges[0]);
        assert_eq!(sliced.num_primary(), 2);
        assert_eq!(sliced.max_mips(), 4);
        assert_eq!(sliced.views()[4].num_mips, 4);
    }
}
