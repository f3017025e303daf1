//! Runtime configuration for the culling/rasterization core.
//!
//! Process-wide [`Settings`] hold the mutable knobs; the pipeline itself only
//! ever reads a [`CullConfig`] snapshot frozen once per frame, so behavior is
//! reproducible within a pass regardless of concurrent settings edits.

/// Hardware-imposed maximum number of packed views a single culling +
/// rasterization pass can reference. Larger view sets must be split into
/// multiple passes (depth-only output mode only).
pub const MAX_VIEWS_PER_CULL_PASS: u32 = 64;

/// Maximum supported cluster hierarchy depth.
pub const MAX_BVH_LEVELS: u32 = 16;

/// Active-bin count above which shader/material binding resolution moves to a
/// detached setup task joined before the draw pass is recorded.
pub const ASYNC_SETUP_BIN_THRESHOLD: usize = 8;

/// Per-test debug toggles. Each culling criterion can be disabled
/// independently for visualization and bisection.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugFlags {
    /// Skip the frustum test.
    pub disable_frustum: bool,
    /// Skip HZB occlusion testing (forces single-pass culling).
    pub disable_hzb: bool,
    /// Skip draw-distance culling.
    pub disable_draw_distance: bool,
    /// Skip the global clip plane test.
    pub disable_clip_plane: bool,
    /// Skip world-position-offset disable-distance culling.
    pub disable_wpo_distance: bool,
    /// Ignore the primitive filter bitmask.
    pub disable_filter: bool,
    /// Retain the debug stats buffer and allow readback.
    pub extract_stats: bool,
}

/// Process-wide runtime settings. Read once per frame by
/// [`CullConfig::freeze`]; never read mid-pass.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Enable two-pass (main + post) occlusion culling.
    pub two_pass_occlusion: bool,
    /// Enable per-material programmable rasterization. When disabled all
    /// clusters collapse into a single fixed-function bin.
    pub programmable_raster: bool,
    /// Use the single persistent-threads culling kernel instead of
    /// level-by-level dispatches.
    pub persistent_threads: bool,
    /// Allow software rasterization dispatches to overlap hardware
    /// rasterization on an async compute queue when the platform supports it.
    pub async_rasterization: bool,
    /// Prefer mesh-shader rasterization permutations when available.
    pub mesh_shaders: bool,
    /// Substitute the fixed-function shader for raster bins whose
    /// programmable pipeline has not finished precompiling.
    pub skip_uncached_raster_pso: bool,
    /// Clear only rendered target rects instead of the full output surface.
    pub fast_clear: bool,
    /// Target error budget in pixels per cluster edge for primary views.
    pub max_pixels_per_edge: f32,
    /// Separate error budget for shadow (depth-only) views.
    pub max_pixels_per_edge_shadow: f32,
    /// Scale the pixel budget with viewport height relative to 1080p.
    pub dynamic_pixel_scaling: bool,
    /// Projected edge length at or above which a cluster rasterizes on the
    /// hardware path.
    pub min_pixels_per_edge_hw: f32,
    /// Fixed maximum pixel threshold for imposter clusters, independent of
    /// standard LOD selection.
    pub imposter_max_pixels: f32,
    /// Virtual-shadow-map page-overlap count above which a cluster is counted
    /// in the large-page-rect statistic.
    pub page_overlap_stat_threshold: u32,
    /// Global clip plane (xyz normal, w offset) culling everything on its
    /// negative side, e.g. for planar reflection targets.
    pub global_clip_plane: Option<[f32; 4]>,
    /// View distance beyond which world-position-offset stops inflating cull
    /// bounds. Zero keeps WPO bounds inflation at any distance.
    pub wpo_disable_distance: f32,
    /// Candidate BVH node capacity (fixed for the process lifetime).
    pub max_nodes: u32,
    /// Candidate cluster capacity.
    pub max_candidate_clusters: u32,
    /// Visible cluster capacity (SW + HW combined per path).
    pub max_visible_clusters: u32,
    /// Streaming request buffer capacity; requests past this are dropped.
    pub max_streaming_requests: u32,
    /// Debug toggles.
    pub debug: DebugFlags,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            two_pass_occlusion: true,
            programmable_raster: true,
            persistent_threads: false,
            async_rasterization: false,
            mesh_shaders: false,
            skip_uncached_raster_pso: true,
            fast_clear: true,
            max_pixels_per_edge: 1.0,
            max_pixels_per_edge_shadow: 2.0,
            dynamic_pixel_scaling: true,
            min_pixels_per_edge_hw: 32.0,
            imposter_max_pixels: 5.0,
            page_overlap_stat_threshold: 128,
            global_clip_plane: None,
            wpo_disable_distance: 0.0,
            max_nodes: 1_048_576,
            max_candidate_clusters: 4_194_304,
            max_visible_clusters: 2_097_152,
            max_streaming_requests: 65_536,
            debug: DebugFlags::default(),
        }
    }
}

/// Per-frame inputs that participate in freezing a [`CullConfig`].
#[derive(Debug, Clone, Copy)]
pub struct FrameInputs {
    /// Height of the primary viewport in pixels.
    pub viewport_height: u32,
    /// Whether this frame renders depth-only (shadow) output.
    pub depth_only: bool,
    /// Whether the device supports overlapping async compute.
    pub supports_async_compute: bool,
    /// Whether mesh-shader style rasterization permutations exist on this
    /// device tier.
    pub supports_mesh_shaders: bool,
}

/// Immutable per-frame configuration snapshot. The culling/raster core reads
/// only this, never ambient [`Settings`] state.
#[derive(Debug, Clone)]
pub struct CullConfig {
    /// Two-pass occlusion requested (may still be downgraded for a single
    /// invocation when no previous HZB exists).
    pub two_pass_occlusion: bool,
    /// Programmable raster enabled for this frame.
    pub programmable_raster: bool,
    /// Persistent-threads culling kernel enabled.
    pub persistent_threads: bool,
    /// Software rasterization may overlap hardware rasterization.
    pub async_rasterization: bool,
    /// Mesh-shader permutations selected.
    pub mesh_shaders: bool,
    /// Precache fallback policy.
    pub skip_uncached_raster_pso: bool,
    /// Fast-clear enabled.
    pub fast_clear: bool,
    /// Resolved pixels-per-edge budget after dynamic scaling.
    pub pixels_per_edge: f32,
    /// SW/HW split threshold.
    pub min_pixels_per_edge_hw: f32,
    /// Imposter pixel threshold.
    pub imposter_max_pixels: f32,
    /// Large-page-rect statistic threshold.
    pub page_overlap_stat_threshold: u32,
    /// Global clip plane for this frame.
    pub global_clip_plane: Option<[f32; 4]>,
    /// WPO bounds-inflation cutoff distance.
    pub wpo_disable_distance: f32,
    /// Candidate node capacity.
    pub max_nodes: u32,
    /// Candidate cluster capacity.
    pub max_candidate_clusters: u32,
    /// Visible cluster capacity.
    pub max_visible_clusters: u32,
    /// Streaming request capacity.
    pub max_streaming_requests: u32,
    /// Debug toggles.
    pub debug: DebugFlags,
}

impl CullConfig {
    /// Freeze a per-frame snapshot from the process-wide settings.
    pub fn freeze(settings: &Settings, frame: FrameInputs) -> Self {
        let budget = if frame.depth_only {
            settings.max_pixels_per_edge_shadow
        } else {
            settings.max_pixels_per_edge
        };

        // Scale the quality budget with output resolution so the perceived
        // error stays roughly constant across viewport sizes.
        let pixels_per_edge = if settings.dynamic_pixel_scaling {
            let scale = (frame.viewport_height.max(1) as f32 / 1080.0).sqrt();
            (budget * scale).clamp(0.25, 16.0)
        } else {
            budget
        };

        Self {
            two_pass_occlusion: settings.two_pass_occlusion && !settings.debug.disable_hzb,
            programmable_raster: settings.programmable_raster,
            persistent_threads: settings.persistent_threads,
            async_rasterization: settings.async_rasterization && frame.supports_async_compute,
            mesh_shaders: settings.mesh_shaders && frame.supports_mesh_shaders,
            skip_uncached_raster_pso: settings.skip_uncached_raster_pso,
            fast_clear: settings.fast_clear,
            pixels_per_edge,
            min_pixels_per_edge_hw: settings.min_pixels_per_edge_hw,
            imposter_max_pixels: settings.imposter_max_pixels,
            page_overlap_stat_threshold: settings.page_overlap_stat_threshold,
            global_clip_plane: settings.global_clip_plane,
            wpo_disable_distance: settings.wpo_disable_distance,
            max_nodes: settings.max_nodes,
            max_candidate_clusters: settings.max_candidate_clusters,
            max_visible_clusters: settings.max_visible_clusters,
            max_streaming_requests: settings.max_streaming_requests,
            debug: settings.debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(height: u32, depth_only: bool) -> FrameInputs {
        FrameInputs {
            viewport_height: height,
            depth_only,
            supports_async_compute: false,
            supports_mesh_shaders: false,
        }
    }

    #[test]
    fn freeze_picks_shadow_budget_for_depth_only() {
        let mut settings = Settings::default();
        settings.dynamic_pixel_scaling = false;
        settings.max_pixels_per_edge = 1.0;
        settings.max_pixels_per_edge_shadow = 4.0;

        let primary = CullConfig::freeze(&settings, frame(1080, false));
        let shadow = CullConfig::freeze(&settings, frame(1080, true));
        assert_eq!(primary.pixels_per_edge, 1.0);
        assert_eq!(shadow.pixels_per_edge, 4.0);
    }

    #[test]
    fn dynamic_scaling_tracks_viewport_height() {
        let settings = Settings::default();
        let at_1080 = CullConfig::freeze(&settings, frame(1080, false));
        let at_4k = CullConfig::freeze(&settings, frame(2160, false));
        assert!(at_4k.pixels_per_edge > at_1080.pixels_per_edge);
    }

    #[test]
    fn async_rasterization_requires_device_support() {
        let mut settings = Settings::default();
        settings.async_rasterization = true;
        let config = CullConfig::freeze(&settings, frame(1080, false));
        assert!(!config.async_rasterization);

        let config = CullConfig::freeze(
            &settings,
            FrameInputs {
                supports_async_compute: true,
                ..frame(1080, false)
            },
        );
        assert!(config.async_rasterization);
    }

    #[test]
    fn disabling_hzb_disables_two_pass() {
        let mut settings = Settings::default();
        settings.debug.disable_hzb = true;
        let config = CullConfig::freeze(&settings, frame(1080, false));
        assert!(!config.two_pass_occlusion);
    }
}
