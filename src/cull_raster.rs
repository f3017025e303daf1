//! The culling + rasterization orchestrator.
//!
//! One invocation takes a packed view set, the scene and streaming buffers
//! and a raster context, and records the full pipeline: primitive filter,
//! instance cull, hierarchical node/cluster cull, raster binning and the
//! software/hardware rasterizers, under either two-pass occlusion (main
//! against the previous frame's HZB, post against a pyramid rebuilt from this
//! frame's output) or a single pass without occlusion. Depth-only output
//! splits over-limit view sets into sequential passes; visibility-buffer
//! output treats an over-limit set as a caller error.

use crate::binning::{build_bin_headers, translation_table, BinningData};
use crate::config::{CullConfig, MAX_VIEWS_PER_CULL_PASS};
use crate::context::{CullingContext, OutputMode, RasterContext, SharedContext};
use crate::error::{Error, Result};
use crate::filter::PrimitiveFilterParams;
use crate::gpu;
use crate::hierarchy_cull::{cull_level_count, HierarchyCullBindings, HierarchyCullParams};
use crate::hzb::HzbSource;
use crate::instance_cull::{
    pack_debug_flags, CullPhase, InstanceCullBindings, InstanceCullParams,
};
use crate::pipelines::{RasterPipelineRegistry, RasterShaderTable};
use crate::rasterize::{
    resolve_bin_setups, BinSetupInputs, RasterBindings, RasterScheduling,
};
use crate::scene::{GpuScene, InstanceDraw, StreamingBuffers, VirtualShadowMapTargets, VisibilityResults};
use crate::view::{fits_single_pass, split_view_ranges, PackedViewArray, ViewRange};

/// How occlusion culling runs for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcclusionPlan {
    /// Main pass against the previous HZB, post pass against the rebuilt one.
    TwoPass,
    /// One pass with no HZB testing.
    SinglePass,
}

/// Decide the occlusion plan. Two-pass culling needs a previous-frame HZB to
/// test the main pass against; without one (first frame, cache invalidation)
/// the invocation silently downgrades to a single unoccluded pass.
pub fn plan_occlusion(two_pass_enabled: bool, prev_hzb_available: bool) -> OcclusionPlan {
    if !two_pass_enabled {
        return OcclusionPlan::SinglePass;
    }
    if !prev_hzb_available {
        log::debug!("no previous HZB; downgrading to single-pass culling");
        return OcclusionPlan::SinglePass;
    }
    OcclusionPlan::TwoPass
}

/// Everything one invocation reads from its collaborators.
pub struct CullRasterInputs<'a> {
    /// Scene instance and primitive data.
    pub scene: &'a GpuScene,
    /// Resident geometry from the streaming manager.
    pub streaming: &'a StreamingBuffers,
    /// Packed views for this invocation.
    pub views: &'a PackedViewArray,
    /// Raster bin registry.
    pub registry: &'a RasterPipelineRegistry,
    /// Capability-keyed shader table.
    pub shader_table: &'a RasterShaderTable,
    /// Per-bin visibility predicates.
    pub visibility: &'a VisibilityResults,
    /// Primitive filter inputs.
    pub filter: &'a PrimitiveFilterParams,
    /// Optional virtual shadow map collaborator.
    pub vsm: Option<&'a VirtualShadowMapTargets>,
    /// Restrict culling to explicit draws instead of the whole scene.
    pub instance_draws: Option<&'a [InstanceDraw]>,
}

impl CullRasterInputs<'_> {
    fn num_instances(&self) -> u32 {
        self.instance_draws
            .map(|draws| draws.len() as u32)
            .unwrap_or(self.scene.instance_count)
    }
}

/// Record and submit one culling + rasterization invocation.
pub fn cull_rasterize(
    shared: &mut SharedContext,
    raster: &RasterContext,
    culling: &mut CullingContext,
    config: &CullConfig,
    inputs: &CullRasterInputs<'_>,
) -> Result<()> {
    // Degenerate input: nothing to cull, nothing to record.
    if inputs.num_instances() == 0 || inputs.views.num_primary() == 0 {
        return Ok(());
    }

    if raster.output_mode == OutputMode::VisibilityBuffer && !fits_single_pass(inputs.views) {
        return Err(Error::SceneMismatch(format!(
            "visibility-buffer output needs globally unique view references: {} views exceed the {} per-pass limit",
            inputs.views.total_views(),
            MAX_VIEWS_PER_CULL_PASS
        )));
    }

    let plan = plan_occlusion(config.two_pass_occlusion, culling.has_prev_hzb);

    let ranges = if raster.output_mode.depth_only() {
        split_view_ranges(inputs.views, MAX_VIEWS_PER_CULL_PASS)
    } else {
        vec![ViewRange {
            first_primary: 0,
            num_primary: inputs.views.num_primary(),
            max_mips: inputs.views.max_mips(),
        }]
    };

    shared.feedback.begin_frame(&shared.queue);

    // Draw-list restriction: upload the (instance, view mask) pairs once;
    // every range reads the same buffer.
    let draw_buffer = inputs.instance_draws.map(|draws| {
        gpu::upload_storage(
            &shared.device,
            "Instance Draw List",
            draws,
            wgpu::BufferUsages::empty(),
        )
    });

    let mut buffers = Vec::new();

    // Filter once; every range reads the same bitmask.
    let mut prologue = shared
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Cull Rasterize Prologue"),
        });
    {
        let device = shared.device.clone();
        let queue = shared.queue.clone();
        shared
            .filter
            .build(&device, &queue, &mut prologue, inputs.scene, inputs.filter);
    }
    if let Some(stats) = &shared.stats {
        stats.clear(&mut prologue);
    }
    // The depth target is cleared once here; per-range hardware passes load
    // so split ranges and the post phase accumulate into one surface.
    raster.targets.clear_depth(&mut prologue);
    buffers.push(prologue.finish());

    // One main command buffer per range, so overlapped software raster work
    // submitted after it still precedes the next range's clears.
    for range in &ranges {
        culling.begin_pass();
        let views = inputs.views.slice_range(range);
        let mut encoder = shared
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Cull Rasterize Encoder"),
            });
        let mut side_buffers = Vec::new();
        record_range(
            shared,
            raster,
            culling,
            config,
            inputs,
            plan,
            &views,
            range.first_primary,
            draw_buffer.as_ref(),
            &mut encoder,
            &mut side_buffers,
        )?;
        buffers.push(encoder.finish());
        buffers.append(&mut side_buffers);
        culling.end_pass();
    }

    let mut epilogue = shared
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Cull Rasterize Epilogue"),
        });
    shared.feedback.copy_to_staging(&mut epilogue);
    if let Some(stats) = &shared.stats {
        stats.copy_to_staging(&mut epilogue);
    }
    buffers.push(epilogue.finish());

    shared.queue.submit(buffers);
    // Depth-only targets skip cross-pass bookkeeping; their post-pass pyramid
    // source is external (VSM physical pages), not this invocation's output.
    if raster.output_mode == OutputMode::VisibilityBuffer {
        culling.has_prev_hzb = true;
    }
    Ok(())
}

/// Record the pipeline for one view range.
#[allow(clippy::too_many_arguments)]
fn record_range(
    shared: &mut SharedContext,
    raster: &RasterContext,
    culling: &CullingContext,
    config: &CullConfig,
    inputs: &CullRasterInputs<'_>,
    plan: OcclusionPlan,
    views: &PackedViewArray,
    first_primary: u32,
    draw_buffer: Option<&wgpu::Buffer>,
    encoder: &mut wgpu::CommandEncoder,
    side_buffers: &mut Vec<wgpu::CommandBuffer>,
) -> Result<()> {
    let device = shared.device.clone();
    let queue = shared.queue.clone();

    let view_buffer = views.upload(&device);
    let num_views = views.total_views();
    let max_mips = views.max_mips();

    shared.queues.reset(encoder);
    encoder.clear_buffer(&raster.visible_clusters, 0, Some(RasterContext::VISIBLE_HEADER_BYTES));
    encoder.clear_buffer(&culling.occluded_instances, 0, Some(16));
    encoder.clear_buffer(&culling.post_dispatch_args, 0, None);

    let viewport_rects: Vec<[u32; 4]> = views.views().iter().map(|v| v.viewport_rect).collect();
    raster
        .targets
        .clear(encoder, config.fast_clear, &viewport_rects);

    let debug_flags = pack_debug_flags(&config.debug);
    let prev_hzb = culling.has_prev_hzb.then(|| shared.hzb.reference());
    let stats_buffer = shared
        .stats
        .as_ref()
        .map(|s| &s.buffer)
        .unwrap_or_else(|| shared.instance_culler.dummy_buffer());
    let vsm_dirty = inputs
        .vsm
        .map(|v| &v.dirty_page_flags)
        .unwrap_or_else(|| shared.instance_culler.dummy_buffer());

    let phases: &[CullPhase] = match plan {
        OcclusionPlan::TwoPass => &[CullPhase::Main, CullPhase::Post],
        OcclusionPlan::SinglePass => &[CullPhase::NoOcclusion],
    };

    for &phase in phases {
        // The post pass tests against a pyramid rebuilt from this pass's own
        // output: the depth target for standard views, the previous-frame
        // physical pages for virtual shadow map views.
        if phase == CullPhase::Post {
            let source = match inputs.vsm {
                Some(vsm) if raster.output_mode.depth_only() => {
                    HzbSource::VsmPhysicalPages(&vsm.physical_pages_prev)
                }
                _ => HzbSource::Depth(&raster.targets.depth_view),
            };
            shared.hzb.set_source(&device, source);
            shared
                .hzb
                .build(encoder, &queue, raster.targets.width, raster.targets.height);
        }

        let hzb_ref = match phase {
            CullPhase::Main => prev_hzb.clone(),
            CullPhase::Post => Some(shared.hzb.reference()),
            CullPhase::NoOcclusion => None,
        };
        let hzb_size = hzb_ref.as_ref().map(|h| h.size).unwrap_or([1, 1]);
        let hzb_view = hzb_ref.as_ref().map(|h| &h.view);

        let phase_code = match phase {
            CullPhase::Main => 0,
            CullPhase::Post => 1,
            CullPhase::NoOcclusion => 2,
        };

        // Instance cull.
        let instance_params = InstanceCullParams {
            num_instances: inputs.num_instances(),
            num_views,
            max_mips,
            phase: phase_code,
            debug_flags,
            imposter_max_pixels: config.imposter_max_pixels,
            hzb_size,
            max_nodes: config.max_nodes,
            max_candidate_clusters: config.max_candidate_clusters,
            has_filter: shared.filter.bitmask().is_some() as u32,
            has_vsm: inputs.vsm.is_some() as u32,
            extract_stats: shared.stats.is_some() as u32,
            wpo_disable_distance: config.wpo_disable_distance,
            has_clip_plane: config.global_clip_plane.is_some() as u32,
            has_draw_list: draw_buffer.is_some() as u32,
            clip_plane: config.global_clip_plane.unwrap_or_default(),
            first_primary,
            _pad: [0; 3],
        };
        let instance_bindings = InstanceCullBindings {
            views: &view_buffer,
            scene: inputs.scene,
            filter_bitmask: shared.filter.bitmask(),
            queues: &shared.queues,
            occluded_instances: &culling.occluded_instances,
            post_dispatch_args: &culling.post_dispatch_args,
            hzb: hzb_view,
            stats: stats_buffer,
            vsm_dirty_flags: vsm_dirty,
            instance_draws: draw_buffer,
            vsm_invalidating: inputs.vsm.map(|v| &v.invalidating_primitives),
        };
        let instance_bind_group =
            shared
                .instance_culler
                .prepare(&device, &queue, instance_params, &instance_bindings);
        match phase {
            CullPhase::Post => shared.instance_culler.record_post(
                encoder,
                &instance_bind_group,
                &culling.post_dispatch_args,
            ),
            _ => shared
                .instance_culler
                .record(encoder, &instance_bind_group, inputs.num_instances()),
        }

        // Hierarchical node and cluster cull.
        let hierarchy_params = HierarchyCullParams::from_config(
            config,
            num_views,
            max_mips,
            phase_code,
            debug_flags,
            shared.feedback.version(),
            hzb_size,
            inputs.vsm.is_some(),
        );
        let hierarchy_bindings = HierarchyCullBindings {
            views: &view_buffer,
            streaming: inputs.streaming,
            queues: &shared.queues,
            visible_clusters: &raster.visible_clusters,
            streaming_requests: &shared.feedback.buffer,
            hzb: hzb_view,
            stats: stats_buffer,
            vsm_page_table: inputs.vsm.map(|v| &v.page_table),
            vsm_page_flags: inputs.vsm.map(|v| &v.page_flags),
        };
        let (cull_bind_group, args_bind_group) =
            shared
                .hierarchy_culler
                .prepare(&device, &queue, hierarchy_params, &hierarchy_bindings);
        if config.persistent_threads {
            shared
                .hierarchy_culler
                .record_persistent(encoder, &cull_bind_group);
        } else {
            shared.hierarchy_culler.record_levels(
                encoder,
                &cull_bind_group,
                &args_bind_group,
                cull_level_count(inputs.streaming),
            );
        }

        // Bound indirect args for the binning sweep.
        shared.clamp_args.record(
            &device,
            &queue,
            encoder,
            config,
            &raster.visible_clusters,
        );

        // Binning.
        let translation = inputs.registry.translate(inputs.visibility);
        let headers = build_bin_headers(inputs.registry, &translation, config.programmable_raster);
        let table = translation_table(inputs.registry, &translation, config.programmable_raster);
        let binning = BinningData::new(&device, config, &headers, &table);
        let binning_bind_group = shared.binner.prepare(
            &device,
            &queue,
            config,
            &binning,
            &raster.visible_clusters,
        );

        // Resolve bin setups; overlap with binning recording when the bin
        // count is large enough to matter.
        let setup_inputs = BinSetupInputs {
            bins: headers
                .iter()
                .map(|h| {
                    let stable = crate::pipelines::RasterBinIndex(h.stable_index);
                    (
                        *inputs.registry.bin(stable),
                        inputs.registry.precache_state(stable),
                        h.stable_index,
                    )
                })
                .collect(),
            depth_only: raster.output_mode.depth_only(),
            virtual_target: inputs.vsm.is_some(),
            mesh_shaders: config.mesh_shaders,
            programmable_raster: config.programmable_raster,
            skip_uncached: config.skip_uncached_raster_pso,
        };
        let setups = if setup_inputs.bins.len() > crate::config::ASYNC_SETUP_BIN_THRESHOLD {
            std::thread::scope(|scope| {
                let handle =
                    scope.spawn(|| resolve_bin_setups(inputs.shader_table, &setup_inputs));
                shared.binner.record(
                    encoder,
                    &binning_bind_group,
                    &binning,
                    &shared.clamp_args.cluster_dispatch_args,
                );
                handle.join().unwrap_or_default()
            })
        } else {
            shared.binner.record(
                encoder,
                &binning_bind_group,
                &binning,
                &shared.clamp_args.cluster_dispatch_args,
            );
            resolve_bin_setups(inputs.shader_table, &setup_inputs)
        };

        // Rasterize.
        let raster_bindings = RasterBindings {
            views: &view_buffer,
            cluster_pages: &inputs.streaming.cluster_page_data,
            visible_clusters: &raster.visible_clusters,
            binned_clusters: &binning.binned_clusters,
            bin_meta: &binning.bin_meta,
            instances: &inputs.scene.instance_data,
        };
        let (sw_bind_group, hw_bind_group) = shared.rasterizer.prepare(
            &device,
            &queue,
            &raster.targets,
            &raster_bindings,
            num_views,
            max_mips,
            raster.output_mode.depth_only(),
        );
        match RasterScheduling::from_config(config) {
            RasterScheduling::SoftwareFirst => {
                shared
                    .rasterizer
                    .record_sw(encoder, &sw_bind_group, &binning);
                shared.rasterizer.record_hw(
                    encoder,
                    &hw_bind_group,
                    &setups,
                    &binning,
                    &raster.targets,
                );
            }
            RasterScheduling::Overlapped => {
                // Software dispatches go to their own command buffer submitted
                // alongside this range, leaving the overlap to the driver. The
                // two paths merge per pixel with atomics, so order between
                // them does not matter.
                let mut sw_encoder =
                    device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                        label: Some("SW Raster Encoder"),
                    });
                shared
                    .rasterizer
                    .record_sw(&mut sw_encoder, &sw_bind_group, &binning);
                side_buffers.push(sw_encoder.finish());
                shared.rasterizer.record_hw(
                    encoder,
                    &hw_bind_group,
                    &setups,
                    &binning,
                    &raster.targets,
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_pass_needs_a_previous_pyramid() {
        // First frame: two-pass requested but nothing to test against.
        assert_eq!(plan_occlusion(true, false), OcclusionPlan::SinglePass);
        // Steady state.
        assert_eq!(plan_occlusion(true, true), OcclusionPlan::TwoPass);
    }

    #[test]
    fn single_pass_when_occlusion_is_off() {
        assert_eq!(plan_occlusion(false, true), OcclusionPlan::SinglePass);
        assert_eq!(plan_occlusion(false, false), OcclusionPlan::SinglePass);
    }
}
