//! Two-phase raster binning.
//!
//! Visible clusters are grouped by raster bin before rasterization so each
//! bin draws with one pipeline. Phase one counts clusters per bin, a reserve
//! pass prefix-sums the counts into per-bin ranges and writes the indirect
//! draw/dispatch arguments, and phase two scatters cluster indices into the
//! reserved ranges. Software ranges for all bins pack first, then the
//! hardware ranges, so the software rasterizer sweeps one contiguous region
//! while each bin's hardware range feeds its own indirect draw.

use bytemuck::{Pod, Zeroable};

use crate::config::CullConfig;
use crate::gpu;
use crate::pipelines::{BinTranslation, RasterPipelineRegistry};

/// Dense-index sentinel for a bin that is not visible this pass.
pub const INVALID_DENSE_BIN: u32 = u32::MAX;

/// Per-bin header record shared with the binning kernels. The host writes
/// `material_flags` and `stable_index`; the kernels fill the counts and
/// offsets.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RasterBinMeta {
    /// Software-path cluster count.
    pub count_sw: u32,
    /// Hardware-path cluster count.
    pub count_hw: u32,
    /// Start of the bin's software range in the binned-cluster buffer.
    pub offset_sw: u32,
    /// Start of the bin's hardware range.
    pub offset_hw: u32,
    /// Material attribute flags (see [`crate::pipelines::material_flags`]).
    pub material_flags: u32,
    /// Stable bin index this dense slot maps back to.
    pub stable_index: u32,
    /// Pad to 32 bytes.
    pub _pad: [u32; 2],
}

/// Build the dense bin header array for one pass. With programmable raster
/// disabled every cluster lands in the single default opaque bin regardless
/// of registered materials.
pub fn build_bin_headers(
    registry: &RasterPipelineRegistry,
    translation: &BinTranslation,
    programmable_raster: bool,
) -> Vec<RasterBinMeta> {
    if !programmable_raster {
        return vec![RasterBinMeta {
            material_flags: registry.bins()[0].attributes.flags(),
            stable_index: 0,
            ..Default::default()
        }];
    }

    (0..translation.num_active() as u32)
        .map(|dense| {
            let stable = translation.stable(dense);
            RasterBinMeta {
                material_flags: registry.bin(stable).attributes.flags(),
                stable_index: stable.0,
                ..Default::default()
            }
        })
        .collect()
}

/// Flatten a [`BinTranslation`] into the stable-to-dense lookup the scatter
/// kernel reads. Hidden bins map to [`INVALID_DENSE_BIN`] and their clusters
/// are skipped.
pub fn translation_table(
    registry: &RasterPipelineRegistry,
    translation: &BinTranslation,
    programmable_raster: bool,
) -> Vec<u32> {
    if !programmable_raster {
        return vec![0; registry.num_bins()];
    }
    (0..registry.num_bins())
        .map(|stable| {
            translation
                .dense(crate::pipelines::RasterBinIndex(stable as u32))
                .unwrap_or(INVALID_DENSE_BIN)
        })
        .collect()
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BinningUniform {
    num_bins: u32,
    max_visible_clusters: u32,
    _pad: [u32; 2],
}

/// Per-pass GPU buffers for binning.
pub struct BinningData {
    /// Dense bin headers.
    pub bin_meta: wgpu::Buffer,
    /// Binned cluster index ranges.
    pub binned_clusters: wgpu::Buffer,
    /// Per-bin hardware draw args (4 words per bin).
    pub indirect_args: wgpu::Buffer,
    /// Global software dispatch args: one workgroup per software cluster
    /// across all bins (the software ranges are packed first, so they form
    /// one contiguous region).
    pub sw_dispatch_args: wgpu::Buffer,
    /// Stable-to-dense translation table.
    pub translation: wgpu::Buffer,
    /// Number of dense bins.
    pub num_bins: u32,
}

impl BinningData {
    /// Words of indirect args per bin.
    pub const ARGS_WORDS_PER_BIN: u64 = 4;

    /// Upload the per-pass binning buffers.
    pub fn new(
        device: &wgpu::Device,
        config: &CullConfig,
        headers: &[RasterBinMeta],
        translation_table: &[u32],
    ) -> Self {
        let bin_meta = gpu::upload_storage(
            device,
            "Raster Bin Meta",
            headers,
            wgpu::BufferUsages::COPY_DST,
        );
        let translation = gpu::upload_storage(
            device,
            "Raster Bin Translation",
            translation_table,
            wgpu::BufferUsages::empty(),
        );
        let binned_clusters = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Binned Clusters"),
            size: config.max_visible_clusters as u64 * 4,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        let indirect_args = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Raster Bin Draw Args"),
            size: headers.len().max(1) as u64 * Self::ARGS_WORDS_PER_BIN * 4,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::INDIRECT,
            mapped_at_creation: false,
        });
        let sw_dispatch_args = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("SW Raster Dispatch Args"),
            size: 3 * 4,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::INDIRECT,
            mapped_at_creation: false,
        });

        Self {
            bin_meta,
            binned_clusters,
            indirect_args,
            sw_dispatch_args,
            translation,
            num_bins: headers.len() as u32,
        }
    }

    /// Byte offset of a bin's hardware draw args.
    pub fn draw_args_offset(&self, dense_bin: u32) -> u64 {
        dense_bin as u64 * Self::ARGS_WORDS_PER_BIN * 4
    }
}

/// The three binning pipelines plus their shared layout.
pub struct RasterBinner {
    count_pipeline: wgpu::ComputePipeline,
    reserve_pipeline: wgpu::ComputePipeline,
    scatter_pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    params_buffer: wgpu::Buffer,
}

impl RasterBinner {
    const WORKGROUP_SIZE: u32 = 64;

    /// Create the count/reserve/scatter pipelines.
    pub fn new(device: &wgpu::Device) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Raster Binning Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/raster_binning.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Raster Binning Bind Group Layout"),
            entries: &[
                gpu::uniform_entry(0),
                gpu::storage_ro_entry(1), // visible clusters
                gpu::storage_ro_entry(2), // translation table
                gpu::storage_rw_entry(3), // bin meta
                gpu::storage_rw_entry(4), // binned clusters
                gpu::storage_rw_entry(5), // per-bin draw args
                gpu::storage_rw_entry(6), // global sw dispatch args
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Raster Binning Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let count_pipeline = gpu::compute_pipeline(
            device,
            "Raster Bin Count Pipeline",
            &pipeline_layout,
            &shader,
            "bin_count",
        );
        let reserve_pipeline = gpu::compute_pipeline(
            device,
            "Raster Bin Reserve Pipeline",
            &pipeline_layout,
            &shader,
            "bin_reserve",
        );
        let scatter_pipeline = gpu::compute_pipeline(
            device,
            "Raster Bin Scatter Pipeline",
            &pipeline_layout,
            &shader,
            "bin_scatter",
        );

        let params_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Raster Binning Params"),
            size: std::mem::size_of::<BinningUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            count_pipeline,
            reserve_pipeline,
            scatter_pipeline,
            bind_group_layout,
            params_buffer,
        }
    }

    /// Upload the uniform block and build the bind group for one pass.
    pub fn prepare(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        config: &CullConfig,
        data: &BinningData,
        visible_clusters: &wgpu::Buffer,
    ) -> wgpu::BindGroup {
        queue.write_buffer(
            &self.params_buffer,
            0,
            bytemuck::cast_slice(&[BinningUniform {
                num_bins: data.num_bins,
                max_visible_clusters: config.max_visible_clusters,
                _pad: [0; 2],
            }]),
        );

        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Raster Binning Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: visible_clusters.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: data.translation.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: data.bin_meta.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: data.binned_clusters.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: data.indirect_args.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 6,
                    resource: data.sw_dispatch_args.as_entire_binding(),
                },
            ],
        })
    }

    /// Record the full count/reserve/scatter sequence. The count and scatter
    /// phases size themselves indirectly from the visible-cluster counters
    /// written by cluster culling.
    pub fn record(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        bind_group: &wgpu::BindGroup,
        data: &BinningData,
        cluster_dispatch_args: &wgpu::Buffer,
    ) {
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Raster Bin Count"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.count_pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups_indirect(cluster_dispatch_args, 0);
        }
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Raster Bin Reserve"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.reserve_pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(gpu::dispatch_size(data.num_bins, Self::WORKGROUP_SIZE), 1, 1);
        }
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Raster Bin Scatter"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.scatter_pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups_indirect(cluster_dispatch_args, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines::{material_flags, MaterialAttributes, RasterBinDesc};
    use crate::scene::VisibilityResults;

    fn registry() -> RasterPipelineRegistry {
        let mut registry = RasterPipelineRegistry::new(8);
        registry
            .register(RasterBinDesc {
                material_id: 1,
                attributes: MaterialAttributes {
                    masked: true,
                    ..Default::default()
                },
                two_sided: false,
            })
            .unwrap();
        registry
            .register(RasterBinDesc {
                material_id: 2,
                attributes: MaterialAttributes {
                    world_position_offset: true,
                    ..Default::default()
                },
                two_sided: true,
            })
            .unwrap();
        registry
    }

    #[test]
    fn headers_carry_material_flags_per_dense_bin() {
        let registry = registry();
        let translation = registry.translate(&VisibilityResults::all_visible(3));
        let headers = build_bin_headers(&registry, &translation, true);

        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0].material_flags, 0);
        assert_eq!(headers[1].material_flags, material_flags::MASKED);
        assert_eq!(headers[2].material_flags, material_flags::WORLD_POSITION_OFFSET);
        // Counts start zeroed; the kernels own them.
        assert!(headers.iter().all(|h| h.count_sw == 0 && h.count_hw == 0));
    }

    #[test]
    fn headers_repeat_identically_for_unchanged_materials() {
        let registry = registry();
        let translation = registry.translate(&VisibilityResults::all_visible(3));
        let first = build_bin_headers(&registry, &translation, true);
        let second = build_bin_headers(&registry, &translation, true);
        assert_eq!(first, second);
    }

    #[test]
    fn fixed_function_collapses_to_the_default_bin() {
        let registry = registry();
        let translation = registry.translate(&VisibilityResults::all_visible(3));

        let headers = build_bin_headers(&registry, &translation, false);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].stable_index, 0);

        let table = translation_table(&registry, &translation, false);
        assert!(table.iter().all(|&dense| dense == 0));
    }

    #[test]
    fn hidden_bins_translate_to_the_invalid_sentinel() {
        let registry = registry();
        let visibility = VisibilityResults::new(vec![true, false, true], None);
        let translation = registry.translate(&visibility);

        let table = translation_table(&registry, &translation, true);
        assert_eq!(table, vec![0, INVALID_DENSE_BIN, 1]);

        let headers = build_bin_headers(&registry, &translation, true);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[1].stable_index, 2);
    }

    #[test]
    fn bin_meta_is_eight_words() {
        // The WGSL counterpart indexes bin headers as array<vec4<u32>, 2>.
        assert_eq!(std::mem::size_of::<RasterBinMeta>(), 32);
    }
}
