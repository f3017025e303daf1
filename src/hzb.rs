//! Hierarchical Z pyramid construction.
//!
//! The HZB is a power-of-two mip chain holding the furthest depth of each
//! region, sampled by the culling kernels with `textureLoad` at a mip chosen
//! from the candidate's screen-space footprint. The main culling pass tests
//! against the previous frame's pyramid; the post pass tests against a
//! pyramid rebuilt from the main pass's own depth output (standard views) or
//! from the virtual shadow map cache's previous-frame physical pages (shadow
//! views) — the two sources are mutually exclusive.

use bytemuck::{Pod, Zeroable};

use crate::gpu;

/// Source surface for the pyramid's base mip.
pub enum HzbSource<'a> {
    /// The pass's rasterized depth output.
    Depth(&'a wgpu::TextureView),
    /// Previous-frame physical pages from the virtual shadow map cache.
    VsmPhysicalPages(&'a wgpu::TextureView),
}

/// A reference to a built pyramid, handed to culling. Absent on the first
/// frame or after a cache invalidation.
#[derive(Clone)]
pub struct HzbRef {
    /// Full mip-chain view.
    pub view: wgpu::TextureView,
    /// Base mip extent.
    pub size: [u32; 2],
    /// Mip count.
    pub mip_count: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct HzbMipUniform {
    src_size: [u32; 2],
    dst_size: [u32; 2],
}

/// Builds the HZB mip chain with one compute dispatch per mip.
pub struct HzbBuilder {
    texture: wgpu::Texture,
    mip_views: Vec<wgpu::TextureView>,
    full_view: wgpu::TextureView,
    width: u32,
    height: u32,
    mip_count: u32,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    uniform_buffers: Vec<wgpu::Buffer>,
    bind_groups: Vec<wgpu::BindGroup>,
}

impl HzbBuilder {
    fn mip_count_for(width: u32, height: u32) -> u32 {
        let max_dim = width.max(height);
        32 - max_dim.leading_zeros()
    }

    /// Create the pyramid texture and build pipeline. Dimensions round up to
    /// powers of two for a clean mip chain.
    pub fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let hzb_width = width.next_power_of_two().max(64);
        let hzb_height = height.next_power_of_two().max(64);
        let mip_count = Self::mip_count_for(hzb_width, hzb_height);

        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("HZB Texture"),
            size: wgpu::Extent3d {
                width: hzb_width,
                height: hzb_height,
                depth_or_array_layers: 1,
            },
            mip_level_count: mip_count,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R32Float,
            usage: wgpu::TextureUsages::STORAGE_BINDING | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });

        let mip_views = (0..mip_count)
            .map(|mip| {
                texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some(&format!("HZB Mip {} View", mip)),
                    format: Some(wgpu::TextureFormat::R32Float),
                    dimension: Some(wgpu::TextureViewDimension::D2),
                    usage: None,
                    aspect: wgpu::TextureAspect::All,
                    base_mip_level: mip,
                    mip_level_count: Some(1),
                    base_array_layer: 0,
                    array_layer_count: Some(1),
                })
            })
            .collect();

        let full_view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("HZB Full View"),
            format: Some(wgpu::TextureFormat::R32Float),
            dimension: Some(wgpu::TextureViewDimension::D2),
            usage: None,
            aspect: wgpu::TextureAspect::All,
            base_mip_level: 0,
            mip_level_count: Some(mip_count),
            base_array_layer: 0,
            array_layer_count: Some(1),
        });

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("HZB Build Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/hzb_build.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("HZB Build Bind Group Layout"),
            entries: &[
                gpu::uniform_entry(0),
                gpu::texture2d_entry(1),
                gpu::storage_texture_entry(2, wgpu::TextureFormat::R32Float),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("HZB Build Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = gpu::compute_pipeline(
            device,
            "HZB Build Pipeline",
            &pipeline_layout,
            &shader,
            "build_mip",
        );

        // One uniform buffer per mip so the whole chain records into a single
        // command encoder without write-after-read hazards.
        let uniform_buffers = (0..mip_count)
            .map(|mip| {
                device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("HZB Build Uniform Mip {}", mip)),
                    size: std::mem::size_of::<HzbMipUniform>() as u64,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                })
            })
            .collect();

        Self {
            texture,
            mip_views,
            full_view,
            width: hzb_width,
            height: hzb_height,
            mip_count,
            pipeline,
            bind_group_layout,
            uniform_buffers,
            bind_groups: Vec::new(),
        }
    }

    /// Recreate for a new output size. No-op when the rounded extent matches.
    pub fn resize(&mut self, device: &wgpu::Device, width: u32, height: u32) {
        let hzb_width = width.next_power_of_two().max(64);
        let hzb_height = height.next_power_of_two().max(64);
        if hzb_width == self.width && hzb_height == self.height {
            return;
        }
        *self = Self::new(device, width, height);
    }

    /// Create the per-mip bind groups for the given base source. Must be
    /// called whenever the source surface changes (including the switch
    /// between depth and VSM physical pages between passes).
    pub fn set_source(&mut self, device: &wgpu::Device, source: HzbSource<'_>) {
        let base_view = match source {
            HzbSource::Depth(view) => view,
            HzbSource::VsmPhysicalPages(view) => view,
        };

        self.bind_groups.clear();
        for mip in 0..self.mip_count {
            let src_view = if mip == 0 {
                base_view
            } else {
                &self.mip_views[(mip - 1) as usize]
            };
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&format!("HZB Build Bind Group Mip {}", mip)),
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: self.uniform_buffers[mip as usize].as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(src_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(&self.mip_views[mip as usize]),
                    },
                ],
            });
            self.bind_groups.push(bind_group);
        }
    }

    /// Record the mip chain build. `src_width`/`src_height` describe the
    /// source surface fed to mip 0.
    pub fn build(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        queue: &wgpu::Queue,
        src_width: u32,
        src_height: u32,
    ) {
        if self.bind_groups.is_empty() {
            return;
        }

        let mut src_w = src_width;
        let mut src_h = src_height;
        for mip in 0..self.mip_count {
            let dst_w = (self.width >> mip).max(1);
            let dst_h = (self.height >> mip).max(1);

            let uniform = HzbMipUniform {
                src_size: [src_w, src_h],
                dst_size: [dst_w, dst_h],
            };
            queue.write_buffer(
                &self.uniform_buffers[mip as usize],
                0,
                bytemuck::cast_slice(&[uniform]),
            );

            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&format!("HZB Build Mip {}", mip)),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.bind_groups[mip as usize], &[]);
            pass.dispatch_workgroups(gpu::dispatch_size(dst_w, 8), gpu::dispatch_size(dst_h, 8), 1);

            src_w = dst_w;
            src_h = dst_h;
        }
    }

    /// Reference to the built pyramid for the culling kernels.
    pub fn reference(&self) -> HzbRef {
        HzbRef {
            view: self.full_view.clone(),
            size: [self.width, self.height],
            mip_count: self.mip_count,
        }
    }

    /// The pyramid texture (for cross-frame retention by the caller).
    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    /// Base mip extent and mip count.
    pub fn dimensions(&self) -> (u32, u32, u32) {
        (self.width, self.height, self.mip_count)
    }
}

#[cfg(test)]
mod tests {
    use super::HzbBuilder;

    #[test]
    fn mip_count_covers_the_full_chain() {
        assert_eq!(HzbBuilder::mip_count_for(64, 64), 7);
        assert_eq!(HzbBuilder::mip_count_for(1024, 512), 11);
        assert_eq!(HzbBuilder::mip_count_for(2048, 2048), 12);
    }
}
