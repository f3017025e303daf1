//! Small helpers for building wgpu bind group layouts and dispatch sizes.
//!
//! The culling pipeline creates a large number of compute bind group layouts
//! with near-identical entries; these constructors keep the pass modules
//! focused on what each binding means rather than descriptor plumbing.

use wgpu::util::DeviceExt;

/// Uniform buffer binding visible to compute.
pub fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Read-only storage buffer binding visible to compute.
pub fn storage_ro_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    storage_entry(binding, true)
}

/// Read-write storage buffer binding visible to compute.
pub fn storage_rw_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    storage_entry(binding, false)
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Non-filterable 2D float texture binding visible to compute (HZB sampling
/// is done with `textureLoad`, so no sampler entry is needed).
pub fn texture2d_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

/// Write-only storage texture binding visible to compute.
pub fn storage_texture_entry(
    binding: u32,
    format: wgpu::TextureFormat,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        count: None,
    }
}

/// Build a compute pipeline from a shader module and an explicit layout.
pub fn compute_pipeline(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::PipelineLayout,
    module: &wgpu::ShaderModule,
    entry_point: &str,
) -> wgpu::ComputePipeline {
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        module,
        entry_point: Some(entry_point),
        compilation_options: Default::default(),
        cache: None,
    })
}

/// Number of workgroups needed to cover `count` items at `group_size` threads
/// per workgroup.
pub fn dispatch_size(count: u32, group_size: u32) -> u32 {
    count.div_ceil(group_size).max(1)
}

/// Create a storage buffer initialized from a slice of Pod values.
pub fn upload_storage<T: bytemuck::Pod>(
    device: &wgpu::Device,
    label: &str,
    contents: &[T],
    extra_usage: wgpu::BufferUsages,
) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::cast_slice(contents),
        usage: wgpu::BufferUsages::STORAGE | extra_usage,
    })
}

/// A placeholder buffer bound in place of an optional input that is absent
/// for this pass (the shader gates access behind a uniform flag). Sized to
/// satisfy the largest fixed-size binding that may fall back to it.
pub fn dummy_storage(device: &wgpu::Device, label: &str) -> wgpu::Buffer {
    upload_storage::<u32>(device, label, &[0; 16], wgpu::BufferUsages::empty())
}

#[cfg(test)]
mod tests {
    use super::dispatch_size;

    #[test]
    fn dispatch_size_rounds_up() {
        assert_eq!(dispatch_size(0, 64), 1);
        assert_eq!(dispatch_size(1, 64), 1);
        assert_eq!(dispatch_size(64, 64), 1);
        assert_eq!(dispatch_size(65, 64), 2);
        assert_eq!(dispatch_size(1000, 64), 16);
    }
}
