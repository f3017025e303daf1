//! Streaming feedback collection.
//!
//! Cluster culling emits a streaming-request record whenever the LOD detail
//! it wants is not resident; culling proceeds with the best resident data and
//! the external streaming manager services the requests asynchronously.
//! Requests land in a fixed-capacity GPU buffer with a version counter;
//! overflow is silently dropped — the manager retries on continued demand.

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};

/// A single streaming request emitted by cluster culling.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct StreamingRequest {
    /// Page the cluster wants resident.
    pub page_index: u32,
    /// Request priority (higher = more urgent detail deficit).
    pub priority: u32,
}

/// Header at the front of the request buffer: the kernels bump `count` with
/// an atomic add and tag each record with `version`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct RequestHeader {
    count: u32,
    version: u32,
}

/// Fixed-capacity streaming request buffer plus end-of-frame readback.
pub struct StreamingFeedback {
    /// Device buffer: header followed by `capacity` request records.
    pub buffer: wgpu::Buffer,
    staging: wgpu::Buffer,
    capacity: u32,
    version: u32,
}

impl StreamingFeedback {
    const HEADER_BYTES: u64 = std::mem::size_of::<RequestHeader>() as u64;

    /// Allocate buffers for at most `capacity` requests per frame.
    pub fn new(device: &wgpu::Device, capacity: u32) -> Self {
        let size =
            Self::HEADER_BYTES + capacity as u64 * std::mem::size_of::<StreamingRequest>() as u64;
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Streaming Request Buffer"),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Streaming Request Staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            staging,
            capacity,
            version: 0,
        }
    }

    /// Request capacity.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Version counter stamped into this frame's requests.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Reset the header for a new frame and advance the version counter.
    pub fn begin_frame(&mut self, queue: &wgpu::Queue) {
        self.version = self.version.wrapping_add(1);
        let header = RequestHeader {
            count: 0,
            version: self.version,
        };
        queue.write_buffer(&self.buffer, 0, bytemuck::cast_slice(&[header]));
    }

    /// Record the end-of-frame copy into the staging buffer.
    pub fn copy_to_staging(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &self.staging, 0, self.staging.size());
    }

    /// Block on the staging copy and hand the frame's requests to the caller
    /// (the external streaming manager). Requests past capacity were never
    /// written; the reported overflow count is logged and dropped.
    pub fn collect(&self, device: &wgpu::Device) -> Result<Vec<StreamingRequest>> {
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

        let data = slice.get_mapped_range();
        let header = *bytemuck::from_bytes::<RequestHeader>(&data[..Self::HEADER_BYTES as usize]);
        let written = header.count.min(self.capacity);
        if header.count > self.capacity {
            log::debug!(
                "dropped {} streaming requests past capacity {}",
                header.count - self.capacity,
                self.capacity
            );
        }

        let records: &[StreamingRequest] = bytemuck::cast_slice(&data[Self::HEADER_BYTES as usize..]);
        let requests = records[..written as usize].to_vec();
        drop(data);
        self.staging.unmap();
        Ok(requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_records_are_two_words() {
        // The WGSL kernel writes requests as vec2<u32>.
        assert_eq!(std::mem::size_of::<StreamingRequest>(), 8);
        assert_eq!(std::mem::size_of::<RequestHeader>(), 8);
    }
}
