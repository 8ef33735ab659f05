//! In-memory host device and the software runtime profiles.
//!
//! [`SoftwareDevice`] stores host buffers as byte vectors and records every
//! host call in order, so tests can assert on exactly what the cache asked
//! the host to do. Two runtime profiles wrap it:
//!
//! - [`StagedSoftwareRuntime`]: the memory-mapped profile (staging leases +
//!   copy batches), shaped like the Vulkan-family backends.
//! - [`DirectSoftwareRuntime`]: the immediate profile (per-copy uploads,
//!   persistent uniform bindings, optional fast sub-data pushes), shaped like
//!   the GL-family backends without full primitive support.

use std::collections::HashMap;

use crate::runtime::{BufferCopy, HostRuntime, IndexFormat, PrimitiveTopology, StagingLease};

/// Handle to a software host buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SoftBuffer(pub u32);

/// A host call observed by the device, in submission order.
#[derive(Clone, Debug, PartialEq)]
pub enum HostCall {
    CopyBuffer {
        dst: u32,
        src: u32,
        copies: Vec<BufferCopy>,
    },
    Finish,
    BindIndexBuffer {
        buffer: u32,
        offset: u32,
        size: u32,
    },
    BindIndexBufferExpanded {
        topology: PrimitiveTopology,
        format: IndexFormat,
        first: u32,
        count: u32,
        buffer: u32,
        offset: u32,
        size: u32,
    },
    BindQuadArrayIndexBuffer {
        first: u32,
        count: u32,
    },
    BindVertexBuffer {
        index: u32,
        buffer: u32,
        offset: u32,
        size: u32,
        stride: u32,
    },
    BindUniformBuffer {
        stage: usize,
        binding_index: u32,
        buffer: u32,
        offset: u32,
        size: u32,
    },
    BindStorageBuffer {
        stage: usize,
        binding_index: u32,
        buffer: u32,
        offset: u32,
        size: u32,
        is_written: bool,
    },
    BindTransformFeedbackBuffer {
        index: u32,
        buffer: u32,
        offset: u32,
        size: u32,
    },
    BindComputeUniformBuffer {
        binding_index: u32,
        buffer: u32,
        offset: u32,
        size: u32,
    },
    BindComputeStorageBuffer {
        binding_index: u32,
        buffer: u32,
        offset: u32,
        size: u32,
        is_written: bool,
    },
    BindFastUniformBuffer {
        stage: usize,
        binding_index: u32,
        size: u32,
    },
    PushFastUniformBuffer {
        stage: usize,
        binding_index: u32,
        data: Vec<u8>,
    },
    BindMappedUniformBuffer {
        stage: usize,
        binding_index: u32,
        size: u32,
    },
}

/// Staging leases carry a nonzero offset so the offset-adjustment arithmetic
/// in the sync engine is actually exercised.
const STAGING_OFFSET: u64 = 256;

/// CPU-side host device: byte-vector buffers plus a host-call log.
pub struct SoftwareDevice {
    buffers: HashMap<u32, Vec<u8>>,
    next_id: u32,
    calls: Vec<HostCall>,
    mapped_uniforms: HashMap<(usize, u32), Vec<u8>>,
    /// Advertised by [`HostRuntime::has_fast_buffer_sub_data`] on the direct
    /// profile.
    pub fast_buffer_sub_data: bool,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            next_id: 0,
            calls: Vec::new(),
            mapped_uniforms: HashMap::new(),
            fast_buffer_sub_data: false,
        }
    }

    /// Contents of a host buffer.
    pub fn buffer_bytes(&self, buffer: SoftBuffer) -> &[u8] {
        &self.buffers[&buffer.0]
    }

    /// Overwrite part of a host buffer, standing in for a GPU-side write
    /// (storage stores, transform feedback output).
    pub fn write_buffer_bytes(&mut self, buffer: SoftBuffer, offset: u64, data: &[u8]) {
        let bytes = self.buffers.get_mut(&buffer.0).expect("unknown buffer");
        bytes[offset as usize..offset as usize + data.len()].copy_from_slice(data);
    }

    /// Host calls recorded so far.
    pub fn calls(&self) -> &[HostCall] {
        &self.calls
    }

    pub fn take_calls(&mut self) -> Vec<HostCall> {
        std::mem::take(&mut self.calls)
    }

    /// Last contents written through the mapped uniform path.
    pub fn mapped_uniform(&self, stage: usize, binding_index: u32) -> Option<&[u8]> {
        self.mapped_uniforms
            .get(&(stage, binding_index))
            .map(Vec::as_slice)
    }

    fn create_buffer(&mut self, size_bytes: u64) -> SoftBuffer {
        let id = self.next_id;
        self.next_id += 1;
        self.buffers.insert(id, vec![0u8; size_bytes as usize]);
        SoftBuffer(id)
    }

    fn staging(&mut self, size: u64) -> StagingLease<SoftBuffer> {
        let buffer = self.create_buffer(STAGING_OFFSET + size);
        StagingLease {
            buffer,
            offset: STAGING_OFFSET,
            size,
        }
    }

    fn staging_span_mut(&mut self, lease: &StagingLease<SoftBuffer>) -> &mut [u8] {
        let bytes = self.buffers.get_mut(&lease.buffer.0).expect("unknown staging buffer");
        &mut bytes[lease.offset as usize..(lease.offset + lease.size) as usize]
    }

    fn staging_span(&self, lease: &StagingLease<SoftBuffer>) -> &[u8] {
        &self.buffers[&lease.buffer.0][lease.offset as usize..(lease.offset + lease.size) as usize]
    }

    fn copy_buffer(&mut self, dst: SoftBuffer, src: SoftBuffer, copies: &[BufferCopy]) {
        self.calls.push(HostCall::CopyBuffer {
            dst: dst.0,
            src: src.0,
            copies: copies.to_vec(),
        });
        for copy in copies {
            let bytes = self.buffers[&src.0]
                [copy.src_offset as usize..(copy.src_offset + copy.size) as usize]
                .to_vec();
            let dst_bytes = self.buffers.get_mut(&dst.0).expect("unknown buffer");
            dst_bytes[copy.dst_offset as usize..copy.dst_offset as usize + bytes.len()]
                .copy_from_slice(&bytes);
        }
    }

    fn upload_buffer_data(&mut self, dst: SoftBuffer, offset: u64, data: &[u8]) {
        let bytes = self.buffers.get_mut(&dst.0).expect("unknown buffer");
        bytes[offset as usize..offset as usize + data.len()].copy_from_slice(data);
    }

    fn download_buffer_data(&self, src: SoftBuffer, offset: u64, out: &mut [u8]) {
        let bytes = &self.buffers[&src.0];
        out.copy_from_slice(&bytes[offset as usize..offset as usize + out.len()]);
    }

    fn map_uniform_buffer(&mut self, stage: usize, binding_index: u32, size: u32) -> &mut [u8] {
        self.calls.push(HostCall::BindMappedUniformBuffer {
            stage,
            binding_index,
            size,
        });
        let span = self.mapped_uniforms.entry((stage, binding_index)).or_default();
        span.clear();
        span.resize(size as usize, 0);
        span
    }
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! delegate_host_runtime_calls {
    () => {
        type Buffer = SoftBuffer;

        fn create_buffer(&mut self, size_bytes: u64) -> SoftBuffer {
            self.device.create_buffer(size_bytes)
        }

        fn upload_staging_buffer(&mut self, size: u64) -> StagingLease<SoftBuffer> {
            self.device.staging(size)
        }

        fn download_staging_buffer(&mut self, size: u64) -> StagingLease<SoftBuffer> {
            self.device.staging(size)
        }

        fn staging_span_mut(&mut self, lease: &StagingLease<SoftBuffer>) -> &mut [u8] {
            self.device.staging_span_mut(lease)
        }

        fn staging_span(&self, lease: &StagingLease<SoftBuffer>) -> &[u8] {
            self.device.staging_span(lease)
        }

        fn copy_buffer(&mut self, dst: &SoftBuffer, src: &SoftBuffer, copies: &[BufferCopy]) {
            self.device.copy_buffer(*dst, *src, copies);
        }

        fn finish(&mut self) {
            self.device.calls.push(HostCall::Finish);
        }

        fn upload_buffer_data(&mut self, dst: &SoftBuffer, offset: u64, data: &[u8]) {
            self.device.upload_buffer_data(*dst, offset, data);
        }

        fn download_buffer_data(&mut self, src: &SoftBuffer, offset: u64, out: &mut [u8]) {
            self.device.download_buffer_data(*src, offset, out);
        }

        fn bind_index_buffer(&mut self, buffer: &SoftBuffer, offset: u32, size: u32) {
            self.device.calls.push(HostCall::BindIndexBuffer {
                buffer: buffer.0,
                offset,
                size,
            });
        }

        fn bind_index_buffer_expanded(
            &mut self,
            topology: PrimitiveTopology,
            format: IndexFormat,
            first: u32,
            count: u32,
            buffer: &SoftBuffer,
            offset: u32,
            size: u32,
        ) {
            self.device.calls.push(HostCall::BindIndexBufferExpanded {
                topology,
                format,
                first,
                count,
                buffer: buffer.0,
                offset,
                size,
            });
        }

        fn bind_quad_array_index_buffer(&mut self, first: u32, count: u32) {
            self.device
                .calls
                .push(HostCall::BindQuadArrayIndexBuffer { first, count });
        }

        fn bind_vertex_buffer(
            &mut self,
            index: u32,
            buffer: &SoftBuffer,
            offset: u32,
            size: u32,
            stride: u32,
        ) {
            self.device.calls.push(HostCall::BindVertexBuffer {
                index,
                buffer: buffer.0,
                offset,
                size,
                stride,
            });
        }

        fn bind_uniform_buffer(
            &mut self,
            stage: usize,
            binding_index: u32,
            buffer: &SoftBuffer,
            offset: u32,
            size: u32,
        ) {
            self.device.calls.push(HostCall::BindUniformBuffer {
                stage,
                binding_index,
                buffer: buffer.0,
                offset,
                size,
            });
        }

        fn bind_storage_buffer(
            &mut self,
            stage: usize,
            binding_index: u32,
            buffer: &SoftBuffer,
            offset: u32,
            size: u32,
            is_written: bool,
        ) {
            self.device.calls.push(HostCall::BindStorageBuffer {
                stage,
                binding_index,
                buffer: buffer.0,
                offset,
                size,
                is_written,
            });
        }

        fn bind_transform_feedback_buffer(
            &mut self,
            index: u32,
            buffer: &SoftBuffer,
            offset: u32,
            size: u32,
        ) {
            self.device.calls.push(HostCall::BindTransformFeedbackBuffer {
                index,
                buffer: buffer.0,
                offset,
                size,
            });
        }

        fn bind_compute_uniform_buffer(
            &mut self,
            binding_index: u32,
            buffer: &SoftBuffer,
            offset: u32,
            size: u32,
        ) {
            self.device.calls.push(HostCall::BindComputeUniformBuffer {
                binding_index,
                buffer: buffer.0,
                offset,
                size,
            });
        }

        fn bind_compute_storage_buffer(
            &mut self,
            binding_index: u32,
            buffer: &SoftBuffer,
            offset: u32,
            size: u32,
            is_written: bool,
        ) {
            self.device.calls.push(HostCall::BindComputeStorageBuffer {
                binding_index,
                buffer: buffer.0,
                offset,
                size,
                is_written,
            });
        }

        fn has_fast_buffer_sub_data(&self) -> bool {
            self.device.fast_buffer_sub_data
        }

        fn bind_fast_uniform_buffer(&mut self, stage: usize, binding_index: u32, size: u32) {
            self.device.calls.push(HostCall::BindFastUniformBuffer {
                stage,
                binding_index,
                size,
            });
        }

        fn push_fast_uniform_buffer(&mut self, stage: usize, binding_index: u32, data: &[u8]) {
            self.device.calls.push(HostCall::PushFastUniformBuffer {
                stage,
                binding_index,
                data: data.to_vec(),
            });
        }

        fn map_uniform_buffer(
            &mut self,
            stage: usize,
            binding_index: u32,
            size: u32,
        ) -> &mut [u8] {
            self.device.map_uniform_buffer(stage, binding_index, size)
        }
    };
}

/// Memory-mapped software profile (staging leases + copy batches).
pub struct StagedSoftwareRuntime {
    pub device: SoftwareDevice,
}

impl StagedSoftwareRuntime {
    pub fn new() -> Self {
        Self {
            device: SoftwareDevice::new(),
        }
    }
}

impl Default for StagedSoftwareRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRuntime for StagedSoftwareRuntime {
    const IS_OPENGL: bool = false;
    const HAS_PERSISTENT_UNIFORM_BUFFER_BINDINGS: bool = false;
    const HAS_FULL_INDEX_AND_PRIMITIVE_SUPPORT: bool = true;
    const NEEDS_BIND_UNIFORM_INDEX: bool = false;
    const NEEDS_BIND_STORAGE_INDEX: bool = false;
    const USE_MEMORY_MAPS: bool = true;

    delegate_host_runtime_calls!();
}

/// Immediate software profile (per-copy uploads, persistent uniform state,
/// no native support for every index format and topology).
pub struct DirectSoftwareRuntime {
    pub device: SoftwareDevice,
}

impl DirectSoftwareRuntime {
    pub fn new() -> Self {
        Self {
            device: SoftwareDevice::new(),
        }
    }
}

impl Default for DirectSoftwareRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRuntime for DirectSoftwareRuntime {
    const IS_OPENGL: bool = true;
    const HAS_PERSISTENT_UNIFORM_BUFFER_BINDINGS: bool = true;
    const HAS_FULL_INDEX_AND_PRIMITIVE_SUPPORT: bool = false;
    const NEEDS_BIND_UNIFORM_INDEX: bool = true;
    const NEEDS_BIND_STORAGE_INDEX: bool = true;
    const USE_MEMORY_MAPS: bool = false;

    delegate_host_runtime_calls!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn copy_buffer_moves_bytes_and_records_the_call() {
        let mut device = SoftwareDevice::new();
        let src = device.create_buffer(16);
        let dst = device.create_buffer(16);
        device.upload_buffer_data(src, 0, &[1, 2, 3, 4]);

        let copies = [BufferCopy {
            src_offset: 0,
            dst_offset: 8,
            size: 4,
        }];
        device.copy_buffer(dst, src, &copies);

        assert_eq!(&device.buffer_bytes(dst)[8..12], &[1, 2, 3, 4]);
        assert_eq!(
            device.calls(),
            &[HostCall::CopyBuffer {
                dst: dst.0,
                src: src.0,
                copies: copies.to_vec(),
            }]
        );
    }

    #[test]
    fn staging_leases_carry_a_nonzero_offset() {
        let mut device = SoftwareDevice::new();
        let lease = device.staging(32);
        assert_eq!(lease.offset, STAGING_OFFSET);
        assert_eq!(device.staging_span(&lease).len(), 32);
    }
}
