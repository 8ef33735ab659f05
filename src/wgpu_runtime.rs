//! wgpu-backed host runtime.
//!
//! Buffer storage and copies run against a real `wgpu::Device`/`wgpu::Queue`;
//! bind calls are recorded into a [`BindingsState`] that the surrounding
//! renderer consumes when it encodes the actual draw or dispatch.
//!
//! WebGPU constrains buffer copies to 4-byte offsets and sizes
//! (`COPY_BUFFER_ALIGNMENT`), while the cache's dirty ranges are
//! byte-granular. Aligned copies go through a command encoder directly;
//! misaligned ones take a read-merge-write fallback that widens the affected
//! region to copy alignment.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error};

use crate::buffer_cache::{NUM_STAGES, NUM_TRANSFORM_FEEDBACK_BUFFERS, NUM_VERTEX_BUFFERS};
use crate::runtime::{BufferCopy, HostRuntime, IndexFormat, PrimitiveTopology, StagingLease};

const COPY_ALIGN: u64 = wgpu::COPY_BUFFER_ALIGNMENT;

#[derive(Debug, Error)]
pub enum WgpuRuntimeError {
    #[error("map_async sender dropped")]
    MapChannelClosed,
    #[error("map_async failed: {0}")]
    MapFailed(String),
}

/// Handle to a wgpu host buffer.
#[derive(Clone, Debug)]
pub struct WgpuBuffer {
    id: u64,
    raw: Arc<wgpu::Buffer>,
}

impl WgpuBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn raw(&self) -> &wgpu::Buffer {
        &self.raw
    }
}

/// A bound buffer range, as handed to the renderer.
#[derive(Clone, Debug)]
pub struct BoundBuffer {
    pub buffer: WgpuBuffer,
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct IndexExpansion {
    pub topology: PrimitiveTopology,
    pub format: IndexFormat,
    pub first: u32,
    pub count: u32,
}

#[derive(Clone, Debug)]
pub struct IndexBinding {
    pub binding: BoundBuffer,
    /// Draw parameters for formats/topologies WebGPU cannot consume
    /// directly; the renderer runs its expansion pass over them.
    pub expansion: Option<IndexExpansion>,
}

#[derive(Clone, Debug)]
pub struct VertexBinding {
    pub binding: BoundBuffer,
    pub stride: u32,
}

/// Per-stage uniform/storage binding slots.
#[derive(Clone, Debug, Default)]
pub struct StageBindings {
    uniform_buffers: Vec<Option<BoundBuffer>>,
    storage_buffers: Vec<Option<(BoundBuffer, bool)>>,
}

impl StageBindings {
    pub fn uniform_buffer(&self, slot: u32) -> Option<&BoundBuffer> {
        self.uniform_buffers.get(slot as usize).and_then(Option::as_ref)
    }

    pub fn storage_buffer(&self, slot: u32) -> Option<&(BoundBuffer, bool)> {
        self.storage_buffers.get(slot as usize).and_then(Option::as_ref)
    }

    fn set_uniform_buffer(&mut self, slot: u32, value: BoundBuffer) {
        let slot = slot as usize;
        if self.uniform_buffers.len() <= slot {
            self.uniform_buffers.resize(slot + 1, None);
        }
        self.uniform_buffers[slot] = Some(value);
    }

    fn set_storage_buffer(&mut self, slot: u32, value: BoundBuffer, is_written: bool) {
        let slot = slot as usize;
        if self.storage_buffers.len() <= slot {
            self.storage_buffers.resize(slot + 1, None);
        }
        self.storage_buffers[slot] = Some((value, is_written));
    }
}

/// Everything the cache has bound since the last draw/dispatch encode.
#[derive(Clone, Debug, Default)]
pub struct BindingsState {
    pub index_buffer: Option<IndexBinding>,
    /// `(first, count)` of a pending non-indexed quad draw.
    pub quad_array_draw: Option<(u32, u32)>,
    pub vertex_buffers: Vec<Option<VertexBinding>>,
    pub transform_feedback_buffers: Vec<Option<BoundBuffer>>,
    pub stages: [StageBindings; NUM_STAGES],
    pub compute: StageBindings,
}

impl BindingsState {
    fn new() -> Self {
        Self {
            vertex_buffers: vec![None; NUM_VERTEX_BUFFERS],
            transform_feedback_buffers: vec![None; NUM_TRANSFORM_FEEDBACK_BUFFERS],
            ..Self::default()
        }
    }
}

/// Host runtime over a wgpu device.
pub struct WgpuRuntime {
    device: wgpu::Device,
    queue: wgpu::Queue,
    next_buffer_id: u64,
    upload_shadows: HashMap<u64, Vec<u8>>,
    download_shadows: HashMap<u64, Vec<u8>>,
    mapped_uniform_scratch: HashMap<(usize, u32), Vec<u8>>,
    bindings: BindingsState,
}

impl WgpuRuntime {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            next_buffer_id: 0,
            upload_shadows: HashMap::new(),
            download_shadows: HashMap::new(),
            mapped_uniform_scratch: HashMap::new(),
            bindings: BindingsState::new(),
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// The bindings recorded since the renderer last consumed them.
    pub fn bindings(&self) -> &BindingsState {
        &self.bindings
    }

    /// Contents last written through the mapped uniform path for a slot.
    pub fn mapped_uniform_data(&self, stage: usize, binding_index: u32) -> Option<&[u8]> {
        self.mapped_uniform_scratch
            .get(&(stage, binding_index))
            .map(Vec::as_slice)
    }

    /// Release staging shadows whose contents have been consumed.
    ///
    /// Call once per frame, after download results have been written back.
    pub fn recall(&mut self) {
        self.upload_shadows.clear();
        self.download_shadows.clear();
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_buffer_id;
        self.next_buffer_id = self.next_buffer_id.wrapping_add(1);
        id
    }

    fn make_buffer(&mut self, size_bytes: u64, usage: wgpu::BufferUsages) -> WgpuBuffer {
        let id = self.alloc_id();
        let raw = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("vesper cached buffer"),
            size: align_up(size_bytes.max(COPY_ALIGN), COPY_ALIGN),
            usage,
            mapped_at_creation: false,
        });
        WgpuBuffer {
            id,
            raw: Arc::new(raw),
        }
    }

    /// Blocking readback of `[offset, offset + size)`, both copy-aligned.
    fn readback_aligned(
        &self,
        buffer: &wgpu::Buffer,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, WgpuRuntimeError> {
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("vesper readback"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("vesper readback"),
            });
        encoder.copy_buffer_to_buffer(buffer, offset, &readback, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = readback.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = sender.send(res);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| WgpuRuntimeError::MapChannelClosed)?
            .map_err(|err| WgpuRuntimeError::MapFailed(format!("{err:?}")))?;

        let mapped = slice.get_mapped_range();
        let out = mapped.to_vec();
        drop(mapped);
        readback.unmap();
        Ok(out)
    }

    /// Read exact (possibly misaligned) bytes by widening to copy alignment.
    fn read_bytes(
        &self,
        buffer: &wgpu::Buffer,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, WgpuRuntimeError> {
        let begin = offset & !(COPY_ALIGN - 1);
        let end = align_up(offset + size, COPY_ALIGN).min(buffer.size());
        let widened = self.readback_aligned(buffer, begin, end - begin)?;
        let head = (offset - begin) as usize;
        Ok(widened[head..head + size as usize].to_vec())
    }

    /// Write exact (possibly misaligned) bytes, merging with the resident
    /// head/tail when widening is needed.
    fn write_bytes(&mut self, buffer: &wgpu::Buffer, offset: u64, data: &[u8]) {
        let size = data.len() as u64;
        if offset % COPY_ALIGN == 0 && size % COPY_ALIGN == 0 {
            self.queue.write_buffer(buffer, offset, data);
            return;
        }
        debug!(offset, size, "misaligned host write; widening to copy alignment");
        let begin = offset & !(COPY_ALIGN - 1);
        let end = align_up(offset + size, COPY_ALIGN).min(buffer.size());
        let mut merged = match self.readback_aligned(buffer, begin, end - begin) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("host readback failed during widened write: {err}");
                return;
            }
        };
        let head = (offset - begin) as usize;
        merged[head..head + data.len()].copy_from_slice(data);
        self.queue.write_buffer(buffer, begin, &merged);
    }

    fn copy_aligned(&mut self, dst: &wgpu::Buffer, src: &wgpu::Buffer, copies: &[BufferCopy]) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("vesper buffer copies"),
            });
        for copy in copies {
            encoder.copy_buffer_to_buffer(src, copy.src_offset, dst, copy.dst_offset, copy.size);
        }
        self.queue.submit(Some(encoder.finish()));
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

fn is_copy_aligned(copy: &BufferCopy) -> bool {
    copy.src_offset % COPY_ALIGN == 0
        && copy.dst_offset % COPY_ALIGN == 0
        && copy.size % COPY_ALIGN == 0
}

impl HostRuntime for WgpuRuntime {
    type Buffer = WgpuBuffer;

    const IS_OPENGL: bool = false;
    const HAS_PERSISTENT_UNIFORM_BUFFER_BINDINGS: bool = false;
    const HAS_FULL_INDEX_AND_PRIMITIVE_SUPPORT: bool = false;
    const NEEDS_BIND_UNIFORM_INDEX: bool = false;
    const NEEDS_BIND_STORAGE_INDEX: bool = false;
    const USE_MEMORY_MAPS: bool = true;

    fn create_buffer(&mut self, size_bytes: u64) -> WgpuBuffer {
        self.make_buffer(
            size_bytes,
            wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::INDEX
                | wgpu::BufferUsages::VERTEX
                | wgpu::BufferUsages::UNIFORM
                | wgpu::BufferUsages::STORAGE,
        )
    }

    fn upload_staging_buffer(&mut self, size: u64) -> StagingLease<WgpuBuffer> {
        let buffer = self.make_buffer(
            size,
            wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        );
        self.upload_shadows.insert(buffer.id, vec![0u8; size as usize]);
        StagingLease {
            buffer,
            offset: 0,
            size,
        }
    }

    fn download_staging_buffer(&mut self, size: u64) -> StagingLease<WgpuBuffer> {
        let buffer = self.make_buffer(
            size,
            wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        );
        self.download_shadows.insert(buffer.id, vec![0u8; size as usize]);
        StagingLease {
            buffer,
            offset: 0,
            size,
        }
    }

    fn staging_span_mut(&mut self, lease: &StagingLease<WgpuBuffer>) -> &mut [u8] {
        self.upload_shadows
            .get_mut(&lease.buffer.id)
            .expect("not an upload staging lease")
    }

    fn staging_span(&self, lease: &StagingLease<WgpuBuffer>) -> &[u8] {
        if let Some(shadow) = self.download_shadows.get(&lease.buffer.id) {
            return shadow;
        }
        self.upload_shadows
            .get(&lease.buffer.id)
            .expect("unknown staging lease")
    }

    fn copy_buffer(&mut self, dst: &WgpuBuffer, src: &WgpuBuffer, copies: &[BufferCopy]) {
        if let Some(shadow) = self.upload_shadows.remove(&src.id) {
            // Upload batch: staging shadow → destination buffer.
            for copy in copies {
                let bytes =
                    &shadow[copy.src_offset as usize..(copy.src_offset + copy.size) as usize];
                self.write_bytes(&dst.raw, copy.dst_offset, bytes);
            }
            return;
        }
        if self.download_shadows.contains_key(&dst.id) {
            // Download batch: source buffer → staging shadow.
            for copy in copies {
                let bytes = match self.read_bytes(&src.raw, copy.src_offset, copy.size) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        error!("host readback failed during download: {err}");
                        vec![0u8; copy.size as usize]
                    }
                };
                let shadow = self.download_shadows.get_mut(&dst.id).expect("shadow vanished");
                shadow[copy.dst_offset as usize..(copy.dst_offset + copy.size) as usize]
                    .copy_from_slice(&bytes);
            }
            return;
        }
        // Buffer-to-buffer batch (coalescing migration).
        let (aligned, misaligned): (Vec<_>, Vec<_>) =
            copies.iter().copied().partition(is_copy_aligned);
        if !aligned.is_empty() {
            self.copy_aligned(&dst.raw, &src.raw, &aligned);
        }
        for copy in &misaligned {
            match self.read_bytes(&src.raw, copy.src_offset, copy.size) {
                Ok(bytes) => self.write_bytes(&dst.raw, copy.dst_offset, &bytes),
                Err(err) => error!("host readback failed during buffer copy: {err}"),
            }
        }
    }

    fn finish(&mut self) {
        self.device.poll(wgpu::Maintain::Wait);
    }

    fn upload_buffer_data(&mut self, dst: &WgpuBuffer, offset: u64, data: &[u8]) {
        self.write_bytes(&dst.raw, offset, data);
    }

    fn download_buffer_data(&mut self, src: &WgpuBuffer, offset: u64, out: &mut [u8]) {
        match self.read_bytes(&src.raw, offset, out.len() as u64) {
            Ok(bytes) => out.copy_from_slice(&bytes),
            Err(err) => {
                error!("host readback failed during immediate download: {err}");
                out.fill(0);
            }
        }
    }

    fn bind_index_buffer(&mut self, buffer: &WgpuBuffer, offset: u32, size: u32) {
        self.bindings.index_buffer = Some(IndexBinding {
            binding: BoundBuffer {
                buffer: buffer.clone(),
                offset,
                size,
            },
            expansion: None,
        });
    }

    fn bind_index_buffer_expanded(
        &mut self,
        topology: PrimitiveTopology,
        format: IndexFormat,
        first: u32,
        count: u32,
        buffer: &WgpuBuffer,
        offset: u32,
        size: u32,
    ) {
        self.bindings.index_buffer = Some(IndexBinding {
            binding: BoundBuffer {
                buffer: buffer.clone(),
                offset,
                size,
            },
            expansion: Some(IndexExpansion {
                topology,
                format,
                first,
                count,
            }),
        });
    }

    fn bind_quad_array_index_buffer(&mut self, first: u32, count: u32) {
        self.bindings.quad_array_draw = Some((first, count));
    }

    fn bind_vertex_buffer(
        &mut self,
        index: u32,
        buffer: &WgpuBuffer,
        offset: u32,
        size: u32,
        stride: u32,
    ) {
        self.bindings.vertex_buffers[index as usize] = Some(VertexBinding {
            binding: BoundBuffer {
                buffer: buffer.clone(),
                offset,
                size,
            },
            stride,
        });
    }

    fn bind_uniform_buffer(
        &mut self,
        stage: usize,
        binding_index: u32,
        buffer: &WgpuBuffer,
        offset: u32,
        size: u32,
    ) {
        self.bindings.stages[stage].set_uniform_buffer(
            binding_index,
            BoundBuffer {
                buffer: buffer.clone(),
                offset,
                size,
            },
        );
    }

    fn bind_storage_buffer(
        &mut self,
        stage: usize,
        binding_index: u32,
        buffer: &WgpuBuffer,
        offset: u32,
        size: u32,
        is_written: bool,
    ) {
        self.bindings.stages[stage].set_storage_buffer(
            binding_index,
            BoundBuffer {
                buffer: buffer.clone(),
                offset,
                size,
            },
            is_written,
        );
    }

    fn bind_transform_feedback_buffer(
        &mut self,
        index: u32,
        buffer: &WgpuBuffer,
        offset: u32,
        size: u32,
    ) {
        self.bindings.transform_feedback_buffers[index as usize] = Some(BoundBuffer {
            buffer: buffer.clone(),
            offset,
            size,
        });
    }

    fn bind_compute_uniform_buffer(
        &mut self,
        binding_index: u32,
        buffer: &WgpuBuffer,
        offset: u32,
        size: u32,
    ) {
        self.bindings.compute.set_uniform_buffer(
            binding_index,
            BoundBuffer {
                buffer: buffer.clone(),
                offset,
                size,
            },
        );
    }

    fn bind_compute_storage_buffer(
        &mut self,
        binding_index: u32,
        buffer: &WgpuBuffer,
        offset: u32,
        size: u32,
        is_written: bool,
    ) {
        self.bindings.compute.set_storage_buffer(
            binding_index,
            BoundBuffer {
                buffer: buffer.clone(),
                offset,
                size,
            },
            is_written,
        );
    }

    fn bind_fast_uniform_buffer(&mut self, _stage: usize, _binding_index: u32, _size: u32) {
        debug_assert!(false, "fast uniform buffers require the GL-family runtime");
    }

    fn push_fast_uniform_buffer(&mut self, _stage: usize, _binding_index: u32, _data: &[u8]) {
        debug_assert!(false, "fast uniform buffers require the GL-family runtime");
    }

    fn map_uniform_buffer(&mut self, stage: usize, binding_index: u32, size: u32) -> &mut [u8] {
        let span = self
            .mapped_uniform_scratch
            .entry((stage, binding_index))
            .or_default();
        span.clear();
        span.resize(size as usize, 0);
        span
    }
}
