//! The buffer cache core.
//!
//! Reconciles guest virtual memory with host buffer objects: a page-indexed
//! catalogue for O(1) bind-time lookup, a coalescing allocator that merges
//! overlapping ranges into one host buffer, bidirectional dirty tracking
//! driving on-demand upload and deferred download, and a hit-rate heuristic
//! that picks between inline and cached paths for small uniform buffers.
//!
//! The cache is not internally synchronized: `&mut self` is the lock. A
//! caller that shares it between the command processor and the memory-write
//! notifier wraps it in its own mutex and holds it across each operation.

use std::collections::VecDeque;
use std::ops::Range;

use tracing::debug;

use crate::buffer::Buffer;
use crate::delayed_destruction::DelayedDestructionRing;
use crate::guest_memory::{is_range_granular, GuestMemory};
use crate::page_table::{PageTable, PAGE_BITS, PAGE_SIZE};
use crate::runtime::{BufferCopy, HostRuntime, IndexFormat, PrimitiveTopology};
use crate::slots::{SlotArena, SlotId};
use crate::{GpuVAddr, VAddr};

pub const NUM_VERTEX_BUFFERS: usize = 32;
pub const NUM_TRANSFORM_FEEDBACK_BUFFERS: usize = 4;
pub const NUM_GRAPHICS_UNIFORM_BUFFERS: usize = 18;
pub const NUM_COMPUTE_UNIFORM_BUFFERS: usize = 8;
pub const NUM_STORAGE_BUFFERS: usize = 16;
pub const NUM_STAGES: usize = 5;

pub const DEFAULT_SKIP_CACHE_SIZE: u32 = 4096;

/// Stable identifier for a cached buffer. Slot 0 is the null buffer.
pub type BufferId = SlotId;

const NULL_BINDING: Binding = Binding {
    cpu_addr: 0,
    size: 0,
    buffer_id: BufferId::NULL,
};

/// Update passes re-run while coalescing deletes buffers out from under the
/// binding tables. Convergence is structural (every pass strictly reduces
/// the number of un-coalesced overlaps), so hitting the cap is a bug.
const MAX_UPDATE_PASSES: u32 = 8;

/// One resolved binding: a guest range plus the cached buffer backing it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Binding {
    cpu_addr: VAddr,
    size: u32,
    buffer_id: BufferId,
}

struct OverlapResult {
    ids: Vec<BufferId>,
    begin: VAddr,
    end: VAddr,
    has_stream_leap: bool,
}

/// Configuration snapshot read at GPU-write marking time.
///
/// Taken explicitly instead of re-reading emulator settings per write; the
/// orchestrator refreshes it at frame boundaries if the user changed it.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheConfig {
    pub gpu_accuracy_high: bool,
    pub use_asynchronous_gpu: bool,
}

/// Index buffer register bank.
#[derive(Clone, Copy, Debug)]
pub struct IndexBufferRegs {
    pub start_addr: GpuVAddr,
    pub end_addr: GpuVAddr,
    pub format: IndexFormat,
    pub first: u32,
    pub count: u32,
}

impl Default for IndexBufferRegs {
    fn default() -> Self {
        Self {
            start_addr: 0,
            end_addr: 0,
            format: IndexFormat::Uint32,
            first: 0,
            count: 0,
        }
    }
}

/// Vertex buffer register bank. `limit_addr` is the inclusive last byte.
#[derive(Clone, Copy, Debug, Default)]
pub struct VertexBufferRegs {
    pub enable: bool,
    pub start_addr: GpuVAddr,
    pub limit_addr: GpuVAddr,
    pub stride: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TransformFeedbackRegs {
    pub enable: bool,
    pub address: GpuVAddr,
    pub buffer_offset: u32,
    pub size: u32,
}

/// Const-buffer bank entry; the storage-buffer descriptor blocks live inside
/// these buffers in guest memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConstBufferRegs {
    pub address: GpuVAddr,
    pub size: u32,
}

/// Rasterizer register state consumed by the graphics update/bind phases.
#[derive(Clone, Debug)]
pub struct GraphicsRegs {
    pub topology: PrimitiveTopology,
    /// First vertex / vertex count of the current non-indexed draw.
    pub vertex_first: u32,
    pub vertex_count: u32,
    pub index_buffer: IndexBufferRegs,
    pub vertex_buffers: [VertexBufferRegs; NUM_VERTEX_BUFFERS],
    pub tfb_enabled: bool,
    pub tfb_bindings: [TransformFeedbackRegs; NUM_TRANSFORM_FEEDBACK_BUFFERS],
    pub const_buffers: [[ConstBufferRegs; NUM_GRAPHICS_UNIFORM_BUFFERS]; NUM_STAGES],
}

impl Default for GraphicsRegs {
    fn default() -> Self {
        Self {
            topology: PrimitiveTopology::Triangles,
            vertex_first: 0,
            vertex_count: 0,
            index_buffer: IndexBufferRegs::default(),
            vertex_buffers: [VertexBufferRegs::default(); NUM_VERTEX_BUFFERS],
            tfb_enabled: false,
            tfb_bindings: [TransformFeedbackRegs::default(); NUM_TRANSFORM_FEEDBACK_BUFFERS],
            const_buffers: [[ConstBufferRegs::default(); NUM_GRAPHICS_UNIFORM_BUFFERS];
                NUM_STAGES],
        }
    }
}

/// Compute launch descriptor state consumed by the compute update phase.
#[derive(Clone, Copy, Debug, Default)]
pub struct ComputeRegs {
    pub const_buffer_enable_mask: u32,
    pub const_buffers: [ConstBufferRegs; NUM_COMPUTE_UNIFORM_BUFFERS],
}

struct DirtyFlags {
    index_buffer: bool,
    vertex_buffers: bool,
    vertex_buffer: [bool; NUM_VERTEX_BUFFERS],
}

impl DirtyFlags {
    fn all() -> Self {
        Self {
            index_buffer: true,
            vertex_buffers: true,
            vertex_buffer: [true; NUM_VERTEX_BUFFERS],
        }
    }
}

fn for_each_enabled_bit(mut mask: u32, mut f: impl FnMut(u32)) {
    let mut index = 0u32;
    while mask != 0 {
        let skip = mask.trailing_zeros();
        index += skip;
        mask >>= skip;
        f(index);
        index += 1;
        mask >>= 1;
    }
}

/// The guest↔host buffer reconciler.
///
/// Generic over the host runtime `R` (capability flags resolve at compile
/// time, so per-backend conditional paths fold away) and the guest memory
/// service `M`.
pub struct BufferCache<R: HostRuntime, M: GuestMemory> {
    runtime: R,
    guest_memory: M,
    config: CacheConfig,

    slot_buffers: SlotArena<Buffer<R::Buffer>>,
    delayed_destruction_ring: DelayedDestructionRing<Buffer<R::Buffer>, 8>,
    page_table: PageTable,

    index_buffer: Binding,
    vertex_buffers: [Binding; NUM_VERTEX_BUFFERS],
    uniform_buffers: [[Binding; NUM_GRAPHICS_UNIFORM_BUFFERS]; NUM_STAGES],
    storage_buffers: [[Binding; NUM_STORAGE_BUFFERS]; NUM_STAGES],
    transform_feedback_buffers: [Binding; NUM_TRANSFORM_FEEDBACK_BUFFERS],
    compute_uniform_buffers: [Binding; NUM_COMPUTE_UNIFORM_BUFFERS],
    compute_storage_buffers: [Binding; NUM_STORAGE_BUFFERS],

    enabled_uniform_buffers: [u32; NUM_STAGES],
    enabled_compute_uniform_buffers: u32,
    enabled_storage_buffers: [u32; NUM_STAGES],
    written_storage_buffers: [u32; NUM_STAGES],
    enabled_compute_storage_buffers: u32,
    written_compute_storage_buffers: u32,

    last_index_count: u32,
    dirty: DirtyFlags,
    dirty_uniform_buffers: [u32; NUM_STAGES],

    fast_bound_uniform_buffers: [u32; NUM_STAGES],
    uniform_cache_hits: [u32; 16],
    uniform_cache_shots: [u32; 16],
    uniform_buffer_skip_cache_size: u32,

    has_deleted_buffers: bool,
    cached_write_buffer_ids: Vec<BufferId>,

    uncommitted_downloads: Vec<BufferId>,
    committed_downloads: VecDeque<Vec<BufferId>>,

    immediate_buffer: Vec<u8>,
}

impl<R: HostRuntime, M: GuestMemory> BufferCache<R, M> {
    pub fn new(mut runtime: R, guest_memory: M, config: CacheConfig) -> Self {
        let mut slot_buffers = SlotArena::new();
        let null_host = runtime.create_buffer(0);
        let null_id = slot_buffers.insert(Buffer::null(null_host));
        debug_assert!(null_id.is_null());

        Self {
            runtime,
            guest_memory,
            config,
            slot_buffers,
            delayed_destruction_ring: DelayedDestructionRing::new(),
            page_table: PageTable::new(),
            index_buffer: NULL_BINDING,
            vertex_buffers: [NULL_BINDING; NUM_VERTEX_BUFFERS],
            uniform_buffers: [[NULL_BINDING; NUM_GRAPHICS_UNIFORM_BUFFERS]; NUM_STAGES],
            storage_buffers: [[NULL_BINDING; NUM_STORAGE_BUFFERS]; NUM_STAGES],
            transform_feedback_buffers: [NULL_BINDING; NUM_TRANSFORM_FEEDBACK_BUFFERS],
            compute_uniform_buffers: [NULL_BINDING; NUM_COMPUTE_UNIFORM_BUFFERS],
            compute_storage_buffers: [NULL_BINDING; NUM_STORAGE_BUFFERS],
            enabled_uniform_buffers: [0; NUM_STAGES],
            enabled_compute_uniform_buffers: 0,
            enabled_storage_buffers: [0; NUM_STAGES],
            written_storage_buffers: [0; NUM_STAGES],
            enabled_compute_storage_buffers: 0,
            written_compute_storage_buffers: 0,
            last_index_count: 0,
            dirty: DirtyFlags::all(),
            dirty_uniform_buffers: [0; NUM_STAGES],
            fast_bound_uniform_buffers: [0; NUM_STAGES],
            uniform_cache_hits: [0; 16],
            uniform_cache_shots: [0; 16],
            uniform_buffer_skip_cache_size: DEFAULT_SKIP_CACHE_SIZE,
            has_deleted_buffers: false,
            cached_write_buffer_ids: Vec::new(),
            uncommitted_downloads: Vec::new(),
            committed_downloads: VecDeque::new(),
            immediate_buffer: Vec::new(),
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    pub fn guest_memory(&self) -> &M {
        &self.guest_memory
    }

    pub fn guest_memory_mut(&mut self) -> &mut M {
        &mut self.guest_memory
    }

    pub fn set_config(&mut self, config: CacheConfig) {
        self.config = config;
    }

    /// Advance one frame: rotate the uniform-cache windows, re-evaluate the
    /// skip-cache threshold and age the destruction ring.
    pub fn tick_frame(&mut self) {
        let hits: u32 = self.uniform_cache_hits.iter().sum();
        let shots: u32 = self.uniform_cache_shots.iter().sum();
        self.uniform_cache_hits.copy_within(0..15, 1);
        self.uniform_cache_shots.copy_within(0..15, 1);
        self.uniform_cache_hits[0] = 0;
        self.uniform_cache_shots[0] = 0;

        // Hit rate below ~98%: the cached path keeps re-uploading, so prefer
        // skipping the cache for small uniform buffers.
        let skip_preferred = hits * 256 < shots * 251;
        self.uniform_buffer_skip_cache_size = if skip_preferred {
            DEFAULT_SKIP_CACHE_SIZE
        } else {
            0
        };

        self.delayed_destruction_ring.tick();
    }

    /// The guest CPU wrote `[cpu_addr, cpu_addr + size)`.
    pub fn write_memory(&mut self, cpu_addr: VAddr, size: u64) {
        for buffer_id in self.buffers_in_range(cpu_addr, size) {
            self.slot_buffers[buffer_id].mark_region_as_cpu_modified(cpu_addr, size);
        }
    }

    /// Same as [`write_memory`](Self::write_memory), but queued for lazy
    /// flushing via [`flush_cached_writes`](Self::flush_cached_writes).
    pub fn cached_write_memory(&mut self, cpu_addr: VAddr, size: u64) {
        for buffer_id in self.buffers_in_range(cpu_addr, size) {
            let buffer = &mut self.slot_buffers[buffer_id];
            if !buffer.has_cached_writes() {
                self.cached_write_buffer_ids.push(buffer_id);
            }
            buffer.cached_cpu_write(cpu_addr, size);
        }
    }

    pub fn flush_cached_writes(&mut self) {
        for buffer_id in std::mem::take(&mut self.cached_write_buffer_ids) {
            self.slot_buffers[buffer_id].flush_cached_writes();
        }
    }

    /// Write every GPU-modified byte of `[cpu_addr, cpu_addr + size)` back to
    /// guest memory.
    pub fn download_memory(&mut self, cpu_addr: VAddr, size: u64) {
        for buffer_id in self.buffers_in_range(cpu_addr, size) {
            self.download_buffer_memory(buffer_id, cpu_addr, size);
        }
    }

    /// Is any byte of the region marked GPU-modified?
    pub fn is_region_gpu_modified(&self, cpu_addr: VAddr, size: u64) -> bool {
        let page_end = (cpu_addr + size).div_ceil(PAGE_SIZE);
        let mut page = cpu_addr >> PAGE_BITS;
        while page < page_end {
            let buffer_id = self.page_table.get(page);
            if buffer_id.is_null() {
                page += 1;
                continue;
            }
            let buffer = &self.slot_buffers[buffer_id];
            if buffer.is_region_gpu_modified(cpu_addr, size) {
                return true;
            }
            page = (buffer.cpu_addr() + buffer.size_bytes()).div_ceil(PAGE_SIZE);
        }
        false
    }

    /// Record a uniform-buffer bind request. The buffer is resolved during
    /// the next update pass.
    pub fn bind_graphics_uniform_buffer(
        &mut self,
        stage: usize,
        index: u32,
        gpu_addr: GpuVAddr,
        size: u32,
    ) {
        let binding = match self.guest_memory.gpu_to_cpu_address(gpu_addr) {
            Some(cpu_addr) => Binding {
                cpu_addr,
                size,
                buffer_id: BufferId::NULL,
            },
            None => NULL_BINDING,
        };
        self.uniform_buffers[stage][index as usize] = binding;
    }

    pub fn disable_graphics_uniform_buffer(&mut self, stage: usize, index: u32) {
        self.uniform_buffers[stage][index as usize] = NULL_BINDING;
    }

    pub fn set_enabled_uniform_buffers(&mut self, stage: usize, enabled: u32) {
        if R::HAS_PERSISTENT_UNIFORM_BUFFER_BINDINGS
            && self.enabled_uniform_buffers[stage] != enabled
        {
            // Persistent host state may hold stale slots for the new mask.
            self.dirty_uniform_buffers[stage] = u32::MAX;
        }
        self.enabled_uniform_buffers[stage] = enabled;
    }

    pub fn set_enabled_compute_uniform_buffers(&mut self, enabled: u32) {
        self.enabled_compute_uniform_buffers = enabled;
    }

    pub fn unbind_graphics_storage_buffers(&mut self, stage: usize) {
        self.enabled_storage_buffers[stage] = 0;
        self.written_storage_buffers[stage] = 0;
    }

    /// Record a storage-buffer bind request; the descriptor `(gpu_addr, size)`
    /// is read from the const buffer at `cbuf_index` + `cbuf_offset`.
    pub fn bind_graphics_storage_buffer(
        &mut self,
        regs: &GraphicsRegs,
        stage: usize,
        ssbo_index: usize,
        cbuf_index: u32,
        cbuf_offset: u32,
        is_written: bool,
    ) {
        self.enabled_storage_buffers[stage] |= 1 << ssbo_index;
        self.written_storage_buffers[stage] |= (is_written as u32) << ssbo_index;

        let ssbo_addr =
            regs.const_buffers[stage][cbuf_index as usize].address + u64::from(cbuf_offset);
        self.storage_buffers[stage][ssbo_index] = self.storage_buffer_binding(ssbo_addr);
    }

    pub fn unbind_compute_storage_buffers(&mut self) {
        self.enabled_compute_storage_buffers = 0;
        self.written_compute_storage_buffers = 0;
    }

    pub fn bind_compute_storage_buffer(
        &mut self,
        regs: &ComputeRegs,
        ssbo_index: usize,
        cbuf_index: u32,
        cbuf_offset: u32,
        is_written: bool,
    ) {
        self.enabled_compute_storage_buffers |= 1 << ssbo_index;
        self.written_compute_storage_buffers |= (is_written as u32) << ssbo_index;

        debug_assert!((regs.const_buffer_enable_mask >> cbuf_index) & 1 != 0);
        let ssbo_addr =
            regs.const_buffers[cbuf_index as usize].address + u64::from(cbuf_offset);
        self.compute_storage_buffers[ssbo_index] = self.storage_buffer_binding(ssbo_addr);
    }

    /// Resolve every graphics binding, retrying while coalescing deletes
    /// buffers out from under already-resolved bindings.
    pub fn update_graphics_buffers(&mut self, regs: &GraphicsRegs, is_indexed: bool) {
        for _ in 0..MAX_UPDATE_PASSES {
            self.has_deleted_buffers = false;
            self.do_update_graphics_buffers(regs, is_indexed);
            if !self.has_deleted_buffers {
                return;
            }
        }
        debug_assert!(false, "graphics buffer update did not converge");
    }

    pub fn update_compute_buffers(&mut self, regs: &ComputeRegs) {
        for _ in 0..MAX_UPDATE_PASSES {
            self.has_deleted_buffers = false;
            self.do_update_compute_buffers(regs);
            if !self.has_deleted_buffers {
                return;
            }
        }
        debug_assert!(false, "compute buffer update did not converge");
    }

    /// Upload and bind index/vertex/transform-feedback buffers.
    pub fn bind_host_geometry_buffers(&mut self, regs: &GraphicsRegs, is_indexed: bool) {
        if is_indexed {
            self.bind_host_index_buffer(regs);
        } else if !R::HAS_FULL_INDEX_AND_PRIMITIVE_SUPPORT
            && regs.topology == PrimitiveTopology::Quads
        {
            self.runtime
                .bind_quad_array_index_buffer(regs.vertex_first, regs.vertex_count);
        }
        self.bind_host_vertex_buffers(regs);
        self.bind_host_transform_feedback_buffers(regs);
    }

    /// Upload and bind one stage's uniform and storage buffers.
    pub fn bind_host_stage_buffers(&mut self, stage: usize) {
        self.bind_host_graphics_uniform_buffers(stage);
        self.bind_host_graphics_storage_buffers(stage);
    }

    pub fn bind_host_compute_buffers(&mut self) {
        self.bind_host_compute_uniform_buffers();
        self.bind_host_compute_storage_buffers();
    }

    pub fn has_uncommitted_flushes(&self) -> bool {
        !self.uncommitted_downloads.is_empty()
    }

    pub fn should_wait_async_flushes(&self) -> bool {
        self.committed_downloads
            .back()
            .is_some_and(|ids| !ids.is_empty())
    }

    /// Snapshot the pending GPU-written buffer list for asynchronous
    /// readback.
    pub fn commit_async_flushes(&mut self) {
        let snapshot = std::mem::take(&mut self.uncommitted_downloads);
        self.committed_downloads.push_front(snapshot);
    }

    /// Drain the oldest committed download list back into guest memory.
    pub fn pop_async_flushes(&mut self) {
        let Some(download_ids) = self.committed_downloads.pop_back() else {
            return;
        };
        if download_ids.is_empty() {
            return;
        }
        let mut downloads: Vec<(BufferCopy, BufferId)> = Vec::new();
        let mut total_size_bytes = 0u64;
        let mut largest_copy = 0u64;
        for &buffer_id in &download_ids {
            self.slot_buffers[buffer_id].for_each_download_range_all(|offset, len| {
                downloads.push((
                    BufferCopy {
                        src_offset: offset,
                        dst_offset: total_size_bytes,
                        size: len,
                    },
                    buffer_id,
                ));
                total_size_bytes += len;
                largest_copy = largest_copy.max(len);
            });
        }
        if downloads.is_empty() {
            return;
        }
        if R::USE_MEMORY_MAPS {
            let staging = self.runtime.download_staging_buffer(total_size_bytes);
            for (copy, buffer_id) in &mut downloads {
                copy.dst_offset += staging.offset;
                self.runtime.copy_buffer(
                    &staging.buffer,
                    self.slot_buffers[*buffer_id].host(),
                    std::slice::from_ref(copy),
                );
            }
            self.runtime.finish();
            let span = self.runtime.staging_span(&staging);
            for (copy, buffer_id) in &downloads {
                let cpu_addr = self.slot_buffers[*buffer_id].cpu_addr() + copy.src_offset;
                let mapped_offset = (copy.dst_offset - staging.offset) as usize;
                self.guest_memory.write_block(
                    cpu_addr,
                    &span[mapped_offset..mapped_offset + copy.size as usize],
                );
            }
        } else {
            self.grow_immediate_buffer(largest_copy as usize);
            for (copy, buffer_id) in &downloads {
                let size = copy.size as usize;
                self.runtime.download_buffer_data(
                    self.slot_buffers[*buffer_id].host(),
                    copy.src_offset,
                    &mut self.immediate_buffer[..size],
                );
                let cpu_addr = self.slot_buffers[*buffer_id].cpu_addr() + copy.src_offset;
                self.guest_memory
                    .write_block(cpu_addr, &self.immediate_buffer[..size]);
            }
        }
    }

    /// Find the buffer backing `[cpu_addr, cpu_addr + size)`, creating (and
    /// coalescing) one if no resident buffer fully contains the range.
    pub fn find_buffer(&mut self, cpu_addr: VAddr, size: u32) -> BufferId {
        if cpu_addr == 0 {
            return BufferId::NULL;
        }
        let buffer_id = self.page_table.lookup(cpu_addr);
        if !buffer_id.is_null()
            && self.slot_buffers[buffer_id].is_in_bounds(cpu_addr, u64::from(size))
        {
            return buffer_id;
        }
        self.create_buffer(cpu_addr, size)
    }

    // Introspection used by the renderer's debug overlay and by tests.

    pub fn buffer_at(&self, cpu_addr: VAddr) -> BufferId {
        self.page_table.lookup(cpu_addr)
    }

    pub fn buffer_range(&self, buffer_id: BufferId) -> Range<VAddr> {
        let buffer = &self.slot_buffers[buffer_id];
        buffer.cpu_addr()..buffer.cpu_addr() + buffer.size_bytes()
    }

    pub fn buffer_stream_score(&self, buffer_id: BufferId) -> u32 {
        self.slot_buffers[buffer_id].stream_score()
    }

    /// The host buffer backing a live slot.
    pub fn host_buffer(&self, buffer_id: BufferId) -> &R::Buffer {
        self.slot_buffers[buffer_id].host()
    }

    /// Live buffers, excluding the null buffer.
    pub fn live_buffers(&self) -> usize {
        self.slot_buffers.len() - 1
    }

    /// Current-frame (hits, shots) of the uniform cache windows.
    pub fn uniform_cache_counters(&self) -> (u32, u32) {
        (self.uniform_cache_hits[0], self.uniform_cache_shots[0])
    }

    pub fn uniform_buffer_skip_cache_size(&self) -> u32 {
        self.uniform_buffer_skip_cache_size
    }

    // Register-write notifications from the rasterizer front-end.

    pub fn mark_index_buffer_dirty(&mut self) {
        self.dirty.index_buffer = true;
    }

    pub fn mark_vertex_buffer_dirty(&mut self, index: usize) {
        self.dirty.vertex_buffers = true;
        self.dirty.vertex_buffer[index] = true;
    }

    pub fn mark_vertex_buffers_dirty(&mut self) {
        self.dirty.vertex_buffers = true;
        self.dirty.vertex_buffer = [true; NUM_VERTEX_BUFFERS];
    }

    fn do_update_graphics_buffers(&mut self, regs: &GraphicsRegs, is_indexed: bool) {
        if is_indexed {
            self.update_index_buffer(regs);
        }
        self.update_vertex_buffers(regs);
        self.update_transform_feedback_buffers(regs);
        for stage in 0..NUM_STAGES {
            self.update_uniform_buffers(stage);
            self.update_storage_buffers(stage);
        }
    }

    fn do_update_compute_buffers(&mut self, regs: &ComputeRegs) {
        self.update_compute_uniform_buffers(regs);
        self.update_compute_storage_buffers();
    }

    fn update_index_buffer(&mut self, regs: &GraphicsRegs) {
        // Index count changes are not always flag-driven, so compare counts
        // as well.
        let index_array = &regs.index_buffer;
        if !self.dirty.index_buffer && self.last_index_count == index_array.count {
            return;
        }
        self.dirty.index_buffer = false;
        self.last_index_count = index_array.count;

        let cpu_addr = self.guest_memory.gpu_to_cpu_address(index_array.start_addr);
        let address_size = index_array.end_addr.saturating_sub(index_array.start_addr) as u32;
        let draw_size = index_array
            .count
            .saturating_mul(index_array.format.bytes_per_index());
        let size = address_size.min(draw_size);
        let Some(cpu_addr) = cpu_addr else {
            self.index_buffer = NULL_BINDING;
            return;
        };
        if size == 0 {
            self.index_buffer = NULL_BINDING;
            return;
        }
        self.index_buffer = Binding {
            cpu_addr,
            size,
            buffer_id: self.find_buffer(cpu_addr, size),
        };
    }

    fn update_vertex_buffers(&mut self, regs: &GraphicsRegs) {
        if !self.dirty.vertex_buffers {
            return;
        }
        self.dirty.vertex_buffers = false;
        for index in 0..NUM_VERTEX_BUFFERS {
            self.update_vertex_buffer(regs, index);
        }
    }

    fn update_vertex_buffer(&mut self, regs: &GraphicsRegs, index: usize) {
        if !self.dirty.vertex_buffer[index] {
            return;
        }
        let array = &regs.vertex_buffers[index];
        let gpu_addr_begin = array.start_addr;
        let gpu_addr_end = array.limit_addr.saturating_add(1);
        let cpu_addr = self.guest_memory.gpu_to_cpu_address(gpu_addr_begin);
        // TODO: narrow the size with stride and vertex-count analysis.
        let size = gpu_addr_end.saturating_sub(gpu_addr_begin) as u32;
        let binding = match cpu_addr {
            Some(cpu_addr) if array.enable && size != 0 => Binding {
                cpu_addr,
                size,
                buffer_id: self.find_buffer(cpu_addr, size),
            },
            _ => NULL_BINDING,
        };
        self.vertex_buffers[index] = binding;
    }

    fn update_uniform_buffers(&mut self, stage: usize) {
        let enabled = self.enabled_uniform_buffers[stage];
        for_each_enabled_bit(enabled, |index| {
            let binding = self.uniform_buffers[stage][index as usize];
            if !binding.buffer_id.is_null() {
                // Already resolved.
                return;
            }
            if R::HAS_PERSISTENT_UNIFORM_BUFFER_BINDINGS {
                self.dirty_uniform_buffers[stage] |= 1 << index;
            }
            let buffer_id = self.find_buffer(binding.cpu_addr, binding.size);
            self.uniform_buffers[stage][index as usize].buffer_id = buffer_id;
        });
    }

    fn update_storage_buffers(&mut self, stage: usize) {
        let enabled = self.enabled_storage_buffers[stage];
        let written_mask = self.written_storage_buffers[stage];
        for_each_enabled_bit(enabled, |index| {
            let binding = self.storage_buffers[stage][index as usize];
            let buffer_id = self.find_buffer(binding.cpu_addr, binding.size);
            self.storage_buffers[stage][index as usize].buffer_id = buffer_id;
            if (written_mask >> index) & 1 != 0 {
                self.mark_written_buffer(buffer_id, binding.cpu_addr, binding.size);
            }
        });
    }

    fn update_transform_feedback_buffers(&mut self, regs: &GraphicsRegs) {
        if !regs.tfb_enabled {
            return;
        }
        for index in 0..NUM_TRANSFORM_FEEDBACK_BUFFERS {
            self.update_transform_feedback_buffer(regs, index);
        }
    }

    fn update_transform_feedback_buffer(&mut self, regs: &GraphicsRegs, index: usize) {
        let binding_regs = &regs.tfb_bindings[index];
        let gpu_addr = binding_regs.address + u64::from(binding_regs.buffer_offset);
        let size = binding_regs.size;
        let cpu_addr = self.guest_memory.gpu_to_cpu_address(gpu_addr);
        let (Some(cpu_addr), true) = (cpu_addr, binding_regs.enable && size != 0) else {
            self.transform_feedback_buffers[index] = NULL_BINDING;
            return;
        };
        let buffer_id = self.find_buffer(cpu_addr, size);
        self.transform_feedback_buffers[index] = Binding {
            cpu_addr,
            size,
            buffer_id,
        };
        // The GPU writes transform feedback output.
        self.mark_written_buffer(buffer_id, cpu_addr, size);
    }

    fn update_compute_uniform_buffers(&mut self, regs: &ComputeRegs) {
        let enabled = self.enabled_compute_uniform_buffers;
        for_each_enabled_bit(enabled, |index| {
            let mut binding = NULL_BINDING;
            if (regs.const_buffer_enable_mask >> index) & 1 != 0 {
                let cbuf = regs.const_buffers[index as usize];
                if let Some(cpu_addr) = self.guest_memory.gpu_to_cpu_address(cbuf.address) {
                    binding.cpu_addr = cpu_addr;
                    binding.size = cbuf.size;
                }
            }
            binding.buffer_id = self.find_buffer(binding.cpu_addr, binding.size);
            self.compute_uniform_buffers[index as usize] = binding;
        });
    }

    fn update_compute_storage_buffers(&mut self) {
        let enabled = self.enabled_compute_storage_buffers;
        let written_mask = self.written_compute_storage_buffers;
        for_each_enabled_bit(enabled, |index| {
            let binding = self.compute_storage_buffers[index as usize];
            let buffer_id = self.find_buffer(binding.cpu_addr, binding.size);
            self.compute_storage_buffers[index as usize].buffer_id = buffer_id;
            if (written_mask >> index) & 1 != 0 {
                self.mark_written_buffer(buffer_id, binding.cpu_addr, binding.size);
            }
        });
    }

    fn mark_written_buffer(&mut self, buffer_id: BufferId, cpu_addr: VAddr, size: u32) {
        if buffer_id.is_null() {
            return;
        }
        self.slot_buffers[buffer_id].mark_region_as_gpu_modified(cpu_addr, u64::from(size));

        if !self.config.gpu_accuracy_high || !self.config.use_asynchronous_gpu {
            return;
        }
        if self.uncommitted_downloads.contains(&buffer_id) {
            return;
        }
        self.uncommitted_downloads.push(buffer_id);
    }

    fn storage_buffer_binding(&self, ssbo_addr: GpuVAddr) -> Binding {
        let gpu_addr: u64 = self.guest_memory.read(ssbo_addr);
        let size: u32 = self.guest_memory.read(ssbo_addr + 8);
        let Some(cpu_addr) = self.guest_memory.gpu_to_cpu_address(gpu_addr) else {
            debug!(ssbo_addr, gpu_addr, "storage descriptor points at unmapped memory");
            return NULL_BINDING;
        };
        if size == 0 {
            return NULL_BINDING;
        }
        // Some titles read past the descriptor's declared size; bind extra
        // slack, capped at the end of the GPU mapping.
        const ARBITRARY_EXTRA_BYTES: u64 = 0xc000;
        let bytes_to_map_end = self.guest_memory.bytes_to_map_end(gpu_addr);
        let size = (u64::from(size) + ARBITRARY_EXTRA_BYTES).min(bytes_to_map_end) as u32;
        Binding {
            cpu_addr,
            size,
            buffer_id: BufferId::NULL,
        }
    }

    fn bind_host_index_buffer(&mut self, regs: &GraphicsRegs) {
        let binding = self.index_buffer;
        self.synchronize_buffer(binding.buffer_id, binding.cpu_addr, binding.size);
        let buffer = &self.slot_buffers[binding.buffer_id];
        let offset = buffer.offset(binding.cpu_addr);
        if R::HAS_FULL_INDEX_AND_PRIMITIVE_SUPPORT {
            self.runtime
                .bind_index_buffer(buffer.host(), offset, binding.size);
        } else {
            let index_array = &regs.index_buffer;
            self.runtime.bind_index_buffer_expanded(
                regs.topology,
                index_array.format,
                index_array.first,
                index_array.count,
                buffer.host(),
                offset,
                binding.size,
            );
        }
    }

    fn bind_host_vertex_buffers(&mut self, regs: &GraphicsRegs) {
        for index in 0..NUM_VERTEX_BUFFERS {
            let binding = self.vertex_buffers[index];
            self.synchronize_buffer(binding.buffer_id, binding.cpu_addr, binding.size);
            if !self.dirty.vertex_buffer[index] {
                continue;
            }
            self.dirty.vertex_buffer[index] = false;

            let stride = regs.vertex_buffers[index].stride;
            let buffer = &self.slot_buffers[binding.buffer_id];
            let offset = buffer.offset(binding.cpu_addr);
            self.runtime
                .bind_vertex_buffer(index as u32, buffer.host(), offset, binding.size, stride);
        }
    }

    fn bind_host_graphics_uniform_buffers(&mut self, stage: usize) {
        let mut dirty = u32::MAX;
        if R::HAS_PERSISTENT_UNIFORM_BUFFER_BINDINGS {
            dirty = std::mem::replace(&mut self.dirty_uniform_buffers[stage], 0);
        }
        let enabled = self.enabled_uniform_buffers[stage];
        let mut binding_index = 0u32;
        for_each_enabled_bit(enabled, |index| {
            let needs_bind = (dirty >> index) & 1 != 0;
            self.bind_host_graphics_uniform_buffer(stage, index, binding_index, needs_bind);
            if R::NEEDS_BIND_UNIFORM_INDEX {
                binding_index += 1;
            }
        });
    }

    fn bind_host_graphics_uniform_buffer(
        &mut self,
        stage: usize,
        index: u32,
        binding_index: u32,
        needs_bind: bool,
    ) {
        let binding = self.uniform_buffers[stage][index as usize];
        let cpu_addr = binding.cpu_addr;
        let size = binding.size;
        let buffer_id = binding.buffer_id;

        let use_fast_buffer = !buffer_id.is_null()
            && size <= self.uniform_buffer_skip_cache_size
            && !self.slot_buffers[buffer_id].is_region_gpu_modified(cpu_addr, u64::from(size));
        if use_fast_buffer {
            if R::IS_OPENGL && self.runtime.has_fast_buffer_sub_data() {
                // Driver-side small-push path; the cache is bypassed
                // entirely.
                if !self.has_fast_uniform_buffer_bound(stage, binding_index) {
                    self.runtime
                        .bind_fast_uniform_buffer(stage, binding_index, size);
                }
                self.fast_bound_uniform_buffers[stage] |= 1 << binding_index;
                self.push_uniform_buffer_data(cpu_addr, size, stage, binding_index);
                return;
            }
            self.fast_bound_uniform_buffers[stage] |= 1 << binding_index;

            // Stream path: fill the mapped host span straight from guest
            // memory.
            let span = self.runtime.map_uniform_buffer(stage, binding_index, size);
            self.guest_memory
                .read_block(cpu_addr, &mut span[..size as usize]);
            return;
        }
        // Classic cached path.
        let sync_cached = self.synchronize_buffer(buffer_id, cpu_addr, size);
        if sync_cached {
            self.uniform_cache_hits[0] += 1;
        }
        self.uniform_cache_shots[0] += 1;

        if !needs_bind && !self.has_fast_uniform_buffer_bound(stage, binding_index) {
            // Nothing changed and no fast slot to displace.
            return;
        }
        self.fast_bound_uniform_buffers[stage] &= !(1 << binding_index);

        let buffer = &self.slot_buffers[buffer_id];
        let offset = buffer.offset(cpu_addr);
        self.runtime
            .bind_uniform_buffer(stage, binding_index, buffer.host(), offset, size);
    }

    fn bind_host_graphics_storage_buffers(&mut self, stage: usize) {
        let enabled = self.enabled_storage_buffers[stage];
        let written_mask = self.written_storage_buffers[stage];
        let mut binding_index = 0u32;
        for_each_enabled_bit(enabled, |index| {
            let binding = self.storage_buffers[stage][index as usize];
            self.synchronize_buffer(binding.buffer_id, binding.cpu_addr, binding.size);

            let is_written = (written_mask >> index) & 1 != 0;
            let buffer = &self.slot_buffers[binding.buffer_id];
            let offset = buffer.offset(binding.cpu_addr);
            if R::NEEDS_BIND_STORAGE_INDEX {
                self.runtime.bind_storage_buffer(
                    stage,
                    binding_index,
                    buffer.host(),
                    offset,
                    binding.size,
                    is_written,
                );
                binding_index += 1;
            } else {
                self.runtime.bind_storage_buffer(
                    stage,
                    index,
                    buffer.host(),
                    offset,
                    binding.size,
                    is_written,
                );
            }
        });
    }

    fn bind_host_transform_feedback_buffers(&mut self, regs: &GraphicsRegs) {
        if !regs.tfb_enabled {
            return;
        }
        for index in 0..NUM_TRANSFORM_FEEDBACK_BUFFERS {
            let binding = self.transform_feedback_buffers[index];
            self.synchronize_buffer(binding.buffer_id, binding.cpu_addr, binding.size);
            let buffer = &self.slot_buffers[binding.buffer_id];
            let offset = buffer.offset(binding.cpu_addr);
            self.runtime.bind_transform_feedback_buffer(
                index as u32,
                buffer.host(),
                offset,
                binding.size,
            );
        }
    }

    fn bind_host_compute_uniform_buffers(&mut self) {
        if R::HAS_PERSISTENT_UNIFORM_BUFFER_BINDINGS {
            // Compute dispatches clobber the persistent graphics uniform
            // state.
            self.dirty_uniform_buffers = [u32::MAX; NUM_STAGES];
        }
        let enabled = self.enabled_compute_uniform_buffers;
        let mut binding_index = 0u32;
        for_each_enabled_bit(enabled, |index| {
            let binding = self.compute_uniform_buffers[index as usize];
            self.synchronize_buffer(binding.buffer_id, binding.cpu_addr, binding.size);
            let buffer = &self.slot_buffers[binding.buffer_id];
            let offset = buffer.offset(binding.cpu_addr);
            if R::NEEDS_BIND_UNIFORM_INDEX {
                self.runtime.bind_compute_uniform_buffer(
                    binding_index,
                    buffer.host(),
                    offset,
                    binding.size,
                );
                binding_index += 1;
            } else {
                self.runtime
                    .bind_compute_uniform_buffer(index, buffer.host(), offset, binding.size);
            }
        });
    }

    fn bind_host_compute_storage_buffers(&mut self) {
        let enabled = self.enabled_compute_storage_buffers;
        let written_mask = self.written_compute_storage_buffers;
        let mut binding_index = 0u32;
        for_each_enabled_bit(enabled, |index| {
            let binding = self.compute_storage_buffers[index as usize];
            self.synchronize_buffer(binding.buffer_id, binding.cpu_addr, binding.size);

            let is_written = (written_mask >> index) & 1 != 0;
            let buffer = &self.slot_buffers[binding.buffer_id];
            let offset = buffer.offset(binding.cpu_addr);
            if R::NEEDS_BIND_STORAGE_INDEX {
                self.runtime.bind_compute_storage_buffer(
                    binding_index,
                    buffer.host(),
                    offset,
                    binding.size,
                    is_written,
                );
                binding_index += 1;
            } else {
                self.runtime.bind_compute_storage_buffer(
                    index,
                    buffer.host(),
                    offset,
                    binding.size,
                    is_written,
                );
            }
        });
    }

    fn has_fast_uniform_buffer_bound(&self, stage: usize, binding_index: u32) -> bool {
        if R::IS_OPENGL {
            (self.fast_bound_uniform_buffers[stage] >> binding_index) & 1 != 0
        } else {
            // Only the GL-family runtime has fast uniform buffers.
            false
        }
    }

    /// Feed a fast uniform push from guest memory, through scratch if the
    /// mapped guest pointer is not contiguous over the range.
    fn push_uniform_buffer_data(
        &mut self,
        cpu_addr: VAddr,
        size: u32,
        stage: usize,
        binding_index: u32,
    ) {
        let len = size as usize;
        if let Some(data) = self.guest_memory.page_slice(cpu_addr, len) {
            self.runtime
                .push_fast_uniform_buffer(stage, binding_index, data);
        } else {
            self.grow_immediate_buffer(len);
            self.guest_memory
                .read_block(cpu_addr, &mut self.immediate_buffer[..len]);
            self.runtime.push_fast_uniform_buffer(
                stage,
                binding_index,
                &self.immediate_buffer[..len],
            );
        }
    }

    /// Upload every CPU-modified range of the binding window. Returns true
    /// when the buffer was already clean.
    fn synchronize_buffer(&mut self, buffer_id: BufferId, cpu_addr: VAddr, size: u32) -> bool {
        if self.slot_buffers[buffer_id].cpu_addr() == 0 {
            // Null buffer; nothing to upload.
            return true;
        }
        let mut copies = Vec::new();
        let mut total_size_bytes = 0u64;
        let mut largest_copy = 0u64;
        self.slot_buffers[buffer_id].for_each_upload_range(
            cpu_addr,
            u64::from(size),
            |offset, len| {
                copies.push(BufferCopy {
                    src_offset: total_size_bytes,
                    dst_offset: offset,
                    size: len,
                });
                total_size_bytes += len;
                largest_copy = largest_copy.max(len);
            },
        );
        if copies.is_empty() {
            return true;
        }
        if R::USE_MEMORY_MAPS {
            self.mapped_upload_memory(buffer_id, total_size_bytes, &mut copies);
        } else {
            self.immediate_upload_memory(buffer_id, largest_copy, &copies);
        }
        false
    }

    fn mapped_upload_memory(
        &mut self,
        buffer_id: BufferId,
        total_size_bytes: u64,
        copies: &mut [BufferCopy],
    ) {
        let staging = self.runtime.upload_staging_buffer(total_size_bytes);
        let buffer_addr = self.slot_buffers[buffer_id].cpu_addr();
        {
            let span = self.runtime.staging_span_mut(&staging);
            for copy in copies.iter_mut() {
                let cpu_addr = buffer_addr + copy.dst_offset;
                self.guest_memory.read_block(
                    cpu_addr,
                    &mut span[copy.src_offset as usize..(copy.src_offset + copy.size) as usize],
                );
                // The copy batch addresses the staging buffer, not the span.
                copy.src_offset += staging.offset;
            }
        }
        self.runtime
            .copy_buffer(self.slot_buffers[buffer_id].host(), &staging.buffer, copies);
    }

    fn immediate_upload_memory(
        &mut self,
        buffer_id: BufferId,
        largest_copy: u64,
        copies: &[BufferCopy],
    ) {
        let buffer_addr = self.slot_buffers[buffer_id].cpu_addr();
        for copy in copies {
            let cpu_addr = buffer_addr + copy.dst_offset;
            let size = copy.size as usize;
            if is_range_granular(cpu_addr, copy.size) {
                if let Some(data) = self.guest_memory.page_slice(cpu_addr, size) {
                    self.runtime.upload_buffer_data(
                        self.slot_buffers[buffer_id].host(),
                        copy.dst_offset,
                        data,
                    );
                    continue;
                }
            }
            self.grow_immediate_buffer(largest_copy as usize);
            self.guest_memory
                .read_block(cpu_addr, &mut self.immediate_buffer[..size]);
            self.runtime.upload_buffer_data(
                self.slot_buffers[buffer_id].host(),
                copy.dst_offset,
                &self.immediate_buffer[..size],
            );
        }
    }

    fn download_buffer_memory(&mut self, buffer_id: BufferId, cpu_addr: VAddr, size: u64) {
        let mut copies = Vec::new();
        let mut total_size_bytes = 0u64;
        let mut largest_copy = 0u64;
        self.slot_buffers[buffer_id].for_each_download_range(cpu_addr, size, |offset, len| {
            copies.push(BufferCopy {
                src_offset: offset,
                dst_offset: total_size_bytes,
                size: len,
            });
            total_size_bytes += len;
            largest_copy = largest_copy.max(len);
        });
        if copies.is_empty() {
            return;
        }
        let buffer_addr = self.slot_buffers[buffer_id].cpu_addr();
        if R::USE_MEMORY_MAPS {
            let staging = self.runtime.download_staging_buffer(total_size_bytes);
            for copy in &mut copies {
                copy.dst_offset += staging.offset;
            }
            self.runtime.copy_buffer(
                &staging.buffer,
                self.slot_buffers[buffer_id].host(),
                &copies,
            );
            self.runtime.finish();
            let span = self.runtime.staging_span(&staging);
            for copy in &copies {
                let copy_cpu_addr = buffer_addr + copy.src_offset;
                let mapped_offset = (copy.dst_offset - staging.offset) as usize;
                self.guest_memory.write_block(
                    copy_cpu_addr,
                    &span[mapped_offset..mapped_offset + copy.size as usize],
                );
            }
        } else {
            self.grow_immediate_buffer(largest_copy as usize);
            for copy in &copies {
                let size = copy.size as usize;
                self.runtime.download_buffer_data(
                    self.slot_buffers[buffer_id].host(),
                    copy.src_offset,
                    &mut self.immediate_buffer[..size],
                );
                self.guest_memory
                    .write_block(buffer_addr + copy.src_offset, &self.immediate_buffer[..size]);
            }
        }
    }

    /// Collect buffers overlapping `[cpu_addr, cpu_addr + wanted_size)` and
    /// the widened extent subsuming them all.
    fn resolve_overlaps(&mut self, cpu_addr: VAddr, wanted_size: u32) -> OverlapResult {
        const STREAM_LEAP_THRESHOLD: u32 = 16;
        let mut ids = Vec::new();
        let mut begin = cpu_addr;
        let mut end = cpu_addr + u64::from(wanted_size);
        let mut stream_score = 0u32;
        let mut has_stream_leap = false;

        let mut addr = cpu_addr;
        while addr >> PAGE_BITS < end.div_ceil(PAGE_SIZE) {
            let overlap_id = self.page_table.lookup(addr);
            if overlap_id.is_null() {
                addr += PAGE_SIZE;
                continue;
            }
            let overlap = &mut self.slot_buffers[overlap_id];
            if overlap.is_picked() {
                addr += PAGE_SIZE;
                continue;
            }
            ids.push(overlap_id);
            overlap.pick();
            let overlap_cpu_addr = overlap.cpu_addr();
            if overlap_cpu_addr < begin {
                // Rewind so buffers straddling pages before the original
                // range are picked up too; the scan resumes one page past
                // the new begin, which belongs to the buffer just picked.
                begin = overlap_cpu_addr;
                addr = begin;
            }
            end = end.max(overlap_cpu_addr + overlap.size_bytes());

            stream_score += overlap.stream_score();
            if stream_score > STREAM_LEAP_THRESHOLD && !has_stream_leap {
                // This region keeps getting rejoined; it is behaving like a
                // stream/ring. Give it headroom instead of recreating it.
                has_stream_leap = true;
                end += PAGE_SIZE * 256;
            }
            addr += PAGE_SIZE;
        }
        OverlapResult {
            ids,
            begin,
            end,
            has_stream_leap,
        }
    }

    fn create_buffer(&mut self, cpu_addr: VAddr, wanted_size: u32) -> BufferId {
        let overlap = self.resolve_overlaps(cpu_addr, wanted_size);
        let size = overlap.end - overlap.begin;
        let host = self.runtime.create_buffer(size);
        let new_buffer_id = self.slot_buffers.insert(Buffer::new(host, overlap.begin, size));
        debug!(
            begin = overlap.begin,
            size,
            merged = overlap.ids.len(),
            stream_leap = overlap.has_stream_leap,
            "created buffer"
        );
        for overlap_id in overlap.ids {
            self.join_overlap(new_buffer_id, overlap_id, !overlap.has_stream_leap);
        }
        self.register(new_buffer_id);
        new_buffer_id
    }

    /// Absorb `overlap_id` into `new_buffer_id`: migrate its GPU-modified
    /// ranges through host copies, relink its download-queue entries, and
    /// delete it.
    fn join_overlap(
        &mut self,
        new_buffer_id: BufferId,
        overlap_id: BufferId,
        accumulate_stream_score: bool,
    ) {
        let (overlap_cpu_addr, overlap_score) = {
            let overlap = &self.slot_buffers[overlap_id];
            (overlap.cpu_addr(), overlap.stream_score())
        };
        if accumulate_stream_score {
            self.slot_buffers[new_buffer_id].increase_stream_score(overlap_score + 1);
        }
        let dst_base_offset = overlap_cpu_addr - self.slot_buffers[new_buffer_id].cpu_addr();
        let mut copies = Vec::new();
        self.slot_buffers[overlap_id].for_each_download_range_all(|offset, len| {
            copies.push(BufferCopy {
                src_offset: offset,
                dst_offset: dst_base_offset + offset,
                size: len,
            });
        });
        {
            let new_buffer = &mut self.slot_buffers[new_buffer_id];
            for copy in &copies {
                // The migrated range is host-authoritative in the new buffer.
                new_buffer.unmark_cpu_modified_range(copy.dst_offset, copy.size);
                new_buffer.mark_gpu_modified_range(copy.dst_offset, copy.size);
            }
        }
        if !copies.is_empty() {
            self.runtime.copy_buffer(
                self.slot_buffers[new_buffer_id].host(),
                self.slot_buffers[overlap_id].host(),
                &copies,
            );
        }
        self.replace_buffer_downloads(overlap_id, new_buffer_id);
        self.delete_buffer(overlap_id);
    }

    fn register(&mut self, buffer_id: BufferId) {
        let buffer = &self.slot_buffers[buffer_id];
        let begin = buffer.cpu_addr();
        let end = begin + buffer.size_bytes();
        self.page_table.register(buffer_id, begin, end);
    }

    fn unregister(&mut self, buffer_id: BufferId) {
        let buffer = &self.slot_buffers[buffer_id];
        let begin = buffer.cpu_addr();
        let end = begin + buffer.size_bytes();
        self.page_table.unregister(buffer_id, begin, end);
    }

    fn delete_buffer(&mut self, buffer_id: BufferId) {
        fn reset(binding: &mut Binding, buffer_id: BufferId) {
            if binding.buffer_id == buffer_id {
                binding.buffer_id = BufferId::NULL;
            }
        }
        reset(&mut self.index_buffer, buffer_id);
        for binding in &mut self.vertex_buffers {
            reset(binding, buffer_id);
        }
        for stage in &mut self.uniform_buffers {
            for binding in stage {
                reset(binding, buffer_id);
            }
        }
        for stage in &mut self.storage_buffers {
            for binding in stage {
                reset(binding, buffer_id);
            }
        }
        for binding in &mut self.transform_feedback_buffers {
            reset(binding, buffer_id);
        }
        for binding in &mut self.compute_uniform_buffers {
            reset(binding, buffer_id);
        }
        for binding in &mut self.compute_storage_buffers {
            reset(binding, buffer_id);
        }
        self.cached_write_buffer_ids.retain(|&id| id != buffer_id);

        // Mark the whole extent CPU-modified to stop further write tracking.
        {
            let buffer = &mut self.slot_buffers[buffer_id];
            let (cpu_addr, size) = (buffer.cpu_addr(), buffer.size_bytes());
            buffer.mark_region_as_cpu_modified(cpu_addr, size);
        }

        self.unregister(buffer_id);
        let buffer = self.slot_buffers.remove(buffer_id);
        self.delayed_destruction_ring.push(buffer);
        self.notify_buffer_deletion();
    }

    fn replace_buffer_downloads(&mut self, old_buffer_id: BufferId, new_buffer_id: BufferId) {
        fn replace(ids: &mut Vec<BufferId>, old_buffer_id: BufferId, new_buffer_id: BufferId) {
            for id in ids.iter_mut() {
                if *id == old_buffer_id {
                    *id = new_buffer_id;
                }
            }
            // Keep only the first occurrence of the replacement; both ids may
            // already have been queued.
            let mut seen = false;
            ids.retain(|&id| {
                if id != new_buffer_id {
                    return true;
                }
                if seen {
                    return false;
                }
                seen = true;
                true
            });
        }
        replace(&mut self.uncommitted_downloads, old_buffer_id, new_buffer_id);
        for ids in &mut self.committed_downloads {
            replace(ids, old_buffer_id, new_buffer_id);
        }
    }

    fn notify_buffer_deletion(&mut self) {
        if R::HAS_PERSISTENT_UNIFORM_BUFFER_BINDINGS {
            self.dirty_uniform_buffers = [u32::MAX; NUM_STAGES];
        }
        self.dirty.index_buffer = true;
        self.dirty.vertex_buffers = true;
        self.dirty.vertex_buffer = [true; NUM_VERTEX_BUFFERS];
        self.has_deleted_buffers = true;
    }

    fn buffers_in_range(&self, cpu_addr: VAddr, size: u64) -> Vec<BufferId> {
        let mut ids = Vec::new();
        let page_end = (cpu_addr + size).div_ceil(PAGE_SIZE);
        let mut page = cpu_addr >> PAGE_BITS;
        while page < page_end {
            let buffer_id = self.page_table.get(page);
            if buffer_id.is_null() {
                page += 1;
                continue;
            }
            ids.push(buffer_id);
            let buffer = &self.slot_buffers[buffer_id];
            page = (buffer.cpu_addr() + buffer.size_bytes()).div_ceil(PAGE_SIZE);
        }
        ids
    }

    fn grow_immediate_buffer(&mut self, wanted: usize) {
        if self.immediate_buffer.len() < wanted {
            self.immediate_buffer.resize(wanted, 0);
        }
    }
}
