//! Guest GPU buffer cache for the Vesper translation layer.
//!
//! Vesper emulates a guest GPU on a host graphics API. This crate reconciles
//! the two address spaces involved — guest virtual memory on one side, host
//! buffer objects on the other — and keeps them coherent under concurrent
//! CPU writes, GPU writes and per-draw binding updates. The pieces:
//!
//! - A page-indexed catalogue mapping guest addresses to host buffer
//!   identities with O(1) bind-time lookup (see [`BufferCache::find_buffer`]).
//! - A coalescing allocator that merges overlapping guest ranges into one
//!   host buffer, migrating pending download state without dropping writes.
//! - Bidirectional dirty tracking (CPU-modified vs GPU-modified), driving
//!   on-demand upload and deferred download.
//! - A hit-rate heuristic selecting between inline and cached paths for
//!   small uniform buffers.
//!
//! The cache is generic over a [`HostRuntime`] (the host-API backend; see
//! [`WgpuRuntime`] for the wgpu one and [`software`] for the in-memory
//! reference) and a [`GuestMemory`] service. It is not internally
//! synchronized; callers that share it across threads wrap it in a mutex and
//! hold it across each operation.

mod buffer;
mod buffer_cache;
mod delayed_destruction;
mod guest_memory;
mod page_table;
mod range_set;
mod runtime;
mod slots;
pub mod software;
mod wgpu_runtime;

/// An address in the guest program's virtual space.
pub type VAddr = u64;
/// An address in the guest GPU's virtual space.
pub type GpuVAddr = u64;

pub use buffer_cache::{
    BufferCache, BufferId, CacheConfig, ComputeRegs, ConstBufferRegs, GraphicsRegs,
    IndexBufferRegs, TransformFeedbackRegs, VertexBufferRegs, DEFAULT_SKIP_CACHE_SIZE,
    NUM_COMPUTE_UNIFORM_BUFFERS, NUM_GRAPHICS_UNIFORM_BUFFERS, NUM_STAGES, NUM_STORAGE_BUFFERS,
    NUM_TRANSFORM_FEEDBACK_BUFFERS, NUM_VERTEX_BUFFERS,
};
pub use delayed_destruction::DelayedDestructionRing;
pub use guest_memory::{
    is_range_granular, GuestMemory, VecGuestMemory, GUEST_PAGE_BITS, GUEST_PAGE_MASK,
    GUEST_PAGE_SIZE,
};
pub use page_table::{ADDRESS_SPACE_BITS, PAGE_BITS, PAGE_SIZE};
pub use range_set::RangeSet;
pub use runtime::{BufferCopy, HostRuntime, IndexFormat, PrimitiveTopology, StagingLease};
pub use slots::{SlotArena, SlotId};
pub use wgpu_runtime::{
    BindingsState, BoundBuffer, IndexBinding, IndexExpansion, StageBindings, VertexBinding,
    WgpuBuffer, WgpuRuntime, WgpuRuntimeError,
};
