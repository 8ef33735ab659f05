//! Host runtime interface.
//!
//! The cache is parameterized on a [`HostRuntime`]: the layer that owns the
//! host graphics API. Capability flags are associated constants so every
//! conditional path folds at compile time per runtime type, matching the
//! zero-cost policy-bundle design of the translation layer.

/// A region copy between two host buffers (offsets in bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// A leased staging region.
///
/// `buffer` is the host staging buffer, `offset` the lease's position inside
/// it. The mapped span (length `size`) is accessed through the runtime's
/// `staging_span`/`staging_span_mut`, and copy offsets must be adjusted by
/// `offset` before the copy batch is submitted.
#[derive(Debug)]
pub struct StagingLease<B> {
    pub buffer: B,
    pub offset: u64,
    pub size: u64,
}

/// Guest index formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexFormat {
    Uint8,
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub const fn bytes_per_index(self) -> u32 {
        match self {
            IndexFormat::Uint8 => 1,
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

/// Guest primitive topologies the cache cares about.
///
/// Only `Quads` changes cache behavior (the quad-array index fallback);
/// everything else is passed through to the runtime untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimitiveTopology {
    Points,
    Lines,
    LineStrip,
    Triangles,
    TriangleStrip,
    Quads,
}

/// The host graphics runtime the cache drives.
///
/// Implementations provide buffer storage, staging leases, copy scheduling
/// and the per-class bind primitives. All methods take `&mut self`; the cache
/// itself is externally synchronized.
pub trait HostRuntime {
    /// Handle to a host buffer object. Cheap to borrow; owned by the cache's
    /// buffer slots.
    type Buffer;

    const IS_OPENGL: bool;
    const HAS_PERSISTENT_UNIFORM_BUFFER_BINDINGS: bool;
    const HAS_FULL_INDEX_AND_PRIMITIVE_SUPPORT: bool;
    const NEEDS_BIND_UNIFORM_INDEX: bool;
    const NEEDS_BIND_STORAGE_INDEX: bool;
    /// Selects the staged (memory-mapped) upload/download paths over the
    /// immediate per-copy paths.
    const USE_MEMORY_MAPS: bool;

    fn create_buffer(&mut self, size_bytes: u64) -> Self::Buffer;

    /// Lease a host-visible staging region for CPU→GPU transfers.
    fn upload_staging_buffer(&mut self, size: u64) -> StagingLease<Self::Buffer>;

    /// Lease a host-visible staging region for GPU→CPU transfers.
    fn download_staging_buffer(&mut self, size: u64) -> StagingLease<Self::Buffer>;

    /// The mapped span of a lease, for filling before an upload copy batch.
    fn staging_span_mut(&mut self, lease: &StagingLease<Self::Buffer>) -> &mut [u8];

    /// The mapped span of a lease, for reading after `finish`.
    fn staging_span(&self, lease: &StagingLease<Self::Buffer>) -> &[u8];

    /// Schedule region copies `src` → `dst` on the host queue.
    fn copy_buffer(&mut self, dst: &Self::Buffer, src: &Self::Buffer, copies: &[BufferCopy]);

    /// Block until previously scheduled host work completes.
    fn finish(&mut self);

    /// Immediate-path upload of `data` at `offset` into `dst`.
    fn upload_buffer_data(&mut self, dst: &Self::Buffer, offset: u64, data: &[u8]);

    /// Immediate-path download from `src` at `offset` into `out`.
    fn download_buffer_data(&mut self, src: &Self::Buffer, offset: u64, out: &mut [u8]);

    fn bind_index_buffer(&mut self, buffer: &Self::Buffer, offset: u32, size: u32);

    /// Index bind for runtimes without full index/primitive support, which
    /// need the draw parameters to expand unsupported formats or topologies.
    #[allow(clippy::too_many_arguments)]
    fn bind_index_buffer_expanded(
        &mut self,
        topology: PrimitiveTopology,
        format: IndexFormat,
        first: u32,
        count: u32,
        buffer: &Self::Buffer,
        offset: u32,
        size: u32,
    );

    /// Non-indexed quad draw fallback for runtimes without native quads.
    fn bind_quad_array_index_buffer(&mut self, first: u32, count: u32);

    fn bind_vertex_buffer(
        &mut self,
        index: u32,
        buffer: &Self::Buffer,
        offset: u32,
        size: u32,
        stride: u32,
    );

    fn bind_uniform_buffer(
        &mut self,
        stage: usize,
        binding_index: u32,
        buffer: &Self::Buffer,
        offset: u32,
        size: u32,
    );

    #[allow(clippy::too_many_arguments)]
    fn bind_storage_buffer(
        &mut self,
        stage: usize,
        binding_index: u32,
        buffer: &Self::Buffer,
        offset: u32,
        size: u32,
        is_written: bool,
    );

    fn bind_transform_feedback_buffer(
        &mut self,
        index: u32,
        buffer: &Self::Buffer,
        offset: u32,
        size: u32,
    );

    fn bind_compute_uniform_buffer(
        &mut self,
        binding_index: u32,
        buffer: &Self::Buffer,
        offset: u32,
        size: u32,
    );

    fn bind_compute_storage_buffer(
        &mut self,
        binding_index: u32,
        buffer: &Self::Buffer,
        offset: u32,
        size: u32,
        is_written: bool,
    );

    /// Driver-managed small-push uniform path (an attribute of older drivers
    /// of one API family). Gates the inline fast-UBO path at bind time.
    fn has_fast_buffer_sub_data(&self) -> bool {
        false
    }

    fn bind_fast_uniform_buffer(&mut self, stage: usize, binding_index: u32, size: u32);

    fn push_fast_uniform_buffer(&mut self, stage: usize, binding_index: u32, data: &[u8]);

    /// Bind a stream-style host uniform buffer and return its write span;
    /// the caller fills it directly from guest memory.
    fn map_uniform_buffer(&mut self, stage: usize, binding_index: u32, size: u32) -> &mut [u8];
}
