//! Index, vertex and quad-fallback bind behavior.

mod common;

use common::{direct_cache, gpu, staged_cache};
use pretty_assertions::assert_eq;
use vesper_buffer_cache::software::HostCall;
use vesper_buffer_cache::{BufferId, CacheConfig, GraphicsRegs, IndexFormat, PrimitiveTopology};

fn indexed_regs(count: u32) -> GraphicsRegs {
    let mut regs = GraphicsRegs::default();
    regs.index_buffer.start_addr = gpu(0x10000);
    regs.index_buffer.end_addr = gpu(0x10100);
    regs.index_buffer.format = IndexFormat::Uint16;
    regs.index_buffer.count = count;
    regs
}

#[test]
fn index_binding_is_clamped_to_the_drawn_index_range() {
    let mut cache = staged_cache(CacheConfig::default());

    // 0x100 bytes of address range, but only 32 × 2-byte indices drawn.
    let regs = indexed_regs(32);
    cache.update_graphics_buffers(&regs, true);
    cache.bind_host_geometry_buffers(&regs, true);

    let sizes: Vec<u32> = cache
        .runtime()
        .device
        .calls()
        .iter()
        .filter_map(|call| match call {
            HostCall::BindIndexBuffer { size, .. } => Some(*size),
            _ => None,
        })
        .collect();
    assert_eq!(sizes, vec![64]);
}

#[test]
fn index_count_changes_are_picked_up_without_a_dirty_flag() {
    let mut cache = staged_cache(CacheConfig::default());

    let regs = indexed_regs(32);
    cache.update_graphics_buffers(&regs, true);
    cache.bind_host_geometry_buffers(&regs, true);

    // No register-write notification, only a different draw count.
    let regs = indexed_regs(16);
    cache.update_graphics_buffers(&regs, true);
    cache.bind_host_geometry_buffers(&regs, true);

    let sizes: Vec<u32> = cache
        .runtime()
        .device
        .calls()
        .iter()
        .filter_map(|call| match call {
            HostCall::BindIndexBuffer { size, .. } => Some(*size),
            _ => None,
        })
        .collect();
    assert_eq!(sizes, vec![64, 32]);
}

#[test]
fn limited_runtimes_get_the_expanded_index_bind() {
    let mut cache = direct_cache(CacheConfig::default());

    let regs = indexed_regs(32);
    cache.update_graphics_buffers(&regs, true);
    cache.bind_host_geometry_buffers(&regs, true);

    assert!(cache.runtime().device.calls().iter().any(|call| matches!(
        call,
        HostCall::BindIndexBufferExpanded {
            format: IndexFormat::Uint16,
            count: 32,
            size: 64,
            ..
        }
    )));
}

#[test]
fn non_indexed_quad_draws_fall_back_to_a_generated_index_buffer() {
    let mut cache = direct_cache(CacheConfig::default());

    let mut regs = GraphicsRegs::default();
    regs.topology = PrimitiveTopology::Quads;
    regs.vertex_first = 4;
    regs.vertex_count = 16;
    cache.update_graphics_buffers(&regs, false);
    cache.bind_host_geometry_buffers(&regs, false);

    assert!(cache
        .runtime()
        .device
        .calls()
        .iter()
        .any(|call| matches!(call, HostCall::BindQuadArrayIndexBuffer { first: 4, count: 16 })));
}

#[test]
fn vertex_buffers_rebind_only_when_marked_dirty() {
    let mut cache = staged_cache(CacheConfig::default());

    let mut regs = GraphicsRegs::default();
    regs.vertex_buffers[0].enable = true;
    regs.vertex_buffers[0].start_addr = gpu(0x10000);
    regs.vertex_buffers[0].limit_addr = gpu(0x100ff);
    regs.vertex_buffers[0].stride = 24;
    cache.update_graphics_buffers(&regs, false);
    cache.bind_host_geometry_buffers(&regs, false);

    fn count_binds(
        cache: &vesper_buffer_cache::BufferCache<
            vesper_buffer_cache::software::StagedSoftwareRuntime,
            vesper_buffer_cache::VecGuestMemory,
        >,
    ) -> usize {
        cache
            .runtime()
            .device
            .calls()
            .iter()
            .filter(|call| {
                matches!(call, HostCall::BindVertexBuffer { index: 0, size, .. } if *size != 0)
            })
            .count()
    }
    assert_eq!(count_binds(&cache), 1);

    // Unchanged registers: the slot is not re-bound.
    cache.update_graphics_buffers(&regs, false);
    cache.bind_host_geometry_buffers(&regs, false);
    assert_eq!(count_binds(&cache), 1);

    // A register-write notification forces a re-resolve and re-bind.
    cache.mark_vertex_buffer_dirty(0);
    cache.update_graphics_buffers(&regs, false);
    cache.bind_host_geometry_buffers(&regs, false);
    assert_eq!(count_binds(&cache), 2);
}

#[test]
fn zero_sized_vertex_ranges_disable_the_binding() {
    let mut cache = staged_cache(CacheConfig::default());

    let mut regs = GraphicsRegs::default();
    regs.vertex_buffers[0].enable = true;
    regs.vertex_buffers[0].start_addr = gpu(0x10000);
    regs.vertex_buffers[0].limit_addr = gpu(0x10000) - 1;
    cache.update_graphics_buffers(&regs, false);

    assert_eq!(cache.buffer_at(0x10000), BufferId::NULL);
    assert_eq!(cache.live_buffers(), 0);
}
