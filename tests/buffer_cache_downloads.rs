//! Download paths: synchronous write-back, asynchronous flush queues, and
//! content preservation across uploads, coalescing and downloads.

mod common;

use common::{direct_cache, gpu, pattern, staged_cache};
use pretty_assertions::assert_eq;
use vesper_buffer_cache::software::HostCall;
use vesper_buffer_cache::{CacheConfig, GraphicsRegs, GuestMemory};

fn async_config() -> CacheConfig {
    CacheConfig {
        gpu_accuracy_high: true,
        use_asynchronous_gpu: true,
    }
}

/// Mark `[cpu_addr, cpu_addr + size)` GPU-modified through the transform
/// feedback update path.
fn tfb_regs(cpu_addr: u64, size: u32) -> GraphicsRegs {
    let mut regs = GraphicsRegs::default();
    regs.tfb_enabled = true;
    regs.tfb_bindings[0].enable = true;
    regs.tfb_bindings[0].address = gpu(cpu_addr);
    regs.tfb_bindings[0].size = size;
    regs
}

#[test]
fn async_flush_round_trip_writes_gpu_output_back_to_guest_memory() {
    let mut cache = staged_cache(async_config());

    // A transform feedback binding marks its range GPU-written and queues
    // the buffer for asynchronous readback.
    cache.update_graphics_buffers(&tfb_regs(0x10000, 256), false);
    assert!(cache.has_uncommitted_flushes());
    assert!(!cache.should_wait_async_flushes());

    // Stand in for the GPU: write output bytes into the host buffer.
    let gpu_output = pattern(256, 9);
    let buffer_id = cache.buffer_at(0x10000);
    let host = *cache.host_buffer(buffer_id);
    cache
        .runtime_mut()
        .device
        .write_buffer_bytes(host, 0, &gpu_output);

    cache.commit_async_flushes();
    assert!(!cache.has_uncommitted_flushes());
    assert!(cache.should_wait_async_flushes());

    cache.pop_async_flushes();
    assert_eq!(
        &cache.guest_memory().as_slice()[0x10000..0x10100],
        &gpu_output[..]
    );
    assert!(!cache.should_wait_async_flushes());

    // The readback went through a staging lease and a host fence.
    assert!(cache
        .runtime()
        .device
        .calls()
        .iter()
        .any(|call| matches!(call, HostCall::Finish)));

    // Draining twice is a no-op.
    cache.pop_async_flushes();
    assert!(!cache.should_wait_async_flushes());
}

#[test]
fn download_memory_writes_back_only_gpu_modified_ranges() {
    let mut cache = direct_cache(CacheConfig::default());

    let guest_data = pattern(0x1000, 1);
    cache.guest_memory_mut().write_block(0x10000, &guest_data);
    let buffer_id = cache.find_buffer(0x10000, 0x1000);

    // GPU writes 64 bytes in the middle of the buffer.
    cache.update_graphics_buffers(&tfb_regs(0x10200, 64), false);
    let gpu_output = pattern(64, 5);
    let host = *cache.host_buffer(buffer_id);
    cache
        .runtime_mut()
        .device
        .write_buffer_bytes(host, 0x200, &gpu_output);

    cache.download_memory(0x10000, 0x1000);

    // Only the GPU-written range reached guest memory; the rest is whatever
    // the guest last wrote.
    assert_eq!(
        &cache.guest_memory().as_slice()[0x10200..0x10240],
        &gpu_output[..]
    );
    assert_eq!(
        &cache.guest_memory().as_slice()[0x10000..0x10200],
        &guest_data[..0x200]
    );

    // The enumeration drained the dirty state; a second download is a no-op.
    assert!(!cache.is_region_gpu_modified(0x10000, 0x1000));
}

#[test]
fn upload_then_download_round_trips_through_the_host_buffer() {
    let mut cache = staged_cache(CacheConfig::default());

    // Guest writes vertex data; a draw uploads it.
    let guest_data = pattern(0x100, 2);
    cache.guest_memory_mut().write_block(0x10000, &guest_data);

    let mut regs = GraphicsRegs::default();
    regs.vertex_buffers[0].enable = true;
    regs.vertex_buffers[0].start_addr = gpu(0x10000);
    regs.vertex_buffers[0].limit_addr = gpu(0x100ff);
    regs.vertex_buffers[0].stride = 16;
    cache.update_graphics_buffers(&regs, false);
    cache.bind_host_geometry_buffers(&regs, false);

    let buffer_id = cache.buffer_at(0x10000);
    let host = *cache.host_buffer(buffer_id);
    assert_eq!(
        &cache.runtime().device.buffer_bytes(host)[..0x100],
        &guest_data[..]
    );

    // The GPU overwrites part of it; a download hands the result back.
    cache.update_graphics_buffers(&tfb_regs(0x10000, 0x100), false);
    let gpu_output = pattern(0x100, 8);
    cache
        .runtime_mut()
        .device
        .write_buffer_bytes(host, 0, &gpu_output);
    cache.download_memory(0x10000, 0x100);
    assert_eq!(
        &cache.guest_memory().as_slice()[0x10000..0x10100],
        &gpu_output[..]
    );
}

#[test]
fn coalescing_preserves_gpu_written_content_and_queue_entries() {
    let mut cache = staged_cache(async_config());

    // Two buffers, both with GPU-written content.
    let mut regs = tfb_regs(0x10000, 0x100);
    regs.tfb_bindings[1].enable = true;
    regs.tfb_bindings[1].address = gpu(0x20000);
    regs.tfb_bindings[1].size = 0x100;
    cache.update_graphics_buffers(&regs, false);

    let content_a = pattern(0x100, 11);
    let content_b = pattern(0x100, 13);
    let host_a = *cache.host_buffer(cache.buffer_at(0x10000));
    let host_b = *cache.host_buffer(cache.buffer_at(0x20000));
    cache.runtime_mut().device.write_buffer_bytes(host_a, 0, &content_a);
    cache.runtime_mut().device.write_buffer_bytes(host_b, 0, &content_b);
    assert!(cache.has_uncommitted_flushes());

    // Merge both into one buffer. The merged extent spans from the leftmost
    // absorbed buffer to the end of the request.
    let merged = cache.find_buffer(0x14000, 0x12000);
    assert_eq!(cache.buffer_range(merged), 0x10000..0x26000);

    // The GPU-modified bytes migrated into the merged buffer.
    let merged_host = *cache.host_buffer(merged);
    assert_eq!(
        &cache.runtime().device.buffer_bytes(merged_host)[0..0x100],
        &content_a[..]
    );
    assert_eq!(
        &cache.runtime().device.buffer_bytes(merged_host)[0x10000..0x10100],
        &content_b[..]
    );
    assert!(cache.is_region_gpu_modified(0x10000, 0x100));
    assert!(cache.is_region_gpu_modified(0x20000, 0x100));

    // The download queue was relinked to the merged buffer; draining it
    // writes both ranges back to guest memory.
    cache.commit_async_flushes();
    cache.pop_async_flushes();
    assert_eq!(
        &cache.guest_memory().as_slice()[0x10000..0x10100],
        &content_a[..]
    );
    assert_eq!(
        &cache.guest_memory().as_slice()[0x20000..0x20100],
        &content_b[..]
    );
}

#[test]
fn cached_writes_do_not_upload_until_flushed() {
    let mut cache = staged_cache(CacheConfig::default());

    let initial = pattern(0x100, 1);
    cache.guest_memory_mut().write_block(0x10000, &initial);

    let mut regs = GraphicsRegs::default();
    regs.vertex_buffers[0].enable = true;
    regs.vertex_buffers[0].start_addr = gpu(0x10000);
    regs.vertex_buffers[0].limit_addr = gpu(0x100ff);
    cache.update_graphics_buffers(&regs, false);
    cache.bind_host_geometry_buffers(&regs, false);

    let host = *cache.host_buffer(cache.buffer_at(0x10000));
    assert_eq!(
        &cache.runtime().device.buffer_bytes(host)[..0x100],
        &initial[..]
    );

    // A cached guest write stays on the guest side across the next draw.
    let updated = pattern(0x100, 4);
    cache.guest_memory_mut().write_block(0x10000, &updated);
    cache.cached_write_memory(0x10000, 0x100);
    cache.update_graphics_buffers(&regs, false);
    cache.bind_host_geometry_buffers(&regs, false);
    assert_eq!(
        &cache.runtime().device.buffer_bytes(host)[..0x100],
        &initial[..]
    );

    // Flushing promotes it; the next draw uploads.
    cache.flush_cached_writes();
    cache.update_graphics_buffers(&regs, false);
    cache.bind_host_geometry_buffers(&regs, false);
    assert_eq!(
        &cache.runtime().device.buffer_bytes(host)[..0x100],
        &updated[..]
    );
}
