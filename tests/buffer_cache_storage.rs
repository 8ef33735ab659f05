//! Storage-buffer descriptor decoding and compute binding behavior.

mod common;

use common::{gpu, staged_cache};
use pretty_assertions::assert_eq;
use vesper_buffer_cache::software::HostCall;
use vesper_buffer_cache::{CacheConfig, ComputeRegs, GraphicsRegs, GuestMemory};

fn async_config() -> CacheConfig {
    CacheConfig {
        gpu_accuracy_high: true,
        use_asynchronous_gpu: true,
    }
}

/// Write an `(address: u64, size: u32)` storage descriptor at `cpu_addr`.
fn write_descriptor(memory: &mut vesper_buffer_cache::VecGuestMemory, cpu_addr: u64, target: u64, size: u32) {
    memory.write_block(cpu_addr, &target.to_le_bytes());
    memory.write_block(cpu_addr + 8, &size.to_le_bytes());
}

#[test]
fn storage_descriptors_decode_with_extra_slack() {
    let mut cache = staged_cache(CacheConfig::default());

    let mut regs = GraphicsRegs::default();
    regs.const_buffers[0][1].address = gpu(0x30000);
    write_descriptor(cache.guest_memory_mut(), 0x30010, gpu(0x10000), 0x100);

    cache.bind_graphics_storage_buffer(&regs, 0, 0, 1, 0x10, false);
    cache.update_graphics_buffers(&regs, false);
    cache.bind_host_stage_buffers(0);

    // The declared 0x100 bytes gain the out-of-bounds slack, capped at the
    // end of the GPU mapping.
    let binds: Vec<_> = cache
        .runtime()
        .device
        .calls()
        .iter()
        .filter_map(|call| match call {
            HostCall::BindStorageBuffer {
                stage,
                offset,
                size,
                is_written,
                ..
            } => Some((*stage, *offset, *size, *is_written)),
            _ => None,
        })
        .collect();
    assert_eq!(binds, vec![(0, 0, 0x100 + 0xc000, false)]);

    let id = cache.buffer_at(0x10000);
    assert_eq!(cache.buffer_range(id), 0x10000..0x10000 + 0x100 + 0xc000);
}

#[test]
fn storage_slack_is_capped_at_the_mapping_end() {
    let mut cache = staged_cache(CacheConfig::default());

    let mut regs = GraphicsRegs::default();
    regs.const_buffers[0][0].address = gpu(0x30000);
    // Descriptor points 0x400 bytes before the end of the GPU mapping.
    let target = common::MEM_SIZE as u64 - 0x400;
    write_descriptor(cache.guest_memory_mut(), 0x30000, gpu(target), 0x100);

    cache.bind_graphics_storage_buffer(&regs, 0, 0, 0, 0, false);
    cache.update_graphics_buffers(&regs, false);
    cache.bind_host_stage_buffers(0);

    let id = cache.buffer_at(target);
    assert_eq!(cache.buffer_range(id), target..target + 0x400);
}

#[test]
fn unmapped_storage_descriptors_disable_the_binding() {
    let mut cache = staged_cache(CacheConfig::default());

    let mut regs = GraphicsRegs::default();
    regs.const_buffers[0][0].address = gpu(0x30000);
    write_descriptor(cache.guest_memory_mut(), 0x30000, 0x9000_0000, 0x100);

    cache.bind_graphics_storage_buffer(&regs, 0, 0, 0, 0, false);
    cache.update_graphics_buffers(&regs, false);
    cache.bind_host_stage_buffers(0);

    assert_eq!(cache.live_buffers(), 0);
    // The slot still binds, with the null buffer.
    assert!(cache
        .runtime()
        .device
        .calls()
        .iter()
        .any(|call| matches!(call, HostCall::BindStorageBuffer { buffer: 0, size: 0, .. })));
}

#[test]
fn written_storage_buffers_are_tracked_and_queued() {
    let mut cache = staged_cache(async_config());

    let mut regs = GraphicsRegs::default();
    regs.const_buffers[0][0].address = gpu(0x30000);
    write_descriptor(cache.guest_memory_mut(), 0x30000, gpu(0x10000), 0x100);

    cache.bind_graphics_storage_buffer(&regs, 0, 0, 0, 0, true);
    cache.update_graphics_buffers(&regs, false);

    assert!(cache.is_region_gpu_modified(0x10000, 0x100));
    assert!(cache.has_uncommitted_flushes());

    // Re-running the update re-marks the same buffer without duplicating
    // its queue entry; the commit/pop cycle drains cleanly.
    cache.update_graphics_buffers(&regs, false);
    cache.commit_async_flushes();
    assert!(cache.should_wait_async_flushes());
    cache.pop_async_flushes();
    assert!(!cache.should_wait_async_flushes());
    assert!(!cache.has_uncommitted_flushes());
}

#[test]
fn compute_buffers_resolve_from_the_launch_descriptor() {
    let mut cache = staged_cache(async_config());

    let mut regs = ComputeRegs::default();
    regs.const_buffer_enable_mask = 0b1;
    regs.const_buffers[0].address = gpu(0x40000);
    regs.const_buffers[0].size = 0x80;

    cache.set_enabled_compute_uniform_buffers(0b1);
    write_descriptor(cache.guest_memory_mut(), 0x40020, gpu(0x50000), 0x40);
    cache.bind_compute_storage_buffer(&regs, 0, 0, 0x20, true);

    cache.update_compute_buffers(&regs);
    cache.bind_host_compute_buffers();

    let calls = cache.runtime().device.calls();
    assert!(calls.iter().any(|call| matches!(
        call,
        HostCall::BindComputeUniformBuffer { size: 0x80, .. }
    )));
    assert!(calls.iter().any(|call| matches!(
        call,
        HostCall::BindComputeStorageBuffer {
            size,
            is_written: true,
            ..
        } if *size == 0x40 + 0xc000
    )));
    assert!(cache.is_region_gpu_modified(0x50000, 0x40));
    assert!(cache.has_uncommitted_flushes());

    // Unbinding clears the masks; the next dispatch binds nothing new.
    cache.unbind_compute_storage_buffers();
    cache.set_enabled_compute_uniform_buffers(0);
    let before = cache.runtime().device.calls().len();
    cache.update_compute_buffers(&regs);
    cache.bind_host_compute_buffers();
    assert_eq!(cache.runtime().device.calls().len(), before);
}
