//! Shared fixtures for the buffer cache scenario tests.
#![allow(dead_code)] // each test binary uses a different subset

use vesper_buffer_cache::software::{DirectSoftwareRuntime, StagedSoftwareRuntime};
use vesper_buffer_cache::{BufferCache, CacheConfig, GpuVAddr, VAddr, VecGuestMemory};

/// Guest RAM size backing every test.
pub const MEM_SIZE: usize = 0x10_0000;

/// Base of the GPU-address window identity-mapped over guest RAM.
pub const GPU_BASE: GpuVAddr = 0x4000_0000;

pub fn gpu(cpu_addr: VAddr) -> GpuVAddr {
    GPU_BASE + cpu_addr
}

pub fn guest_memory() -> VecGuestMemory {
    let mut memory = VecGuestMemory::new(MEM_SIZE);
    memory.map_gpu(GPU_BASE, 0, MEM_SIZE as u64);
    memory
}

pub fn staged_cache(config: CacheConfig) -> BufferCache<StagedSoftwareRuntime, VecGuestMemory> {
    BufferCache::new(StagedSoftwareRuntime::new(), guest_memory(), config)
}

pub fn direct_cache(config: CacheConfig) -> BufferCache<DirectSoftwareRuntime, VecGuestMemory> {
    BufferCache::new(DirectSoftwareRuntime::new(), guest_memory(), config)
}

/// A recognizable byte pattern of the given length.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
