//! Slab-style device-memory allocation.
//!
//! One [`MemoryPool`] exists per memory type. Pools carve allocations out of
//! large device-memory blocks and keep a per-block free list with
//! first-fit placement and coalescing, so a free immediately makes an
//! equal-sized allocation satisfiable again without growing the pool.

use std::sync::Mutex;

use ash::vk;
use log::error;
use moraine_utils::align_up;

use crate::Error;

/// Size of a freshly allocated device-memory block. Requests larger than
/// this get a block of their own.
pub const DEFAULT_BLOCK_SIZE: u64 = 16 * 1024 * 1024;

/// A raw device-memory block handed out by a [`MemorySource`].
pub struct MemoryBlock {
    pub memory: vk::DeviceMemory,
    pub size: u64,
    /// Persistent host mapping, null when the memory type is not mappable.
    pub map: *mut u8,
}

/// Where a pool gets its blocks from. The device-backed source calls
/// `vkAllocateMemory`; tests count fake blocks.
pub trait MemorySource: Send + Sync {
    fn allocate_block(&self, size: u64) -> Result<MemoryBlock, Error>;
    fn free_block(&self, block: &MemoryBlock);
}

/// A suballocation of device memory. Owned by the image or buffer that
/// requested it; the pool retains ownership of the underlying memory
/// object.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub memory: vk::DeviceMemory,
    pub offset: u64,
    pub size: u64,
    /// Host pointer to the allocation, null when not mappable.
    pub map: *mut u8,
    pub memory_flags: vk::MemoryPropertyFlags,
    block: usize,
}

impl Allocation {
    /// An allocation backed by its own dedicated memory object, used for
    /// imported and exported external memory. Freeing it destroys the
    /// memory object instead of returning to a pool.
    pub(crate) fn dedicated(
        memory: vk::DeviceMemory,
        size: u64,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Self {
        Self {
            memory,
            offset: 0,
            size,
            map: std::ptr::null_mut(),
            memory_flags,
            block: usize::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FreeRange {
    offset: u64,
    size: u64,
}

struct Block {
    inner: MemoryBlock,
    /// Free ranges sorted by offset; neighbors are coalesced on free.
    free: Vec<FreeRange>,
}

impl Block {
    fn carve(&mut self, size: u64, alignment: u64) -> Option<(u64, *mut u8)> {
        let position = self.free.iter().position(|range| {
            let aligned = align_up(range.offset, alignment);
            aligned + size <= range.offset + range.size
        })?;

        let range = self.free.remove(position);
        let aligned = align_up(range.offset, alignment);

        let trailing = (range.offset + range.size) - (aligned + size);
        if trailing > 0 {
            self.free.insert(
                position,
                FreeRange {
                    offset: aligned + size,
                    size: trailing,
                },
            );
        }
        if aligned > range.offset {
            self.free.insert(
                position,
                FreeRange {
                    offset: range.offset,
                    size: aligned - range.offset,
                },
            );
        }

        let map = if self.inner.map.is_null() {
            std::ptr::null_mut()
        } else {
            self.inner.map.wrapping_add(aligned as usize)
        };
        Some((aligned, map))
    }

    fn give_back(&mut self, offset: u64, size: u64) {
        let position = self
            .free
            .iter()
            .position(|range| range.offset > offset)
            .unwrap_or(self.free.len());
        self.free.insert(position, FreeRange { offset, size });

        // Merge with the next range, then with the previous one.
        if position + 1 < self.free.len()
            && self.free[position].offset + self.free[position].size
                == self.free[position + 1].offset
        {
            self.free[position].size += self.free[position + 1].size;
            self.free.remove(position + 1);
        }
        if position > 0
            && self.free[position - 1].offset + self.free[position - 1].size
                == self.free[position].offset
        {
            self.free[position - 1].size += self.free[position].size;
            self.free.remove(position);
        }
    }
}

struct PoolState {
    blocks: Vec<Block>,
}

/// A free-list allocator over one memory type.
pub struct MemoryPool {
    source: Box<dyn MemorySource>,
    memory_type_index: u32,
    memory_flags: vk::MemoryPropertyFlags,
    state: Mutex<PoolState>,
}

// Mapped pointers are handed out but only dereferenced by the submission
// thread.
unsafe impl Send for MemoryPool {}
unsafe impl Sync for MemoryPool {}

impl MemoryPool {
    pub fn new(
        source: Box<dyn MemorySource>,
        memory_type_index: u32,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Self {
        Self {
            source,
            memory_type_index,
            memory_flags,
            state: Mutex::new(PoolState { blocks: Vec::new() }),
        }
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_flags
    }

    pub fn allocate(&self, size: u64, alignment: u64) -> Result<Allocation, Error> {
        debug_assert!(size > 0);
        debug_assert!(alignment.is_power_of_two());

        let mut state = self.state.lock().unwrap();

        for (index, block) in state.blocks.iter_mut().enumerate() {
            if let Some((offset, map)) = block.carve(size, alignment) {
                return Ok(Allocation {
                    memory: block.inner.memory,
                    offset,
                    size,
                    map,
                    memory_flags: self.memory_flags,
                    block: index,
                });
            }
        }

        // No block can hold the request; grow the pool. A failure here
        // leaves the existing free lists untouched.
        let block_size = size.max(DEFAULT_BLOCK_SIZE);
        let inner = self.source.allocate_block(block_size).map_err(|err| {
            error!(
                "[Vulkan] Failed to allocate {} bytes (alignment {}) from memory type {}: {}",
                size, alignment, self.memory_type_index, err
            );
            err
        })?;

        let index = state.blocks.len();
        state.blocks.push(Block {
            inner,
            free: vec![FreeRange {
                offset: 0,
                size: block_size,
            }],
        });

        let block = &mut state.blocks[index];
        let (offset, map) = block
            .carve(size, alignment)
            .expect("fresh block must fit the request it was sized for");
        Ok(Allocation {
            memory: block.inner.memory,
            offset,
            size,
            map,
            memory_flags: self.memory_flags,
            block: index,
        })
    }

    pub fn free(&self, allocation: Allocation) {
        let mut state = self.state.lock().unwrap();
        let block = &mut state.blocks[allocation.block];
        debug_assert!(block.inner.memory == allocation.memory);
        block.give_back(allocation.offset, allocation.size);
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap();
        for block in &state.blocks {
            self.source.free_block(&block.inner);
        }
    }
}

/// Picks the memory type satisfying `type_bits`, preferring `preferred`
/// property flags and falling back to any satisfying type.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    disallowed: vk::MemoryPropertyFlags,
    preferred: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let types = &properties.memory_types[..properties.memory_type_count as usize];

    let candidate = |index: &u32| {
        let flags = types[*index as usize].property_flags;
        type_bits & (1 << index) != 0 && !flags.intersects(disallowed)
    };

    (0..types.len() as u32)
        .find(|index| candidate(index) && types[*index as usize].property_flags.contains(preferred))
        .or_else(|| (0..types.len() as u32).find(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingSource {
        live_blocks: Arc<AtomicUsize>,
        allocated_bytes: Arc<AtomicU64>,
    }

    impl MemorySource for CountingSource {
        fn allocate_block(&self, size: u64) -> Result<MemoryBlock, Error> {
            self.live_blocks.fetch_add(1, Ordering::SeqCst);
            self.allocated_bytes.fetch_add(size, Ordering::SeqCst);
            Ok(MemoryBlock {
                memory: vk::DeviceMemory::null(),
                size,
                map: std::ptr::null_mut(),
            })
        }

        fn free_block(&self, _block: &MemoryBlock) {
            self.live_blocks.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn pool() -> (MemoryPool, Arc<AtomicUsize>) {
        let source = CountingSource::default();
        let live = source.live_blocks.clone();
        (
            MemoryPool::new(Box::new(source), 0, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            live,
        )
    }

    #[test]
    fn free_makes_request_satisfiable_without_growth() {
        let (pool, live) = pool();

        let allocation = pool.allocate(4096, 256).unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 1);
        pool.free(allocation);

        let again = pool.allocate(4096, 256).unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 1, "pool grew on reuse");
        assert_eq!(again.offset, allocation.offset);
    }

    #[test]
    fn allocations_respect_alignment_and_do_not_overlap() {
        let (pool, _live) = pool();

        let a = pool.allocate(100, 1).unwrap();
        let b = pool.allocate(300, 128).unwrap();
        let c = pool.allocate(50, 64).unwrap();

        assert_eq!(b.offset % 128, 0);
        assert_eq!(c.offset % 64, 0);

        let ranges = [(a.offset, a.size), (b.offset, b.size), (c.offset, c.size)];
        for (i, &(offset, size)) in ranges.iter().enumerate() {
            for &(other_offset, other_size) in &ranges[i + 1..] {
                assert!(
                    offset + size <= other_offset || other_offset + other_size <= offset,
                    "allocations overlap"
                );
            }
        }
    }

    #[test]
    fn coalescing_reassembles_adjacent_ranges() {
        let (pool, live) = pool();

        let a = pool.allocate(1024, 1).unwrap();
        let b = pool.allocate(1024, 1).unwrap();
        let c = pool.allocate(1024, 1).unwrap();

        // Freeing in scattered order must still merge a..c into one range.
        pool.free(b);
        pool.free(a);
        pool.free(c);

        let merged = pool.allocate(3072, 1).unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(merged.offset, 0);
    }

    #[test]
    fn oversized_requests_get_their_own_block() {
        let (pool, live) = pool();

        let big = pool.allocate(DEFAULT_BLOCK_SIZE * 2, 4096).unwrap();
        assert_eq!(big.size, DEFAULT_BLOCK_SIZE * 2);
        assert_eq!(live.load(Ordering::SeqCst), 1);

        let small = pool.allocate(64, 64).unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 2);
        assert_eq!(small.offset, 0, "small request landed in a fresh block");
    }

    #[test]
    fn find_memory_type_prefers_requested_flags() {
        let mut properties = vk::PhysicalDeviceMemoryProperties::default();
        properties.memory_type_count = 3;
        properties.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        properties.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        properties.memory_types[2].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_CACHED
            | vk::MemoryPropertyFlags::HOST_COHERENT;

        // Preferred pass.
        assert_eq!(
            find_memory_type(
                &properties,
                0b111,
                vk::MemoryPropertyFlags::empty(),
                vk::MemoryPropertyFlags::HOST_CACHED,
            ),
            Some(2)
        );
        // Fallback pass: nothing has LAZILY_ALLOCATED, first match wins.
        assert_eq!(
            find_memory_type(
                &properties,
                0b111,
                vk::MemoryPropertyFlags::empty(),
                vk::MemoryPropertyFlags::LAZILY_ALLOCATED,
            ),
            Some(0)
        );
        // Disallowed flags filter both passes.
        assert_eq!(
            find_memory_type(
                &properties,
                0b110,
                vk::MemoryPropertyFlags::HOST_CACHED,
                vk::MemoryPropertyFlags::empty(),
            ),
            Some(1)
        );
        // Bitmask restricts candidates.
        assert_eq!(
            find_memory_type(
                &properties,
                0b001,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
                vk::MemoryPropertyFlags::empty(),
            ),
            None
        );
    }
}
