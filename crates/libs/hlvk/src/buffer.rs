//! Linear GPU buffers backed by the memory pools.
//!
//! Buffers carry no layout state; callers are responsible for pipeline
//! barriers between dependent buffer accesses at the command-recording
//! layer.

use std::sync::Arc;

use ash::vk;
use moraine_utils::align_up;

use crate::{Allocation, Device, Error, MemoryPool};

/// What a buffer is used for; determines usage bits and the preferred
/// memory type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Vertex,
    Storage,
    /// CPU→GPU staging; host-mappable.
    Upload,
    /// GPU→CPU readback; host-mappable.
    Download,
}

impl BufferUsage {
    fn vk_usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferUsage::Vertex => {
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Storage => {
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Upload => vk::BufferUsageFlags::TRANSFER_SRC,
            BufferUsage::Download => vk::BufferUsageFlags::TRANSFER_DST,
        }
    }

    fn memory_preference(self) -> vk::MemoryPropertyFlags {
        match self {
            BufferUsage::Vertex | BufferUsage::Storage => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            BufferUsage::Upload => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            BufferUsage::Download => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED
            }
        }
    }

    fn host_accessible(self) -> bool {
        matches!(self, BufferUsage::Upload | BufferUsage::Download)
    }
}

pub struct Buffer {
    device: Arc<Device>,
    pub(crate) inner: vk::Buffer,
    usage: BufferUsage,
    size: u64,
    pool: Arc<MemoryPool>,
    allocation: Option<Allocation>,
    mapped: bool,
}

impl Buffer {
    pub fn new(device: Arc<Device>, size: u64, usage: BufferUsage) -> Result<Buffer, Error> {
        debug_assert!(size > 0);

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage.vk_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let inner = unsafe { device.inner.create_buffer(&buffer_info, None)? };

        let requirements = unsafe { device.inner.get_buffer_memory_requirements(inner) };
        let pool = match device.find_allocator(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::empty(),
            usage.memory_preference(),
        ) {
            Ok(pool) => pool,
            Err(err) => {
                unsafe { device.inner.destroy_buffer(inner, None) };
                return Err(err);
            }
        };

        let allocation = match pool.allocate(requirements.size, requirements.alignment) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.inner.destroy_buffer(inner, None) };
                return Err(err);
            }
        };

        if let Err(err) = unsafe {
            device
                .inner
                .bind_buffer_memory(inner, allocation.memory, allocation.offset)
        } {
            pool.free(allocation);
            unsafe { device.inner.destroy_buffer(inner, None) };
            return Err(err.into());
        }

        Ok(Buffer {
            device,
            inner,
            usage,
            size,
            pool,
            allocation: Some(allocation),
            mapped: false,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn vk_buffer(&self) -> vk::Buffer {
        self.inner
    }

    /// Whether [`map`](Self::map) can succeed: only upload/download buffers
    /// on host-visible memory are ever mapped.
    pub fn can_map(&self) -> bool {
        let Some(allocation) = &self.allocation else {
            return false;
        };
        self.usage.host_accessible()
            && allocation
                .memory_flags
                .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
            && !allocation.map.is_null()
    }

    /// The host pointer to the buffer's memory. Mapping twice without an
    /// intervening unmap is a caller bug.
    pub fn map(&mut self) -> Option<*mut u8> {
        debug_assert!(!self.mapped, "buffer mapped twice");
        if !self.can_map() {
            return None;
        }
        self.mapped = true;
        self.allocation.as_ref().map(|allocation| allocation.map)
    }

    /// Ends host access, flushing the written range on non-coherent memory.
    pub fn unmap(&mut self, written: u64) {
        debug_assert!(self.mapped, "buffer was not mapped");
        debug_assert!(written <= self.size);
        self.mapped = false;

        let Some(allocation) = &self.allocation else {
            return;
        };
        if written == 0
            || allocation
                .memory_flags
                .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return;
        }

        let atom = self.device.limits().non_coherent_atom_size;
        let start = allocation.offset / atom * atom;
        let end = align_up(allocation.offset + written, atom);
        let range = vk::MappedMemoryRange::builder()
            .memory(allocation.memory)
            .offset(start)
            .size(end - start)
            .build();
        unsafe {
            // Flushing cannot fail for a valid range short of device loss.
            let _ = self.device.inner.flush_mapped_memory_ranges(&[range]);
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.inner.destroy_buffer(self.inner, None);
        }
        if let Some(allocation) = self.allocation.take() {
            self.pool.free(allocation);
        }
    }
}

impl Device {
    pub fn create_buffer(
        self: &Arc<Self>,
        size: u64,
        usage: BufferUsage,
    ) -> Result<Buffer, Error> {
        Buffer::new(self.clone(), size, usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_classes_pick_sensible_memory() {
        assert!(BufferUsage::Upload
            .memory_preference()
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
        assert!(BufferUsage::Download
            .memory_preference()
            .contains(vk::MemoryPropertyFlags::HOST_CACHED));
        assert!(BufferUsage::Vertex
            .memory_preference()
            .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL));

        assert!(BufferUsage::Upload.host_accessible());
        assert!(BufferUsage::Download.host_accessible());
        assert!(!BufferUsage::Vertex.host_accessible());
        assert!(!BufferUsage::Storage.host_accessible());
    }
}
