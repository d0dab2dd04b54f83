use ash::vk;
use thiserror::Error;

use crate::MemoryFormat;

/// Errors surfaced by the resource manager.
///
/// Unsupported external-memory imports are deliberately *not* represented
/// here: import paths return `None` so callers can fall back to a CPU copy
/// without treating the condition as exceptional.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no supported device format for {format:?} at {width}x{height}")]
    UnsupportedFormat {
        format: MemoryFormat,
        width: u32,
        height: u32,
    },

    #[error("failed to allocate {size} bytes from memory type {memory_type}: {source}")]
    AllocationFailed {
        size: u64,
        memory_type: u32,
        source: vk::Result,
    },

    #[error("no memory type matches bitmask {type_bits:#x} with the requested properties")]
    NoMatchingMemoryType { type_bits: u32 },

    #[error(transparent)]
    Vk(#[from] vk::Result),
}
