mod allocator;
mod barrier;
mod buffer;
mod caps;
mod context;
mod device;
mod error;
mod format;
mod image;
mod import;
mod instance;
mod negotiator;
mod physical_device;
mod sampler;
mod ycbcr;

pub use allocator::*;
pub use barrier::{CommandRecorder, ImageBarrier, ImageState, Semaphore, SyncState, TransitionSink};
pub use buffer::*;
pub use caps::*;
pub use context::*;
pub use device::*;
pub use error::*;
pub use format::*;
pub use image::{Image, ImageInfo, ImagePurpose};
pub use import::*;
pub use instance::*;
pub use negotiator::*;
pub use physical_device::*;
pub use sampler::*;
pub use ycbcr::{Ycbcr, YcbcrInfo};

pub(crate) use ycbcr::SharedCache;
