//! Image synchronization state and the primitives that carry it.
//!
//! Every image tracks the `(pipeline stage, layout, access mask)` it was
//! left in. The command-recording layer requests transitions; barriers are
//! only emitted when the state actually changes, and an imported producer
//! semaphore is consumed exactly once, on the first transition away from
//! the `GENERAL` import sentinel.

use std::sync::Arc;

use ash::vk;

use crate::{Device, Error};

/// Synchronization state of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageState {
    pub stage: vk::PipelineStageFlags,
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags,
}

impl ImageState {
    pub const fn new(
        stage: vk::PipelineStageFlags,
        layout: vk::ImageLayout,
        access: vk::AccessFlags,
    ) -> Self {
        Self {
            stage,
            layout,
            access,
        }
    }
}

/// A single full-resource layout transition.
#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub from: ImageState,
    pub to: ImageState,
}

/// Where transitions are recorded to. [`CommandRecorder`] writes real
/// commands; tests count emissions.
pub trait TransitionSink {
    fn image_barrier(&mut self, barrier: &ImageBarrier);

    /// Queue-submit wait for an imported semaphore, to be waited at `stage`.
    fn semaphore_wait(&mut self, semaphore: vk::Semaphore, value: u64, stage: vk::PipelineStageFlags);
}

/// A pending wait on an external producer, armed at import time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ImportWait {
    pub semaphore: vk::Semaphore,
    pub value: u64,
}

/// The per-image synchronization state machine.
#[derive(Debug)]
pub struct SyncState {
    current: ImageState,
    import_wait: Option<ImportWait>,
}

impl SyncState {
    pub fn new(initial: ImageState) -> Self {
        Self {
            current: initial,
            import_wait: None,
        }
    }

    pub(crate) fn with_import_wait(initial: ImageState, wait: ImportWait) -> Self {
        Self {
            current: initial,
            import_wait: Some(wait),
        }
    }

    pub fn current(&self) -> ImageState {
        self.current
    }

    /// Overwrites the tracked state without emitting a barrier, for callers
    /// that transitioned the image through means this tracker cannot see
    /// (e.g. a render pass' final layout).
    pub fn set(&mut self, state: ImageState) {
        self.current = state;
    }

    /// Brings the image into `target`, emitting at most one barrier.
    ///
    /// The first transition away from the `GENERAL` import sentinel records
    /// the producer-semaphore wait at the *target* stage, sequencing GPU
    /// consumption after the external producer's last write. The wait is
    /// never re-armed, even when the layout cycles back through `GENERAL`.
    pub fn transition(&mut self, image: vk::Image, target: ImageState, sink: &mut dyn TransitionSink) {
        if self.current == target {
            return;
        }

        if self.current.layout == vk::ImageLayout::GENERAL {
            if let Some(wait) = self.import_wait.take() {
                sink.semaphore_wait(wait.semaphore, wait.value, target.stage);
            }
        }

        sink.image_barrier(&ImageBarrier {
            image,
            from: self.current,
            to: target,
        });

        self.current = target;
    }
}

/// Semaphore for ordering GPU work, optionally imported from an external
/// producer.
pub struct Semaphore {
    device: Arc<Device>,
    pub inner: vk::Semaphore,
}

impl Semaphore {
    pub fn new(device: Arc<Device>) -> Result<Self, Error> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let inner = unsafe { device.inner.create_semaphore(&semaphore_info, None)? };

        Ok(Self { device, inner })
    }

    /// Imports a dma-buf sync file as a temporary binary semaphore. The fd
    /// is consumed on success.
    pub(crate) fn import_sync_fd(device: Arc<Device>, fd: i32) -> Result<Self, Error> {
        let semaphore = Self::new(device)?;

        let import_info = vk::ImportSemaphoreFdInfoKHR::builder()
            .semaphore(semaphore.inner)
            .handle_type(vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD)
            .flags(vk::SemaphoreImportFlags::TEMPORARY)
            .fd(fd);
        let result = unsafe {
            (semaphore.device.fns.external_semaphore_fd.import_semaphore_fd_khr)(
                semaphore.device.inner.handle(),
                &*import_info,
            )
        };
        result.result()?;

        Ok(semaphore)
    }

    /// Imports a D3D12 fence as a timeline semaphore.
    #[cfg(windows)]
    pub(crate) fn import_d3d12_fence(
        device: Arc<Device>,
        handle: vk::HANDLE,
    ) -> Result<Self, Error> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE);
        let semaphore_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
        let inner = unsafe { device.inner.create_semaphore(&semaphore_info, None)? };
        let semaphore = Self { device, inner };

        let import_info = vk::ImportSemaphoreWin32HandleInfoKHR::builder()
            .semaphore(semaphore.inner)
            .handle_type(vk::ExternalSemaphoreHandleTypeFlags::D3D12_FENCE)
            .handle(handle);
        let result = unsafe {
            (semaphore
                .device
                .fns
                .external_semaphore_win32
                .import_semaphore_win32_handle_khr)(
                semaphore.device.inner.handle(),
                &*import_info,
            )
        };
        result.result()?;

        Ok(semaphore)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.inner.destroy_semaphore(self.inner, None);
        }
    }
}

/// Records transitions into a command buffer and collects the semaphore
/// waits the eventual queue submission has to include.
pub struct CommandRecorder<'a> {
    device: &'a Device,
    pub command_buffer: vk::CommandBuffer,
    waits: Vec<(vk::Semaphore, u64, vk::PipelineStageFlags)>,
}

impl<'a> CommandRecorder<'a> {
    pub fn new(device: &'a Device, command_buffer: vk::CommandBuffer) -> Self {
        Self {
            device,
            command_buffer,
            waits: Vec::new(),
        }
    }

    /// Semaphore waits accumulated since creation, in submission order.
    pub fn wait_semaphores(&self) -> &[(vk::Semaphore, u64, vk::PipelineStageFlags)] {
        &self.waits
    }
}

impl TransitionSink for CommandRecorder<'_> {
    fn image_barrier(&mut self, barrier: &ImageBarrier) {
        let image_barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(barrier.from.access)
            .dst_access_mask(barrier.to.access)
            .old_layout(barrier.from.layout)
            .new_layout(barrier.to.layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(barrier.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe {
            self.device.inner.cmd_pipeline_barrier(
                self.command_buffer,
                barrier.from.stage,
                barrier.to.stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[image_barrier.build()],
            );
        }
    }

    fn semaphore_wait(&mut self, semaphore: vk::Semaphore, value: u64, stage: vk::PipelineStageFlags) {
        self.waits.push((semaphore, value, stage));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingSink {
        barriers: Vec<ImageBarrier>,
        waits: Vec<(vk::Semaphore, u64, vk::PipelineStageFlags)>,
    }

    impl TransitionSink for CountingSink {
        fn image_barrier(&mut self, barrier: &ImageBarrier) {
            self.barriers.push(*barrier);
        }

        fn semaphore_wait(
            &mut self,
            semaphore: vk::Semaphore,
            value: u64,
            stage: vk::PipelineStageFlags,
        ) {
            self.waits.push((semaphore, value, stage));
        }
    }

    fn shader_read() -> ImageState {
        ImageState::new(
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::SHADER_READ,
        )
    }

    fn transfer_write() -> ImageState {
        ImageState::new(
            vk::PipelineStageFlags::TRANSFER,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
        )
    }

    fn general() -> ImageState {
        ImageState::new(
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::ImageLayout::GENERAL,
            vk::AccessFlags::empty(),
        )
    }

    #[test]
    fn repeated_transition_is_a_noop() {
        let mut sync = SyncState::new(transfer_write());
        let mut sink = CountingSink::default();

        sync.transition(vk::Image::null(), shader_read(), &mut sink);
        sync.transition(vk::Image::null(), shader_read(), &mut sink);

        assert_eq!(sink.barriers.len(), 1);
        assert_eq!(sync.current(), shader_read());
    }

    #[test]
    fn barrier_carries_old_and_new_state() {
        let mut sync = SyncState::new(transfer_write());
        let mut sink = CountingSink::default();

        sync.transition(vk::Image::null(), shader_read(), &mut sink);

        let barrier = &sink.barriers[0];
        assert_eq!(barrier.from, transfer_write());
        assert_eq!(barrier.to, shader_read());
    }

    #[test]
    fn import_wait_fires_once_at_target_stage() {
        let wait = ImportWait {
            semaphore: vk::Semaphore::null(),
            value: 42,
        };
        let mut sync = SyncState::with_import_wait(general(), wait);
        let mut sink = CountingSink::default();

        sync.transition(vk::Image::null(), shader_read(), &mut sink);
        assert_eq!(sink.waits.len(), 1);
        assert_eq!(
            sink.waits[0],
            (
                vk::Semaphore::null(),
                42,
                vk::PipelineStageFlags::FRAGMENT_SHADER
            )
        );

        // Cycle back through GENERAL and away again: no further waits.
        sync.transition(vk::Image::null(), general(), &mut sink);
        sync.transition(vk::Image::null(), transfer_write(), &mut sink);

        assert_eq!(sink.waits.len(), 1);
        assert_eq!(sink.barriers.len(), 3);
    }

    #[test]
    fn no_wait_without_imported_semaphore() {
        let mut sync = SyncState::new(general());
        let mut sink = CountingSink::default();

        sync.transition(vk::Image::null(), shader_read(), &mut sink);

        assert!(sink.waits.is_empty());
        assert_eq!(sink.barriers.len(), 1);
    }
}
