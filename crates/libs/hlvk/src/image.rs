//! The central GPU resource: an image, its views, its memory and its
//! synchronization state.
//!
//! Construction is split in two: a purpose-specific *plan* ([`ImageInfo`])
//! produced by pure format negotiation, and the execution of that plan
//! against the device. The split keeps every per-purpose decision (tiling,
//! usage, initial state, memory preference) testable without a GPU.

use std::sync::Arc;

use ash::vk;

use crate::{
    mapping_to_array, mip_levels, select_format, Allocation, Conversion, Device, Error,
    FormatQuery, FormatSelection, ImageFlags, ImageState, MemoryFormat, MemoryLayout, MemoryPool,
    MemoryPlane, SamplerKind, Semaphore, ShaderOp, SyncState, TransitionSink, Ycbcr, YcbcrInfo,
    MAX_PLANES,
};

/// What backs an image's memory.
pub(crate) enum ImageMemory {
    /// No owned memory: either not bound yet, or owned elsewhere (a
    /// swapchain).
    None,
    /// Suballocated from a shared pool.
    Pooled {
        pool: Arc<MemoryPool>,
        allocation: Allocation,
    },
    /// A dedicated memory object (external imports and exports); freeing
    /// destroys the memory object itself.
    Dedicated { allocation: Allocation },
}

#[derive(Clone, Copy)]
pub(crate) struct DescriptorEntry {
    set: vk::DescriptorSet,
    pool_id: usize,
}

/// A fully negotiated construction plan for an image.
#[derive(Debug, Clone, Copy)]
pub struct ImageInfo {
    pub format: MemoryFormat,
    pub vk_format: vk::Format,
    pub components: vk::ComponentMapping,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub width: u32,
    pub height: u32,
    pub flags: ImageFlags,
    pub conversion: Conversion,
    pub shader_op: ShaderOp,
    pub needs_conversion: bool,
    pub initial: ImageState,
    pub memory_preference: vk::MemoryPropertyFlags,
}

impl ImageInfo {
    fn from_selection(
        selection: FormatSelection,
        usage: vk::ImageUsageFlags,
        width: u32,
        height: u32,
        initial: ImageState,
    ) -> Self {
        let memory_preference = if selection.tiling == vk::ImageTiling::LINEAR {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };

        Self {
            format: selection.format,
            vk_format: selection.vk_format,
            components: selection.components,
            tiling: selection.tiling,
            usage,
            width,
            height,
            flags: selection.flags,
            conversion: selection.conversion,
            shader_op: selection.shader_op,
            needs_conversion: selection.needs_conversion,
            initial,
            memory_preference,
        }
    }

    /// Plans a CPU→GPU staging target: linear tiling so the host can write
    /// the texels directly, starting preinitialized.
    pub fn for_upload(
        query: &impl FormatQuery,
        format: MemoryFormat,
        conversion: Conversion,
        width: u32,
        height: u32,
    ) -> Result<ImageInfo, Error> {
        debug_assert!(width > 0 && height > 0);

        let usage = vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::SAMPLED;
        let selection = select_format(
            query,
            format,
            conversion,
            ImageFlags::empty(),
            vk::ImageTiling::LINEAR,
            usage,
            width,
            height,
        )
        .ok_or(Error::UnsupportedFormat {
            format,
            width,
            height,
        })?;

        Ok(Self::from_selection(
            selection,
            usage,
            width,
            height,
            ImageState::new(
                vk::PipelineStageFlags::TRANSFER,
                vk::ImageLayout::PREINITIALIZED,
                vk::AccessFlags::TRANSFER_WRITE,
            ),
        ))
    }

    /// Plans an atlas for batched small-texture packing: device-local,
    /// filterable and renderable.
    pub fn for_atlas(query: &impl FormatQuery, width: u32, height: u32) -> Result<ImageInfo, Error> {
        debug_assert!(width > 0 && height > 0);

        let usage = vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED;
        let selection = select_format(
            query,
            MemoryFormat::Rgba8Premultiplied,
            Conversion::None,
            ImageFlags::FILTERABLE | ImageFlags::RENDERABLE,
            vk::ImageTiling::OPTIMAL,
            usage,
            width,
            height,
        )
        .ok_or(Error::UnsupportedFormat {
            format: MemoryFormat::Rgba8Premultiplied,
            width,
            height,
        })?;

        Ok(Self::from_selection(
            selection,
            usage,
            width,
            height,
            ImageState::new(
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::ImageLayout::UNDEFINED,
                vk::AccessFlags::empty(),
            ),
        ))
    }

    /// Plans an offscreen render target, optionally mipmap-capable.
    pub fn for_offscreen(
        query: &impl FormatQuery,
        format: MemoryFormat,
        try_srgb: bool,
        with_mipmap: bool,
        width: u32,
        height: u32,
    ) -> Result<ImageInfo, Error> {
        debug_assert!(width > 0 && height > 0);

        let usage = vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST;
        let required = ImageFlags::RENDERABLE
            | if with_mipmap {
                ImageFlags::CAN_MIPMAP | ImageFlags::FILTERABLE
            } else {
                ImageFlags::empty()
            };
        let selection = select_format(
            query,
            format,
            if try_srgb {
                Conversion::Srgb
            } else {
                Conversion::None
            },
            required,
            vk::ImageTiling::OPTIMAL,
            usage,
            width,
            height,
        )
        .ok_or(Error::UnsupportedFormat {
            format,
            width,
            height,
        })?;

        Ok(Self::from_selection(
            selection,
            usage,
            width,
            height,
            ImageState::new(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::ImageLayout::UNDEFINED,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
        ))
    }

    pub fn mip_levels(&self) -> u32 {
        if self.flags.contains(ImageFlags::CAN_MIPMAP) {
            mip_levels(self.width, self.height)
        } else {
            1
        }
    }
}

/// The purposes an image can be requested for by the rendering pipeline.
#[derive(Debug, Clone, Copy)]
pub enum ImagePurpose {
    Upload,
    /// Ignores the requested format; atlases are always the default
    /// premultiplied RGBA layout.
    Atlas,
    Offscreen {
        try_srgb: bool,
        with_mipmap: bool,
    },
}

pub struct Image {
    pub(crate) device: Arc<Device>,
    pub(crate) inner: vk::Image,
    pub(crate) view: vk::ImageView,
    pub(crate) framebuffer: Option<vk::Framebuffer>,
    pub(crate) framebuffer_view: Option<vk::ImageView>,
    pub(crate) descriptor_sets: [Option<DescriptorEntry>; SamplerKind::COUNT],
    pub(crate) ycbcr: Option<Arc<Ycbcr>>,
    pub(crate) import_semaphore: Option<Semaphore>,
    pub(crate) sync: SyncState,
    pub(crate) memory: ImageMemory,
    pub(crate) owns_image: bool,
    pub(crate) format: MemoryFormat,
    pub(crate) vk_format: vk::Format,
    pub(crate) components: vk::ComponentMapping,
    pub(crate) tiling: vk::ImageTiling,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) flags: ImageFlags,
    pub(crate) conversion: Conversion,
    pub(crate) shader_op: ShaderOp,
}

impl Image {
    /// Executes a construction plan.
    pub fn new(device: Arc<Device>, info: ImageInfo) -> Result<Image, Error> {
        debug_assert!(info.width > 0 && info.height > 0);

        let mut flags = info.flags;
        let mut shader_op = info.shader_op;

        // A color-model conversion or a multi-planar format forces the
        // "external" sampling path through a shared conversion object.
        let ycbcr = if info.conversion.ycbcr().is_some() || info.needs_conversion {
            let (model, range) = info.conversion.ycbcr().unwrap_or((
                vk::SamplerYcbcrModelConversion::RGB_IDENTITY,
                vk::SamplerYcbcrRange::ITU_FULL,
            ));
            let entry = Ycbcr::get(
                &device,
                YcbcrInfo {
                    vk_format: info.vk_format,
                    components: mapping_to_array(&info.components),
                    model,
                    range,
                },
            )?;
            flags |= ImageFlags::EXTERNAL;
            shader_op = ShaderOp::Default;
            Some(entry)
        } else {
            None
        };

        let usage = info.usage
            | if flags.intersects(ImageFlags::BLIT | ImageFlags::DOWNLOADABLE) {
                vk::ImageUsageFlags::TRANSFER_SRC
            } else {
                vk::ImageUsageFlags::empty()
            };

        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(info.vk_format)
            .extent(vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: 1,
            })
            .mip_levels(info.mip_levels())
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(info.tiling)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(info.initial.layout);
        let inner = unsafe { device.inner.create_image(&create_info, None)? };

        let mut image = Image {
            device: device.clone(),
            inner,
            view: vk::ImageView::null(),
            framebuffer: None,
            framebuffer_view: None,
            descriptor_sets: [None; SamplerKind::COUNT],
            ycbcr,
            import_semaphore: None,
            sync: SyncState::new(info.initial),
            memory: ImageMemory::None,
            owns_image: true,
            format: info.format,
            vk_format: info.vk_format,
            components: info.components,
            tiling: info.tiling,
            width: info.width,
            height: info.height,
            flags,
            conversion: info.conversion,
            shader_op,
        };

        let requirements = unsafe { device.inner.get_image_memory_requirements(inner) };
        let pool = device.find_allocator(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::empty(),
            info.memory_preference,
        )?;
        let allocation = pool.allocate(requirements.size, requirements.alignment)?;
        image.memory = ImageMemory::Pooled { pool, allocation };

        unsafe {
            device
                .inner
                .bind_image_memory(inner, allocation.memory, allocation.offset)?
        };

        image.view = create_view(
            &device,
            inner,
            info.vk_format,
            &info.components,
            image.ycbcr.as_deref(),
        )?;

        Ok(image)
    }

    pub fn new_for_upload(
        device: Arc<Device>,
        format: MemoryFormat,
        conversion: Conversion,
        width: u32,
        height: u32,
    ) -> Result<Image, Error> {
        let info = ImageInfo::for_upload(device.as_ref(), format, conversion, width, height)?;
        Self::new(device, info)
    }

    pub fn new_for_atlas(device: Arc<Device>, width: u32, height: u32) -> Result<Image, Error> {
        let info = ImageInfo::for_atlas(device.as_ref(), width, height)?;
        Self::new(device, info)
    }

    pub fn new_for_offscreen(
        device: Arc<Device>,
        format: MemoryFormat,
        try_srgb: bool,
        with_mipmap: bool,
        width: u32,
        height: u32,
    ) -> Result<Image, Error> {
        let info = ImageInfo::for_offscreen(
            device.as_ref(),
            format,
            try_srgb,
            with_mipmap,
            width,
            height,
        )?;
        Self::new(device, info)
    }

    /// Wraps an image whose memory the presentation layer owns. The wrapper
    /// destroys neither the image nor any memory.
    pub fn for_swapchain(
        device: Arc<Device>,
        image: vk::Image,
        vk_format: vk::Format,
        format: MemoryFormat,
        width: u32,
        height: u32,
    ) -> Result<Image, Error> {
        let conversion = if format.vk_srgb_format() == Some(vk_format) {
            Conversion::Srgb
        } else {
            Conversion::None
        };

        let mut wrapper = Image {
            device: device.clone(),
            inner: image,
            view: vk::ImageView::null(),
            framebuffer: None,
            framebuffer_view: None,
            descriptor_sets: [None; SamplerKind::COUNT],
            ycbcr: None,
            import_semaphore: None,
            sync: SyncState::new(ImageState::new(
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::ImageLayout::UNDEFINED,
                vk::AccessFlags::empty(),
            )),
            memory: ImageMemory::None,
            owns_image: false,
            format,
            vk_format,
            components: crate::identity_mapping(),
            tiling: vk::ImageTiling::OPTIMAL,
            width,
            height,
            flags: ImageFlags::empty(),
            conversion,
            shader_op: ShaderOp::Default,
        };

        wrapper.view = create_view(
            &device,
            image,
            vk_format,
            &crate::identity_mapping(),
            None,
        )?;

        Ok(wrapper)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> MemoryFormat {
        self.format
    }

    pub fn vk_format(&self) -> vk::Format {
        self.vk_format
    }

    pub fn components(&self) -> vk::ComponentMapping {
        self.components
    }

    pub fn tiling(&self) -> vk::ImageTiling {
        self.tiling
    }

    pub fn flags(&self) -> ImageFlags {
        self.flags
    }

    pub fn conversion(&self) -> Conversion {
        self.conversion
    }

    pub fn shader_op(&self) -> ShaderOp {
        self.shader_op
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn vk_image(&self) -> vk::Image {
        self.inner
    }

    pub fn ycbcr(&self) -> Option<&Arc<Ycbcr>> {
        self.ycbcr.as_ref()
    }

    pub fn state(&self) -> ImageState {
        self.sync.current()
    }

    /// Overwrites the tracked synchronization state without a barrier, for
    /// transitions performed by a render pass.
    pub fn set_state(&mut self, state: ImageState) {
        self.sync.set(state);
    }

    /// Brings the image into `target` before the next GPU operation,
    /// emitting at most one barrier and consuming a pending import
    /// semaphore on the first transition away from the import sentinel.
    pub fn transition(&mut self, target: ImageState, sink: &mut dyn TransitionSink) {
        self.sync.transition(self.inner, target, sink);
    }

    /// Whether the host can write the image's texels directly.
    pub fn can_map(&self) -> bool {
        if self.tiling != vk::ImageTiling::LINEAR {
            return false;
        }

        let layout = self.sync.current().layout;
        if layout != vk::ImageLayout::PREINITIALIZED && layout != vk::ImageLayout::GENERAL {
            return false;
        }

        let allocation = match &self.memory {
            ImageMemory::Pooled { allocation, .. } | ImageMemory::Dedicated { allocation } => {
                allocation
            }
            ImageMemory::None => return false,
        };
        allocation
            .memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_CACHED)
            && !allocation.map.is_null()
    }

    /// The host mapping and per-plane layout of a mappable image, or `None`
    /// when [`can_map`](Self::can_map) does not hold.
    pub fn mapped_data(&self) -> Option<(*mut u8, MemoryLayout)> {
        const PLANE_ASPECTS: [vk::ImageAspectFlags; 3] = [
            vk::ImageAspectFlags::PLANE_0,
            vk::ImageAspectFlags::PLANE_1,
            vk::ImageAspectFlags::PLANE_2,
        ];

        if !self.can_map() {
            return None;
        }

        let allocation = match &self.memory {
            ImageMemory::Pooled { allocation, .. } | ImageMemory::Dedicated { allocation } => {
                allocation
            }
            ImageMemory::None => return None,
        };

        let n_planes = self.format.n_planes();
        let mut planes = [MemoryPlane::default(); MAX_PLANES];
        for (plane, slot) in planes.iter_mut().enumerate().take(n_planes) {
            let subresource = vk::ImageSubresource {
                aspect_mask: if n_planes == 1 {
                    vk::ImageAspectFlags::COLOR
                } else {
                    PLANE_ASPECTS[plane]
                },
                mip_level: 0,
                array_layer: 0,
            };
            let layout = unsafe {
                self.device
                    .inner
                    .get_image_subresource_layout(self.inner, subresource)
            };
            *slot = MemoryPlane {
                offset: layout.offset,
                stride: layout.row_pitch,
            };
        }

        Some((
            allocation.map,
            MemoryLayout {
                format: self.format,
                width: self.width,
                height: self.height,
                size: allocation.size,
                n_planes,
                planes,
            },
        ))
    }

    /// The cached descriptor set for one sampler configuration, created on
    /// first use. Images never hold more than one set per configuration.
    pub fn descriptor_set(&mut self, kind: SamplerKind) -> Result<vk::DescriptorSet, Error> {
        let index = kind.index();
        if let Some(entry) = &self.descriptor_sets[index] {
            return Ok(entry.set);
        }

        let layout = match &self.ycbcr {
            Some(ycbcr) => ycbcr.descriptor_set_layout(),
            None => self.device.image_set_layout()?,
        };
        let (set, pool_id) = self.device.allocate_descriptor(layout)?;

        let sampler = match &self.ycbcr {
            Some(ycbcr) => ycbcr.sampler(),
            None => self.device.sampler(kind)?,
        };
        let image_info = vk::DescriptorImageInfo {
            sampler,
            image_view: self.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(std::slice::from_ref(&image_info));
        unsafe {
            self.device
                .inner
                .update_descriptor_sets(&[write.build()], &[])
        };

        self.descriptor_sets[index] = Some(DescriptorEntry { set, pool_id });
        Ok(set)
    }

    /// The framebuffer rendering into this image, created on first use.
    /// Mipmap-capable images render through a dedicated single-level view,
    /// since the sampling view spans the whole chain.
    pub fn framebuffer(&mut self, render_pass: vk::RenderPass) -> Result<vk::Framebuffer, Error> {
        if let Some(framebuffer) = self.framebuffer {
            return Ok(framebuffer);
        }

        let framebuffer_view = if self.flags.contains(ImageFlags::CAN_MIPMAP) {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(self.inner)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.vk_format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            unsafe { self.device.inner.create_image_view(&view_info, None)? }
        } else {
            self.view
        };
        self.framebuffer_view = Some(framebuffer_view);

        let attachments = [framebuffer_view];
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(self.width)
            .height(self.height)
            .layers(1);
        let framebuffer = unsafe {
            self.device
                .inner
                .create_framebuffer(&framebuffer_info, None)?
        };
        self.framebuffer = Some(framebuffer);
        Ok(framebuffer)
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            for entry in self.descriptor_sets.iter().flatten() {
                self.device.free_descriptor(entry.pool_id, entry.set);
            }

            if let Some(framebuffer) = self.framebuffer.take() {
                self.device.inner.destroy_framebuffer(framebuffer, None);
            }
            if let Some(framebuffer_view) = self.framebuffer_view.take() {
                if framebuffer_view != self.view {
                    self.device.inner.destroy_image_view(framebuffer_view, None);
                }
            }
            if self.view != vk::ImageView::null() {
                self.device.inner.destroy_image_view(self.view, None);
            }

            if self.owns_image {
                self.device.inner.destroy_image(self.inner, None);
            }

            match std::mem::replace(&mut self.memory, ImageMemory::None) {
                ImageMemory::None => {}
                ImageMemory::Pooled { pool, allocation } => pool.free(allocation),
                ImageMemory::Dedicated { allocation } => {
                    self.device.inner.free_memory(allocation.memory, None)
                }
            }
        }
    }
}

/// Creates the sampling view for an image. When a YCbCr conversion is
/// attached the swizzle must be identity; the conversion handles the
/// channel mapping.
pub(crate) fn create_view(
    device: &Device,
    image: vk::Image,
    vk_format: vk::Format,
    components: &vk::ComponentMapping,
    ycbcr: Option<&Ycbcr>,
) -> Result<vk::ImageView, Error> {
    let mut conversion_info = vk::SamplerYcbcrConversionInfo::builder()
        .conversion(ycbcr.map(Ycbcr::conversion).unwrap_or_default());

    let mut view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(vk_format)
        .components(if ycbcr.is_some() {
            vk::ComponentMapping::default()
        } else {
            *components
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: 1,
        });
    if ycbcr.is_some() {
        view_info = view_info.push_next(&mut conversion_info);
    }

    let view = unsafe { device.inner.create_image_view(&view_info, None)? };
    Ok(view)
}

impl Device {
    /// The rendering pipeline's image request entry point.
    pub fn request_image(
        self: &Arc<Self>,
        purpose: ImagePurpose,
        format: MemoryFormat,
        conversion: Conversion,
        width: u32,
        height: u32,
    ) -> Result<Image, Error> {
        match purpose {
            ImagePurpose::Upload => {
                Image::new_for_upload(self.clone(), format, conversion, width, height)
            }
            ImagePurpose::Atlas => Image::new_for_atlas(self.clone(), width, height),
            ImagePurpose::Offscreen {
                try_srgb,
                with_mipmap,
            } => Image::new_for_offscreen(
                self.clone(),
                format,
                try_srgb,
                with_mipmap,
                width,
                height,
            ),
        }
    }
}
