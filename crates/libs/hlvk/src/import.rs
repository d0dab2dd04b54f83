//! External-memory interop: dma-buf and D3D12 resource import, plus
//! dma-buf export for handing rendered images back to the presentation
//! layer.
//!
//! Every import failure is an expected condition: the functions return
//! `None` (logged at debug level) so the caller can fall back to a CPU copy
//! path. Only programming errors panic.

use std::sync::Arc;

use ash::vk;
use log::debug;
use smallvec::SmallVec;

use crate::image::{create_view, ImageMemory};
use crate::{
    is_framebuffer_compatible, mapping_to_array, select_dmabuf_format, supports_format,
    Allocation, ColorState, Conversion, Device, DeviceFeatures, FormatQuery, Image, ImageFlags,
    ImageState, MemoryFormat, MemoryPlane, SamplerKind, Semaphore, ShaderOp, SyncState, Ycbcr,
    YcbcrInfo, MAX_PLANES,
};

/// Offset, stride and backing fd of one dma-buf plane.
#[derive(Debug, Clone, Copy)]
pub struct PlaneLayout {
    pub fd: i32,
    pub offset: u64,
    pub stride: u64,
}

/// A dma-buf handed over by an external producer.
///
/// The plane fds and the optional sync fd are consumed on successful
/// import; on failure the caller keeps ownership.
#[derive(Debug, Clone)]
pub struct DmabufImport {
    pub fourcc: u32,
    pub modifier: u64,
    pub width: u32,
    pub height: u32,
    pub planes: SmallVec<[PlaneLayout; MAX_PLANES]>,
    /// Sync file representing the producer's outstanding writes.
    pub sync_fd: Option<i32>,
    pub premultiplied: bool,
    /// Colorimetry of the producer's data.
    pub conversion: Conversion,
}

impl DmabufImport {
    /// Planes living in separate buffer objects cannot be bound to a single
    /// memory object.
    pub fn is_disjoint(&self) -> bool {
        self.planes
            .iter()
            .any(|plane| plane.fd != self.planes[0].fd)
    }
}

/// A shared D3D12 resource plus an optional fence guarding it.
///
/// The caller provides the resource description; querying it requires the
/// D3D12 API, which lives on the other side of the interop boundary.
#[derive(Debug, Clone)]
pub struct D3d12Import {
    /// Shared NT handle of the resource.
    pub resource_handle: isize,
    /// Shared NT handle of the fence, if any.
    pub fence_handle: Option<isize>,
    /// Timeline value to wait for before consuming the resource.
    pub fence_wait: u64,
    pub dxgi_format: u32,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub premultiplied: bool,
}

/// The external memory objects an [`Image`] can be built from.
#[derive(Debug, Clone)]
pub enum ImportDescriptor {
    Dmabuf(DmabufImport),
    D3d12(D3d12Import),
}

/// The negotiated shape of a dma-buf import, before any Vulkan object is
/// created.
#[derive(Debug, Clone, Copy)]
pub struct DmabufImportPlan {
    pub format: MemoryFormat,
    pub vk_format: vk::Format,
    pub components: vk::ComponentMapping,
    pub flags: ImageFlags,
    pub conversion: Conversion,
    pub shader_op: ShaderOp,
    pub needs_conversion: bool,
    pub is_yuv: bool,
}

/// Resolves whether a dma-buf can be imported at all: fourcc, modifier,
/// plane count and YCbCr capability all have to line up.
pub fn plan_dmabuf_import(
    query: &impl FormatQuery,
    features: DeviceFeatures,
    import: &DmabufImport,
) -> Option<DmabufImportPlan> {
    if !features.contains(DeviceFeatures::DMABUF) {
        debug!("[Vulkan] Device does not support dmabuf import");
        return None;
    }

    if import.planes.is_empty() {
        debug!("[Vulkan] Rejecting dmabuf without planes");
        return None;
    }

    if import.is_disjoint() {
        // Binding each plane to its own memory object is not supported.
        debug!("[Vulkan] Rejecting disjoint dmabuf");
        return None;
    }

    let Some((format, is_yuv)) =
        MemoryFormat::from_dmabuf_fourcc(import.fourcc, import.premultiplied)
    else {
        debug!("[Vulkan] Unsupported dmabuf fourcc {:#010x}", import.fourcc);
        return None;
    };
    let mapping = format.vk_format();

    if mapping.needs_conversion && !features.contains(DeviceFeatures::YCBCR) {
        debug!(
            "[Vulkan] Cannot import {:?} dmabuf without YCbCr support",
            format
        );
        return None;
    }

    let Some(mut flags) = supports_format(
        query,
        mapping.vk_format,
        Some(import.modifier),
        import.planes.len() as u32,
        vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT,
        vk::ImageUsageFlags::SAMPLED,
        import.width,
        import.height,
    ) else {
        debug!(
            "[Vulkan] Device does not support format {:#010x} with modifier {:#018x} and {} planes",
            import.fourcc,
            import.modifier,
            import.planes.len()
        );
        return None;
    };

    let conversion = if query.supports_conversion(import.conversion) {
        import.conversion
    } else {
        Conversion::None
    };

    let uses_ycbcr = mapping.needs_conversion || conversion.ycbcr().is_some();
    if uses_ycbcr {
        flags |= ImageFlags::EXTERNAL;
    }
    if mapping.needs_conversion || !is_framebuffer_compatible(&mapping.components) {
        flags -= ImageFlags::BLIT;
    }

    let shader_op = if uses_ycbcr {
        ShaderOp::Default
    } else {
        format.default_shader_op()
    };

    Some(DmabufImportPlan {
        format,
        vk_format: mapping.vk_format,
        components: mapping.components,
        flags,
        conversion,
        shader_op,
        needs_conversion: mapping.needs_conversion,
        is_yuv,
    })
}

impl Device {
    /// Builds an image from a foreign memory object. Returns `None` when the
    /// device cannot import this particular resource shape; the caller is
    /// expected to fall back to a CPU copy path.
    pub fn import_external_memory(self: &Arc<Self>, descriptor: &ImportDescriptor) -> Option<Image> {
        match descriptor {
            ImportDescriptor::Dmabuf(import) => import_dmabuf(self, import),
            #[cfg(windows)]
            ImportDescriptor::D3d12(import) => import_d3d12(self, import),
            #[cfg(not(windows))]
            ImportDescriptor::D3d12(_) => {
                debug!("[Vulkan] D3D12 resource import is only available on Windows");
                None
            }
        }
    }
}

fn import_dmabuf(device: &Arc<Device>, import: &DmabufImport) -> Option<Image> {
    let plan = plan_dmabuf_import(device.as_ref(), device.features(), import)?;

    let initial = ImageState::new(
        vk::PipelineStageFlags::TOP_OF_PIPE,
        // The producer's exact prior state is unknowable.
        vk::ImageLayout::GENERAL,
        vk::AccessFlags::empty(),
    );

    let plane_layouts = import
        .planes
        .iter()
        .map(|plane| vk::SubresourceLayout {
            offset: plane.offset,
            size: 0,
            row_pitch: plane.stride,
            array_pitch: 0,
            depth_pitch: 0,
        })
        .collect::<SmallVec<[vk::SubresourceLayout; MAX_PLANES]>>();

    let mut modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::builder()
        .drm_format_modifier(import.modifier)
        .plane_layouts(&plane_layouts);
    let mut external_info = vk::ExternalMemoryImageCreateInfo::builder()
        .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
    let usage = vk::ImageUsageFlags::SAMPLED
        | if plan
            .flags
            .intersects(ImageFlags::BLIT | ImageFlags::DOWNLOADABLE)
        {
            vk::ImageUsageFlags::TRANSFER_SRC
        } else {
            vk::ImageUsageFlags::empty()
        };
    let create_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(plan.vk_format)
        .extent(vk::Extent3D {
            width: import.width,
            height: import.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(initial.layout)
        .push_next(&mut external_info)
        .push_next(&mut modifier_info);

    let image = match unsafe { device.inner.create_image(&create_info, None) } {
        Ok(image) => image,
        Err(err) => {
            debug!("[Vulkan] vkCreateImage() failed for dmabuf import: {err}");
            return None;
        }
    };

    let destroy_image = || unsafe { device.inner.destroy_image(image, None) };

    let fd = import.planes[0].fd;
    let mut fd_properties = vk::MemoryFdPropertiesKHR::default();
    let result = unsafe {
        (device.fns.external_memory_fd.get_memory_fd_properties_khr)(
            device.inner.handle(),
            vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
            fd,
            &mut fd_properties,
        )
    };
    if result != vk::Result::SUCCESS {
        debug!("[Vulkan] vkGetMemoryFdPropertiesKHR() failed: {result}");
        destroy_image();
        return None;
    }

    let mut requirements = vk::MemoryRequirements2::default();
    let requirements_info = vk::ImageMemoryRequirementsInfo2::builder().image(image);
    unsafe {
        device
            .inner
            .get_image_memory_requirements2(&requirements_info, &mut requirements)
    };
    let size = requirements.memory_requirements.size;

    let Some(memory_type) = device.find_memory_type_index(
        fd_properties.memory_type_bits,
        vk::MemoryPropertyFlags::empty(),
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    ) else {
        debug!("[Vulkan] No memory type accepts the dmabuf fd");
        destroy_image();
        return None;
    };

    // Waiting on the producer happens on the first transition away from
    // the GENERAL sentinel, not here.
    let import_semaphore = match import.sync_fd {
        Some(sync_fd) if device.has_feature(DeviceFeatures::SEMAPHORE_IMPORT) => {
            match Semaphore::import_sync_fd(device.clone(), sync_fd) {
                Ok(semaphore) => Some(semaphore),
                Err(err) => {
                    debug!("[Vulkan] Failed to import sync fd: {err}");
                    None
                }
            }
        }
        _ => None,
    };

    let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder().image(image);
    let mut import_info = vk::ImportMemoryFdInfoKHR::builder()
        .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
        .fd(fd);
    let allocate_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(size)
        .memory_type_index(memory_type)
        .push_next(&mut dedicated_info)
        .push_next(&mut import_info);
    let memory = match unsafe { device.inner.allocate_memory(&allocate_info, None) } {
        Ok(memory) => memory,
        Err(err) => {
            debug!("[Vulkan] Failed to import dmabuf memory: {err}");
            destroy_image();
            return None;
        }
    };

    let bind_info = vk::BindImageMemoryInfo::builder()
        .image(image)
        .memory(memory)
        .memory_offset(0)
        .build();
    if let Err(err) = unsafe { device.inner.bind_image_memory2(&[bind_info]) } {
        debug!("[Vulkan] Failed to bind imported dmabuf memory: {err}");
        unsafe { device.inner.free_memory(memory, None) };
        destroy_image();
        return None;
    }

    let ycbcr = if plan.needs_conversion || plan.conversion.ycbcr().is_some() {
        let (model, range) = plan.conversion.ycbcr().unwrap_or((
            vk::SamplerYcbcrModelConversion::RGB_IDENTITY,
            vk::SamplerYcbcrRange::ITU_FULL,
        ));
        match Ycbcr::get(
            device,
            YcbcrInfo {
                vk_format: plan.vk_format,
                components: mapping_to_array(&plan.components),
                model,
                range,
            },
        ) {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!("[Vulkan] Failed to create YCbCr conversion: {err}");
                unsafe { device.inner.free_memory(memory, None) };
                destroy_image();
                return None;
            }
        }
    } else {
        None
    };

    let view = match create_view(
        device,
        image,
        plan.vk_format,
        &plan.components,
        ycbcr.as_deref(),
    ) {
        Ok(view) => view,
        Err(err) => {
            debug!("[Vulkan] Failed to create dmabuf image view: {err}");
            unsafe { device.inner.free_memory(memory, None) };
            destroy_image();
            return None;
        }
    };

    let sync = match &import_semaphore {
        Some(semaphore) => SyncState::with_import_wait(
            initial,
            crate::barrier::ImportWait {
                semaphore: semaphore.inner,
                value: 0,
            },
        ),
        None => SyncState::new(initial),
    };

    debug!(
        "[Vulkan] Imported {}x{} {}dmabuf, fourcc {:#010x}, modifier {:#018x}",
        import.width,
        import.height,
        if plan.is_yuv { "YUV " } else { "" },
        import.fourcc,
        import.modifier,
    );

    Some(Image {
        device: device.clone(),
        inner: image,
        view,
        framebuffer: None,
        framebuffer_view: None,
        descriptor_sets: [None; SamplerKind::COUNT],
        ycbcr,
        import_semaphore,
        sync,
        memory: ImageMemory::Dedicated {
            allocation: Allocation::dedicated(
                memory,
                size,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ),
        },
        owns_image: true,
        format: plan.format,
        vk_format: plan.vk_format,
        components: plan.components,
        tiling: vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT,
        width: import.width,
        height: import.height,
        flags: plan.flags,
        conversion: plan.conversion,
        shader_op: plan.shader_op,
    })
}

#[cfg(windows)]
fn import_d3d12(device: &Arc<Device>, import: &D3d12Import) -> Option<Image> {
    if !device.has_feature(DeviceFeatures::WIN32) {
        debug!("[Vulkan] Device does not support D3D12 resource import");
        return None;
    }

    let Some(format) = MemoryFormat::from_dxgi_format(import.dxgi_format, import.premultiplied)
    else {
        debug!("[Vulkan] Unsupported DXGI format {}", import.dxgi_format);
        return None;
    };
    let mapping = format.vk_format();

    if mapping.needs_conversion && !device.has_feature(DeviceFeatures::YCBCR) {
        debug!(
            "[Vulkan] Cannot import DXGI format {} without YCbCr support",
            import.dxgi_format
        );
        return None;
    }

    let Some(mut flags) = supports_format(
        device.as_ref(),
        mapping.vk_format,
        None,
        1,
        vk::ImageTiling::OPTIMAL,
        vk::ImageUsageFlags::SAMPLED,
        import.width,
        import.height,
    ) else {
        debug!(
            "[Vulkan] Device does not support DXGI format {}",
            import.dxgi_format
        );
        return None;
    };

    // The resource's existing mip chain dictates mipmapping; the image is
    // foreign, so rendering into it is out of the question.
    flags -= ImageFlags::CAN_MIPMAP | ImageFlags::RENDERABLE;
    if import.mip_levels > 1 {
        flags |= ImageFlags::CAN_MIPMAP | ImageFlags::MIPMAP;
    }
    if mapping.needs_conversion {
        flags |= ImageFlags::EXTERNAL;
        flags -= ImageFlags::BLIT;
    }

    let initial = ImageState::new(
        vk::PipelineStageFlags::TOP_OF_PIPE,
        vk::ImageLayout::GENERAL,
        vk::AccessFlags::empty(),
    );

    let mut external_info = vk::ExternalMemoryImageCreateInfo::builder()
        .handle_types(vk::ExternalMemoryHandleTypeFlags::D3D12_RESOURCE);
    let usage = vk::ImageUsageFlags::SAMPLED
        | if flags.intersects(ImageFlags::BLIT | ImageFlags::DOWNLOADABLE) {
            vk::ImageUsageFlags::TRANSFER_SRC
        } else {
            vk::ImageUsageFlags::empty()
        };
    let create_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(mapping.vk_format)
        .extent(vk::Extent3D {
            width: import.width,
            height: import.height,
            depth: 1,
        })
        .mip_levels(import.mip_levels.max(1))
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(initial.layout)
        .push_next(&mut external_info);

    let image = match unsafe { device.inner.create_image(&create_info, None) } {
        Ok(image) => image,
        Err(err) => {
            debug!("[Vulkan] vkCreateImage() failed for D3D12 import: {err}");
            return None;
        }
    };

    let destroy_image = || unsafe { device.inner.destroy_image(image, None) };

    let mut handle_properties = vk::MemoryWin32HandlePropertiesKHR::default();
    let result = unsafe {
        (device
            .fns
            .external_memory_win32
            .get_memory_win32_handle_properties_khr)(
            device.inner.handle(),
            vk::ExternalMemoryHandleTypeFlags::D3D12_RESOURCE,
            import.resource_handle as vk::HANDLE,
            &mut handle_properties,
        )
    };
    if result != vk::Result::SUCCESS {
        debug!("[Vulkan] vkGetMemoryWin32HandlePropertiesKHR() failed: {result}");
        destroy_image();
        return None;
    }

    let mut requirements = vk::MemoryRequirements2::default();
    let requirements_info = vk::ImageMemoryRequirementsInfo2::builder().image(image);
    unsafe {
        device
            .inner
            .get_image_memory_requirements2(&requirements_info, &mut requirements)
    };
    let size = requirements.memory_requirements.size;

    let Some(memory_type) = device.find_memory_type_index(
        handle_properties.memory_type_bits,
        vk::MemoryPropertyFlags::empty(),
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    ) else {
        debug!("[Vulkan] No memory type accepts the D3D12 resource");
        destroy_image();
        return None;
    };

    let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder().image(image);
    let mut import_info = vk::ImportMemoryWin32HandleInfoKHR::builder()
        .handle_type(vk::ExternalMemoryHandleTypeFlags::D3D12_RESOURCE)
        .handle(import.resource_handle as vk::HANDLE);
    let allocate_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(size)
        .memory_type_index(memory_type)
        .push_next(&mut dedicated_info)
        .push_next(&mut import_info);
    let memory = match unsafe { device.inner.allocate_memory(&allocate_info, None) } {
        Ok(memory) => memory,
        Err(err) => {
            debug!("[Vulkan] Failed to import D3D12 resource memory: {err}");
            destroy_image();
            return None;
        }
    };

    let bind_info = vk::BindImageMemoryInfo::builder()
        .image(image)
        .memory(memory)
        .memory_offset(0)
        .build();
    if let Err(err) = unsafe { device.inner.bind_image_memory2(&[bind_info]) } {
        debug!("[Vulkan] Failed to bind imported D3D12 memory: {err}");
        unsafe { device.inner.free_memory(memory, None) };
        destroy_image();
        return None;
    }

    let import_semaphore = match import.fence_handle {
        Some(fence_handle) if device.has_feature(DeviceFeatures::WIN32_SEMAPHORE) => {
            match Semaphore::import_d3d12_fence(device.clone(), fence_handle as vk::HANDLE) {
                Ok(semaphore) => Some(semaphore),
                Err(err) => {
                    debug!("[Vulkan] Failed to import D3D12 fence: {err}");
                    None
                }
            }
        }
        _ => None,
    };

    let ycbcr = if mapping.needs_conversion {
        match Ycbcr::get(
            device,
            YcbcrInfo {
                vk_format: mapping.vk_format,
                components: mapping_to_array(&mapping.components),
                model: vk::SamplerYcbcrModelConversion::RGB_IDENTITY,
                range: vk::SamplerYcbcrRange::ITU_FULL,
            },
        ) {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!("[Vulkan] Failed to create YCbCr conversion: {err}");
                unsafe { device.inner.free_memory(memory, None) };
                destroy_image();
                return None;
            }
        }
    } else {
        None
    };

    let view = match create_view(
        device,
        image,
        mapping.vk_format,
        &mapping.components,
        ycbcr.as_deref(),
    ) {
        Ok(view) => view,
        Err(err) => {
            debug!("[Vulkan] Failed to create D3D12 image view: {err}");
            unsafe { device.inner.free_memory(memory, None) };
            destroy_image();
            return None;
        }
    };

    let sync = match &import_semaphore {
        Some(semaphore) => SyncState::with_import_wait(
            initial,
            crate::barrier::ImportWait {
                semaphore: semaphore.inner,
                value: import.fence_wait,
            },
        ),
        None => SyncState::new(initial),
    };

    let shader_op = if mapping.needs_conversion {
        ShaderOp::Default
    } else {
        format.default_shader_op()
    };

    debug!(
        "[Vulkan] Imported {}x{} D3D12 resource of {}format {}",
        import.width,
        import.height,
        if mapping.needs_conversion { "YUV " } else { "" },
        import.dxgi_format,
    );

    Some(Image {
        device: device.clone(),
        inner: image,
        view,
        framebuffer: None,
        framebuffer_view: None,
        descriptor_sets: [None; SamplerKind::COUNT],
        ycbcr,
        import_semaphore,
        sync,
        memory: ImageMemory::Dedicated {
            allocation: Allocation::dedicated(
                memory,
                size,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            ),
        },
        owns_image: true,
        format,
        vk_format: mapping.vk_format,
        components: mapping.components,
        tiling: vk::ImageTiling::OPTIMAL,
        width: import.width,
        height: import.height,
        flags,
        conversion: Conversion::None,
        shader_op,
    })
}

/// A dma-buf-backed texture exported for the presentation layer. The caller
/// takes ownership of the file descriptor.
#[derive(Debug, Clone)]
pub struct DmabufTexture {
    pub fd: i32,
    pub fourcc: u32,
    pub modifier: u64,
    pub width: u32,
    pub height: u32,
    pub n_planes: usize,
    pub planes: [MemoryPlane; MAX_PLANES],
    pub premultiplied: bool,
    pub color_state: ColorState,
}

impl Image {
    /// Creates an image whose memory can be exported as a dma-buf, the
    /// producer side of handing textures back to the presentation layer.
    pub fn new_dmabuf(
        device: &Arc<Device>,
        format: MemoryFormat,
        try_srgb: bool,
        width: u32,
        height: u32,
    ) -> Option<Image> {
        if !device.has_feature(DeviceFeatures::DMABUF) {
            debug!("[Vulkan] Device cannot allocate exportable dmabufs");
            return None;
        }

        let selection = select_dmabuf_format(device.as_ref(), format, try_srgb, width, height)?;

        let initial = ImageState::new(
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::ImageLayout::UNDEFINED,
            vk::AccessFlags::empty(),
        );

        let mut modifier_list = vk::ImageDrmFormatModifierListCreateInfoEXT::builder()
            .drm_format_modifiers(&selection.modifiers);
        let mut external_info = vk::ExternalMemoryImageCreateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let usage = vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::COLOR_ATTACHMENT
            | if selection
                .flags
                .intersects(ImageFlags::BLIT | ImageFlags::DOWNLOADABLE)
            {
                vk::ImageUsageFlags::TRANSFER_SRC
            } else {
                vk::ImageUsageFlags::empty()
            };
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(selection.vk_format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(initial.layout)
            .push_next(&mut external_info)
            .push_next(&mut modifier_list);

        let image = match unsafe { device.inner.create_image(&create_info, None) } {
            Ok(image) => image,
            Err(err) => {
                debug!("[Vulkan] vkCreateImage() failed for exportable dmabuf: {err}");
                return None;
            }
        };
        let destroy_image = || unsafe { device.inner.destroy_image(image, None) };

        let requirements = unsafe { device.inner.get_image_memory_requirements(image) };
        let Some(memory_type) = device.find_memory_type_index(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::empty(),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) else {
            debug!("[Vulkan] No memory type for exportable dmabuf");
            destroy_image();
            return None;
        };

        let mut export_info = vk::ExportMemoryAllocateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type)
            .push_next(&mut export_info);
        let memory = match unsafe { device.inner.allocate_memory(&allocate_info, None) } {
            Ok(memory) => memory,
            Err(err) => {
                debug!("[Vulkan] Failed to allocate exportable dmabuf memory: {err}");
                destroy_image();
                return None;
            }
        };

        if let Err(err) = unsafe { device.inner.bind_image_memory(image, memory, 0) } {
            debug!("[Vulkan] Failed to bind exportable dmabuf memory: {err}");
            unsafe { device.inner.free_memory(memory, None) };
            destroy_image();
            return None;
        }

        let ycbcr = if selection.needs_conversion {
            match Ycbcr::get(
                device,
                YcbcrInfo {
                    vk_format: selection.vk_format,
                    components: mapping_to_array(&selection.components),
                    model: vk::SamplerYcbcrModelConversion::RGB_IDENTITY,
                    range: vk::SamplerYcbcrRange::ITU_FULL,
                },
            ) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    debug!("[Vulkan] Failed to create YCbCr conversion: {err}");
                    unsafe { device.inner.free_memory(memory, None) };
                    destroy_image();
                    return None;
                }
            }
        } else {
            None
        };

        let view = match create_view(
            device,
            image,
            selection.vk_format,
            &selection.components,
            ycbcr.as_deref(),
        ) {
            Ok(view) => view,
            Err(err) => {
                debug!("[Vulkan] Failed to create exportable dmabuf view: {err}");
                unsafe { device.inner.free_memory(memory, None) };
                destroy_image();
                return None;
            }
        };

        Some(Image {
            device: device.clone(),
            inner: image,
            view,
            framebuffer: None,
            framebuffer_view: None,
            descriptor_sets: [None; SamplerKind::COUNT],
            ycbcr,
            import_semaphore: None,
            sync: SyncState::new(initial),
            memory: ImageMemory::Dedicated {
                allocation: Allocation::dedicated(
                    memory,
                    requirements.size,
                    vk::MemoryPropertyFlags::DEVICE_LOCAL,
                ),
            },
            owns_image: true,
            format: selection.format,
            vk_format: selection.vk_format,
            components: selection.components,
            tiling: vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT,
            width,
            height,
            flags: selection.flags | ImageFlags::EXTERNAL,
            conversion: selection.conversion,
            shader_op: selection.shader_op,
        })
    }

    /// Exports the image as a dma-buf texture handle for the presentation
    /// layer. Returns `None` on any capability or export failure.
    pub fn export_dmabuf(&self, color_state: ColorState) -> Option<DmabufTexture> {
        const PLANE_ASPECTS: [vk::ImageAspectFlags; MAX_PLANES] = [
            vk::ImageAspectFlags::MEMORY_PLANE_0_EXT,
            vk::ImageAspectFlags::MEMORY_PLANE_1_EXT,
            vk::ImageAspectFlags::MEMORY_PLANE_2_EXT,
            vk::ImageAspectFlags::MEMORY_PLANE_3_EXT,
        ];

        if !self.flags.contains(ImageFlags::EXTERNAL) {
            return None;
        }

        let Some(fourcc) = self.format.dmabuf_fourcc() else {
            debug!("[Vulkan] Format {:?} has no dmabuf fourcc", self.format);
            return None;
        };

        let memory = match &self.memory {
            ImageMemory::Dedicated { allocation } => allocation.memory,
            _ => {
                debug!("[Vulkan] Only dedicated external memory can be exported");
                return None;
            }
        };

        let mut modifier_properties = vk::ImageDrmFormatModifierPropertiesEXT::default();
        let result = unsafe {
            (self
                .device
                .fns
                .image_drm_format_modifier
                .get_image_drm_format_modifier_properties_ext)(
                self.device.inner.handle(),
                self.inner,
                &mut modifier_properties,
            )
        };
        if result != vk::Result::SUCCESS {
            debug!("[Vulkan] Failed to query image modifier: {result}");
            return None;
        }
        let modifier = modifier_properties.drm_format_modifier;

        let n_planes = self
            .device
            .drm_modifiers(self.vk_format)
            .iter()
            .find(|info| info.modifier == modifier)
            .map(|info| info.plane_count as usize)?;
        if n_planes == 0 || n_planes > MAX_PLANES {
            return None;
        }

        let get_fd_info = vk::MemoryGetFdInfoKHR::builder()
            .memory(memory)
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let mut fd: i32 = -1;
        let result = unsafe {
            (self.device.fns.external_memory_fd.get_memory_fd_khr)(
                self.device.inner.handle(),
                &*get_fd_info,
                &mut fd,
            )
        };
        if result != vk::Result::SUCCESS {
            debug!("[Vulkan] vkGetMemoryFdKHR() failed: {result}");
            return None;
        }

        let mut planes = [MemoryPlane::default(); MAX_PLANES];
        for (plane, slot) in planes.iter_mut().enumerate().take(n_planes) {
            let subresource = vk::ImageSubresource {
                aspect_mask: PLANE_ASPECTS[plane],
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

        Some(DmabufTexture {
            fd,
            fourcc,
            modifier,
            width: self.width,
            height: self.height,
            n_planes,
            planes,
            premultiplied: self.format.is_premultiplied(),
            color_state,
        })
    }
}
