//! The logical device and the shared per-device state: memory pools, the
//! YCbCr cache, cached samplers and descriptor pools.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::sync::{Arc, Mutex};

use ash::{vk, Instance as AshInstance};
use log::{error, warn};
use once_cell::sync::OnceCell;
use smallvec::SmallVec;

use crate::{
    find_memory_type, Conversion, DeviceFeatures, DrmFormatInfo, Error, FormatQuery,
    ImageFormatLimits, Instance, MemoryBlock, MemoryPool, MemorySource, PhysicalDevice,
    QueueFamily, SamplerKind, SharedCache, Ycbcr, YcbcrInfo,
};

const DESCRIPTOR_POOL_SIZE: u32 = 64;

/// Extension entry points resolved through `vkGetDeviceProcAddr`.
pub(crate) struct ExtFns {
    pub external_memory_fd: vk::KhrExternalMemoryFdFn,
    pub external_semaphore_fd: vk::KhrExternalSemaphoreFdFn,
    pub image_drm_format_modifier: vk::ExtImageDrmFormatModifierFn,
    #[cfg(windows)]
    pub external_memory_win32: vk::KhrExternalMemoryWin32Fn,
    #[cfg(windows)]
    pub external_semaphore_win32: vk::KhrExternalSemaphoreWin32Fn,
}

impl ExtFns {
    fn load(instance: &AshInstance, device: vk::Device) -> Self {
        macro_rules! load {
            ($table:path) => {
                <$table>::load(|name| unsafe {
                    std::mem::transmute(instance.get_device_proc_addr(device, name.as_ptr()))
                })
            };
        }

        Self {
            external_memory_fd: load!(vk::KhrExternalMemoryFdFn),
            external_semaphore_fd: load!(vk::KhrExternalSemaphoreFdFn),
            image_drm_format_modifier: load!(vk::ExtImageDrmFormatModifierFn),
            #[cfg(windows)]
            external_memory_win32: load!(vk::KhrExternalMemoryWin32Fn),
            #[cfg(windows)]
            external_semaphore_win32: load!(vk::KhrExternalSemaphoreWin32Fn),
        }
    }
}

/// Allocates pool blocks straight from the device.
struct DeviceMemorySource {
    device: ash::Device,
    memory_type_index: u32,
    mappable: bool,
}

impl MemorySource for DeviceMemorySource {
    fn allocate_block(&self, size: u64) -> Result<MemoryBlock, Error> {
        let allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(self.memory_type_index);
        let memory = unsafe { self.device.allocate_memory(&allocate_info, None) }.map_err(
            |source| Error::AllocationFailed {
                size,
                memory_type: self.memory_type_index,
                source,
            },
        )?;

        let map = if self.mappable {
            match unsafe {
                self.device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            } {
                Ok(pointer) => pointer as *mut u8,
                Err(source) => {
                    unsafe { self.device.free_memory(memory, None) };
                    return Err(Error::AllocationFailed {
                        size,
                        memory_type: self.memory_type_index,
                        source,
                    });
                }
            }
        } else {
            std::ptr::null_mut()
        };

        Ok(MemoryBlock { memory, size, map })
    }

    fn free_block(&self, block: &MemoryBlock) {
        unsafe { self.device.free_memory(block.memory, None) };
    }
}

#[derive(Debug, Clone)]
pub struct Queue {
    pub inner: vk::Queue,
    pub family_index: u32,
}

pub struct Device {
    pub(crate) inner: ash::Device,
    pub(crate) fns: ExtFns,
    instance: AshInstance,
    physical_device: PhysicalDevice,
    features: DeviceFeatures,
    queue_family_index: u32,
    memory_pools: Mutex<HashMap<u32, Arc<MemoryPool>>>,
    descriptor_pools: Mutex<Vec<vk::DescriptorPool>>,
    samplers: [OnceCell<vk::Sampler>; SamplerKind::COUNT],
    image_set_layout: OnceCell<vk::DescriptorSetLayout>,
    ycbcr_cache: SharedCache<YcbcrInfo, Ycbcr>,
}

impl Device {
    pub(crate) fn new(
        instance: &Instance,
        physical_device: &PhysicalDevice,
        queue_family: QueueFamily,
        required_extensions: &[&str],
        features: DeviceFeatures,
    ) -> anyhow::Result<Self> {
        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family.index)
            .queue_priorities(&queue_priorities)
            .build()];

        let mut extension_names: Vec<&CStr> = Vec::new();
        if features.contains(DeviceFeatures::DMABUF) {
            extension_names.push(vk::KhrExternalMemoryFdFn::name());
            extension_names.push(vk::ExtExternalMemoryDmaBufFn::name());
            extension_names.push(vk::ExtImageDrmFormatModifierFn::name());
        }
        if features.contains(DeviceFeatures::SEMAPHORE_IMPORT) {
            extension_names.push(vk::KhrExternalSemaphoreFdFn::name());
        }
        if features.contains(DeviceFeatures::WIN32) {
            extension_names.push(vk::KhrExternalMemoryWin32Fn::name());
        }
        if features.contains(DeviceFeatures::WIN32_SEMAPHORE) {
            extension_names.push(vk::KhrExternalSemaphoreWin32Fn::name());
        }

        let user_extensions = required_extensions
            .iter()
            .map(|extension| CString::new(*extension))
            .collect::<Result<Vec<_>, _>>()?;

        let extension_pointers = extension_names
            .iter()
            .map(|name| name.as_ptr())
            .chain(user_extensions.iter().map(|name| name.as_ptr()))
            .collect::<Vec<_>>();

        let mut ycbcr_features = vk::PhysicalDeviceSamplerYcbcrConversionFeatures::builder()
            .sampler_ycbcr_conversion(features.contains(DeviceFeatures::YCBCR));
        let device_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_pointers)
            .push_next(&mut ycbcr_features);

        let inner = unsafe {
            instance
                .inner
                .create_device(physical_device.inner, &device_create_info, None)?
        };

        let fns = ExtFns::load(&instance.inner, inner.handle());

        Ok(Self {
            inner,
            fns,
            instance: instance.inner.clone(),
            physical_device: physical_device.clone(),
            features,
            queue_family_index: queue_family.index,
            memory_pools: Mutex::new(HashMap::new()),
            descriptor_pools: Mutex::new(Vec::new()),
            samplers: std::array::from_fn(|_| OnceCell::new()),
            image_set_layout: OnceCell::new(),
            ycbcr_cache: SharedCache::new(),
        })
    }

    pub fn get_queue(&self, queue_family: QueueFamily, queue_index: u32) -> Queue {
        let inner = unsafe { self.inner.get_device_queue(queue_family.index, queue_index) };
        Queue {
            inner,
            family_index: queue_family.index,
        }
    }

    pub fn features(&self) -> DeviceFeatures {
        self.features
    }

    pub fn has_feature(&self, feature: DeviceFeatures) -> bool {
        self.features.contains(feature)
    }

    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.physical_device
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.physical_device.limits
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub(crate) fn ycbcr_cache(&self) -> &SharedCache<YcbcrInfo, Ycbcr> {
        &self.ycbcr_cache
    }

    /// Resolves a memory type for `type_bits` and returns the shared pool
    /// for it, creating the pool on first use.
    pub fn find_allocator(
        &self,
        type_bits: u32,
        disallowed: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
    ) -> Result<Arc<MemoryPool>, Error> {
        let index = self
            .find_memory_type_index(type_bits, disallowed, preferred)
            .ok_or_else(|| {
                error!(
                    "[Vulkan] No memory type for bitmask {:#x} (disallowed {:?}, preferred {:?})",
                    type_bits, disallowed, preferred
                );
                Error::NoMatchingMemoryType { type_bits }
            })?;

        let flags = self.physical_device.memory_properties.memory_types[index as usize]
            .property_flags;
        let mut pools = self.memory_pools.lock().unwrap();
        let pool = pools.entry(index).or_insert_with(|| {
            Arc::new(MemoryPool::new(
                Box::new(DeviceMemorySource {
                    device: self.inner.clone(),
                    memory_type_index: index,
                    mappable: flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
                }),
                index,
                flags,
            ))
        });
        Ok(pool.clone())
    }

    pub fn find_memory_type_index(
        &self,
        type_bits: u32,
        disallowed: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        find_memory_type(
            &self.physical_device.memory_properties,
            type_bits,
            disallowed,
            preferred,
        )
    }

    /// The lazily created sampler for a sampler configuration.
    pub fn sampler(&self, kind: SamplerKind) -> Result<vk::Sampler, Error> {
        self.samplers[kind.index()]
            .get_or_try_init(|| {
                let create_info = kind.create_info();
                unsafe { self.inner.create_sampler(&create_info, None) }.map_err(Error::from)
            })
            .copied()
    }

    /// The descriptor-set layout used by images without a YCbCr conversion.
    pub fn image_set_layout(&self) -> Result<vk::DescriptorSetLayout, Error> {
        self.image_set_layout
            .get_or_try_init(|| {
                let bindings = [vk::DescriptorSetLayoutBinding::builder()
                    .binding(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                    .build()];
                let layout_info =
                    vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
                unsafe { self.inner.create_descriptor_set_layout(&layout_info, None) }
                    .map_err(Error::from)
            })
            .copied()
    }

    /// Allocates one descriptor set, growing the pool list when the current
    /// pool runs out. The returned pool id is needed to free the set.
    pub fn allocate_descriptor(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<(vk::DescriptorSet, usize), Error> {
        let mut pools = self.descriptor_pools.lock().unwrap();

        if let Some(pool) = pools.last().copied() {
            let pool_id = pools.len() - 1;
            let layouts = [layout];
            let allocate_info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(pool)
                .set_layouts(&layouts);
            match unsafe { self.inner.allocate_descriptor_sets(&allocate_info) } {
                Ok(sets) => return Ok((sets[0], pool_id)),
                Err(err)
                    if err == vk::Result::ERROR_OUT_OF_POOL_MEMORY
                        || err == vk::Result::ERROR_FRAGMENTED_POOL => {}
                Err(err) => return Err(err.into()),
            }
        }

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: DESCRIPTOR_POOL_SIZE,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(DESCRIPTOR_POOL_SIZE)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { self.inner.create_descriptor_pool(&pool_info, None)? };
        pools.push(pool);
        let pool_id = pools.len() - 1;

        let layouts = [layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.inner.allocate_descriptor_sets(&allocate_info)? };
        Ok((sets[0], pool_id))
    }

    pub fn free_descriptor(&self, pool_id: usize, set: vk::DescriptorSet) {
        let pools = self.descriptor_pools.lock().unwrap();
        let pool = pools[pool_id];
        if let Err(err) = unsafe { self.inner.free_descriptor_sets(pool, &[set]) } {
            warn!("[Vulkan] Failed to free descriptor set: {err}");
        }
    }

    pub fn wait_idle(&self) -> Result<(), Error> {
        unsafe { self.inner.device_wait_idle()? };
        Ok(())
    }
}

impl FormatQuery for Device {
    fn format_features(
        &self,
        vk_format: vk::Format,
        tiling: vk::ImageTiling,
    ) -> vk::FormatFeatureFlags {
        let mut properties = vk::FormatProperties2::default();
        unsafe {
            self.instance.get_physical_device_format_properties2(
                self.physical_device.inner,
                vk_format,
                &mut properties,
            )
        };

        match tiling {
            vk::ImageTiling::OPTIMAL => properties.format_properties.optimal_tiling_features,
            vk::ImageTiling::LINEAR => properties.format_properties.linear_tiling_features,
            _ => vk::FormatFeatureFlags::empty(),
        }
    }

    fn image_limits(
        &self,
        vk_format: vk::Format,
        tiling: vk::ImageTiling,
        modifier: Option<u64>,
        usage: vk::ImageUsageFlags,
    ) -> Option<ImageFormatLimits> {
        let queue_family_indices = [self.queue_family_index];
        let mut modifier_info = vk::PhysicalDeviceImageDrmFormatModifierInfoEXT::builder()
            .drm_format_modifier(modifier.unwrap_or(0))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_family_indices);

        let mut format_info = vk::PhysicalDeviceImageFormatInfo2::builder()
            .format(vk_format)
            .ty(vk::ImageType::TYPE_2D)
            .tiling(tiling)
            .usage(usage);
        if tiling == vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT {
            format_info = format_info.push_next(&mut modifier_info);
        }

        let mut image_properties = vk::ImageFormatProperties2::default();
        let result = unsafe {
            self.instance.get_physical_device_image_format_properties2(
                self.physical_device.inner,
                &format_info,
                &mut image_properties,
            )
        };
        result.ok()?;

        let properties = image_properties.image_format_properties;
        Some(ImageFormatLimits {
            max_width: properties.max_extent.width,
            max_height: properties.max_extent.height,
            max_mip_levels: properties.max_mip_levels,
        })
    }

    fn drm_modifiers(&self, vk_format: vk::Format) -> SmallVec<[DrmFormatInfo; 8]> {
        if !self.features.contains(DeviceFeatures::DMABUF) {
            return SmallVec::new();
        }

        let mut modifier_list = vk::DrmFormatModifierPropertiesListEXT::default();
        let mut properties = vk::FormatProperties2::builder()
            .push_next(&mut modifier_list)
            .build();
        unsafe {
            self.instance.get_physical_device_format_properties2(
                self.physical_device.inner,
                vk_format,
                &mut properties,
            )
        };

        let count = modifier_list.drm_format_modifier_count as usize;
        if count == 0 {
            return SmallVec::new();
        }

        let mut modifier_properties =
            vec![vk::DrmFormatModifierPropertiesEXT::default(); count];
        modifier_list.p_drm_format_modifier_properties = modifier_properties.as_mut_ptr();
        let mut properties = vk::FormatProperties2::builder()
            .push_next(&mut modifier_list)
            .build();
        unsafe {
            self.instance.get_physical_device_format_properties2(
                self.physical_device.inner,
                vk_format,
                &mut properties,
            )
        };

        modifier_properties
            .iter()
            .take(modifier_list.drm_format_modifier_count as usize)
            .map(|properties| DrmFormatInfo {
                modifier: properties.drm_format_modifier,
                plane_count: properties.drm_format_modifier_plane_count,
                features: properties.drm_format_modifier_tiling_features,
            })
            .collect()
    }

    fn supports_conversion(&self, conversion: Conversion) -> bool {
        conversion.ycbcr().is_none() || self.features.contains(DeviceFeatures::YCBCR)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Every image, buffer and cache entry holds an Arc to the device,
        // so nothing references the objects destroyed here anymore.
        unsafe {
            for pool in self.descriptor_pools.get_mut().unwrap().drain(..) {
                self.inner.destroy_descriptor_pool(pool, None);
            }
            for cell in &self.samplers {
                if let Some(&sampler) = cell.get() {
                    self.inner.destroy_sampler(sampler, None);
                }
            }
            if let Some(&layout) = self.image_set_layout.get() {
                self.inner.destroy_descriptor_set_layout(layout, None);
            }
            self.memory_pools.get_mut().unwrap().clear();
            self.inner.destroy_device(None);
        }
    }
}
