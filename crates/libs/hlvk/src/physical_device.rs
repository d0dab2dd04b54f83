use std::ffi::CStr;

use ash::vk;
use bitflags::bitflags;

bitflags! {
    /// Optional device capabilities the resource manager can make use of.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFeatures: u32 {
        /// dma-buf import/export with DRM format modifiers.
        const DMABUF = 1 << 0;
        /// Sampler YCbCr conversion for multi-planar formats.
        const YCBCR = 1 << 1;
        /// Semaphore import from sync files.
        const SEMAPHORE_IMPORT = 1 << 2;
        /// Win32 external-memory handles (D3D12 resource interop).
        const WIN32 = 1 << 3;
        /// Win32 external-semaphore handles (D3D12 fence interop).
        const WIN32_SEMAPHORE = 1 << 4;
    }
}

impl DeviceFeatures {
    pub fn is_compatible_with(&self, required: &DeviceFeatures) -> bool {
        self.contains(*required)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueFamily {
    pub index: u32,
    pub(crate) inner: vk::QueueFamilyProperties,
}

impl QueueFamily {
    pub(crate) fn new(index: u32, inner: vk::QueueFamilyProperties) -> Self {
        Self { index, inner }
    }

    pub fn supports_graphics(&self) -> bool {
        self.inner.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    }

    pub fn supports_compute(&self) -> bool {
        self.inner.queue_flags.contains(vk::QueueFlags::COMPUTE)
    }

    pub fn has_queues(&self) -> bool {
        self.inner.queue_count > 0
    }
}

#[derive(Clone)]
pub struct PhysicalDevice {
    pub(crate) inner: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub limits: vk::PhysicalDeviceLimits,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: Vec<QueueFamily>,
    pub supported_extensions: Vec<String>,
    pub supported_features: DeviceFeatures,
}

impl PhysicalDevice {
    pub(crate) fn new(
        instance: &ash::Instance,
        inner: vk::PhysicalDevice,
    ) -> anyhow::Result<Self> {
        let properties = unsafe { instance.get_physical_device_properties(inner) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_str()?
            .to_owned();

        let memory_properties = unsafe { instance.get_physical_device_memory_properties(inner) };

        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(inner) }
            .into_iter()
            .enumerate()
            .map(|(index, family)| QueueFamily::new(index as u32, family))
            .collect::<Vec<_>>();

        let supported_extensions =
            unsafe { instance.enumerate_device_extension_properties(inner)? }
                .iter()
                .map(|extension| {
                    Ok(unsafe { CStr::from_ptr(extension.extension_name.as_ptr()) }
                        .to_str()?
                        .to_owned())
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

        let supported_features =
            detect_features(instance, inner, &supported_extensions, &properties);

        Ok(Self {
            inner,
            name,
            device_type: properties.device_type,
            limits: properties.limits,
            memory_properties,
            queue_families,
            supported_extensions,
            supported_features,
        })
    }

    pub fn supports_extensions(&self, extensions: &[&str]) -> bool {
        extensions.iter().all(|extension| {
            self.supported_extensions
                .iter()
                .any(|supported| supported == extension)
        })
    }
}

fn detect_features(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    extensions: &[String],
    properties: &vk::PhysicalDeviceProperties,
) -> DeviceFeatures {
    let has = |name: &CStr| {
        let name = name.to_str().unwrap_or_default();
        extensions.iter().any(|extension| extension == name)
    };

    let mut features = DeviceFeatures::empty();

    if has(vk::KhrExternalMemoryFdFn::name())
        && has(vk::ExtExternalMemoryDmaBufFn::name())
        && has(vk::ExtImageDrmFormatModifierFn::name())
    {
        features |= DeviceFeatures::DMABUF;
    }
    if has(vk::KhrExternalSemaphoreFdFn::name()) {
        features |= DeviceFeatures::SEMAPHORE_IMPORT;
    }
    if has(vk::KhrExternalMemoryWin32Fn::name()) {
        features |= DeviceFeatures::WIN32;
    }
    if has(vk::KhrExternalSemaphoreWin32Fn::name()) {
        features |= DeviceFeatures::WIN32_SEMAPHORE;
    }

    // YCbCr conversion is core since 1.1 but still an optional feature.
    if properties.api_version >= vk::make_api_version(0, 1, 1, 0) {
        let mut ycbcr = vk::PhysicalDeviceSamplerYcbcrConversionFeatures::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut ycbcr)
            .build();
        unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
        if ycbcr.sampler_ycbcr_conversion == vk::TRUE {
            features |= DeviceFeatures::YCBCR;
        }
    }

    features
}
