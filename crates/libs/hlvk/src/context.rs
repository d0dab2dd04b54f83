use std::sync::Arc;

use ash::Entry;
use log::info;
use moraine_utils::{Version, VERSION_1_2};

use crate::{Device, DeviceFeatures, Instance, PhysicalDevice, Queue, QueueFamily};

/// Owns the Vulkan bootstrap chain: entry, instance, selected physical
/// device and the logical device every resource hangs off.
pub struct Context {
    pub instance: Instance,
    pub physical_device: PhysicalDevice,
    pub device: Arc<Device>,
    pub graphics_queue: Queue,
    pub graphics_queue_family: QueueFamily,
    _entry: Entry,
}

pub struct ContextBuilder<'a> {
    vulkan_version: Version,
    app_name: &'a str,
    required_device_extensions: &'a [&'a str],
    required_device_features: DeviceFeatures,
}

impl<'a> ContextBuilder<'a> {
    pub fn new() -> Self {
        Self {
            vulkan_version: VERSION_1_2,
            app_name: "",
            required_device_extensions: &[],
            required_device_features: DeviceFeatures::empty(),
        }
    }

    pub fn vulkan_version(self, vulkan_version: Version) -> Self {
        Self {
            vulkan_version,
            ..self
        }
    }

    pub fn app_name(self, app_name: &'a str) -> Self {
        Self { app_name, ..self }
    }

    pub fn required_device_extensions(self, required_extensions: &'a [&str]) -> Self {
        Self {
            required_device_extensions: required_extensions,
            ..self
        }
    }

    pub fn required_device_features(self, required_features: DeviceFeatures) -> Self {
        Self {
            required_device_features: required_features,
            ..self
        }
    }

    pub fn build(self) -> anyhow::Result<Context> {
        Context::new(self)
    }
}

impl Default for ContextBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    fn new(
        ContextBuilder {
            vulkan_version,
            app_name,
            required_device_extensions,
            required_device_features,
        }: ContextBuilder,
    ) -> anyhow::Result<Self> {
        let entry = unsafe { Entry::load()? };
        let mut instance = Instance::new(&entry, vulkan_version, app_name)?;

        let physical_devices = instance.enumerate_physical_devices()?;
        let (physical_device, graphics_queue_family) = select_suitable_physical_device(
            physical_devices,
            required_device_extensions,
            &required_device_features,
        )?;
        info!("[Vulkan] Selected physical device: {:?}", physical_device.name);

        let device = Arc::new(Device::new(
            &instance,
            &physical_device,
            graphics_queue_family,
            required_device_extensions,
            physical_device.supported_features,
        )?);
        let graphics_queue = device.get_queue(graphics_queue_family, 0);

        Ok(Self {
            instance,
            physical_device,
            device,
            graphics_queue,
            graphics_queue_family,
            _entry: entry,
        })
    }

    pub fn device_wait_idle(&self) -> anyhow::Result<()> {
        self.device.wait_idle()?;

        Ok(())
    }
}

fn select_suitable_physical_device(
    devices: &[PhysicalDevice],
    required_extensions: &[&str],
    required_features: &DeviceFeatures,
) -> anyhow::Result<(PhysicalDevice, QueueFamily)> {
    let mut graphics = None;

    let device = devices
        .iter()
        .find(|device| {
            graphics = device
                .queue_families
                .iter()
                .find(|family| family.has_queues() && family.supports_graphics())
                .copied();

            graphics.is_some()
                && device.supports_extensions(required_extensions)
                && device
                    .supported_features
                    .is_compatible_with(required_features)
        })
        .ok_or_else(|| anyhow::anyhow!("Could not find a suitable device"))?;

    Ok((device.clone(), graphics.unwrap()))
}
