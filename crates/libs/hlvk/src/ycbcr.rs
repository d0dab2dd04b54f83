//! Shared YCbCr conversion objects.
//!
//! Sampling a multi-planar or color-converted image needs a conversion
//! object, a conversion-aware sampler with it baked in as an immutable
//! sampler, and a descriptor-set layout compatible with that sampler. All
//! three are created together and shared by every image with the same
//! `(format, swizzle, model, range)`, dying when the last image releases
//! them.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

use ash::vk;

use crate::{Device, Error};

/// Key identifying one conversion configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct YcbcrInfo {
    pub vk_format: vk::Format,
    pub components: [vk::ComponentSwizzle; 4],
    pub model: vk::SamplerYcbcrModelConversion,
    pub range: vk::SamplerYcbcrRange,
}

/// A keyed cache of shared entries. Entries stay alive for as long as any
/// user holds the `Arc`; dead entries are pruned on the next insertion.
pub(crate) struct SharedCache<K, V> {
    entries: Mutex<HashMap<K, Weak<V>>>,
}

impl<K: Eq + Hash + Copy, V> SharedCache<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create<E>(
        &self,
        key: K,
        create: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        let mut entries = self.entries.lock().unwrap();

        if let Some(existing) = entries.get(&key).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let value = Arc::new(create()?);
        entries.retain(|_, weak| weak.strong_count() > 0);
        entries.insert(key, Arc::downgrade(&value));
        Ok(value)
    }

    /// Whether an entry for `key` is still referenced by anyone.
    #[cfg(test)]
    pub fn is_alive(&self, key: &K) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|weak| weak.strong_count() > 0)
            .unwrap_or(false)
    }
}

/// One cached conversion configuration and its GPU-level artifacts.
pub struct Ycbcr {
    device: Arc<Device>,
    info: YcbcrInfo,
    conversion: vk::SamplerYcbcrConversion,
    sampler: vk::Sampler,
    set_layout: vk::DescriptorSetLayout,
}

impl Ycbcr {
    /// Looks up or creates the shared entry for `info`.
    pub fn get(device: &Arc<Device>, info: YcbcrInfo) -> Result<Arc<Ycbcr>, Error> {
        let owner = device.clone();
        device
            .ycbcr_cache()
            .get_or_create(info, move || Ycbcr::new(owner, info))
    }

    fn new(device: Arc<Device>, info: YcbcrInfo) -> Result<Ycbcr, Error> {
        let [r, g, b, a] = info.components;
        let conversion_info = vk::SamplerYcbcrConversionCreateInfo::builder()
            .format(info.vk_format)
            .ycbcr_model(info.model)
            .ycbcr_range(info.range)
            .components(vk::ComponentMapping { r, g, b, a })
            .x_chroma_offset(vk::ChromaLocation::COSITED_EVEN)
            .y_chroma_offset(vk::ChromaLocation::COSITED_EVEN)
            .chroma_filter(vk::Filter::LINEAR)
            .force_explicit_reconstruction(false);
        let conversion = unsafe {
            device
                .inner
                .create_sampler_ycbcr_conversion(&conversion_info, None)?
        };

        let mut sampler_conversion_info =
            vk::SamplerYcbcrConversionInfo::builder().conversion(conversion);
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .push_next(&mut sampler_conversion_info);
        let sampler = match unsafe { device.inner.create_sampler(&sampler_info, None) } {
            Ok(sampler) => sampler,
            Err(err) => {
                unsafe {
                    device
                        .inner
                        .destroy_sampler_ycbcr_conversion(conversion, None)
                };
                return Err(err.into());
            }
        };

        // Conversion-aware samplers must be immutable in the layout.
        let immutable_samplers = [sampler];
        let bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .immutable_samplers(&immutable_samplers)
            .build()];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let set_layout = match unsafe {
            device.inner.create_descriptor_set_layout(&layout_info, None)
        } {
            Ok(layout) => layout,
            Err(err) => {
                unsafe {
                    device.inner.destroy_sampler(sampler, None);
                    device
                        .inner
                        .destroy_sampler_ycbcr_conversion(conversion, None);
                }
                return Err(err.into());
            }
        };

        Ok(Ycbcr {
            device,
            info,
            conversion,
            sampler,
            set_layout,
        })
    }

    pub fn info(&self) -> YcbcrInfo {
        self.info
    }

    pub fn conversion(&self) -> vk::SamplerYcbcrConversion {
        self.conversion
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    pub fn descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }
}

impl Drop for Ycbcr {
    fn drop(&mut self) {
        unsafe {
            self.device
                .inner
                .destroy_descriptor_set_layout(self.set_layout, None);
            self.device.inner.destroy_sampler(self.sampler, None);
            self.device
                .inner
                .destroy_sampler_ycbcr_conversion(self.conversion, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_keys_share_one_entry() {
        let cache: SharedCache<u32, String> = SharedCache::new();

        let first = cache
            .get_or_create(7, || Ok::<_, ()>("entry".to_owned()))
            .unwrap();
        let second = cache
            .get_or_create(7, || -> Result<String, ()> { panic!("must reuse the live entry") })
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(Arc::strong_count(&first), 2);
    }

    #[test]
    fn entry_dies_with_its_last_user() {
        let cache: SharedCache<u32, String> = SharedCache::new();

        let first = cache
            .get_or_create(7, || Ok::<_, ()>("entry".to_owned()))
            .unwrap();
        let second = cache
            .get_or_create(7, || Ok::<_, ()>("dup".to_owned()))
            .unwrap();
        assert!(cache.is_alive(&7));

        drop(first);
        assert!(cache.is_alive(&7));
        drop(second);
        assert!(!cache.is_alive(&7));

        // A later request creates a fresh entry.
        let recreated = cache
            .get_or_create(7, || Ok::<_, ()>("again".to_owned()))
            .unwrap();
        assert_eq!(*recreated, "again");
    }

    #[test]
    fn distinct_keys_do_not_alias() {
        let cache: SharedCache<YcbcrInfo, u32> = SharedCache::new();
        let base = YcbcrInfo {
            vk_format: vk::Format::G8_B8R8_2PLANE_420_UNORM,
            components: [vk::ComponentSwizzle::IDENTITY; 4],
            model: vk::SamplerYcbcrModelConversion::YCBCR_601,
            range: vk::SamplerYcbcrRange::ITU_FULL,
        };
        let narrow = YcbcrInfo {
            range: vk::SamplerYcbcrRange::ITU_NARROW,
            ..base
        };

        let a = cache.get_or_create(base, || Ok::<_, ()>(1)).unwrap();
        let b = cache.get_or_create(narrow, || Ok::<_, ()>(2)).unwrap();
        assert_ne!(*a, *b);
    }
}
