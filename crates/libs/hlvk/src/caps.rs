//! The capability-query seam between format negotiation and a concrete
//! device.
//!
//! [`Device`](crate::Device) answers these queries with real
//! `vkGetPhysicalDeviceFormatProperties2` calls; tests answer them from
//! tables. Everything the negotiator decides is derived from this interface
//! alone.

use ash::vk;
use bitflags::bitflags;
use smallvec::SmallVec;

use crate::Conversion;

bitflags! {
    /// Capabilities an image ended up with after format negotiation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageFlags: u32 {
        /// The image can be a blit source.
        const BLIT = 1 << 0;
        /// The image can be sampled with linear filtering.
        const FILTERABLE = 1 << 1;
        /// The image can be used as a blending color attachment.
        const RENDERABLE = 1 << 2;
        /// The image can be a transfer source for downloads.
        const DOWNLOADABLE = 1 << 3;
        /// A full mipmap chain can be allocated and regenerated.
        const CAN_MIPMAP = 1 << 4;
        /// The mipmap levels currently hold valid data.
        const MIPMAP = 1 << 5;
        /// Sampling goes through a YCbCr conversion ("external" sampling).
        const EXTERNAL = 1 << 6;
    }
}

/// Device limits for one `(format, tiling, usage)` combination.
#[derive(Debug, Clone, Copy)]
pub struct ImageFormatLimits {
    pub max_width: u32,
    pub max_height: u32,
    pub max_mip_levels: u32,
}

/// One DRM format modifier advertised by the device for a format.
#[derive(Debug, Clone, Copy)]
pub struct DrmFormatInfo {
    pub modifier: u64,
    pub plane_count: u32,
    pub features: vk::FormatFeatureFlags,
}

/// Capability queries the negotiator needs from a device.
pub trait FormatQuery {
    /// Format features for optimal or linear tiling.
    fn format_features(
        &self,
        vk_format: vk::Format,
        tiling: vk::ImageTiling,
    ) -> vk::FormatFeatureFlags;

    /// Limits for creating a 2D image with the given parameters, or `None`
    /// when such an image cannot be created at all. `modifier` is only
    /// meaningful for DRM-modifier tiling.
    fn image_limits(
        &self,
        vk_format: vk::Format,
        tiling: vk::ImageTiling,
        modifier: Option<u64>,
        usage: vk::ImageUsageFlags,
    ) -> Option<ImageFormatLimits>;

    /// All DRM format modifiers the device advertises for a format.
    fn drm_modifiers(&self, vk_format: vk::Format) -> SmallVec<[DrmFormatInfo; 8]>;

    /// Whether the device can apply the given sampling conversion.
    fn supports_conversion(&self, conversion: Conversion) -> bool;
}

/// Number of mip levels of a full chain for the given extent.
pub fn mip_levels(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_levels_counts_full_chain() {
        assert_eq!(mip_levels(1, 1), 1);
        assert_eq!(mip_levels(2, 2), 2);
        assert_eq!(mip_levels(64, 64), 7);
        assert_eq!(mip_levels(64, 128), 8);
        assert_eq!(mip_levels(100, 1), 7);
    }
}
