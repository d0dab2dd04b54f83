//! Format negotiation.
//!
//! Walks a logical format's fallback chain against the device's capability
//! matrix until a creatable `(vk format, swizzle, tiling)` triple is found:
//! first the natural format (preferring its sRGB variant when an sRGB
//! conversion is wanted), then a channel-reordered RGBA equivalent sampled
//! through a swizzle, then the per-format fallback conversions.

use ash::vk;
use log::debug;
use smallvec::SmallVec;

use crate::{
    is_framebuffer_compatible, mip_levels, Conversion, DrmFormatInfo, FormatQuery, ImageFlags,
    MemoryFormat, ShaderOp,
};

/// The flag subset compared against a caller's required flags. Downloading
/// is never required, merely reported.
const CHECK_FLAGS: ImageFlags = ImageFlags::BLIT
    .union(ImageFlags::FILTERABLE)
    .union(ImageFlags::RENDERABLE)
    .union(ImageFlags::CAN_MIPMAP);

/// Result of a successful negotiation.
#[derive(Debug, Clone, Copy)]
pub struct FormatSelection {
    /// The logical format the caller has to provide data in. Differs from
    /// the requested format when a fallback conversion was taken.
    pub format: MemoryFormat,
    pub vk_format: vk::Format,
    pub components: vk::ComponentMapping,
    pub tiling: vk::ImageTiling,
    pub flags: ImageFlags,
    pub conversion: Conversion,
    pub shader_op: ShaderOp,
    /// Sampling needs a YCbCr conversion object (multi-planar formats).
    pub needs_conversion: bool,
}

/// Result of a successful dma-buf negotiation: like [`FormatSelection`] but
/// with the modifier list to create the image with instead of a tiling.
#[derive(Debug, Clone)]
pub struct DmabufSelection {
    pub format: MemoryFormat,
    pub vk_format: vk::Format,
    pub components: vk::ComponentMapping,
    pub flags: ImageFlags,
    pub conversion: Conversion,
    pub shader_op: ShaderOp,
    pub needs_conversion: bool,
    pub modifiers: SmallVec<[u64; 8]>,
}

/// Queries whether the device can create a sampled 2D image with the exact
/// given parameters and derives the capability flags it would have.
pub fn supports_format(
    query: &impl FormatQuery,
    vk_format: vk::Format,
    modifier: Option<u64>,
    n_planes: u32,
    tiling: vk::ImageTiling,
    usage: vk::ImageUsageFlags,
    width: u32,
    height: u32,
) -> Option<ImageFlags> {
    let features = if tiling == vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT {
        let modifier = modifier?;
        query
            .drm_modifiers(vk_format)
            .iter()
            .find(|info| info.modifier == modifier && info.plane_count == n_planes)
            .map(|info| info.features)?
    } else {
        query.format_features(vk_format, tiling)
    };

    if !features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE) {
        return None;
    }

    let limits = query.image_limits(vk_format, tiling, modifier, usage)?;
    if limits.max_width < width || limits.max_height < height {
        return None;
    }

    let mut flags = ImageFlags::empty();
    if features.contains(vk::FormatFeatureFlags::BLIT_SRC) {
        flags |= ImageFlags::BLIT;
    }
    if features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR) {
        flags |= ImageFlags::FILTERABLE;
    }
    if features.contains(vk::FormatFeatureFlags::COLOR_ATTACHMENT_BLEND) {
        flags |= ImageFlags::RENDERABLE;
    }
    if features.contains(vk::FormatFeatureFlags::TRANSFER_SRC) {
        flags |= ImageFlags::DOWNLOADABLE;
    }
    if limits.max_mip_levels >= mip_levels(width, height)
        && flags.contains(ImageFlags::BLIT | ImageFlags::FILTERABLE | ImageFlags::RENDERABLE)
    {
        flags |= ImageFlags::CAN_MIPMAP;
    }

    Some(flags)
}

/// Checks a single format candidate: swizzle legality for render targets,
/// feature support, required-flag coverage, and the silent linear→optimal
/// tiling upgrade.
fn check_format(
    query: &impl FormatQuery,
    vk_format: vk::Format,
    components: &vk::ComponentMapping,
    required_flags: ImageFlags,
    tiling: vk::ImageTiling,
    usage: vk::ImageUsageFlags,
    width: u32,
    height: u32,
) -> Option<(vk::ImageTiling, ImageFlags)> {
    if vk_format == vk::Format::UNDEFINED {
        return None;
    }

    // Color attachments are written through the raw channel order, so a
    // swizzled candidate can never be a render target.
    if usage.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        && !is_framebuffer_compatible(components)
    {
        return None;
    }

    let required = required_flags & CHECK_FLAGS;

    if let Some(flags) = supports_format(query, vk_format, None, 1, tiling, usage, width, height) {
        if flags & required == required {
            return Some((tiling, flags));
        }
    }

    // Never fail merely because linear was preferred.
    if tiling == vk::ImageTiling::LINEAR {
        if let Some(flags) = supports_format(
            query,
            vk_format,
            None,
            1,
            vk::ImageTiling::OPTIMAL,
            usage,
            width,
            height,
        ) {
            if flags & required == required {
                return Some((vk::ImageTiling::OPTIMAL, flags));
            }
        }
    }

    None
}

/// One candidate of the fallback walk.
struct Candidate {
    format: MemoryFormat,
    vk_format: vk::Format,
    srgb_format: Option<vk::Format>,
    components: vk::ComponentMapping,
    needs_conversion: bool,
}

/// The ordered candidate list for a format: natural, RGBA equivalent,
/// then the fallback conversions.
fn candidates(format: MemoryFormat, try_srgb: bool) -> SmallVec<[Candidate; 4]> {
    let mut list = SmallVec::new();

    let mapping = format.vk_format();
    list.push(Candidate {
        format,
        vk_format: mapping.vk_format,
        srgb_format: if try_srgb { format.vk_srgb_format() } else { None },
        components: mapping.components,
        needs_conversion: mapping.needs_conversion,
    });

    if let Some((rgba_format, components)) = format.rgba_format() {
        let mapping = rgba_format.vk_format();
        list.push(Candidate {
            // The texel layout is unchanged, callers keep uploading the
            // original format; only the view swizzle differs.
            format,
            vk_format: mapping.vk_format,
            srgb_format: if try_srgb {
                rgba_format.vk_srgb_format()
            } else {
                None
            },
            components,
            needs_conversion: mapping.needs_conversion,
        });
    }

    for &fallback in format.fallbacks() {
        let mapping = fallback.vk_format();
        list.push(Candidate {
            format: fallback,
            vk_format: mapping.vk_format,
            srgb_format: if try_srgb {
                fallback.vk_srgb_format()
            } else {
                None
            },
            components: mapping.components,
            needs_conversion: mapping.needs_conversion,
        });
    }

    list
}

/// Negotiates a concrete format for an image.
///
/// Returns `None` only when the whole fallback chain is exhausted, which is
/// expected for extents exceeding the device's image limits.
pub fn select_format(
    query: &impl FormatQuery,
    format: MemoryFormat,
    conversion: Conversion,
    required_flags: ImageFlags,
    tiling: vk::ImageTiling,
    usage: vk::ImageUsageFlags,
    width: u32,
    height: u32,
) -> Option<FormatSelection> {
    let mut conversion = if query.supports_conversion(conversion) {
        conversion
    } else {
        Conversion::None
    };
    let try_srgb = conversion == Conversion::Srgb;

    let mut chosen = None;
    for candidate in candidates(format, try_srgb) {
        if let Some((tiling, flags)) = check_format(
            query,
            candidate.srgb_format.unwrap_or(vk::Format::UNDEFINED),
            &candidate.components,
            required_flags,
            tiling,
            usage,
            width,
            height,
        ) {
            chosen = Some((candidate, true, tiling, flags));
            break;
        }
        if let Some((tiling, flags)) = check_format(
            query,
            candidate.vk_format,
            &candidate.components,
            required_flags,
            tiling,
            usage,
            width,
            height,
        ) {
            chosen = Some((candidate, false, tiling, flags));
            break;
        }
    }

    let (candidate, srgb_taken, tiling, mut flags) = chosen?;
    let vk_format = if srgb_taken {
        candidate.srgb_format.unwrap()
    } else {
        candidate.vk_format
    };

    if !srgb_taken && conversion == Conversion::Srgb {
        conversion = Conversion::None;
    }

    let shader_op = candidate.format.default_shader_op();

    // Blitting copies raw pixels, which a swizzle or conversion would bypass.
    if !is_framebuffer_compatible(&candidate.components) || candidate.needs_conversion {
        flags -= ImageFlags::BLIT;
    }

    // A mipmap chain is only worth allocating when the image can render,
    // filter and blit its own levels and the shader samples it directly.
    if !flags.contains(
        ImageFlags::FILTERABLE
            | ImageFlags::RENDERABLE
            | ImageFlags::BLIT
            | ImageFlags::CAN_MIPMAP,
    ) || shader_op != ShaderOp::Default
        || !required_flags.contains(ImageFlags::CAN_MIPMAP)
    {
        flags -= ImageFlags::CAN_MIPMAP;
    }

    Some(FormatSelection {
        format: candidate.format,
        vk_format,
        components: candidate.components,
        tiling,
        flags,
        conversion,
        shader_op,
        needs_conversion: candidate.needs_conversion,
    })
}

/// Checks one candidate for dma-buf creation: enumerates the device's
/// modifiers, keeps those usable for sampling and blending at the given
/// extent, and intersects the capability flags across them.
fn check_dmabuf_format(
    query: &impl FormatQuery,
    vk_format: vk::Format,
    components: &vk::ComponentMapping,
    width: u32,
    height: u32,
) -> Option<(ImageFlags, SmallVec<[u64; 8]>)> {
    let required =
        vk::FormatFeatureFlags::SAMPLED_IMAGE | vk::FormatFeatureFlags::COLOR_ATTACHMENT_BLEND;

    if vk_format == vk::Format::UNDEFINED {
        return None;
    }
    if !is_framebuffer_compatible(components) {
        return None;
    }

    let mut flags = ImageFlags::BLIT
        | ImageFlags::FILTERABLE
        | ImageFlags::RENDERABLE
        | ImageFlags::DOWNLOADABLE;
    let mut modifiers = SmallVec::new();

    for DrmFormatInfo {
        modifier, features, ..
    } in query.drm_modifiers(vk_format)
    {
        if !features.contains(required) {
            continue;
        }

        let Some(limits) = query.image_limits(
            vk_format,
            vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT,
            Some(modifier),
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
        ) else {
            continue;
        };
        if limits.max_width < width || limits.max_height < height {
            continue;
        }

        // A modifier missing a feature disqualifies the whole format from
        // advertising it; the driver picks the modifier, not us.
        if !features.contains(vk::FormatFeatureFlags::BLIT_SRC) {
            flags -= ImageFlags::BLIT;
        }
        if !features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR) {
            flags -= ImageFlags::FILTERABLE;
        }
        if !features.contains(vk::FormatFeatureFlags::COLOR_ATTACHMENT_BLEND) {
            flags -= ImageFlags::RENDERABLE;
        }
        if !features.contains(vk::FormatFeatureFlags::TRANSFER_SRC) {
            flags -= ImageFlags::DOWNLOADABLE;
        }

        modifiers.push(modifier);
    }

    if modifiers.is_empty() {
        return None;
    }

    Some((flags, modifiers))
}

/// Negotiates a format and modifier list for creating an exportable dma-buf
/// image.
pub fn select_dmabuf_format(
    query: &impl FormatQuery,
    format: MemoryFormat,
    try_srgb: bool,
    width: u32,
    height: u32,
) -> Option<DmabufSelection> {
    let mut chosen = None;
    for candidate in candidates(format, try_srgb) {
        if let Some((flags, modifiers)) = check_dmabuf_format(
            query,
            candidate.srgb_format.unwrap_or(vk::Format::UNDEFINED),
            &candidate.components,
            width,
            height,
        ) {
            chosen = Some((candidate, true, flags, modifiers));
            break;
        }
        if let Some((flags, modifiers)) =
            check_dmabuf_format(query, candidate.vk_format, &candidate.components, width, height)
        {
            chosen = Some((candidate, false, flags, modifiers));
            break;
        }
    }

    let Some((candidate, srgb_taken, mut flags, modifiers)) = chosen else {
        debug!(
            "[Vulkan] No dmabuf-capable format for {:?} at {}x{}",
            format, width, height
        );
        return None;
    };

    let vk_format = if srgb_taken {
        candidate.srgb_format.unwrap()
    } else {
        candidate.vk_format
    };

    if !is_framebuffer_compatible(&candidate.components) || candidate.needs_conversion {
        flags -= ImageFlags::BLIT;
    }

    let shader_op = if candidate.needs_conversion {
        ShaderOp::Default
    } else {
        candidate.format.default_shader_op()
    };

    Some(DmabufSelection {
        format: candidate.format,
        vk_format,
        components: candidate.components,
        flags,
        conversion: if srgb_taken {
            Conversion::Srgb
        } else {
            Conversion::None
        },
        shader_op,
        needs_conversion: candidate.needs_conversion,
        modifiers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ImageFormatLimits, MemoryFormat};
    use std::collections::HashMap;

    /// Table-driven device capabilities for tests.
    #[derive(Default)]
    struct SimulatedDevice {
        optimal: HashMap<vk::Format, vk::FormatFeatureFlags>,
        linear: HashMap<vk::Format, vk::FormatFeatureFlags>,
        drm: HashMap<vk::Format, Vec<DrmFormatInfo>>,
        max_extent: u32,
        max_mip_levels: u32,
        ycbcr: bool,
    }

    impl SimulatedDevice {
        fn new() -> Self {
            Self {
                max_extent: 4096,
                max_mip_levels: 13,
                ycbcr: true,
                ..Default::default()
            }
        }

        fn all_features() -> vk::FormatFeatureFlags {
            vk::FormatFeatureFlags::SAMPLED_IMAGE
                | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR
                | vk::FormatFeatureFlags::COLOR_ATTACHMENT_BLEND
                | vk::FormatFeatureFlags::BLIT_SRC
                | vk::FormatFeatureFlags::TRANSFER_SRC
        }

        fn with_format(mut self, format: vk::Format) -> Self {
            self.optimal.insert(format, Self::all_features());
            self.linear.insert(format, Self::all_features());
            self
        }

        fn with_optimal_only(mut self, format: vk::Format) -> Self {
            self.optimal.insert(format, Self::all_features());
            self
        }
    }

    impl FormatQuery for SimulatedDevice {
        fn format_features(
            &self,
            vk_format: vk::Format,
            tiling: vk::ImageTiling,
        ) -> vk::FormatFeatureFlags {
            let table = match tiling {
                vk::ImageTiling::LINEAR => &self.linear,
                _ => &self.optimal,
            };
            table.get(&vk_format).copied().unwrap_or_default()
        }

        fn image_limits(
            &self,
            vk_format: vk::Format,
            tiling: vk::ImageTiling,
            modifier: Option<u64>,
            _usage: vk::ImageUsageFlags,
        ) -> Option<ImageFormatLimits> {
            let supported = match tiling {
                vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT => self
                    .drm
                    .get(&vk_format)
                    .map(|infos| infos.iter().any(|info| Some(info.modifier) == modifier))
                    .unwrap_or(false),
                vk::ImageTiling::LINEAR => self.linear.contains_key(&vk_format),
                _ => self.optimal.contains_key(&vk_format),
            };
            supported.then_some(ImageFormatLimits {
                max_width: self.max_extent,
                max_height: self.max_extent,
                max_mip_levels: self.max_mip_levels,
            })
        }

        fn drm_modifiers(&self, vk_format: vk::Format) -> SmallVec<[DrmFormatInfo; 8]> {
            self.drm
                .get(&vk_format)
                .map(|infos| infos.iter().copied().collect())
                .unwrap_or_default()
        }

        fn supports_conversion(&self, conversion: Conversion) -> bool {
            conversion.ycbcr().is_none() || self.ycbcr
        }
    }

    const ALL_FORMATS: &[MemoryFormat] = &[
        MemoryFormat::Rgba8,
        MemoryFormat::Rgba8Premultiplied,
        MemoryFormat::Bgra8,
        MemoryFormat::Bgra8Premultiplied,
        MemoryFormat::Rgb8,
        MemoryFormat::Bgr8,
        MemoryFormat::Rgba16,
        MemoryFormat::Rgba16Float,
        MemoryFormat::Rgba32Float,
        MemoryFormat::Gray8,
        MemoryFormat::Alpha8,
        MemoryFormat::Nv12,
        MemoryFormat::Yuv420,
    ];

    fn sampled_usage() -> vk::ImageUsageFlags {
        vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST
    }

    #[test]
    fn selection_flags_are_consistent() {
        // Whatever is requested, a returned selection never reports an
        // inconsistent flag combination and always covers the request.
        let device = SimulatedDevice::new()
            .with_format(vk::Format::R8G8B8A8_UNORM)
            .with_format(vk::Format::R8_UNORM);

        let requests = [
            ImageFlags::empty(),
            ImageFlags::FILTERABLE,
            ImageFlags::RENDERABLE,
            ImageFlags::FILTERABLE | ImageFlags::RENDERABLE,
            ImageFlags::CAN_MIPMAP | ImageFlags::FILTERABLE | ImageFlags::RENDERABLE,
        ];

        for &format in ALL_FORMATS {
            for &required in &requests {
                let Some(selection) = select_format(
                    &device,
                    format,
                    Conversion::None,
                    required,
                    vk::ImageTiling::OPTIMAL,
                    sampled_usage(),
                    256,
                    256,
                ) else {
                    continue;
                };
                assert!(
                    selection.flags.contains(required & ImageFlags::FILTERABLE),
                    "{format:?}: filterable request not honored"
                );
                if selection.flags.contains(ImageFlags::CAN_MIPMAP) {
                    assert!(selection.flags.contains(
                        ImageFlags::RENDERABLE | ImageFlags::FILTERABLE | ImageFlags::BLIT
                    ));
                }
            }
        }
    }

    #[test]
    fn linear_request_upgrades_to_optimal() {
        let device = SimulatedDevice::new().with_optimal_only(vk::Format::R8G8B8A8_UNORM);

        let selection = select_format(
            &device,
            MemoryFormat::Rgba8,
            Conversion::None,
            ImageFlags::empty(),
            vk::ImageTiling::LINEAR,
            sampled_usage(),
            64,
            64,
        )
        .unwrap();

        assert_eq!(selection.tiling, vk::ImageTiling::OPTIMAL);
        assert_eq!(selection.vk_format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn srgb_variant_preferred_when_requested() {
        let device = SimulatedDevice::new()
            .with_format(vk::Format::R8G8B8A8_UNORM)
            .with_format(vk::Format::R8G8B8A8_SRGB);

        let selection = select_format(
            &device,
            MemoryFormat::Rgba8,
            Conversion::Srgb,
            ImageFlags::empty(),
            vk::ImageTiling::OPTIMAL,
            sampled_usage(),
            64,
            64,
        )
        .unwrap();
        assert_eq!(selection.vk_format, vk::Format::R8G8B8A8_SRGB);
        assert_eq!(selection.conversion, Conversion::Srgb);
    }

    #[test]
    fn srgb_conversion_dropped_when_variant_unsupported() {
        let device = SimulatedDevice::new().with_format(vk::Format::R8G8B8A8_UNORM);

        let selection = select_format(
            &device,
            MemoryFormat::Rgba8,
            Conversion::Srgb,
            ImageFlags::empty(),
            vk::ImageTiling::OPTIMAL,
            sampled_usage(),
            64,
            64,
        )
        .unwrap();
        assert_eq!(selection.vk_format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(selection.conversion, Conversion::None);
    }

    #[test]
    fn rgba_equivalent_clears_blit() {
        // BGRA has no native support; the device only exposes RGBA8. The
        // negotiator must fall back to the RGBA equivalent with a swizzle
        // and revoke blitting.
        let device = SimulatedDevice::new().with_format(vk::Format::R8G8B8A8_UNORM);

        let selection = select_format(
            &device,
            MemoryFormat::Bgra8,
            Conversion::None,
            ImageFlags::FILTERABLE,
            vk::ImageTiling::OPTIMAL,
            sampled_usage(),
            64,
            64,
        )
        .unwrap();

        assert_eq!(selection.vk_format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(selection.format, MemoryFormat::Bgra8);
        assert!(!is_framebuffer_compatible(&selection.components));
        assert!(!selection.flags.contains(ImageFlags::BLIT));
    }

    #[test]
    fn swizzled_candidate_never_renders() {
        // With color-attachment usage the swizzled RGBA equivalent is
        // skipped and the fallback chain converts to RGBA8 proper.
        let device = SimulatedDevice::new().with_format(vk::Format::R8G8B8A8_UNORM);

        let selection = select_format(
            &device,
            MemoryFormat::Bgra8,
            Conversion::None,
            ImageFlags::RENDERABLE,
            vk::ImageTiling::OPTIMAL,
            sampled_usage() | vk::ImageUsageFlags::COLOR_ATTACHMENT,
            64,
            64,
        )
        .unwrap();

        assert_eq!(selection.format, MemoryFormat::Rgba8);
        assert!(is_framebuffer_compatible(&selection.components));
        assert!(selection.flags.contains(ImageFlags::RENDERABLE));
    }

    #[test]
    fn oversized_extent_exhausts_chain() {
        let device = SimulatedDevice::new().with_format(vk::Format::R8G8B8A8_UNORM);

        assert!(select_format(
            &device,
            MemoryFormat::Rgba8,
            Conversion::None,
            ImageFlags::empty(),
            vk::ImageTiling::OPTIMAL,
            sampled_usage(),
            1 << 20,
            1 << 20,
        )
        .is_none());
    }

    #[test]
    fn mipmap_needs_request_and_capability() {
        let device = SimulatedDevice::new().with_format(vk::Format::R8G8B8A8_UNORM);

        // Not requested: capability reported by the device is dropped.
        let selection = select_format(
            &device,
            MemoryFormat::Rgba8Premultiplied,
            Conversion::None,
            ImageFlags::empty(),
            vk::ImageTiling::OPTIMAL,
            sampled_usage(),
            64,
            64,
        )
        .unwrap();
        assert!(!selection.flags.contains(ImageFlags::CAN_MIPMAP));

        // Requested on a premultiplied format with full support: granted.
        let selection = select_format(
            &device,
            MemoryFormat::Rgba8Premultiplied,
            Conversion::None,
            ImageFlags::CAN_MIPMAP | ImageFlags::FILTERABLE | ImageFlags::RENDERABLE,
            vk::ImageTiling::OPTIMAL,
            sampled_usage(),
            64,
            64,
        )
        .unwrap();
        assert!(selection.flags.contains(ImageFlags::CAN_MIPMAP));
    }

    #[test]
    fn dmabuf_selection_intersects_modifier_features() {
        let mut device = SimulatedDevice::new();
        device.drm.insert(
            vk::Format::R8G8B8A8_UNORM,
            vec![
                DrmFormatInfo {
                    modifier: 0,
                    plane_count: 1,
                    features: SimulatedDevice::all_features(),
                },
                DrmFormatInfo {
                    modifier: 7,
                    plane_count: 1,
                    features: SimulatedDevice::all_features()
                        & !vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR,
                },
            ],
        );

        let selection = select_dmabuf_format(&device, MemoryFormat::Rgba8, false, 64, 64).unwrap();
        assert_eq!(selection.modifiers.as_slice(), &[0, 7]);
        // Modifier 7 cannot filter, so the format as a whole cannot.
        assert!(!selection.flags.contains(ImageFlags::FILTERABLE));
        assert!(selection.flags.contains(ImageFlags::RENDERABLE));
    }

    #[test]
    fn dmabuf_selection_fails_without_modifiers() {
        let device = SimulatedDevice::new().with_format(vk::Format::R8G8B8A8_UNORM);
        assert!(select_dmabuf_format(&device, MemoryFormat::Rgba8, false, 64, 64).is_none());
    }
}
