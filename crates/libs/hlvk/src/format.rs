//! Logical pixel formats and their Vulkan mappings.
//!
//! The fallback chains, RGBA equivalents and swizzle tables here are data,
//! not logic: the negotiator walks them without knowing anything about a
//! concrete format.

use ash::vk;

/// Upper bound on the number of memory planes a format can use.
pub const MAX_PLANES: usize = 4;

const fn fourcc(code: &[u8; 4]) -> u32 {
    code[0] as u32 | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

pub const DRM_FORMAT_ABGR8888: u32 = fourcc(b"AB24");
pub const DRM_FORMAT_ARGB8888: u32 = fourcc(b"AR24");
pub const DRM_FORMAT_R8: u32 = fourcc(b"R8  ");
pub const DRM_FORMAT_NV12: u32 = fourcc(b"NV12");
pub const DRM_FORMAT_YUV420: u32 = fourcc(b"YU12");

// DXGI_FORMAT values used by the D3D12 import path.
const DXGI_FORMAT_R32G32B32A32_FLOAT: u32 = 2;
const DXGI_FORMAT_R16G16B16A16_FLOAT: u32 = 10;
const DXGI_FORMAT_R16G16B16A16_UNORM: u32 = 11;
const DXGI_FORMAT_R8G8B8A8_UNORM: u32 = 28;
const DXGI_FORMAT_R8_UNORM: u32 = 61;
const DXGI_FORMAT_B8G8R8A8_UNORM: u32 = 87;
const DXGI_FORMAT_NV12: u32 = 103;

/// A logical, API-independent pixel format.
///
/// `Premultiplied` variants share the Vulkan format of their straight
/// counterpart; the distinction only matters for shading and for dma-buf
/// fourcc metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryFormat {
    Rgba8,
    Rgba8Premultiplied,
    Bgra8,
    Bgra8Premultiplied,
    Rgb8,
    Bgr8,
    Rgba16,
    Rgba16Float,
    Rgba32Float,
    Gray8,
    Alpha8,
    /// 2-plane 4:2:0 YUV (NV12).
    Nv12,
    /// 3-plane 4:2:0 YUV (I420).
    Yuv420,
}

/// How a shader has to sample an image of a given format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderOp {
    Default,
    /// Alpha has to be multiplied in after sampling.
    StraightAlpha,
    TwoPlanes,
    ThreePlanes,
}

/// Color conversion applied when sampling an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    None,
    /// Reinterpret through the sRGB variant of the format.
    Srgb,
    Bt601,
    Bt601Narrow,
    Bt709,
    Bt709Narrow,
    Bt2020,
    Bt2020Narrow,
}

impl Conversion {
    /// The YCbCr model/range pair for this conversion, or `None` for the
    /// RGB-identity conversions that need no sampler conversion object.
    pub fn ycbcr(self) -> Option<(vk::SamplerYcbcrModelConversion, vk::SamplerYcbcrRange)> {
        match self {
            Conversion::None | Conversion::Srgb => None,
            Conversion::Bt601 => Some((
                vk::SamplerYcbcrModelConversion::YCBCR_601,
                vk::SamplerYcbcrRange::ITU_FULL,
            )),
            Conversion::Bt601Narrow => Some((
                vk::SamplerYcbcrModelConversion::YCBCR_601,
                vk::SamplerYcbcrRange::ITU_NARROW,
            )),
            Conversion::Bt709 => Some((
                vk::SamplerYcbcrModelConversion::YCBCR_709,
                vk::SamplerYcbcrRange::ITU_FULL,
            )),
            Conversion::Bt709Narrow => Some((
                vk::SamplerYcbcrModelConversion::YCBCR_709,
                vk::SamplerYcbcrRange::ITU_NARROW,
            )),
            Conversion::Bt2020 => Some((
                vk::SamplerYcbcrModelConversion::YCBCR_2020,
                vk::SamplerYcbcrRange::ITU_FULL,
            )),
            Conversion::Bt2020Narrow => Some((
                vk::SamplerYcbcrModelConversion::YCBCR_2020,
                vk::SamplerYcbcrRange::ITU_NARROW,
            )),
        }
    }
}

/// Color-state tag handed through to exported dma-buf textures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorState {
    Srgb,
    SrgbLinear,
    Rec601,
    Rec709,
    Rec2020,
}

pub const fn component_mapping(
    r: vk::ComponentSwizzle,
    g: vk::ComponentSwizzle,
    b: vk::ComponentSwizzle,
    a: vk::ComponentSwizzle,
) -> vk::ComponentMapping {
    vk::ComponentMapping { r, g, b, a }
}

pub const fn identity_mapping() -> vk::ComponentMapping {
    component_mapping(
        vk::ComponentSwizzle::IDENTITY,
        vk::ComponentSwizzle::IDENTITY,
        vk::ComponentSwizzle::IDENTITY,
        vk::ComponentSwizzle::IDENTITY,
    )
}

pub fn is_identity_mapping(components: &vk::ComponentMapping) -> bool {
    (components.r == vk::ComponentSwizzle::R || components.r == vk::ComponentSwizzle::IDENTITY)
        && (components.g == vk::ComponentSwizzle::G
            || components.g == vk::ComponentSwizzle::IDENTITY)
        && (components.b == vk::ComponentSwizzle::B
            || components.b == vk::ComponentSwizzle::IDENTITY)
        && (components.a == vk::ComponentSwizzle::A
            || components.a == vk::ComponentSwizzle::IDENTITY)
}

/// Whether a swizzle is usable on a color attachment. Render targets are
/// written through the raw channel order, so only channel-preserving
/// mappings qualify.
pub fn is_framebuffer_compatible(components: &vk::ComponentMapping) -> bool {
    is_identity_mapping(components)
}

pub fn mapping_to_array(components: &vk::ComponentMapping) -> [vk::ComponentSwizzle; 4] {
    [components.r, components.g, components.b, components.a]
}

/// The Vulkan view of a logical format: concrete format, the swizzle needed
/// to sample it in logical channel order, and whether sampling requires a
/// YCbCr conversion object (multi-planar formats).
#[derive(Debug, Clone, Copy)]
pub struct FormatMapping {
    pub vk_format: vk::Format,
    pub components: vk::ComponentMapping,
    pub needs_conversion: bool,
}

impl MemoryFormat {
    pub fn vk_format(self) -> FormatMapping {
        let (vk_format, components, needs_conversion) = match self {
            MemoryFormat::Rgba8 | MemoryFormat::Rgba8Premultiplied => {
                (vk::Format::R8G8B8A8_UNORM, identity_mapping(), false)
            }
            MemoryFormat::Bgra8 | MemoryFormat::Bgra8Premultiplied => {
                (vk::Format::B8G8R8A8_UNORM, identity_mapping(), false)
            }
            MemoryFormat::Rgb8 => (vk::Format::R8G8B8_UNORM, identity_mapping(), false),
            MemoryFormat::Bgr8 => (vk::Format::B8G8R8_UNORM, identity_mapping(), false),
            MemoryFormat::Rgba16 => (vk::Format::R16G16B16A16_UNORM, identity_mapping(), false),
            MemoryFormat::Rgba16Float => {
                (vk::Format::R16G16B16A16_SFLOAT, identity_mapping(), false)
            }
            MemoryFormat::Rgba32Float => {
                (vk::Format::R32G32B32A32_SFLOAT, identity_mapping(), false)
            }
            MemoryFormat::Gray8 => (
                vk::Format::R8_UNORM,
                component_mapping(
                    vk::ComponentSwizzle::R,
                    vk::ComponentSwizzle::R,
                    vk::ComponentSwizzle::R,
                    vk::ComponentSwizzle::ONE,
                ),
                false,
            ),
            MemoryFormat::Alpha8 => (
                vk::Format::R8_UNORM,
                component_mapping(
                    vk::ComponentSwizzle::ZERO,
                    vk::ComponentSwizzle::ZERO,
                    vk::ComponentSwizzle::ZERO,
                    vk::ComponentSwizzle::R,
                ),
                false,
            ),
            MemoryFormat::Nv12 => (
                vk::Format::G8_B8R8_2PLANE_420_UNORM,
                identity_mapping(),
                true,
            ),
            MemoryFormat::Yuv420 => (
                vk::Format::G8_B8_R8_3PLANE_420_UNORM,
                identity_mapping(),
                true,
            ),
        };

        FormatMapping {
            vk_format,
            components,
            needs_conversion,
        }
    }

    /// The sRGB reinterpretation of this format, if Vulkan has one.
    pub fn vk_srgb_format(self) -> Option<vk::Format> {
        match self {
            MemoryFormat::Rgba8 | MemoryFormat::Rgba8Premultiplied => {
                Some(vk::Format::R8G8B8A8_SRGB)
            }
            MemoryFormat::Bgra8 | MemoryFormat::Bgra8Premultiplied => {
                Some(vk::Format::B8G8R8A8_SRGB)
            }
            MemoryFormat::Rgb8 => Some(vk::Format::R8G8B8_SRGB),
            MemoryFormat::Bgr8 => Some(vk::Format::B8G8R8_SRGB),
            _ => None,
        }
    }

    /// A channel-reordered equivalent more likely to be supported, together
    /// with the swizzle that restores the logical channel order.
    ///
    /// The returned format has the same per-texel memory layout, so image
    /// data can be uploaded unconverted.
    pub fn rgba_format(self) -> Option<(MemoryFormat, vk::ComponentMapping)> {
        let swapped_rb = component_mapping(
            vk::ComponentSwizzle::B,
            vk::ComponentSwizzle::G,
            vk::ComponentSwizzle::R,
            vk::ComponentSwizzle::A,
        );
        match self {
            MemoryFormat::Bgra8 => Some((MemoryFormat::Rgba8, swapped_rb)),
            MemoryFormat::Bgra8Premultiplied => {
                Some((MemoryFormat::Rgba8Premultiplied, swapped_rb))
            }
            MemoryFormat::Bgr8 => Some((
                MemoryFormat::Rgb8,
                component_mapping(
                    vk::ComponentSwizzle::B,
                    vk::ComponentSwizzle::G,
                    vk::ComponentSwizzle::R,
                    vk::ComponentSwizzle::IDENTITY,
                ),
            )),
            _ => None,
        }
    }

    /// Ordered fallback conversions, best first. Every chain ends in a
    /// format that plain rasterization hardware supports.
    pub fn fallbacks(self) -> &'static [MemoryFormat] {
        match self {
            MemoryFormat::Rgba8 => &[],
            MemoryFormat::Rgba8Premultiplied => &[MemoryFormat::Rgba8],
            MemoryFormat::Bgra8 => &[MemoryFormat::Rgba8],
            MemoryFormat::Bgra8Premultiplied => {
                &[MemoryFormat::Rgba8Premultiplied, MemoryFormat::Rgba8]
            }
            MemoryFormat::Rgb8 => &[MemoryFormat::Rgba8],
            MemoryFormat::Bgr8 => &[MemoryFormat::Rgb8, MemoryFormat::Rgba8],
            MemoryFormat::Rgba16 => &[MemoryFormat::Rgba16Float, MemoryFormat::Rgba8],
            MemoryFormat::Rgba16Float => &[MemoryFormat::Rgba32Float, MemoryFormat::Rgba8],
            MemoryFormat::Rgba32Float => &[MemoryFormat::Rgba16Float, MemoryFormat::Rgba8],
            MemoryFormat::Gray8 => &[MemoryFormat::Rgb8, MemoryFormat::Rgba8],
            MemoryFormat::Alpha8 => &[MemoryFormat::Rgba8],
            MemoryFormat::Nv12 => &[MemoryFormat::Rgba8],
            MemoryFormat::Yuv420 => &[MemoryFormat::Rgba8],
        }
    }

    pub fn default_shader_op(self) -> ShaderOp {
        match self {
            MemoryFormat::Rgba8 | MemoryFormat::Bgra8 => ShaderOp::StraightAlpha,
            MemoryFormat::Nv12 => ShaderOp::TwoPlanes,
            MemoryFormat::Yuv420 => ShaderOp::ThreePlanes,
            _ => ShaderOp::Default,
        }
    }

    pub fn n_planes(self) -> usize {
        match self {
            MemoryFormat::Nv12 => 2,
            MemoryFormat::Yuv420 => 3,
            _ => 1,
        }
    }

    pub fn has_alpha(self) -> bool {
        matches!(
            self,
            MemoryFormat::Rgba8
                | MemoryFormat::Rgba8Premultiplied
                | MemoryFormat::Bgra8
                | MemoryFormat::Bgra8Premultiplied
                | MemoryFormat::Rgba16
                | MemoryFormat::Rgba16Float
                | MemoryFormat::Rgba32Float
                | MemoryFormat::Alpha8
        )
    }

    pub fn is_premultiplied(self) -> bool {
        matches!(
            self,
            MemoryFormat::Rgba8Premultiplied | MemoryFormat::Bgra8Premultiplied
        ) || !self.has_alpha()
    }

    /// Resolves a dma-buf fourcc to a logical format. Returns the format and
    /// whether it is a YUV-family format.
    pub fn from_dmabuf_fourcc(fourcc: u32, premultiplied: bool) -> Option<(MemoryFormat, bool)> {
        match fourcc {
            DRM_FORMAT_ABGR8888 if premultiplied => Some((MemoryFormat::Rgba8Premultiplied, false)),
            DRM_FORMAT_ABGR8888 => Some((MemoryFormat::Rgba8, false)),
            DRM_FORMAT_ARGB8888 if premultiplied => Some((MemoryFormat::Bgra8Premultiplied, false)),
            DRM_FORMAT_ARGB8888 => Some((MemoryFormat::Bgra8, false)),
            DRM_FORMAT_R8 => Some((MemoryFormat::Gray8, false)),
            DRM_FORMAT_NV12 => Some((MemoryFormat::Nv12, true)),
            DRM_FORMAT_YUV420 => Some((MemoryFormat::Yuv420, true)),
            _ => None,
        }
    }

    /// The fourcc advertised when exporting this format as a dma-buf.
    pub fn dmabuf_fourcc(self) -> Option<u32> {
        match self {
            MemoryFormat::Rgba8 | MemoryFormat::Rgba8Premultiplied => Some(DRM_FORMAT_ABGR8888),
            MemoryFormat::Bgra8 | MemoryFormat::Bgra8Premultiplied => Some(DRM_FORMAT_ARGB8888),
            MemoryFormat::Gray8 => Some(DRM_FORMAT_R8),
            MemoryFormat::Nv12 => Some(DRM_FORMAT_NV12),
            MemoryFormat::Yuv420 => Some(DRM_FORMAT_YUV420),
            _ => None,
        }
    }

    /// Resolves a DXGI format (D3D12 interop) to a logical format.
    pub fn from_dxgi_format(dxgi: u32, premultiplied: bool) -> Option<MemoryFormat> {
        match dxgi {
            DXGI_FORMAT_R8G8B8A8_UNORM if premultiplied => Some(MemoryFormat::Rgba8Premultiplied),
            DXGI_FORMAT_R8G8B8A8_UNORM => Some(MemoryFormat::Rgba8),
            DXGI_FORMAT_B8G8R8A8_UNORM if premultiplied => Some(MemoryFormat::Bgra8Premultiplied),
            DXGI_FORMAT_B8G8R8A8_UNORM => Some(MemoryFormat::Bgra8),
            DXGI_FORMAT_R16G16B16A16_UNORM => Some(MemoryFormat::Rgba16),
            DXGI_FORMAT_R16G16B16A16_FLOAT => Some(MemoryFormat::Rgba16Float),
            DXGI_FORMAT_R32G32B32A32_FLOAT => Some(MemoryFormat::Rgba32Float),
            DXGI_FORMAT_R8_UNORM => Some(MemoryFormat::Gray8),
            DXGI_FORMAT_NV12 => Some(MemoryFormat::Nv12),
            _ => None,
        }
    }
}

/// Per-plane offset and row stride of a host-mapped image.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryPlane {
    pub offset: u64,
    pub stride: u64,
}

/// Describes the memory of a host-mapped image.
#[derive(Debug, Clone, Copy)]
pub struct MemoryLayout {
    pub format: MemoryFormat,
    pub width: u32,
    pub height: u32,
    pub size: u64,
    pub n_planes: usize,
    pub planes: [MemoryPlane; MAX_PLANES],
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn fallback_chains_never_cycle() {
        for &format in ALL_FORMATS {
            for &fallback in format.fallbacks() {
                assert_ne!(fallback, format, "{format:?} falls back to itself");
                assert!(
                    !fallback.fallbacks().contains(&format),
                    "{format:?} and {fallback:?} fall back to each other"
                );
            }
        }
    }

    #[test]
    fn fallback_chains_preserve_alpha() {
        for &format in ALL_FORMATS {
            if !format.has_alpha() {
                continue;
            }
            for &fallback in format.fallbacks() {
                assert!(
                    fallback.has_alpha(),
                    "{format:?} falls back to alpha-less {fallback:?}"
                );
            }
        }
    }

    #[test]
    fn multiplanar_formats_need_conversion() {
        for &format in ALL_FORMATS {
            assert_eq!(format.vk_format().needs_conversion, format.n_planes() > 1);
        }
    }

    #[test]
    fn exported_fourcc_resolves_back() {
        for &format in ALL_FORMATS {
            let Some(fourcc) = format.dmabuf_fourcc() else {
                continue;
            };
            let (resolved, is_yuv) =
                MemoryFormat::from_dmabuf_fourcc(fourcc, format.is_premultiplied()).unwrap();
            assert_eq!(resolved, format);
            assert_eq!(is_yuv, format.n_planes() > 1);
        }
    }

    #[test]
    fn srgb_variants_only_for_8bit_rgb() {
        assert_eq!(
            MemoryFormat::Rgba8.vk_srgb_format(),
            Some(vk::Format::R8G8B8A8_SRGB)
        );
        assert_eq!(MemoryFormat::Rgba16Float.vk_srgb_format(), None);
        assert_eq!(MemoryFormat::Nv12.vk_srgb_format(), None);
    }

    #[test]
    fn rgba_equivalent_keeps_texel_layout() {
        let (format, components) = MemoryFormat::Bgra8.rgba_format().unwrap();
        assert_eq!(format, MemoryFormat::Rgba8);
        assert!(!is_identity_mapping(&components));
        assert!(!is_framebuffer_compatible(&components));
    }
}
