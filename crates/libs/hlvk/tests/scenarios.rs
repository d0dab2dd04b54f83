//! End-to-end negotiation scenarios against a simulated capability matrix.

use ash::vk;
use moraine_hlvk::{
    plan_dmabuf_import, Conversion, DeviceFeatures, DmabufImport, DrmFormatInfo, FormatQuery,
    ImageFlags, ImageFormatLimits, ImageInfo, MemoryFormat, PlaneLayout, ShaderOp,
    DRM_FORMAT_NV12,
};
use smallvec::{smallvec, SmallVec};
use std::collections::HashMap;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A device defined entirely by tables.
#[derive(Default)]
struct SimulatedDevice {
    optimal: HashMap<vk::Format, vk::FormatFeatureFlags>,
    linear: HashMap<vk::Format, vk::FormatFeatureFlags>,
    drm: HashMap<vk::Format, Vec<DrmFormatInfo>>,
    ycbcr: bool,
}

fn all_features() -> vk::FormatFeatureFlags {
    vk::FormatFeatureFlags::SAMPLED_IMAGE
        | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR
        | vk::FormatFeatureFlags::COLOR_ATTACHMENT_BLEND
        | vk::FormatFeatureFlags::BLIT_SRC
        | vk::FormatFeatureFlags::TRANSFER_SRC
}

impl SimulatedDevice {
    fn with_format(mut self, format: vk::Format) -> Self {
        self.optimal.insert(format, all_features());
        self.linear.insert(format, all_features());
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
            max_width: 16384,
            max_height: 16384,
            max_mip_levels: 15,
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

fn nv12_import(planes: SmallVec<[PlaneLayout; 4]>) -> DmabufImport {
    DmabufImport {
        fourcc: DRM_FORMAT_NV12,
        modifier: 0,
        width: 256,
        height: 144,
        planes,
        sync_fd: None,
        premultiplied: true,
        conversion: Conversion::Bt601,
    }
}

#[test]
fn upload_image_is_linear_and_host_mappable() {
    init_logging();
    // Scenario: an upload image for straight-alpha RGBA8 at 64x64.
    let device = SimulatedDevice::default().with_format(vk::Format::R8G8B8A8_UNORM);

    let info = ImageInfo::for_upload(&device, MemoryFormat::Rgba8, Conversion::None, 64, 64)
        .expect("upload plan");

    assert_eq!(info.tiling, vk::ImageTiling::LINEAR);
    assert_eq!(info.initial.layout, vk::ImageLayout::PREINITIALIZED);
    assert_eq!(info.initial.stage, vk::PipelineStageFlags::TRANSFER);
    assert_eq!(info.initial.access, vk::AccessFlags::TRANSFER_WRITE);
    assert!(info
        .memory_preference
        .contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
    assert_eq!(info.shader_op, ShaderOp::StraightAlpha);
    assert_eq!(info.mip_levels(), 1);
}

#[test]
fn unsupported_native_format_falls_back_to_rgba_equivalent() {
    init_logging();
    // Scenario: the device has no BGRA8 but exposes the RGBA equivalent.
    // Sampling works through a non-identity swizzle; blitting is revoked
    // because a blit would bypass the swizzle.
    let device = SimulatedDevice::default().with_format(vk::Format::R8G8B8A8_UNORM);

    let info = ImageInfo::for_upload(&device, MemoryFormat::Bgra8, Conversion::None, 64, 64)
        .expect("fallback plan");

    assert_eq!(info.vk_format, vk::Format::R8G8B8A8_UNORM);
    assert_eq!(info.format, MemoryFormat::Bgra8, "texel layout unchanged");
    assert_ne!(info.components.r, vk::ComponentSwizzle::IDENTITY);
    assert!(!info.flags.contains(ImageFlags::BLIT));
}

#[test]
fn nv12_import_without_modifier_support_returns_none() {
    init_logging();
    // Scenario: a 2-plane NV12 dma-buf on a device advertising no DRM
    // modifiers at all. The import must signal graceful unsupport, not
    // abort.
    let mut device = SimulatedDevice::default().with_format(vk::Format::R8G8B8A8_UNORM);
    device.ycbcr = true;

    let import = nv12_import(smallvec![
        PlaneLayout {
            fd: 7,
            offset: 0,
            stride: 256,
        },
        PlaneLayout {
            fd: 7,
            offset: 256 * 144,
            stride: 256,
        },
    ]);

    assert!(plan_dmabuf_import(
        &device,
        DeviceFeatures::DMABUF | DeviceFeatures::YCBCR,
        &import
    )
    .is_none());
}

#[test]
fn nv12_import_with_modifier_goes_through_ycbcr() {
    init_logging();
    let mut device = SimulatedDevice::default();
    device.ycbcr = true;
    device.drm.insert(
        vk::Format::G8_B8R8_2PLANE_420_UNORM,
        vec![DrmFormatInfo {
            modifier: 0,
            plane_count: 2,
            features: all_features(),
        }],
    );

    let import = nv12_import(smallvec![
        PlaneLayout {
            fd: 7,
            offset: 0,
            stride: 256,
        },
        PlaneLayout {
            fd: 7,
            offset: 256 * 144,
            stride: 256,
        },
    ]);

    let plan = plan_dmabuf_import(
        &device,
        DeviceFeatures::DMABUF | DeviceFeatures::YCBCR,
        &import,
    )
    .expect("NV12 import plan");

    assert_eq!(plan.format, MemoryFormat::Nv12);
    assert!(plan.needs_conversion);
    assert!(plan.is_yuv);
    assert!(plan.flags.contains(ImageFlags::EXTERNAL));
    assert!(!plan.flags.contains(ImageFlags::BLIT));
    assert_eq!(plan.shader_op, ShaderOp::Default);
    assert_eq!(plan.conversion, Conversion::Bt601);
}

#[test]
fn disjoint_dmabuf_planes_are_rejected() {
    init_logging();
    let mut device = SimulatedDevice::default();
    device.ycbcr = true;
    device.drm.insert(
        vk::Format::G8_B8R8_2PLANE_420_UNORM,
        vec![DrmFormatInfo {
            modifier: 0,
            plane_count: 2,
            features: all_features(),
        }],
    );

    let import = nv12_import(smallvec![
        PlaneLayout {
            fd: 7,
            offset: 0,
            stride: 256,
        },
        PlaneLayout {
            fd: 8,
            offset: 0,
            stride: 256,
        },
    ]);

    assert!(plan_dmabuf_import(
        &device,
        DeviceFeatures::DMABUF | DeviceFeatures::YCBCR,
        &import
    )
    .is_none());
}

#[test]
fn mipmapped_offscreen_plans_a_full_chain() {
    init_logging();
    let device = SimulatedDevice::default().with_format(vk::Format::R8G8B8A8_UNORM);

    let info = ImageInfo::for_offscreen(
        &device,
        MemoryFormat::Rgba8Premultiplied,
        false,
        true,
        64,
        64,
    )
    .expect("offscreen plan");

    assert!(info.flags.contains(ImageFlags::CAN_MIPMAP));
    assert_eq!(info.mip_levels(), 7);
    assert_eq!(info.initial.layout, vk::ImageLayout::UNDEFINED);
    assert_eq!(
        info.initial.stage,
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
    );
}

#[test]
fn oversized_request_is_an_error_not_a_panic() {
    init_logging();
    let device = SimulatedDevice::default().with_format(vk::Format::R8G8B8A8_UNORM);

    let result = ImageInfo::for_upload(
        &device,
        MemoryFormat::Rgba8,
        Conversion::None,
        1 << 20,
        1 << 20,
    );
    assert!(result.is_err());
}
