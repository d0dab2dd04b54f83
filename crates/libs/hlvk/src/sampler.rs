use ash::vk;

/// The sampler configurations images cache descriptor sets for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    /// Linear filtering, edge clamping.
    Default,
    /// Linear filtering, transparent-black border.
    Transparent,
    /// Linear filtering, repeat wrapping.
    Repeat,
    Nearest,
    /// Linear filtering across the full mip chain.
    MipmapDefault,
}

impl SamplerKind {
    pub const COUNT: usize = 5;

    pub const ALL: [SamplerKind; Self::COUNT] = [
        SamplerKind::Default,
        SamplerKind::Transparent,
        SamplerKind::Repeat,
        SamplerKind::Nearest,
        SamplerKind::MipmapDefault,
    ];

    pub fn index(self) -> usize {
        match self {
            SamplerKind::Default => 0,
            SamplerKind::Transparent => 1,
            SamplerKind::Repeat => 2,
            SamplerKind::Nearest => 3,
            SamplerKind::MipmapDefault => 4,
        }
    }

    pub(crate) fn create_info(self) -> vk::SamplerCreateInfo {
        let builder = match self {
            SamplerKind::Default => vk::SamplerCreateInfo::builder()
                .mag_filter(vk::Filter::LINEAR)
                .min_filter(vk::Filter::LINEAR)
                .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE),
            SamplerKind::Transparent => vk::SamplerCreateInfo::builder()
                .mag_filter(vk::Filter::LINEAR)
                .min_filter(vk::Filter::LINEAR)
                .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_BORDER)
                .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_BORDER)
                .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_BORDER)
                .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK),
            SamplerKind::Repeat => vk::SamplerCreateInfo::builder()
                .mag_filter(vk::Filter::LINEAR)
                .min_filter(vk::Filter::LINEAR)
                .address_mode_u(vk::SamplerAddressMode::REPEAT)
                .address_mode_v(vk::SamplerAddressMode::REPEAT)
                .address_mode_w(vk::SamplerAddressMode::REPEAT),
            SamplerKind::Nearest => vk::SamplerCreateInfo::builder()
                .mag_filter(vk::Filter::NEAREST)
                .min_filter(vk::Filter::NEAREST)
                .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE),
            SamplerKind::MipmapDefault => vk::SamplerCreateInfo::builder()
                .mag_filter(vk::Filter::LINEAR)
                .min_filter(vk::Filter::LINEAR)
                .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
                .max_lod(vk::LOD_CLAMP_NONE)
                .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE),
        };
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_dense_and_unique() {
        for (expected, kind) in SamplerKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), expected);
        }
    }
}
