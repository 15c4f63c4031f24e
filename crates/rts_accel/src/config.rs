//! Renderer configuration.

use rts_math::RotationOrder;

use crate::pipeline::ShadingMode;

/// Settings fixed for the lifetime of a coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct RendererConfig {
    /// Output image width in pixels
    pub width: u32,
    /// Output image height in pixels
    pub height: u32,
    /// Render targets written next to the output: normal/roughness,
    /// view depth and albedo, in that order. These feed the denoiser.
    pub aux_targets: u32,
    /// Maximum trace depth, primary rays included
    pub max_recursion_depth: u32,
    /// How instance Euler angles are composed
    pub rotation_order: RotationOrder,
    /// Mode used until the first `SetShadingMode`
    pub default_shading_mode: ShadingMode,
    /// Samples per pixel, forwarded to the programs through the camera constants
    pub sample_count: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            aux_targets: 3,
            max_recursion_depth: 2,
            rotation_order: RotationOrder::default(),
            default_shading_mode: ShadingMode::Flat,
            sample_count: 1,
        }
    }
}

impl RendererConfig {
    /// A config rendering `width` x `height` with everything else default.
    pub fn with_size(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    /// Output image plus auxiliary targets.
    pub fn output_count(&self) -> u32 {
        1 + self.aux_targets
    }

    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RendererConfig::default();
        assert_eq!(config.output_count(), 4);
        assert_eq!(config.default_shading_mode, ShadingMode::Flat);
        assert_eq!(config.rotation_order, RotationOrder::RollPitchYaw);
    }

    #[test]
    fn test_with_size() {
        let config = RendererConfig::with_size(64, 32);
        assert_eq!((config.width, config.height), (64, 32));
        assert!((config.aspect() - 2.0).abs() < 1e-6);
    }
}
