//! Environment texture loading.
//!
//! Images are decoded with the image crate into linear RGBA floats and
//! sampled as equirectangular maps by escaping rays.

use std::f32::consts::PI;
use std::path::Path;

use rts_math::Vec3;
use thiserror::Error;

/// Errors that can occur during texture loading.
#[derive(Error, Debug)]
pub enum TextureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decoding error: {0}")]
    ImageError(#[from] image::ImageError),
}

pub type TextureResult<T> = Result<T, TextureError>;

/// A loaded texture with pixel data.
///
/// Stores pixels in linear RGBA format, row-major.
#[derive(Clone, Debug)]
pub struct Texture {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<[f32; 4]>,
    /// Source file path (for debugging)
    pub path: String,
}

impl Texture {
    pub fn new(width: u32, height: u32, pixels: Vec<[f32; 4]>, path: impl Into<String>) -> Self {
        Self {
            width,
            height,
            pixels,
            path: path.into(),
        }
    }

    /// Create a solid color texture (1x1).
    pub fn solid_color(color: Vec3) -> Self {
        Self::new(1, 1, vec![[color.x, color.y, color.z, 1.0]], "<solid>")
    }

    /// Nearest-texel lookup in equirectangular layout for a world direction.
    pub fn sample_direction(&self, direction: Vec3) -> Vec3 {
        let d = direction.normalize_or_zero();
        let u = 0.5 + d.z.atan2(d.x) / (2.0 * PI);
        let v = d.y.clamp(-1.0, 1.0).acos() / PI;
        let x = ((u * self.width as f32) as u32).min(self.width.saturating_sub(1));
        let y = ((v * self.height as f32) as u32).min(self.height.saturating_sub(1));
        let p = self.get_pixel(x, y);
        Vec3::new(p[0], p[1], p[2])
    }

    fn get_pixel(&self, x: u32, y: u32) -> [f32; 4] {
        let idx = (y * self.width + x) as usize;
        self.pixels
            .get(idx)
            .copied()
            .unwrap_or([0.0, 0.0, 0.0, 1.0])
    }

    /// Get total size in bytes (approximate).
    pub fn size_bytes(&self) -> usize {
        self.pixels.len() * std::mem::size_of::<[f32; 4]>()
    }
}

/// Load a texture from a file path.
///
/// HDR formats keep their float values; 8-bit formats are converted from sRGB.
pub fn load_texture<P: AsRef<Path>>(path: P) -> TextureResult<Texture> {
    let path = path.as_ref();
    let img = image::open(path)?;

    let pixels: Vec<[f32; 4]> = match img {
        image::DynamicImage::ImageRgb32F(_) | image::DynamicImage::ImageRgba32F(_) => img
            .to_rgba32f()
            .pixels()
            .map(|p| p.0)
            .collect(),
        _ => img
            .to_rgba8()
            .pixels()
            .map(|p| {
                [
                    srgb_to_linear(p[0]),
                    srgb_to_linear(p[1]),
                    srgb_to_linear(p[2]),
                    p[3] as f32 / 255.0,
                ]
            })
            .collect(),
    };

    let texture = Texture::new(img.width(), img.height(), pixels, path.to_string_lossy());
    log::debug!(
        "Loaded texture: {} ({}x{}, {:.1} KB)",
        texture.path,
        texture.width,
        texture.height,
        texture.size_bytes() as f32 / 1024.0
    );
    Ok(texture)
}

/// Convert sRGB byte value to linear float.
fn srgb_to_linear(value: u8) -> f32 {
    let v = value as f32 / 255.0;
    if v <= 0.04045 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}
