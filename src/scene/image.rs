//! Image decoding

use std::path::{Path, PathBuf};

use crate::error::{ViewerError, ViewerResult};

/// CPU-side RGBA8 image, rows tightly packed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl DecodedImage {
    /// Wrap RGBA8 pixels, checking the buffer matches the dimensions.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> ViewerResult<Self> {
        if width == 0 || height == 0 {
            return Err(ViewerError::InvalidTexture(format!(
                "image has zero size ({}x{})",
                width, height
            )));
        }
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(ViewerError::InvalidTexture(format!(
                "{} bytes of pixels for a {}x{} RGBA8 image (expected {})",
                pixels.len(),
                width,
                height,
                expected
            )));
        }
        Ok(Self { width, height, pixels })
    }

    /// Create a single-color image
    pub fn solid_color(width: u32, height: u32, color: [u8; 4]) -> Self {
        let pixels = color.repeat(width as usize * height as usize);
        Self { width, height, pixels }
    }

    /// Create a checkerboard of 8-pixel squares, `color1` in the top-left square
    pub fn checkerboard(size: u32, color1: [u8; 4], color2: [u8; 4]) -> Self {
        let mut pixels = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let is_first = ((x / 8) + (y / 8)) % 2 == 0;
                pixels.extend_from_slice(if is_first { &color1 } else { &color2 });
            }
        }
        Self {
            width: size,
            height: size,
            pixels,
        }
    }

    /// RGBA value at (x, y), or `None` outside the image.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let start = (y as usize * self.width as usize + x as usize) * 4;
        let texel = self.pixels.get(start..start + 4)?;
        let mut rgba = [0; 4];
        rgba.copy_from_slice(texel);
        Some(rgba)
    }
}

/// Where a material's texture comes from
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    /// Image file on disk.
    File(PathBuf),
    /// Compressed image bytes embedded in the scene file.
    Embedded {
        bytes: Vec<u8>,
        mime_type: Option<String>,
    },
    /// Pixels that are already decoded.
    Decoded(DecodedImage),
}

/// Turns an [`ImageSource`] into RGBA8 pixels
pub trait ImageDecoder {
    fn decode(&self, source: &ImageSource) -> ViewerResult<DecodedImage>;
}

/// [`ImageDecoder`] backed by the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateDecoder;

impl ImageCrateDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Load an image from a file path
    pub fn from_file(path: &Path) -> ViewerResult<DecodedImage> {
        let img = image::open(path)
            .map_err(|e| ViewerError::InvalidTexture(format!("{}: {}", path.display(), e)))?;
        Self::from_dynamic(img)
    }

    /// Load an image from compressed bytes
    pub fn from_bytes(bytes: &[u8], mime_type: Option<&str>) -> ViewerResult<DecodedImage> {
        let format = mime_type.and_then(image::ImageFormat::from_mime_type);
        let img = match format {
            Some(format) => image::load_from_memory_with_format(bytes, format),
            None => image::load_from_memory(bytes),
        }
        .map_err(|e| ViewerError::InvalidTexture(format!("embedded image: {}", e)))?;
        Self::from_dynamic(img)
    }

    fn from_dynamic(img: image::DynamicImage) -> ViewerResult<DecodedImage> {
        let rgba = img.to_rgba8();
        let (width, height) = rgba.dimensions();
        DecodedImage::new(width, height, rgba.into_raw())
    }
}

impl ImageDecoder for ImageCrateDecoder {
    fn decode(&self, source: &ImageSource) -> ViewerResult<DecodedImage> {
        match source {
            ImageSource::File(path) => Self::from_file(path),
            ImageSource::Embedded { bytes, mime_type } => Self::from_bytes(bytes, mime_type.as_deref()),
            ImageSource::Decoded(image) => Ok(image.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_checkerboard_squares() {
        let black = [0, 0, 0, 255];
        let magenta = [255, 0, 255, 255];
        let image = DecodedImage::checkerboard(64, black, magenta);
        assert_eq!(image.pixels.len(), 64 * 64 * 4);
        assert_eq!(image.pixel(0, 0), Some(black));
        assert_eq!(image.pixel(7, 7), Some(black));
        assert_eq!(image.pixel(8, 0), Some(magenta));
        assert_eq!(image.pixel(8, 8), Some(black));
        assert_eq!(image.pixel(63, 0), Some(magenta));
    }

    #[rstest]
    #[case(4, 0)]
    #[case(0, 2)]
    #[case(u32::MAX, u32::MAX)]
    fn test_pixel_outside_image_is_none(#[case] x: u32, #[case] y: u32) {
        let image = DecodedImage::solid_color(4, 2, [9, 9, 9, 255]);
        assert_eq!(image.pixel(x, y), None);
        assert_eq!(image.pixel(3, 1), Some([9, 9, 9, 255]));
    }

    #[test]
    fn test_size_mismatch_is_invalid() {
        assert!(matches!(
            DecodedImage::new(2, 2, vec![0; 15]),
            Err(ViewerError::InvalidTexture(_))
        ));
        assert!(DecodedImage::new(0, 2, Vec::new()).is_err());
    }

    #[test]
    fn test_decode_png_bytes() {
        let mut png = Vec::new();
        let source = image::RgbaImage::from_raw(2, 1, vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        source
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageOutputFormat::Png)
            .unwrap();

        let decoded = ImageCrateDecoder
            .decode(&ImageSource::Embedded {
                bytes: png,
                mime_type: Some("image/png".to_string()),
            })
            .unwrap();
        assert_eq!(decoded.width, 2);
        assert_eq!(decoded.pixels, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_missing_file_is_invalid_texture() {
        let result = ImageCrateDecoder.decode(&ImageSource::File(PathBuf::from("/nonexistent/albedo.png")));
        assert!(matches!(result, Err(ViewerError::InvalidTexture(_))));
    }
}
