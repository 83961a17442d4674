//! Frame type and the image decoding boundary.

use image::{ImageError, Rgb, RgbImage};

// BT.601 luma weights, matching the usual RGB -> gray conversion.
const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("image decode failed: {0}")]
    Decode(#[from] ImageError),
    #[error("invalid RGB buffer for {width}x{height}: expected {expected} bytes, got {actual}")]
    InvalidLength {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// A decoded 3-channel (RGB8) frame.
///
/// Owned by the caller for the duration of one pipeline call, never persisted.
#[derive(Clone)]
pub struct Frame {
    image: RgbImage,
}

impl Frame {
    /// Decode an uploaded image payload (any format the `image` crate knows).
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let image = image::load_from_memory(bytes)?.into_rgb8();
        Ok(Self { image })
    }

    /// Wrap a packed RGB8 buffer of `width * height * 3` bytes.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 3;
        let actual = data.len();
        RgbImage::from_raw(width, height, data)
            .filter(|_| actual == expected)
            .map(|image| Self { image })
            .ok_or(FrameError::InvalidLength {
                width,
                height,
                expected,
                actual,
            })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        self.image.get_pixel(x, y).0
    }

    /// Single-channel luminance, one byte per pixel in row-major order.
    pub fn luminance(&self) -> Vec<u8> {
        self.image.pixels().map(luma).collect()
    }
}

impl From<RgbImage> for Frame {
    fn from(image: RgbImage) -> Self {
        Self { image }
    }
}

fn luma(pixel: &Rgb<u8>) -> u8 {
    let [r, g, b] = pixel.0;
    let y = LUMA_R * r as f32 + LUMA_G * g as f32 + LUMA_B * b as f32;
    y.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageFormat;
    use std::io::Cursor;

    #[test]
    fn test_luminance_weights() {
        let frame = Frame::from_rgb(3, 1, vec![255, 0, 0, 0, 255, 0, 0, 0, 255]).unwrap();
        assert_eq!(frame.luminance(), vec![76, 150, 29]);
    }

    #[test]
    fn test_luminance_of_gray_is_identity() {
        let data: Vec<u8> = [0u8, 100, 150, 255].iter().flat_map(|&v| [v, v, v]).collect();
        let frame = Frame::from_rgb(4, 1, data).unwrap();
        assert_eq!(frame.luminance(), vec![0, 100, 150, 255]);
    }

    #[test]
    fn test_from_rgb_rejects_wrong_length() {
        let short = Frame::from_rgb(2, 2, vec![0u8; 11]);
        assert!(matches!(
            short,
            Err(FrameError::InvalidLength { expected: 12, actual: 11, .. })
        ));
        let long = Frame::from_rgb(2, 2, vec![0u8; 13]);
        assert!(matches!(long, Err(FrameError::InvalidLength { actual: 13, .. })));
    }

    #[test]
    fn test_decode_png() {
        let img = RgbImage::from_pixel(4, 3, Rgb([10, 20, 30]));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();

        let frame = Frame::decode(&buf).unwrap();
        assert_eq!((frame.width(), frame.height()), (4, 3));
        assert_eq!(frame.pixel(3, 2), [10, 20, 30]);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result = Frame::decode(b"definitely not an image");
        assert!(matches!(result, Err(FrameError::Decode(_))));
    }
}
