//! Row-major grayscale frame buffer
//!
//! The reassembler writes one byte per pixel into a `GrayFrame`; once a
//! cycle completes the frame is handed to the driver, which encodes it as
//! PNG for upload.

use image::{GrayImage, ImageFormat};
use std::io::Cursor;

/// Fixed-size grayscale image, one byte per pixel, row-major
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayFrame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl GrayFrame {
    /// Create a zero-filled frame
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize],
        }
    }

    /// Wrap existing row-major pixel data.
    ///
    /// Returns `None` if `pixels.len() != width * height`.
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        if pixels.len() != width as usize * height as usize {
            return None;
        }
        Some(Self {
            width,
            height,
            pixels,
        })
    }

    /// Frame width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row-major pixel data
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Consume the frame and return its pixel data
    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    /// Pixel at column `x`, row `y`
    pub fn get(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    /// Store `value` at linear row-major `index` (`row = index / W`,
    /// `col = index % W`). Out-of-range writes are ignored.
    pub(crate) fn set_linear(&mut self, index: usize, value: u8) {
        if let Some(slot) = self.pixels.get_mut(index) {
            *slot = value;
        }
    }

    /// Zero every pixel
    pub fn clear(&mut self) {
        self.pixels.fill(0);
    }

    /// Convert to an `image::GrayImage`
    pub fn to_gray_image(&self) -> GrayImage {
        // Length is width * height by construction
        GrayImage::from_raw(self.width, self.height, self.pixels.clone())
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }

    /// Encode as PNG for upload.
    ///
    /// # Errors
    ///
    /// Returns the encoder error if PNG encoding fails.
    pub fn encode_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut out = Cursor::new(Vec::new());
        self.to_gray_image().write_to(&mut out, ImageFormat::Png)?;
        Ok(out.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_zero_filled() {
        let frame = GrayFrame::new(4, 3);
        assert_eq!(frame.pixels().len(), 12);
        assert!(frame.pixels().iter().all(|&p| p == 0));
    }

    #[test]
    fn test_from_pixels_rejects_wrong_length() {
        assert!(GrayFrame::from_pixels(4, 4, vec![0; 15]).is_none());
        assert!(GrayFrame::from_pixels(4, 4, vec![0; 16]).is_some());
    }

    #[test]
    fn test_linear_index_is_row_major() {
        let mut frame = GrayFrame::new(4, 4);
        frame.set_linear(6, 0xAB); // row 1, col 2
        assert_eq!(frame.get(2, 1), Some(0xAB));
        assert_eq!(frame.get(1, 2), Some(0));
    }

    #[test]
    fn test_out_of_range_access() {
        let mut frame = GrayFrame::new(2, 2);
        frame.set_linear(4, 9);
        assert_eq!(frame.get(2, 0), None);
        assert!(frame.pixels().iter().all(|&p| p == 0));
    }

    #[test]
    fn test_encode_png_signature() {
        let pixels: Vec<u8> = (0..64).map(|i| (i * 4) as u8).collect();
        let frame = GrayFrame::from_pixels(8, 8, pixels).unwrap();
        let png = frame.encode_png().unwrap();

        assert_eq!(&png[..8], &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
        let decoded = image::load_from_memory(&png).unwrap().to_luma8();
        assert_eq!(decoded.as_raw(), frame.pixels());
    }
}
