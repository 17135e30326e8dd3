//! Decoded video frames.
//!
//! - `Frame`: packed RGB8 pixels as produced by every ingest source.
//! - JPEG encoding for the MJPEG fan-out.

use anyhow::{anyhow, Context, Result};
use image::{ImageBuffer, RgbImage};
use std::time::Instant;

/// Decoded RGB8 frame (`width * height * 3` bytes, row-major, no padding).
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic capture instant.
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = expected_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
        })
    }

    pub fn from_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            captured_at: Instant::now(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }

    /// Copy into an `RgbImage` for drawing.
    pub fn to_image(&self) -> Result<RgbImage> {
        ImageBuffer::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let image = self.to_image()?;
        encode_jpeg(&image, quality)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut jpeg = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, quality);
    encoder.encode_image(image).context("encode jpeg")?;
    Ok(jpeg)
}

fn expected_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}
