//! Turns uploaded bytes into an upright 8-bit RGB [`Image`].
//!
//! Uploads arrive from file pickers and cameras with all sorts of container
//! quirks, so decoding happens twice: a lenient pass sniffs the format,
//! applies the EXIF orientation and re-encodes the pixels as PNG, then a
//! strict pass decodes that PNG with the format pinned.

use std::io::Cursor;

use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader, RgbImage};

use crate::error::DecodeError;

/// Decoded picture. Channel order is R, G, B; width and height are never zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pixels: RgbImage,
}

impl Image {
    pub const CHANNELS: usize = 3;

    /// Wraps an RGB buffer, rejecting zero-sized images.
    pub fn from_rgb(pixels: RgbImage) -> Result<Self, DecodeError> {
        let (width, height) = pixels.dimensions();
        if width == 0 || height == 0 {
            return Err(DecodeError::NoPixels { width, height });
        }
        Ok(Self { pixels })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn channels(&self) -> usize {
        Self::CHANNELS
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.pixels
    }
}

/// Decodes a JPEG/PNG-family buffer.
pub fn decode_image(bytes: &[u8]) -> Result<Image, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let normalized = normalize(bytes)?;
    let strict = image::load_from_memory_with_format(&normalized, ImageFormat::Png)
        .map_err(|e| DecodeError::Corrupt(e.to_string()))?;
    let image = Image::from_rgb(strict.into_rgb8())?;
    tracing::debug!(
        "decoded {} bytes into {}x{} image",
        bytes.len(),
        image.width(),
        image.height()
    );
    Ok(image)
}

/// Lenient pass: any format the image library can sniff, upright, re-encoded
/// as 8-bit RGB PNG.
fn normalize(bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| DecodeError::Unrecognized(e.to_string()))?;
    let format = reader
        .format()
        .ok_or_else(|| DecodeError::Unrecognized("unknown container format".into()))?;
    let mut decoder = reader
        .into_decoder()
        .map_err(|e| DecodeError::Corrupt(e.to_string()))?;
    let orientation = match decoder.orientation() {
        Ok(orientation) => Some(orientation),
        Err(e) => {
            tracing::debug!("ignoring unreadable orientation metadata: {e}");
            None
        }
    };
    let mut img =
        DynamicImage::from_decoder(decoder).map_err(|e| DecodeError::Corrupt(e.to_string()))?;
    if let Some(orientation) = orientation {
        img.apply_orientation(orientation);
    }
    if img.width() == 0 || img.height() == 0 {
        return Err(DecodeError::NoPixels {
            width: img.width(),
            height: img.height(),
        });
    }
    tracing::debug!("lenient decode of {format:?} succeeded");

    let rgb = DynamicImage::ImageRgb8(img.into_rgb8());
    let mut out = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(|e| DecodeError::Corrupt(e.to_string()))?;
    Ok(out)
}
