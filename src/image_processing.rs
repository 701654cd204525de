use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageFormat, ImageReader, Limits, RgbImage};
use thiserror::Error;
use tracing::debug;

use crate::config::ServiceConfig;

/// Formats accepted from object storage and local files.
const ALLOWED_FORMATS: &[ImageFormat] = &[ImageFormat::Jpeg, ImageFormat::Png];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to decode image: {source}")]
    Decode {
        #[from]
        source: image::ImageError,
    },

    #[error("image too large: {width}x{height} = {pixels} pixels, max {max_pixels}")]
    ImageTooLarge {
        width: u32,
        height: u32,
        pixels: u64,
        max_pixels: u64,
    },

    #[error("invalid image dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("input too large: {size} bytes, max {max_size}")]
    InputTooLarge { size: usize, max_size: usize },

    #[error("input bytes empty")]
    EmptyInput,

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
}

#[derive(Debug, Error)]
#[error("{format} encoding failed: width={width}, height={height}, reason={reason}")]
pub struct EncodeError {
    pub format: &'static str,
    pub width: u32,
    pub height: u32,
    pub reason: String,
}

/// Bounds applied while decoding untrusted image bytes.
#[derive(Clone, Debug)]
pub struct DecodeLimits {
    pub max_input_bytes: usize,
    pub max_dimension: u32,
    pub max_image_pixels: u64,
    pub max_alloc_bytes: u64,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self::from(&ServiceConfig::default())
    }
}

impl From<&ServiceConfig> for DecodeLimits {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            max_input_bytes: config.max_input_bytes,
            max_dimension: config.max_dimension,
            max_image_pixels: config.max_image_pixels,
            max_alloc_bytes: config.max_alloc_bytes,
        }
    }
}

/// Decodes JPEG or PNG bytes into an 8-bit RGB raster.
pub fn decode_image(limits: &DecodeLimits, raw_bytes: &[u8]) -> Result<RgbImage, DecodeError> {
    if raw_bytes.is_empty() {
        return Err(DecodeError::EmptyInput);
    }

    if raw_bytes.len() > limits.max_input_bytes {
        return Err(DecodeError::InputTooLarge {
            size: raw_bytes.len(),
            max_size: limits.max_input_bytes,
        });
    }

    let mut reader = ImageReader::new(Cursor::new(raw_bytes))
        .with_guessed_format()
        .map_err(|e| DecodeError::Decode { source: e.into() })?;

    match reader.format() {
        Some(format) if ALLOWED_FORMATS.contains(&format) => {}
        Some(format) => return Err(DecodeError::UnsupportedFormat(format!("{format:?}"))),
        None => return Err(DecodeError::UnsupportedFormat("unknown".into())),
    }

    let mut decode_limits = Limits::default();
    decode_limits.max_image_width = Some(limits.max_dimension);
    decode_limits.max_image_height = Some(limits.max_dimension);
    decode_limits.max_alloc = Some(limits.max_alloc_bytes);
    reader.limits(decode_limits);

    let img = reader.decode()?;
    let (width, height) = (img.width(), img.height());

    if width == 0 || height == 0 {
        return Err(DecodeError::InvalidDimensions { width, height });
    }

    let pixels = width as u64 * height as u64;
    if pixels > limits.max_image_pixels {
        return Err(DecodeError::ImageTooLarge {
            width,
            height,
            pixels,
            max_pixels: limits.max_image_pixels,
        });
    }

    debug!(width, height, "image decoded");
    Ok(img.to_rgb8())
}

pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
    check_encodable("jpeg", img)?;
    let (width, height) = img.dimensions();

    let mut buffer = Vec::with_capacity((width as usize * height as usize * 3) / 10);
    JpegEncoder::new_with_quality(&mut buffer, quality)
        .write_image(img.as_raw(), width, height, ExtendedColorType::Rgb8)
        .map_err(|e| encode_error("jpeg", img, e))?;

    Ok(buffer)
}

/// Lossless output, used when a local job asks for a `.png` destination.
pub fn encode_png(img: &RgbImage) -> Result<Vec<u8>, EncodeError> {
    check_encodable("png", img)?;
    let (width, height) = img.dimensions();

    let mut buffer = Vec::new();
    PngEncoder::new(&mut buffer)
        .write_image(img.as_raw(), width, height, ExtendedColorType::Rgb8)
        .map_err(|e| encode_error("png", img, e))?;

    Ok(buffer)
}

fn check_encodable(format: &'static str, img: &RgbImage) -> Result<(), EncodeError> {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(EncodeError {
            format,
            width,
            height,
            reason: "zero dimension".into(),
        });
    }
    Ok(())
}

fn encode_error(format: &'static str, img: &RgbImage, e: image::ImageError) -> EncodeError {
    EncodeError {
        format,
        width: img.width(),
        height: img.height(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Rgb;

    pub(crate) fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    pub(crate) fn create_test_png(width: u32, height: u32) -> Vec<u8> {
        encode_png(&gradient(width, height)).unwrap()
    }

    #[test]
    fn decode_rejects_empty() {
        let result = decode_image(&DecodeLimits::default(), &[]);
        assert!(matches!(result, Err(DecodeError::EmptyInput)));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_image(&DecodeLimits::default(), &[0xFF, 0xFE, 0x00]).is_err());
    }

    #[test]
    fn decode_rejects_oversized_input() {
        let limits = DecodeLimits {
            max_input_bytes: 100,
            ..Default::default()
        };
        let result = decode_image(&limits, &[0u8; 101]);
        assert!(matches!(result, Err(DecodeError::InputTooLarge { size: 101, .. })));
    }

    #[test]
    fn decode_rejects_gif() {
        let gif = [0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00];
        let result = decode_image(&DecodeLimits::default(), &gif);
        assert!(matches!(result, Err(DecodeError::UnsupportedFormat(_))));
    }

    #[test]
    fn decode_rejects_too_many_pixels() {
        let limits = DecodeLimits {
            max_image_pixels: 100,
            ..Default::default()
        };
        let png = create_test_png(20, 20);
        let result = decode_image(&limits, &png);
        assert!(matches!(result, Err(DecodeError::ImageTooLarge { pixels: 400, .. })));
    }

    #[test]
    fn decode_png_roundtrip_pixels() {
        let png = create_test_png(64, 32);
        let img = decode_image(&DecodeLimits::default(), &png).unwrap();
        assert_eq!(img.dimensions(), (64, 32));
        assert_eq!(img, gradient(64, 32));
    }

    #[test]
    fn encode_jpeg_produces_decodable_output() {
        let img = gradient(40, 30);
        let jpeg = encode_jpeg(&img, 90).unwrap();
        assert_eq!(&jpeg[0..2], &[0xFF, 0xD8]);

        let decoded = decode_image(&DecodeLimits::default(), &jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (40, 30));
    }

    #[test]
    fn encode_rejects_empty_image() {
        assert!(encode_jpeg(&RgbImage::new(0, 0), 90).is_err());
    }

    #[test]
    fn encode_error_names_format() {
        let err = encode_png(&RgbImage::new(3, 0)).unwrap_err();
        assert_eq!(err.format, "png");
        assert!(err.to_string().starts_with("png encoding failed"));
    }
}
