#![allow(dead_code)]

use std::sync::Arc;

use anonymizer::{BBox, Detector, DetectorError, Detectors, RawDetection};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, Rgb, RgbImage};

pub const FACE_MARKER: Rgb<u8> = Rgb([255, 0, 0]);
pub const PLATE_MARKER: Rgb<u8> = Rgb([0, 0, 255]);

const MARKER_BORDER: u32 = 2;

/// Gray checkerboard with marker outlines `[x, y, w, h]` painted on top. The
/// outline interior keeps the checkerboard so blurring it is visible.
pub fn street_scene(width: u32, height: u32, markers: &[(Rgb<u8>, [u32; 4])]) -> RgbImage {
    let mut img = RgbImage::from_fn(width, height, |x, y| {
        if ((x / 4) + (y / 4)) % 2 == 0 {
            Rgb([40, 40, 40])
        } else {
            Rgb([200, 200, 200])
        }
    });
    for (color, [mx, my, mw, mh]) in markers {
        for y in *my..(my + mh).min(height) {
            for x in *mx..(mx + mw).min(width) {
                let on_border = x < mx + MARKER_BORDER
                    || x + MARKER_BORDER >= mx + mw
                    || y < my + MARKER_BORDER
                    || y + MARKER_BORDER >= my + mh;
                if on_border {
                    img.put_pixel(x, y, *color);
                }
            }
        }
    }
    img
}

pub fn png_bytes(img: &RgbImage) -> Vec<u8> {
    let mut buffer = Vec::new();
    PngEncoder::new(&mut buffer)
        .write_image(img.as_raw(), img.width(), img.height(), ExtendedColorType::Rgb8)
        .expect("png encoding");
    buffer
}

pub fn jpeg_bytes(img: &RgbImage) -> Vec<u8> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, 95)
        .write_image(img.as_raw(), img.width(), img.height(), ExtendedColorType::Rgb8)
        .expect("jpeg encoding");
    buffer
}

/// Reports the bounding box of all pixels close to one marker colour.
pub struct MarkerDetector {
    pub color: Rgb<u8>,
}

impl MarkerDetector {
    fn matches(&self, p: &Rgb<u8>) -> bool {
        p.0.iter()
            .zip(self.color.0)
            .all(|(a, b)| (*a as i32 - b as i32).abs() < 60)
    }
}

impl Detector for MarkerDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<RawDetection>, DetectorError> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (x, y, p) in image.enumerate_pixels() {
            if self.matches(p) {
                bounds = Some(match bounds {
                    None => (x, y, x, y),
                    Some((x1, y1, x2, y2)) => (x1.min(x), y1.min(y), x2.max(x), y2.max(y)),
                });
            }
        }

        Ok(bounds
            .map(|(x1, y1, x2, y2)| {
                RawDetection::from(BBox::new(
                    x1 as i32,
                    y1 as i32,
                    (x2 - x1 + 1) as i32,
                    (y2 - y1 + 1) as i32,
                ))
            })
            .into_iter()
            .collect())
    }
}

pub struct FailingDetector;

impl Detector for FailingDetector {
    fn detect(&self, _image: &RgbImage) -> Result<Vec<RawDetection>, DetectorError> {
        Err(DetectorError::Inference("model crashed".into()))
    }
}

pub fn marker_detectors() -> Detectors {
    Detectors::new(
        Arc::new(MarkerDetector { color: FACE_MARKER }),
        Arc::new(MarkerDetector { color: PLATE_MARKER }),
    )
}
