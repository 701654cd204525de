//! Overlapping tile decomposition of large rasters.
//!
//! Tiles are emitted row-major: x ascending within a row, rows ascending.
//! Fixtures and the detection order downstream depend on that order.

use image::{imageops, RgbImage};

use crate::config::{tile_step, ConfigError};

/// Tile geometry in parent image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Owned copy of a sub-region, tagged with its top-left offset in the parent.
#[derive(Debug, Clone)]
pub struct Tile {
    pub pixels: RgbImage,
    pub offset_x: u32,
    pub offset_y: u32,
}

impl Tile {
    pub fn rect(&self) -> TileRect {
        TileRect {
            x: self.offset_x,
            y: self.offset_y,
            width: self.pixels.width(),
            height: self.pixels.height(),
        }
    }
}

/// Tile rectangles for a `width` x `height` image, without touching pixels.
pub fn plan_tiles(
    width: u32,
    height: u32,
    tile_size: u32,
    overlap: f32,
) -> Result<Vec<TileRect>, ConfigError> {
    let step = tile_step(tile_size, overlap)?;

    let mut rects = Vec::new();
    for y in (0..height).step_by(step as usize) {
        for x in (0..width).step_by(step as usize) {
            rects.push(TileRect {
                x,
                y,
                width: tile_size.min(width - x),
                height: tile_size.min(height - y),
            });
        }
    }
    Ok(rects)
}

/// Splits `image` into overlapping tiles. Edge tiles are not padded.
pub fn slice(image: &RgbImage, tile_size: u32, overlap: f32) -> Result<Vec<Tile>, ConfigError> {
    let rects = plan_tiles(image.width(), image.height(), tile_size, overlap)?;

    Ok(rects
        .into_iter()
        .map(|r| Tile {
            pixels: imageops::crop_imm(image, r.x, r.y, r.width, r.height).to_image(),
            offset_x: r.x,
            offset_y: r.y,
        })
        .collect())
}

/// The identity decomposition: one tile covering the whole image.
pub fn whole_image(image: &RgbImage) -> Tile {
    Tile {
        pixels: image.clone(),
        offset_x: 0,
        offset_y: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use proptest::prelude::*;

    fn offsets(rects: &[TileRect]) -> Vec<(u32, u32)> {
        rects.iter().map(|r| (r.x, r.y)).collect()
    }

    #[test]
    fn square_image_no_overlap_gives_four_tiles() {
        let rects = plan_tiles(2048, 2048, 1024, 0.0).unwrap();
        assert_eq!(
            offsets(&rects),
            vec![(0, 0), (1024, 0), (0, 1024), (1024, 1024)]
        );
        assert!(rects.iter().all(|r| r.width == 1024 && r.height == 1024));
    }

    #[test]
    fn default_overlap_walks_in_steps_of_819() {
        let rects = plan_tiles(3000, 1500, 1024, 0.2).unwrap();
        let xs: Vec<u32> = rects.iter().filter(|r| r.y == 0).map(|r| r.x).collect();
        let ys: Vec<u32> = rects.iter().filter(|r| r.x == 0).map(|r| r.y).collect();
        assert_eq!(xs, vec![0, 819, 1638, 2457]);
        assert_eq!(ys, vec![0, 819]);
        assert_eq!(rects.len(), 8);
    }

    #[test]
    fn edge_tiles_are_truncated() {
        let rects = plan_tiles(3000, 1500, 1024, 0.2).unwrap();
        let last = rects.last().unwrap();
        assert_eq!((last.x, last.y), (2457, 819));
        assert_eq!((last.width, last.height), (543, 681));
    }

    #[test]
    fn small_image_with_large_tile_is_single_tile() {
        let rects = plan_tiles(640, 480, 1024, 0.2).unwrap();
        assert_eq!(rects, vec![TileRect { x: 0, y: 0, width: 640, height: 480 }]);
    }

    #[test]
    fn zero_sized_image_has_no_tiles() {
        assert!(plan_tiles(0, 100, 1024, 0.2).unwrap().is_empty());
    }

    #[test]
    fn invalid_overlap_fails() {
        assert_eq!(
            plan_tiles(100, 100, 1024, 1.0),
            Err(ConfigError::InvalidOverlap(1.0))
        );
    }

    #[test]
    fn slice_copies_pixels_at_offset() {
        let image = RgbImage::from_fn(30, 20, |x, y| Rgb([x as u8, y as u8, 7]));
        let tiles = slice(&image, 16, 0.5).unwrap();

        assert_eq!(tiles.len(), 12);
        for tile in &tiles {
            let (w, h) = tile.pixels.dimensions();
            for ty in 0..h {
                for tx in 0..w {
                    assert_eq!(
                        tile.pixels.get_pixel(tx, ty),
                        image.get_pixel(tile.offset_x + tx, tile.offset_y + ty)
                    );
                }
            }
        }
    }

    #[test]
    fn whole_image_tile_is_identity() {
        let image = RgbImage::from_pixel(50, 40, Rgb([1, 2, 3]));
        let tile = whole_image(&image);
        assert_eq!((tile.offset_x, tile.offset_y), (0, 0));
        assert_eq!(tile.pixels, image);
        assert_eq!(tile.rect(), TileRect { x: 0, y: 0, width: 50, height: 40 });
    }

    proptest! {
        #[test]
        fn tiles_stay_in_bounds_and_cover_corners(
            width in 1u32..400,
            height in 1u32..400,
            tile_size in 8u32..128,
            overlap in 0.0f32..0.8,
        ) {
            let rects = plan_tiles(width, height, tile_size, overlap).unwrap();
            for r in &rects {
                prop_assert!(r.width > 0 && r.height > 0);
                prop_assert!(r.x + r.width <= width);
                prop_assert!(r.y + r.height <= height);
            }
            // corners of the image are always covered
            for (px, py) in [(0, 0), (width - 1, 0), (0, height - 1), (width - 1, height - 1)] {
                let covered = rects.iter().any(|r| {
                    px >= r.x && px < r.x + r.width && py >= r.y && py < r.y + r.height
                });
                prop_assert!(covered);
            }
        }
    }
}
