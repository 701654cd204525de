use serde::{Deserialize, Serialize};

/// Axis-aligned pixel box as top-left corner plus extent.
///
/// A `BBox` carries no record of its coordinate space. Detector output is
/// tile-local until it has been passed through [`BBox::translate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl BBox {
    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    /// Builds a box from corner coordinates, truncating toward zero.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_corners(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            x: x1 as i32,
            y: y1 as i32,
            w: (x2 - x1) as i32,
            h: (y2 - y1) as i32,
        }
    }

    /// `(x1, y1, x2, y2)` with `x2 = x + w` and `y2 = y + h`.
    pub fn corners(&self) -> Corners {
        Corners {
            x1: f64::from(self.x),
            y1: f64::from(self.y),
            x2: f64::from(self.x) + f64::from(self.w),
            y2: f64::from(self.y) + f64::from(self.h),
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    /// Moves the box by a tile offset. Extent is unchanged.
    pub fn translate(self, dx: u32, dy: u32) -> Self {
        Self {
            x: self.x.saturating_add(i32::try_from(dx).unwrap_or(i32::MAX)),
            y: self.y.saturating_add(i32::try_from(dy).unwrap_or(i32::MAX)),
            ..self
        }
    }

    /// Intersects the box with an image of the given size.
    ///
    /// Returns `None` when nothing of the box is left inside the image.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<PixelRect> {
        let x = i64::from(self.x.max(0));
        let y = i64::from(self.y.max(0));
        let w = i64::from(self.w).min(i64::from(width) - x);
        let h = i64::from(self.h).min(i64::from(height) - y);

        if w <= 0 || h <= 0 {
            return None;
        }

        Some(PixelRect {
            x: x as u32,
            y: y as u32,
            width: w as u32,
            height: h as u32,
        })
    }

    /// `[x/W, y/H, w/W, h/H]` for an image of `width` x `height`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn normalized(&self, width: u32, height: u32) -> [f32; 4] {
        let w_f = f64::from(width.max(1));
        let h_f = f64::from(height.max(1));
        [
            (f64::from(self.x) / w_f) as f32,
            (f64::from(self.y) / h_f) as f32,
            (f64::from(self.w) / w_f) as f32,
            (f64::from(self.h) / h_f) as f32,
        ]
    }
}

impl From<[i32; 4]> for BBox {
    fn from(v: [i32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Corners {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl Corners {
    /// Area with the inclusive `+1` pixel convention, never zero for a
    /// non-inverted box.
    pub fn inclusive_area(&self) -> f64 {
        (self.x2 - self.x1 + 1.0) * (self.y2 - self.y1 + 1.0)
    }
}

/// In-bounds pixel rectangle, produced by clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}
