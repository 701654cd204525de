use std::fmt;
use std::sync::Arc;

use image::RgbImage;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::geometry::BBox;
use crate::tiling::Tile;

/// Score given to detections whose detector reports none.
pub const PLACEHOLDER_CONFIDENCE: f32 = 1.0;

// ============================================================================
// Error Types
// ============================================================================

#[derive(thiserror::Error, Debug)]
pub enum DetectorError {
    #[error("inference failed: {0}")]
    Inference(String),

    #[error("detector cannot handle a {width}x{height} input")]
    UnsupportedInput { width: u32, height: u32 },

    #[error("detector model not loaded")]
    NotLoaded,
}

// ============================================================================
// Detection Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Face,
    Plate,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Face, Category::Plate];

    pub fn label(self) -> &'static str {
        match self {
            Category::Face => "face",
            Category::Plate => "plate",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A box as reported by a detector, in the coordinates of the image it saw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub bbox: BBox,
    pub score: Option<f32>,
}

impl From<BBox> for RawDetection {
    fn from(bbox: BBox) -> Self {
        Self { bbox, score: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[must_use]
pub struct Detection {
    /// Global pixel box, unclamped.
    pub bbox: BBox,
    pub category: Category,
    pub confidence: f32,
}

/// All detections of one image: faces in tile order, then plates in tile
/// order.
#[derive(Debug, Clone, Default, PartialEq)]
#[must_use]
pub struct DetectionSet {
    detections: Vec<Detection>,
}

impl DetectionSet {
    pub fn as_slice(&self) -> &[Detection] {
        &self.detections
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
        self.detections.iter()
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Boxes of every detection, labels dropped.
    pub fn boxes(&self) -> Vec<BBox> {
        self.detections.iter().map(|d| d.bbox).collect()
    }

    pub fn count(&self, category: Category) -> usize {
        self.detections
            .iter()
            .filter(|d| d.category == category)
            .count()
    }
}

impl From<Vec<Detection>> for DetectionSet {
    fn from(detections: Vec<Detection>) -> Self {
        Self { detections }
    }
}

impl<'a> IntoIterator for &'a DetectionSet {
    type Item = &'a Detection;
    type IntoIter = std::slice::Iter<'a, Detection>;

    fn into_iter(self) -> Self::IntoIter {
        self.detections.iter()
    }
}

// ============================================================================
// Detector Capability
// ============================================================================

/// An object detector for one category.
///
/// # Thread Safety
///
/// Implementations are shared across tiles and across pipeline invocations,
/// possibly from several threads at once. A detector that is not reentrant
/// must serialize internally (e.g. a `Mutex` around its session).
pub trait Detector: Send + Sync {
    /// Returns boxes in the coordinate space of `image`. Must not retain or
    /// alter the pixels.
    fn detect(&self, image: &RgbImage) -> Result<Vec<RawDetection>, DetectorError>;
}

impl<F> Detector for F
where
    F: Fn(&RgbImage) -> Result<Vec<RawDetection>, DetectorError> + Send + Sync,
{
    fn detect(&self, image: &RgbImage) -> Result<Vec<RawDetection>, DetectorError> {
        self(image)
    }
}

/// One loaded detector per category, built once by the caller and shared.
#[derive(Clone)]
pub struct Detectors {
    pub face: Arc<dyn Detector>,
    pub plate: Arc<dyn Detector>,
}

impl Detectors {
    pub fn new(face: Arc<dyn Detector>, plate: Arc<dyn Detector>) -> Self {
        Self { face, plate }
    }

    pub fn get(&self, category: Category) -> &dyn Detector {
        match category {
            Category::Face => self.face.as_ref(),
            Category::Plate => self.plate.as_ref(),
        }
    }
}

impl fmt::Debug for Detectors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detectors").finish_non_exhaustive()
    }
}

// ============================================================================
// Aggregation
// ============================================================================

/// Per-tile results, one list per category in [`Category::ALL`] order.
type TileDetections = [Vec<Detection>; 2];

/// Runs every detector on every tile and merges the results into global
/// coordinates.
///
/// A detector failing on a tile yields no detections for that tile and
/// category; the remaining tiles are unaffected. Detections scored below
/// `confidence_threshold` and degenerate boxes are dropped.
pub fn detect_tiles(
    tiles: &[Tile],
    detectors: &Detectors,
    confidence_threshold: f32,
    parallel: bool,
) -> DetectionSet {
    let per_tile = run_tiles(tiles, detectors, confidence_threshold, parallel);

    let mut detections = Vec::new();
    for slot in 0..Category::ALL.len() {
        for tile_result in &per_tile {
            detections.extend_from_slice(&tile_result[slot]);
        }
    }

    debug!(
        tiles = tiles.len(),
        detections = detections.len(),
        "tile detection merged"
    );
    DetectionSet::from(detections)
}

#[cfg(feature = "parallel")]
fn run_tiles(
    tiles: &[Tile],
    detectors: &Detectors,
    confidence_threshold: f32,
    parallel: bool,
) -> Vec<TileDetections> {
    use rayon::prelude::*;

    if parallel && tiles.len() > 1 {
        // collect() keeps tile order
        tiles
            .par_iter()
            .map(|tile| detect_tile(tile, detectors, confidence_threshold))
            .collect()
    } else {
        tiles
            .iter()
            .map(|tile| detect_tile(tile, detectors, confidence_threshold))
            .collect()
    }
}

#[cfg(not(feature = "parallel"))]
fn run_tiles(
    tiles: &[Tile],
    detectors: &Detectors,
    confidence_threshold: f32,
    _parallel: bool,
) -> Vec<TileDetections> {
    tiles
        .iter()
        .map(|tile| detect_tile(tile, detectors, confidence_threshold))
        .collect()
}

fn detect_tile(tile: &Tile, detectors: &Detectors, confidence_threshold: f32) -> TileDetections {
    Category::ALL.map(|category| {
        match detectors.get(category).detect(&tile.pixels) {
            Ok(raw) => remap(&raw, tile, category, confidence_threshold),
            Err(e) => {
                counter!("detector.failures", "category" => category.label()).increment(1);
                warn!(
                    tile_x = tile.offset_x,
                    tile_y = tile.offset_y,
                    %category,
                    error = %e,
                    "detector failed on tile, continuing without it"
                );
                Vec::new()
            }
        }
    })
}

/// Moves tile-local detections into parent coordinates.
fn remap(
    raw: &[RawDetection],
    tile: &Tile,
    category: Category,
    confidence_threshold: f32,
) -> Vec<Detection> {
    raw.iter()
        .filter(|r| !r.bbox.is_degenerate())
        .map(|r| Detection {
            bbox: r.bbox.translate(tile.offset_x, tile.offset_y),
            category,
            confidence: r.score.unwrap_or(PLACEHOLDER_CONFIDENCE),
        })
        .filter(|d| d.confidence.is_finite() && d.confidence >= confidence_threshold)
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
