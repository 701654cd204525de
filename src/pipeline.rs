use std::time::Instant;

use image::RgbImage;
use metrics::histogram;
use tracing::{debug, info, instrument};

use crate::config::{ConfigError, PipelineConfig};
use crate::geometry::BBox;
use crate::metadata::{build_metadata, DetectionMetadata};
use crate::nms::suppress;
use crate::redact::redact;
use crate::tiling::{slice, whole_image, Tile};
use crate::vision::{detect_tiles, DetectionSet, Detectors};

/// Result of one redaction pass.
#[derive(Debug, Clone)]
#[must_use]
pub struct PipelineOutput {
    pub image: RgbImage,
    /// Every detection, before suppression.
    pub detections: DetectionSet,
    /// Boxes that were blurred.
    pub suppressed: Vec<BBox>,
    pub metadata: Vec<DetectionMetadata>,
}

impl PipelineOutput {
    pub fn detection_count(&self) -> usize {
        self.metadata.len()
    }
}

/// Slice → detect → suppress → redact over injected detectors.
///
/// Holds no per-image state; one instance can serve concurrent callers.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    detectors: Detectors,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, detectors: Detectors) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, detectors })
    }

    pub fn with_defaults(detectors: Detectors) -> Self {
        Self {
            config: PipelineConfig::default(),
            detectors,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// A pipeline sharing the same detectors with another score cut-off.
    pub fn with_confidence_threshold(&self, threshold: f32) -> Result<Self, ConfigError> {
        let config = PipelineConfig {
            confidence_threshold: threshold,
            ..self.config.clone()
        };
        Self::new(config, self.detectors.clone())
    }

    pub fn needs_tiling(&self, width: u32, height: u32) -> bool {
        width > self.config.tiling_threshold || height > self.config.tiling_threshold
    }

    /// Whole image when it fits under the tiling threshold, overlapping tiles
    /// otherwise.
    pub fn tiles_for(&self, image: &RgbImage) -> Result<Vec<Tile>, ConfigError> {
        if self.needs_tiling(image.width(), image.height()) {
            slice(image, self.config.tile_size, self.config.overlap)
        } else {
            Ok(vec![whole_image(image)])
        }
    }

    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    pub fn run(&self, image: &RgbImage) -> Result<PipelineOutput, ConfigError> {
        let start = Instant::now();
        let (width, height) = image.dimensions();

        let tiles = self.tiles_for(image)?;
        debug!(tiles = tiles.len(), "image split");

        let detections = detect_tiles(
            &tiles,
            &self.detectors,
            self.config.confidence_threshold,
            self.config.parallel,
        );
        drop(tiles);

        let suppressed = suppress(&detections.boxes(), self.config.iou_threshold);
        let redacted = redact(image, &suppressed);
        let metadata = build_metadata(&detections, width, height);

        histogram!("pipeline.detections").record(detections.len() as f64);
        histogram!("pipeline.duration_ms").record(start.elapsed().as_secs_f64() * 1000.0);
        info!(
            detections = detections.len(),
            regions = suppressed.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "image redacted"
        );

        Ok(PipelineOutput {
            image: redacted,
            detections,
            suppressed,
            metadata,
        })
    }
}
