//! Tiled privacy redaction for high-resolution imagery.
//!
//! Large images are sliced into overlapping tiles, every tile is run through
//! injected face and plate detectors, tile-local boxes are mapped back to
//! image coordinates, overlapping boxes are suppressed, and the surviving
//! regions are Gaussian-blurred. [`job::JobProcessor`] wraps the pipeline with
//! object storage, JPEG encoding and bounded concurrency.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod config;
pub mod geometry;
pub mod image_processing;
pub mod job;
pub mod metadata;
pub mod nms;
pub mod pipeline;
pub mod redact;
pub mod storage;
pub mod tiling;
pub mod vision;

pub use config::{ConfigError, PipelineConfig, ServiceConfig};
pub use geometry::{BBox, PixelRect};
pub use image_processing::{DecodeError, DecodeLimits, EncodeError};
pub use job::{AnonymizeRequest, AnonymizeResponse, JobError, JobProcessor, LocalJobResult};
pub use metadata::{DetectionMetadata, RunStatus, SummaryRow};
pub use pipeline::{Pipeline, PipelineOutput};
pub use storage::{FsStore, InMemoryStore, ObjectStore, StorageError};
pub use tiling::Tile;
pub use vision::{Category, Detection, DetectionSet, Detector, DetectorError, Detectors, RawDetection};
