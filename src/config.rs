use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_TILING_THRESHOLD: u32 = 2000;
pub const DEFAULT_TILE_SIZE: u32 = 1024;
pub const DEFAULT_OVERLAP: f32 = 0.2;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.5;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_OUTPUT_PREFIX: &str = "processed/";

const ENV_PREFIX: &str = "ANONYMIZER_";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid overlap fraction: {0}, must be in [0.0, 1.0)")]
    InvalidOverlap(f32),

    #[error("tile size must be positive")]
    ZeroTileSize,

    #[error("tile step is zero for tile_size={tile_size}, overlap={overlap}")]
    ZeroStep { tile_size: u32, overlap: f32 },

    #[error("invalid {name}: {value}, must be in [0.0, 1.0]")]
    InvalidThreshold { name: &'static str, value: f32 },

    #[error("invalid jpeg quality: {0}, must be in [1, 100]")]
    InvalidJpegQuality(u8),

    #[error("max_concurrent_jobs must be positive")]
    ZeroConcurrency,

    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidEnv {
        var: String,
        value: String,
        reason: String,
    },
}

/// Tunables of the tiling, suppression and redaction pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Images with both sides at or below this are processed as one tile.
    pub tiling_threshold: u32,
    pub tile_size: u32,
    /// Fraction of `tile_size` shared by neighbouring tiles.
    pub overlap: f32,
    pub iou_threshold: f32,
    /// Detections scored below this are dropped.
    pub confidence_threshold: f32,
    /// Run per-tile detection on the rayon pool.
    pub parallel: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tiling_threshold: DEFAULT_TILING_THRESHOLD,
            tile_size: DEFAULT_TILE_SIZE,
            overlap: DEFAULT_OVERLAP,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            parallel: cfg!(feature = "parallel"),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        tile_step(self.tile_size, self.overlap)?;
        validate_unit("iou_threshold", self.iou_threshold)?;
        validate_unit("confidence_threshold", self.confidence_threshold)?;
        Ok(())
    }
}

/// `floor(tile_size * (1 - overlap))`, rejecting configurations that would
/// never advance.
pub fn tile_step(tile_size: u32, overlap: f32) -> Result<u32, ConfigError> {
    if !overlap.is_finite() || !(0.0..1.0).contains(&overlap) {
        return Err(ConfigError::InvalidOverlap(overlap));
    }
    if tile_size == 0 {
        return Err(ConfigError::ZeroTileSize);
    }

    let step = (tile_size as f64 * (1.0 - overlap as f64)).floor() as u32;
    if step == 0 {
        return Err(ConfigError::ZeroStep { tile_size, overlap });
    }
    Ok(step)
}

fn validate_unit(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::InvalidThreshold { name, value });
    }
    Ok(())
}

/// Limits and defaults of the job service around the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub default_bucket: String,
    pub output_prefix: String,
    pub max_input_bytes: usize,
    pub max_dimension: u32,
    pub max_image_pixels: u64,
    pub max_alloc_bytes: u64,
    pub jpeg_quality: u8,
    pub max_concurrent_jobs: usize,
    pub pipeline: PipelineConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_bucket: "drone-raw-data".into(),
            output_prefix: DEFAULT_OUTPUT_PREFIX.into(),
            max_input_bytes: 50 * 1024 * 1024,
            max_dimension: 15_000,
            max_image_pixels: 150_000_000,
            max_alloc_bytes: 1024 * 1024 * 1024,
            jpeg_quality: 90,
            max_concurrent_jobs: 4,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(ConfigError::InvalidJpegQuality(self.jpeg_quality));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        self.pipeline.validate()
    }

    /// Defaults overridden by `ANONYMIZER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`ServiceConfig::from_env`] with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |suffix: &str| {
            let var = format!("{ENV_PREFIX}{suffix}");
            lookup(&var).map(|value| (var, value))
        };

        if let Some((_, v)) = get("BUCKET") {
            config.default_bucket = v;
        }
        if let Some((_, v)) = get("OUTPUT_PREFIX") {
            config.output_prefix = v;
        }
        if let Some((var, v)) = get("MAX_INPUT_BYTES") {
            config.max_input_bytes = parse_env(&var, &v)?;
        }
        if let Some((var, v)) = get("MAX_DIMENSION") {
            config.max_dimension = parse_env(&var, &v)?;
        }
        if let Some((var, v)) = get("JPEG_QUALITY") {
            config.jpeg_quality = parse_env(&var, &v)?;
        }
        if let Some((var, v)) = get("MAX_CONCURRENT_JOBS") {
            config.max_concurrent_jobs = parse_env(&var, &v)?;
        }
        if let Some((var, v)) = get("TILING_THRESHOLD") {
            config.pipeline.tiling_threshold = parse_env(&var, &v)?;
        }
        if let Some((var, v)) = get("TILE_SIZE") {
            config.pipeline.tile_size = parse_env(&var, &v)?;
        }
        if let Some((var, v)) = get("OVERLAP") {
            config.pipeline.overlap = parse_env(&var, &v)?;
        }
        if let Some((var, v)) = get("IOU_THRESHOLD") {
            config.pipeline.iou_threshold = parse_env(&var, &v)?;
        }
        if let Some((var, v)) = get("CONFIDENCE_THRESHOLD") {
            config.pipeline.confidence_threshold = parse_env(&var, &v)?;
        }
        if let Some((var, v)) = get("PARALLEL") {
            config.pipeline.parallel = parse_env(&var, &v)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_env<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}
