use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{
    ConfigError, ServiceConfig, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_OUTPUT_PREFIX,
};
use crate::image_processing::{
    decode_image, encode_jpeg, encode_png, DecodeError, DecodeLimits, EncodeError,
};
use crate::metadata::{write_summary_csv, DetectionMetadata, RunStatus, SummaryRow};
use crate::pipeline::Pipeline;
use crate::storage::{ObjectStore, StorageError};
use crate::vision::Detectors;

const OUTPUT_SUFFIX: &str = "_anonymized.jpg";
const LOCAL_OUTPUT_PREFIX: &str = "processed_";
const SUMMARY_FILE: &str = "summary.csv";
const METADATA_SUFFIX: &str = ".json";
const BATCH_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("service overloaded, try again later")]
    Overloaded,

    #[error("processing task failed: {0}")]
    Join(String),

    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl JobError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        JobError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ============================================================================
// Request / Response
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnonymizeRequest {
    pub s3_key: String,
    /// Falls back to [`ServiceConfig::default_bucket`].
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
}

fn default_output_prefix() -> String {
    DEFAULT_OUTPUT_PREFIX.to_string()
}

fn default_confidence_threshold() -> f32 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

impl AnonymizeRequest {
    pub fn new(bucket: impl Into<String>, s3_key: impl Into<String>) -> Self {
        Self {
            s3_key: s3_key.into(),
            bucket: Some(bucket.into()),
            overwrite: false,
            output_prefix: default_output_prefix(),
            confidence_threshold: default_confidence_threshold(),
        }
    }

    pub fn output_key(&self) -> String {
        output_key(&self.s3_key, self.overwrite, &self.output_prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnonymizeResponse {
    pub job_id: Uuid,
    pub status: RunStatus,
    pub processed_s3_key: String,
    pub objects_detected: usize,
}

/// Result of a job on the local filesystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalJobResult {
    pub job_id: Uuid,
    pub status: RunStatus,
    pub output_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub objects_detected: usize,
    pub metadata: Vec<DetectionMetadata>,
}

/// Destination key of a redacted object.
///
/// `key` itself when overwriting, otherwise `prefix` + stem of the last path
/// segment + `_anonymized.jpg`.
pub fn output_key(key: &str, overwrite: bool, prefix: &str) -> String {
    if overwrite {
        return key.to_string();
    }
    let file_name = key.rsplit('/').next().unwrap_or(key);
    let stem = match file_name.rfind('.') {
        Some(dot) if dot > 0 => &file_name[..dot],
        _ => file_name,
    };
    format!("{prefix}{stem}{OUTPUT_SUFFIX}")
}

// ============================================================================
// Processing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Jpeg,
    Png,
}

impl OutputFormat {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("png") => OutputFormat::Png,
            _ => OutputFormat::Jpeg,
        }
    }
}

struct Redacted {
    encoded: Vec<u8>,
    width: u32,
    height: u32,
    metadata: Vec<DetectionMetadata>,
}

fn redact_encoded(
    limits: &DecodeLimits,
    pipeline: &Pipeline,
    jpeg_quality: u8,
    format: OutputFormat,
    raw_bytes: &[u8],
) -> Result<Redacted, JobError> {
    let image = decode_image(limits, raw_bytes)?;
    let (width, height) = image.dimensions();
    let output = pipeline.run(&image)?;
    drop(image);

    let encoded = match format {
        OutputFormat::Jpeg => encode_jpeg(&output.image, jpeg_quality)?,
        OutputFormat::Png => encode_png(&output.image)?,
    };

    Ok(Redacted {
        encoded,
        width,
        height,
        metadata: output.metadata,
    })
}

/// Runs redaction jobs against an object store or local files.
///
/// At most `max_concurrent_jobs` run at once; further calls are rejected with
/// [`JobError::Overloaded`] instead of queueing.
pub struct JobProcessor {
    config: ServiceConfig,
    limits: DecodeLimits,
    pipeline: Pipeline,
    store: Arc<dyn ObjectStore>,
    semaphore: Arc<Semaphore>,
}

impl std::fmt::Debug for JobProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobProcessor")
            .field("config", &self.config)
            .field("limits", &self.limits)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl JobProcessor {
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn ObjectStore>,
        detectors: Detectors,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let pipeline = Pipeline::new(config.pipeline.clone(), detectors)?;
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        Ok(Self {
            limits: DecodeLimits::from(&config),
            config,
            pipeline,
            store,
            semaphore,
        })
    }

    pub fn with_defaults(store: Arc<dyn ObjectStore>, detectors: Detectors) -> Self {
        let config = ServiceConfig::default();
        Self {
            limits: DecodeLimits::from(&config),
            pipeline: Pipeline::with_defaults(detectors),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            config,
            store,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Fetch, redact, encode as JPEG and store under [`output_key`].
    #[instrument(skip(self, request), fields(key = %request.s3_key, overwrite = request.overwrite))]
    pub async fn process_job(&self, request: &AnonymizeRequest) -> Result<AnonymizeResponse, JobError> {
        let start = Instant::now();
        counter!("job.requests").increment(1);

        let _permit = self.semaphore.try_acquire().map_err(|_| {
            counter!("job.rejected").increment(1);
            JobError::Overloaded
        })?;

        let job_id = Uuid::new_v4();
        let result = self.run_job(job_id, request).await;

        histogram!("job.duration_ms").record(start.elapsed().as_millis() as f64);

        match &result {
            Ok(response) => {
                histogram!("job.objects_detected").record(response.objects_detected as f64);
                info!(
                    %job_id,
                    output_key = %response.processed_s3_key,
                    objects = response.objects_detected,
                    "job completed"
                );
            }
            Err(e) => {
                counter!("job.errors").increment(1);
                warn!(%job_id, error = %e, "job failed");
            }
        }

        result
    }

    async fn run_job(&self, job_id: Uuid, request: &AnonymizeRequest) -> Result<AnonymizeResponse, JobError> {
        let bucket = request
            .bucket
            .as_deref()
            .unwrap_or(&self.config.default_bucket);
        info!(%job_id, bucket, "job started");

        let pipeline = self.pipeline.with_confidence_threshold(request.confidence_threshold)?;
        let processed_key = request.output_key();

        let raw = self.store.fetch(bucket, &request.s3_key).await?;
        debug!(%job_id, size = raw.len(), "source fetched");

        let redacted = self.redact_blocking(raw, pipeline, OutputFormat::Jpeg).await?;
        histogram!("job.output_size").record(redacted.encoded.len() as f64);

        self.store
            .store(Bytes::from(redacted.encoded), bucket, &processed_key)
            .await?;

        Ok(AnonymizeResponse {
            job_id,
            status: RunStatus::Success,
            processed_s3_key: processed_key,
            objects_detected: redacted.metadata.len(),
        })
    }

    async fn redact_blocking(
        &self,
        raw: Bytes,
        pipeline: Pipeline,
        format: OutputFormat,
    ) -> Result<Redacted, JobError> {
        let limits = self.limits.clone();
        let quality = self.config.jpeg_quality;

        tokio::task::spawn_blocking(move || redact_encoded(&limits, &pipeline, quality, format, &raw))
            .await
            .map_err(|e| JobError::Join(e.to_string()))?
    }

    /// Redacts one image file into `output`. The output is PNG when `output`
    /// ends in `.png`, JPEG otherwise.
    #[instrument(skip(self, input), fields(input = %input.display()))]
    pub async fn process_local_file(&self, input: &Path, output: &Path) -> Result<LocalJobResult, JobError> {
        counter!("job.local.requests").increment(1);

        let _permit = self.semaphore.try_acquire().map_err(|_| {
            counter!("job.local.rejected").increment(1);
            JobError::Overloaded
        })?;

        self.redact_local_file(input, output).await
    }

    /// Local job body; the caller holds a permit.
    async fn redact_local_file(&self, input: &Path, output: &Path) -> Result<LocalJobResult, JobError> {
        let job_id = Uuid::new_v4();
        info!(%job_id, input = %input.display(), "local job started");

        let raw = tokio::fs::read(input)
            .await
            .map_err(|e| JobError::io(input, e))?;
        let redacted = self
            .redact_blocking(Bytes::from(raw), self.pipeline.clone(), OutputFormat::for_path(output))
            .await?;

        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| JobError::io(parent, e))?;
        }
        tokio::fs::write(output, &redacted.encoded)
            .await
            .map_err(|e| JobError::io(output, e))?;

        Ok(LocalJobResult {
            job_id,
            status: RunStatus::Success,
            output_path: output.to_path_buf(),
            width: redacted.width,
            height: redacted.height,
            objects_detected: redacted.metadata.len(),
            metadata: redacted.metadata,
        })
    }

    /// Redacts every image of `input_dir` into `output_dir`.
    ///
    /// Writes `processed_<name>`, `<name>.json` and `summary.csv`. A file that
    /// fails becomes a `failed` summary row; only directory-level I/O aborts
    /// the batch. The batch holds one job permit throughout and waits for it
    /// when every permit is taken.
    #[instrument(skip(self, input_dir), fields(input_dir = %input_dir.display()))]
    pub async fn run_local_batch(&self, input_dir: &Path, output_dir: &Path) -> Result<Vec<SummaryRow>, JobError> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| JobError::io(output_dir, e))?;

        let inputs = list_images(input_dir).await?;

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| JobError::Overloaded)?;
        info!(files = inputs.len(), "batch started");

        let mut rows = Vec::with_capacity(inputs.len());
        for input in inputs {
            let start = Instant::now();
            let name = input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let row = match self.process_batch_entry(&input, &name, output_dir).await {
                Ok(result) => SummaryRow {
                    filename: name,
                    width: result.width,
                    height: result.height,
                    objects_detected: result.objects_detected,
                    processing_time_seconds: start.elapsed().as_secs_f64(),
                    status: RunStatus::Success,
                    error: None,
                },
                Err(e) => {
                    counter!("job.local.errors").increment(1);
                    warn!(file = %name, error = %e, "batch entry failed");
                    SummaryRow::failed(name, start.elapsed().as_secs_f64(), e.to_string())
                }
            };
            rows.push(row);
        }

        let mut csv = Vec::new();
        let summary_path = output_dir.join(SUMMARY_FILE);
        write_summary_csv(&mut csv, &rows).map_err(|e| JobError::io(&summary_path, e))?;
        tokio::fs::write(&summary_path, csv)
            .await
            .map_err(|e| JobError::io(&summary_path, e))?;

        let failed = rows.iter().filter(|r| r.status == RunStatus::Failed).count();
        info!(files = rows.len(), failed, "batch finished");
        Ok(rows)
    }

    async fn process_batch_entry(
        &self,
        input: &Path,
        name: &str,
        output_dir: &Path,
    ) -> Result<LocalJobResult, JobError> {
        let output = output_dir.join(format!("{LOCAL_OUTPUT_PREFIX}{name}"));
        let result = self.redact_local_file(input, &output).await?;

        // full name: `a.jpg` and `a.png` must not share a metadata file
        let json_path = output_dir.join(format!("{name}{METADATA_SUFFIX}"));
        let json = serde_json::to_vec_pretty(&result.metadata)?;
        tokio::fs::write(&json_path, json)
            .await
            .map_err(|e| JobError::io(&json_path, e))?;

        Ok(result)
    }
}

/// Image files of `dir` (by extension), sorted by file name.
async fn list_images(dir: &Path) -> Result<Vec<PathBuf>, JobError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| JobError::io(dir, e))?;

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| JobError::io(dir, e))? {
        let path = entry.path();
        let is_file = entry
            .file_type()
            .await
            .map_err(|e| JobError::io(&path, e))?
            .is_file();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| BATCH_EXTENSIONS.iter().any(|a| ext.eq_ignore_ascii_case(a)));
        if is_file && is_image {
            files.push(path);
        }
    }

    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;
    use crate::image_processing::tests::create_test_png;
    use crate::storage::InMemoryStore;
    use crate::vision::{DetectorError, RawDetection};
    use assert_matches::assert_matches;
    use image::RgbImage;

    fn no_detections(_: &RgbImage) -> Result<Vec<RawDetection>, DetectorError> {
        Ok(Vec::new())
    }

    fn one_face(_: &RgbImage) -> Result<Vec<RawDetection>, DetectorError> {
        Ok(vec![RawDetection::from(BBox::new(2, 2, 8, 8))])
    }

    fn processor(store: Arc<InMemoryStore>) -> JobProcessor {
        JobProcessor::with_defaults(store, Detectors::new(Arc::new(one_face), Arc::new(no_detections)))
    }

    #[test]
    fn output_key_derivation() {
        assert_eq!(
            output_key("raw/2024/frame_001.jpg", false, "processed/"),
            "processed/frame_001_anonymized.jpg"
        );
        assert_eq!(output_key("frame.png", false, "out/"), "out/frame_anonymized.jpg");
        assert_eq!(output_key("a/b.c.jpeg", false, ""), "b.c_anonymized.jpg");
        assert_eq!(output_key("dir/noext", false, "p/"), "p/noext_anonymized.jpg");
        assert_eq!(output_key(".hidden", false, "p/"), "p/.hidden_anonymized.jpg");
        assert_eq!(output_key("raw/frame.jpg", true, "processed/"), "raw/frame.jpg");
    }

    #[test]
    fn request_defaults_from_json() {
        let request: AnonymizeRequest =
            serde_json::from_str(r#"{"s3_key": "raw/a.jpg", "bucket": "b"}"#).unwrap();
        assert_eq!(request, AnonymizeRequest::new("b", "raw/a.jpg"));
        assert!(!request.overwrite);
        assert_eq!(request.output_prefix, "processed/");
        assert!((request.confidence_threshold - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn response_json_shape() {
        let response = AnonymizeResponse {
            job_id: Uuid::nil(),
            status: RunStatus::Success,
            processed_s3_key: "processed/a_anonymized.jpg".into(),
            objects_detected: 3,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["objects_detected"], 3);
        assert_eq!(json["job_id"], "00000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn output_format_follows_extension() {
        assert_eq!(OutputFormat::for_path(Path::new("a/processed_x.PNG")), OutputFormat::Png);
        assert_eq!(OutputFormat::for_path(Path::new("x.jpg")), OutputFormat::Jpeg);
        assert_eq!(OutputFormat::for_path(Path::new("x")), OutputFormat::Jpeg);
    }

    #[tokio::test]
    async fn job_stores_under_derived_key() {
        let store = Arc::new(InMemoryStore::new());
        store.insert("bucket", "raw/frame.png", create_test_png(32, 32)).await;
        let processor = processor(store.clone());

        let response = processor
            .process_job(&AnonymizeRequest::new("bucket", "raw/frame.png"))
            .await
            .unwrap();

        assert_eq!(response.processed_s3_key, "processed/frame_anonymized.jpg");
        assert_eq!(response.objects_detected, 1);
        assert_eq!(response.status, RunStatus::Success);
        assert!(store.contains("bucket", "processed/frame_anonymized.jpg").await);
    }

    #[tokio::test]
    async fn missing_bucket_uses_default() {
        let store = Arc::new(InMemoryStore::new());
        store.insert("drone-raw-data", "a.png", create_test_png(8, 8)).await;
        let processor = processor(store.clone());

        let request: AnonymizeRequest = serde_json::from_str(r#"{"s3_key": "a.png"}"#).unwrap();
        processor.process_job(&request).await.unwrap();

        assert!(store.contains("drone-raw-data", "processed/a_anonymized.jpg").await);
    }

    #[tokio::test]
    async fn rejects_when_overloaded() {
        let store = Arc::new(InMemoryStore::new());
        store.insert("bucket", "a.png", create_test_png(8, 8)).await;
        let processor = processor(store);

        let _permits: Vec<_> = (0..processor.config.max_concurrent_jobs)
            .map(|_| processor.semaphore.try_acquire().unwrap())
            .collect();

        let result = processor.process_job(&AnonymizeRequest::new("bucket", "a.png")).await;
        assert_matches!(result, Err(JobError::Overloaded));
    }

    #[tokio::test]
    async fn invalid_confidence_override_is_config_error() {
        let store = Arc::new(InMemoryStore::new());
        store.insert("bucket", "a.png", create_test_png(8, 8)).await;
        let processor = processor(store);

        let mut request = AnonymizeRequest::new("bucket", "a.png");
        request.confidence_threshold = -0.1;
        let result = processor.process_job(&request).await;
        assert_matches!(result, Err(JobError::Config(ConfigError::InvalidThreshold { .. })));
    }

    #[test]
    fn invalid_service_config_is_rejected() {
        let config = ServiceConfig {
            max_concurrent_jobs: 0,
            ..Default::default()
        };
        let result = JobProcessor::new(
            config,
            Arc::new(InMemoryStore::new()),
            Detectors::new(Arc::new(no_detections), Arc::new(no_detections)),
        );
        assert_matches!(result, Err(ConfigError::ZeroConcurrency));
    }

    #[tokio::test]
    async fn local_file_keeps_png_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.png");
        let output = dir.path().join("nested/processed_in.png");
        std::fs::write(&input, create_test_png(24, 16)).unwrap();

        let processor = processor(Arc::new(InMemoryStore::new()));
        let result = processor.process_local_file(&input, &output).await.unwrap();

        assert_eq!((result.width, result.height), (24, 16));
        assert_eq!(result.objects_detected, 1);
        let written = std::fs::read(&output).unwrap();
        assert_eq!(&written[1..4], b"PNG");
    }

    #[tokio::test]
    async fn local_file_missing_input_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let processor = processor(Arc::new(InMemoryStore::new()));
        let result = processor
            .process_local_file(&dir.path().join("nope.png"), &dir.path().join("out.jpg"))
            .await;
        assert_matches!(result, Err(JobError::Io { path, .. }) if path.ends_with("nope.png"));
    }

    #[tokio::test]
    async fn batch_waits_for_a_permit_instead_of_failing() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        std::fs::write(input.path().join("a.png"), create_test_png(16, 16)).unwrap();
        std::fs::write(input.path().join("b.png"), create_test_png(16, 16)).unwrap();

        let processor = Arc::new(processor(Arc::new(InMemoryStore::new())));
        let held = processor
            .semaphore
            .clone()
            .try_acquire_many_owned(processor.config.max_concurrent_jobs as u32)
            .unwrap();

        let batch = {
            let processor = processor.clone();
            let (input, output) = (input.path().to_path_buf(), output.path().to_path_buf());
            tokio::spawn(async move { processor.run_local_batch(&input, &output).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!batch.is_finished());

        drop(held);
        let rows = batch.await.unwrap().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == RunStatus::Success));
    }
}
