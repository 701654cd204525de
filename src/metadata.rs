use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use crate::vision::{Category, DetectionSet};

pub const SUMMARY_HEADER: &str =
    "filename,width,height,objects_detected,processing_time_seconds,status,error";

/// One raw detection as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionMetadata {
    pub label: Category,
    /// `[x, y, w, h]` divided by image width/height. Taken from the unclamped
    /// global box, so partly outside detections may leave `[0, 1]`.
    #[serde(rename = "box")]
    pub bbox: [f32; 4],
    pub score: f32,
}

/// Metadata for every detection of the set, suppressed or not.
pub fn build_metadata(detections: &DetectionSet, width: u32, height: u32) -> Vec<DetectionMetadata> {
    detections
        .iter()
        .map(|d| DetectionMetadata {
            label: d.category,
            bbox: d.bbox.normalized(width, height),
            score: d.confidence,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

/// One line of the batch summary CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub filename: String,
    pub width: u32,
    pub height: u32,
    pub objects_detected: usize,
    pub processing_time_seconds: f64,
    pub status: RunStatus,
    pub error: Option<String>,
}

impl SummaryRow {
    pub fn failed(filename: impl Into<String>, seconds: f64, error: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            width: 0,
            height: 0,
            objects_detected: 0,
            processing_time_seconds: seconds,
            status: RunStatus::Failed,
            error: Some(error.into()),
        }
    }

    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{},{:.3},{},{}",
            escape_csv(&self.filename),
            self.width,
            self.height,
            self.objects_detected,
            self.processing_time_seconds,
            self.status.as_str(),
            escape_csv(self.error.as_deref().unwrap_or(""))
        )
    }
}

/// Writes the header and one line per row.
pub fn write_summary_csv<W: Write>(mut writer: W, rows: &[SummaryRow]) -> io::Result<()> {
    writeln!(writer, "{SUMMARY_HEADER}")?;
    for row in rows {
        writeln!(writer, "{}", row.to_csv_line())?;
    }
    writer.flush()
}

fn escape_csv(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
