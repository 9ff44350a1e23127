use std::io::Cursor;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ProcessingError, Result};

/// Image job lifecycle: Pending -> Processing -> Completed/Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }

    /// Whether a job may move from `self` to `next`.
    ///
    /// `Processing -> Pending` is only used when a reservation is rolled back
    /// before the remote call was issued.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Error)
                | (JobStatus::Processing, JobStatus::Pending)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which remote operations to apply to each image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingMode {
    Ai,
    Resize,
    Both,
    CropHead,
    CropHeadAi,
    All,
}

impl ProcessingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMode::Ai => "ai",
            ProcessingMode::Resize => "resize",
            ProcessingMode::Both => "both",
            ProcessingMode::CropHead => "crop-head",
            ProcessingMode::CropHeadAi => "crop-head-ai",
            ProcessingMode::All => "all",
        }
    }
}

impl FromStr for ProcessingMode {
    type Err = ProcessingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ai" => Ok(ProcessingMode::Ai),
            "resize" => Ok(ProcessingMode::Resize),
            "both" => Ok(ProcessingMode::Both),
            "crop-head" => Ok(ProcessingMode::CropHead),
            "crop-head-ai" => Ok(ProcessingMode::CropHeadAi),
            "all" => Ok(ProcessingMode::All),
            other => Err(ProcessingError::Other(format!(
                "Unknown processing mode: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output box requested by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

/// Current and original pixel dimensions of a job's image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
    pub original: Size,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            original: Size { width, height },
        }
    }
}

/// Processing settings chosen before a batch is submitted.
///
/// Shared by reference across every job of the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingConfig {
    /// Target output box; `None` keeps the remote result's size.
    pub target: Option<TargetSize>,
    /// Optional tool label forwarded with usage events.
    pub tool: Option<String>,
    /// `None` when the mode was missing or unrecognized.
    pub mode: Option<ProcessingMode>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            target: None,
            tool: None,
            mode: Some(ProcessingMode::Ai),
        }
    }
}

impl ProcessingConfig {
    pub fn new(mode: ProcessingMode) -> Self {
        Self {
            mode: Some(mode),
            ..Self::default()
        }
    }

    pub fn with_target(mut self, width: u32, height: u32) -> Self {
        self.target = Some(TargetSize::new(width, height));
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn output_spec(&self) -> OutputSpec {
        OutputSpec {
            target: self.target,
            mode: self.mode,
        }
    }
}

/// What the remote client should produce for one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputSpec {
    pub target: Option<TargetSize>,
    pub mode: Option<ProcessingMode>,
}

/// A transient reference to in-memory image bytes.
///
/// Releasing drops this handle's reference; releasing twice is a no-op.
#[derive(Clone, Default)]
pub struct BlobHandle {
    data: Option<Arc<[u8]>>,
}

impl BlobHandle {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            data: Some(bytes.into()),
        }
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn len(&self) -> usize {
        self.data.as_ref().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_released(&self) -> bool {
        self.data.is_none()
    }

    /// Returns `true` only for the call that actually released the bytes.
    pub fn release(&mut self) -> bool {
        self.data.take().is_some()
    }
}

impl std::fmt::Debug for BlobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            Some(d) => write!(f, "BlobHandle({} bytes)", d.len()),
            None => f.write_str("BlobHandle(released)"),
        }
    }
}

/// An uploaded file: identity metadata plus its bytes.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub name: String,
    pub size: u64,
    /// Last-modified time in milliseconds since the Unix epoch.
    pub last_modified: Option<i64>,
    pub mime: String,
    pub data: BlobHandle,
}

impl SourceImage {
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>, last_modified: Option<i64>) -> Self {
        let name = name.into();
        let mime = image::guess_format(&bytes)
            .map(|f| f.to_mime_type().to_string())
            .or_else(|_| image::ImageFormat::from_path(&name).map(|f| f.to_mime_type().to_string()))
            .unwrap_or_else(|_| "application/octet-stream".to_string());
        Self {
            name,
            size: bytes.len() as u64,
            last_modified,
            mime,
            data: BlobHandle::new(bytes),
        }
    }

    /// Read a file from disk, keeping its modification time for cache identity.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let last_modified = tokio::fs::metadata(path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis());
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        Ok(Self::from_bytes(name, bytes, last_modified))
    }

    pub fn is_image(&self) -> bool {
        self.mime.starts_with("image/")
    }

    /// Decode just the header to learn the pixel size.
    pub fn read_dimensions(&self) -> Option<Dimensions> {
        let bytes = self.data.bytes()?;
        image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .ok()?
            .into_dimensions()
            .ok()
            .map(|(w, h)| Dimensions::new(w, h))
    }
}

/// Output of a successful remote call.
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub data: BlobHandle,
    pub width: u32,
    pub height: u32,
    pub mime: String,
}

/// One user-submitted image and its processing lifecycle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageJob {
    pub id: String,
    #[serde(skip)]
    pub source: SourceImage,
    pub file_name: String,
    pub status: JobStatus,
    #[serde(skip)]
    pub result: Option<ProcessedImage>,
    pub error: Option<String>,
    pub model: String,
    pub mode: Option<ProcessingMode>,
    pub dimensions: Option<Dimensions>,
    /// ISO 8601 timestamp of intake.
    pub created_at: String,
    pub duration_ms: Option<u64>,
}

impl ImageJob {
    /// Create a pending job with a generated UUID.
    pub fn new(source: SourceImage, model: impl Into<String>, mode: Option<ProcessingMode>) -> Self {
        let dimensions = source.read_dimensions();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file_name: source.name.clone(),
            source,
            status: JobStatus::Pending,
            result: None,
            error: None,
            model: model.into(),
            mode,
            dimensions,
            created_at: chrono::Utc::now().to_rfc3339(),
            duration_ms: None,
        }
    }

    /// Set a custom ID for this job (builder pattern).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Drop the source and result bytes. Returns `true` if anything was freed.
    pub fn release_handles(&mut self) -> bool {
        let source = self.source.data.release();
        let result = self
            .result
            .as_mut()
            .map(|r| r.data.release())
            .unwrap_or(false);
        source || result
    }
}

/// Aggregate progress of the current batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub total_to_process: usize,
    pub processed: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = image::RgbaImage::new(w, h);
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_mode_round_trip_names() {
        for mode in [
            ProcessingMode::Ai,
            ProcessingMode::Resize,
            ProcessingMode::Both,
            ProcessingMode::CropHead,
            ProcessingMode::CropHeadAi,
            ProcessingMode::All,
        ] {
            assert_eq!(mode.as_str().parse::<ProcessingMode>().unwrap(), mode);
            let json = serde_json::to_string(&mode).unwrap();
            assert_eq!(json, format!("\"{}\"", mode.as_str()));
        }
        assert!("crop_head".parse::<ProcessingMode>().is_err());
    }

    #[test]
    fn test_status_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Error));
        assert!(Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Error.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_source_dimensions_and_mime() {
        let source = SourceImage::from_bytes("cat.png", png_bytes(40, 30), Some(1_700_000_000_000));
        assert_eq!(source.mime, "image/png");
        assert!(source.is_image());
        let dims = source.read_dimensions().unwrap();
        assert_eq!((dims.width, dims.height), (40, 30));
        assert_eq!(dims.original, Size { width: 40, height: 30 });
    }

    #[test]
    fn test_non_image_source() {
        let source = SourceImage::from_bytes("notes.txt", b"hello".to_vec(), None);
        assert!(!source.is_image());
        assert!(source.read_dimensions().is_none());
    }

    #[test]
    fn test_release_is_idempotent() {
        let source = SourceImage::from_bytes("a.png", png_bytes(2, 2), None);
        let mut job = ImageJob::new(source, "bria", Some(ProcessingMode::Ai));
        job.result = Some(ProcessedImage {
            data: BlobHandle::new(vec![1u8, 2, 3]),
            width: 2,
            height: 2,
            mime: "image/png".into(),
        });

        assert!(job.release_handles());
        assert!(job.source.data.is_released());
        assert!(!job.release_handles());
    }

    #[test]
    fn test_job_serializes_without_bytes() {
        let source = SourceImage::from_bytes("a.png", png_bytes(3, 3), None);
        let job = ImageJob::new(source, "bria", Some(ProcessingMode::CropHeadAi)).with_id("job-1");
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["id"], "job-1");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["mode"], "crop-head-ai");
        assert_eq!(json["dimensions"]["original"]["width"], 3);
        assert!(json.get("source").is_none());
    }
}
