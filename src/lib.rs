//! # bgremove-batch
//!
//! Quota-aware batch processing for a remote background-removal service.
//!
//! ## Key Features
//!
//! - **Pre-reserved quota**: each job's full operation cost is charged to a
//!   [`QuotaLedger`] before its remote call and rolled back if the call fails
//!   or the batch is cancelled first
//! - **Operation planning**: [`OperationPlan`] maps a processing mode to the
//!   billable operations it performs
//! - **Signed, retried requests**: [`RemoteClient`] signs every call, retries
//!   transient failures with a growing delay and memoizes results
//! - **Cooperative cancellation**: a shared [`CancellationToken`] checked at
//!   fixed points in every job, plus "delete all" with deferred cleanup
//! - **Admin exemption**: remote quota checks for signed-in users, with the
//!   admin verdict cached per batch
//!
//! ## Quick Start
//!
//! 1. Build a [`RemoteClient`] from [`ClientConfig::from_env()`]
//! 2. Wrap it in a [`BatchOrchestrator`] and add images to its [`JobStore`]
//! 3. Call [`BatchOrchestrator::submit()`] with a [`ProcessingConfig`]

pub mod cache;
pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod exemption;
pub mod export;
pub mod imaging;
pub mod ledger;
pub mod orchestrator;
pub mod planner;
pub mod retry;
pub mod signing;
pub mod store;
pub mod types;
pub mod usage;

pub use cache::{CacheKey, ResultCache};
pub use cancel::CancellationToken;
pub use client::RemoteClient;
pub use config::{ClientConfig, OrchestratorConfig};
pub use error::{ProcessingError, Result};
pub use exemption::{Exemption, NoQuotaAuthority, QuotaAuthority};
pub use ledger::{Capacity, Identity, QuotaLedger, RemoteQuota, Reservation};
pub use orchestrator::{BatchEvent, BatchOrchestrator, BatchOutcome, BatchReport};
pub use planner::{OperationKind, OperationPlan};
pub use retry::RetryPolicy;
pub use store::JobStore;
pub use types::{
    BatchProgress, BlobHandle, Dimensions, ImageJob, JobStatus, OutputSpec, ProcessedImage,
    ProcessingConfig, ProcessingMode, SourceImage, TargetSize,
};
pub use usage::{TracingUsageRecorder, UsageEvent, UsageRecorder};

/// Performs the remote work for one image.
///
/// [`RemoteClient`] is the production implementation; tests and alternative
/// backends implement it directly.
///
/// # Example
///
/// ```ignore
/// use bgremove_batch::*;
///
/// struct Passthrough;
///
/// impl ImageProcessor for Passthrough {
///     async fn process(
///         &self,
///         source: &SourceImage,
///         _model: &str,
///         _spec: &OutputSpec,
///     ) -> Result<ProcessedImage> {
///         Ok(ProcessedImage {
///             data: source.data.clone(),
///             width: 1,
///             height: 1,
///             mime: source.mime.clone(),
///         })
///     }
/// }
/// ```
pub trait ImageProcessor: Send + Sync + 'static {
    /// Process a single image.
    ///
    /// # Arguments
    /// * `source`: the uploaded file
    /// * `model`: model tag (e.g. "bria", "clothing")
    /// * `spec`: target size and processing mode
    fn process(
        &self,
        source: &SourceImage,
        model: &str,
        spec: &OutputSpec,
    ) -> impl std::future::Future<Output = Result<ProcessedImage>> + Send;
}
