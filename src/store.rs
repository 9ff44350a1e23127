use std::sync::Mutex;

use crate::error::{ProcessingError, Result};
use crate::types::*;

/// In-memory collection of image jobs, kept in intake order.
///
/// The store enforces the job state machine; the orchestrator is the only
/// caller that moves jobs out of `Pending`.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: Mutex<Vec<ImageJob>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<ImageJob>>> {
        self.jobs
            .lock()
            .map_err(|e| ProcessingError::Other(format!("Job store poisoned: {}", e)))
    }

    /// Add a job. Returns its ID.
    pub fn add(&self, job: ImageJob) -> Result<String> {
        let mut jobs = self.lock()?;
        let id = job.id.clone();
        jobs.push(job);
        Ok(id)
    }

    /// Create pending jobs from uploaded files. Non-image files are skipped.
    pub fn add_sources(
        &self,
        sources: Vec<SourceImage>,
        model: &str,
        mode: Option<ProcessingMode>,
    ) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for source in sources {
            if !source.is_image() {
                tracing::debug!(file = %source.name, "Skipping non-image upload");
                continue;
            }
            ids.push(self.add(ImageJob::new(source, model, mode))?);
        }
        Ok(ids)
    }

    /// Get a specific job by ID (cloned snapshot).
    pub fn get(&self, job_id: &str) -> Option<ImageJob> {
        self.jobs
            .lock()
            .ok()?
            .iter()
            .find(|j| j.id == job_id)
            .cloned()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs
            .lock()
            .map(|j| j.iter().any(|job| job.id == job_id))
            .unwrap_or(false)
    }

    /// Get all jobs (cloned snapshot).
    pub fn list(&self) -> Vec<ImageJob> {
        self.jobs.lock().map(|j| j.clone()).unwrap_or_default()
    }

    /// IDs of pending jobs, in intake order.
    pub fn pending_ids(&self) -> Vec<String> {
        self.jobs
            .lock()
            .map(|j| {
                j.iter()
                    .filter(|job| job.status == JobStatus::Pending)
                    .map(|job| job.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs
            .lock()
            .map(|j| j.iter().filter(|job| job.status == status).count())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().map(|j| j.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn transition<F>(&self, job_id: &str, next: JobStatus, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ImageJob),
    {
        let mut jobs = self.lock()?;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| ProcessingError::NotFound(job_id.to_string()))?;

        if !job.status.can_transition_to(next) {
            return Err(ProcessingError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status.to_string(),
                to: next.to_string(),
            });
        }
        job.status = next;
        apply(job);
        Ok(())
    }

    /// Pending -> Processing, recording the model and mode actually used.
    pub fn mark_processing(
        &self,
        job_id: &str,
        model: &str,
        mode: Option<ProcessingMode>,
    ) -> Result<()> {
        self.transition(job_id, JobStatus::Processing, |job| {
            job.model = model.to_string();
            job.mode = mode;
            job.error = None;
        })
    }

    /// Processing -> Completed with the result handle.
    pub fn mark_completed(
        &self,
        job_id: &str,
        result: ProcessedImage,
        duration_ms: u64,
    ) -> Result<()> {
        self.transition(job_id, JobStatus::Completed, |job| {
            let original = job
                .dimensions
                .map(|d| d.original)
                .unwrap_or(Size {
                    width: result.width,
                    height: result.height,
                });
            job.dimensions = Some(Dimensions {
                width: result.width,
                height: result.height,
                original,
            });
            job.result = Some(result);
            job.duration_ms = Some(duration_ms);
        })
    }

    /// Processing -> Error with a user-facing message.
    pub fn mark_failed(&self, job_id: &str, message: String, duration_ms: u64) -> Result<()> {
        self.transition(job_id, JobStatus::Error, |job| {
            job.error = Some(message);
            job.duration_ms = Some(duration_ms);
        })
    }

    /// Processing -> Pending, used when a job is abandoned before its remote call.
    pub fn revert_to_pending(&self, job_id: &str) -> Result<()> {
        self.transition(job_id, JobStatus::Pending, |_| {})
    }

    /// Remove one job and release its handles.
    pub fn remove(&self, job_id: &str) -> Result<Option<ImageJob>> {
        let mut jobs = self.lock()?;
        let Some(pos) = jobs.iter().position(|j| j.id == job_id) else {
            return Ok(None);
        };
        let mut job = jobs.remove(pos);
        job.release_handles();
        Ok(Some(job))
    }

    /// Remove every job, handing them back so their handles can be released later.
    pub fn clear(&self) -> Result<Vec<ImageJob>> {
        let mut jobs = self.lock()?;
        Ok(std::mem::take(&mut *jobs))
    }

    /// Completed jobs (cloned), for export.
    pub fn completed(&self) -> Vec<ImageJob> {
        self.jobs
            .lock()
            .map(|j| {
                j.iter()
                    .filter(|job| job.status == JobStatus::Completed)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
