use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::instrument;

use crate::cancel::{self, CancellationToken};
use crate::config::OrchestratorConfig;
use crate::error::{ProcessingError, Result};
use crate::exemption::{Exemption, ExemptionCache, NoQuotaAuthority, QuotaAuthority};
use crate::ledger::{Capacity, QuotaLedger, RemoteQuota, Reservation};
use crate::planner::OperationPlan;
use crate::store::JobStore;
use crate::types::*;
use crate::usage::{TracingUsageRecorder, UsageEvent, UsageRecorder};
use crate::ImageProcessor;

/// How a batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchOutcome {
    /// Every selected job was attempted.
    Completed,
    /// The cancellation token tripped; remaining jobs were not submitted.
    Cancelled,
    /// The quota refused further work; unprocessed jobs stay pending.
    QuotaExhausted,
    /// No pending jobs.
    NothingToDo,
}

/// Summary returned by [`BatchOrchestrator::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub outcome: BatchOutcome,
    /// Jobs selected for this batch.
    pub selected: usize,
    pub completed: usize,
    pub failed: usize,
    /// Remaining capacity after the batch.
    pub remaining: Capacity,
    /// Whether the user should be told they are out of quota.
    pub limit_reached: bool,
}

/// Progress notifications, delivered in order to the caller's callback.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BatchEvent {
    BatchStarted { total: usize },
    JobStarted { job_id: String, operations: u32 },
    JobCompleted { job_id: String, duration_ms: u64 },
    JobFailed { job_id: String, error: String },
    JobCancelled { job_id: String },
    Progress { total_to_process: usize, processed: usize, failed: usize },
    LimitReached { remaining: i64 },
    BatchFinished { outcome: BatchOutcome },
}

/// Per-job result that does not stop the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Completed,
    Failed,
    /// The job was removed from the store while it was being processed.
    Removed,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs pending jobs one at a time against an [`ImageProcessor`], charging a
/// [`QuotaLedger`] before every remote call.
///
/// Quota is reserved for the job's full [`OperationPlan`] before the call and
/// rolled back if the job fails or is cancelled before the call completes.
/// The store, ledger and cancellation token are shared handles, so a UI can
/// read them (or call [`delete_all`](Self::delete_all)) while a batch runs.
pub struct BatchOrchestrator<P, A = NoQuotaAuthority, U = TracingUsageRecorder> {
    processor: P,
    authority: A,
    recorder: U,
    store: Arc<JobStore>,
    ledger: Arc<QuotaLedger>,
    token: CancellationToken,
    exemptions: ExemptionCache,
    config: OrchestratorConfig,
    running: AtomicBool,
    progress: Mutex<BatchProgress>,
}

impl<P: ImageProcessor> BatchOrchestrator<P> {
    pub fn new(processor: P, config: OrchestratorConfig) -> Self {
        Self {
            processor,
            authority: NoQuotaAuthority,
            recorder: TracingUsageRecorder,
            store: Arc::new(JobStore::new()),
            ledger: Arc::new(QuotaLedger::new(config.max_free_images)),
            token: CancellationToken::new(),
            exemptions: ExemptionCache::new(),
            config,
            running: AtomicBool::new(false),
            progress: Mutex::new(BatchProgress::default()),
        }
    }
}

impl<P, A, U> BatchOrchestrator<P, A, U>
where
    P: ImageProcessor,
    A: QuotaAuthority,
    U: UsageRecorder,
{
    /// Use a remote quota authority for authenticated identities.
    pub fn with_authority<A2: QuotaAuthority>(self, authority: A2) -> BatchOrchestrator<P, A2, U> {
        BatchOrchestrator {
            processor: self.processor,
            authority,
            recorder: self.recorder,
            store: self.store,
            ledger: self.ledger,
            token: self.token,
            exemptions: self.exemptions,
            config: self.config,
            running: self.running,
            progress: self.progress,
        }
    }

    /// Send usage events somewhere other than the log.
    pub fn with_recorder<U2: UsageRecorder>(self, recorder: U2) -> BatchOrchestrator<P, A, U2> {
        BatchOrchestrator {
            processor: self.processor,
            authority: self.authority,
            recorder,
            store: self.store,
            ledger: self.ledger,
            token: self.token,
            exemptions: self.exemptions,
            config: self.config,
            running: self.running,
            progress: self.progress,
        }
    }

    /// Share an existing ledger (e.g. one restored from a persisted count).
    pub fn with_ledger(mut self, ledger: Arc<QuotaLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_store(mut self, store: Arc<JobStore>) -> Self {
        self.store = store;
        self
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> BatchProgress {
        self.progress.lock().map(|p| *p).unwrap_or_default()
    }

    fn set_progress(&self, progress: BatchProgress) {
        if let Ok(mut p) = self.progress.lock() {
            *p = progress;
        }
    }

    /// Process pending jobs without progress notifications.
    pub async fn submit(&self, config: &ProcessingConfig) -> Result<BatchReport> {
        self.submit_with_events(config, |_| {}).await
    }

    /// Process every pending job the current quota allows, in intake order.
    ///
    /// Only one batch runs at a time per orchestrator; a second concurrent
    /// submit is rejected.
    pub async fn submit_with_events<F>(
        &self,
        config: &ProcessingConfig,
        on_event: F,
    ) -> Result<BatchReport>
    where
        F: Fn(&BatchEvent) + Send + Sync,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ProcessingError::Other("A batch is already running".into()));
        }
        let _running = RunningGuard(&self.running);
        self.exemptions.invalidate();

        let pending = self.store.pending_ids();
        if pending.is_empty() {
            on_event(&BatchEvent::BatchFinished {
                outcome: BatchOutcome::NothingToDo,
            });
            return Ok(BatchReport {
                outcome: BatchOutcome::NothingToDo,
                selected: 0,
                completed: 0,
                failed: 0,
                remaining: self.ledger.remaining_processes(),
                limit_reached: false,
            });
        }

        let cost = OperationPlan::for_mode(config.mode, config.target).count();
        self.refresh_remote_quota(cost).await;
        let capacity = self.ledger.remaining_processes();
        if capacity.is_exhausted() {
            tracing::info!(pending = pending.len(), "No quota left, batch not started");
            on_event(&BatchEvent::LimitReached {
                remaining: capacity.as_sentinel(),
            });
            on_event(&BatchEvent::BatchFinished {
                outcome: BatchOutcome::QuotaExhausted,
            });
            return Ok(BatchReport {
                outcome: BatchOutcome::QuotaExhausted,
                selected: 0,
                completed: 0,
                failed: 0,
                remaining: capacity,
                limit_reached: true,
            });
        }

        let selected: Vec<String> = match capacity {
            Capacity::Unlimited => pending,
            Capacity::Limited(n) => pending.into_iter().take(n as usize).collect(),
        };

        let mut progress = BatchProgress {
            total_to_process: selected.len(),
            processed: 0,
            failed: 0,
        };
        self.set_progress(progress);
        tracing::info!(jobs = selected.len(), capacity = capacity.as_sentinel(), "Batch started");
        on_event(&BatchEvent::BatchStarted {
            total: selected.len(),
        });

        let mut outcome = BatchOutcome::Completed;
        let mut completed = 0;

        for job_id in &selected {
            if self.token.is_cancelled() {
                outcome = BatchOutcome::Cancelled;
                break;
            }
            if !self.ledger.can_process() {
                outcome = BatchOutcome::QuotaExhausted;
                break;
            }

            match self.process_job(job_id, config, &on_event).await {
                Ok(JobOutcome::Completed) => {
                    completed += 1;
                    progress.processed += 1;
                }
                Ok(JobOutcome::Failed) => {
                    progress.processed += 1;
                    progress.failed += 1;
                }
                Ok(JobOutcome::Removed) => {}
                Err(ProcessingError::Cancelled) => {
                    outcome = BatchOutcome::Cancelled;
                    break;
                }
                Err(ProcessingError::QuotaExceeded {
                    requested,
                    remaining,
                }) => {
                    tracing::info!(requested, remaining, "Quota refused job {}", job_id);
                    outcome = BatchOutcome::QuotaExhausted;
                    break;
                }
                Err(e) => {
                    tracing::warn!("Job {} skipped: {}", job_id, e);
                }
            }

            self.set_progress(progress);
            on_event(&BatchEvent::Progress {
                total_to_process: progress.total_to_process,
                processed: progress.processed,
                failed: progress.failed,
            });
        }

        self.set_progress(progress);
        self.refresh_remote_quota(cost).await;
        let remaining = self.ledger.remaining_processes();
        let limit_reached = outcome == BatchOutcome::QuotaExhausted || remaining.is_exhausted();
        if limit_reached {
            on_event(&BatchEvent::LimitReached {
                remaining: remaining.as_sentinel(),
            });
        }
        tracing::info!(
            ?outcome,
            completed,
            failed = progress.failed,
            remaining = remaining.as_sentinel(),
            "Batch finished"
        );
        on_event(&BatchEvent::BatchFinished { outcome });

        Ok(BatchReport {
            outcome,
            selected: selected.len(),
            completed,
            failed: progress.failed,
            remaining,
            limit_reached,
        })
    }

    /// Re-read an authenticated identity's quota from the authority.
    ///
    /// A failed check keeps the last snapshot; the per-job check still refuses
    /// work when the authority is down.
    async fn refresh_remote_quota(&self, requested_ops: u32) {
        let identity = self.ledger.identity();
        if !identity.is_authenticated() {
            return;
        }
        match self
            .exemptions
            .resolve(&self.authority, &identity, requested_ops)
            .await
        {
            Ok(Exemption::Limited(quota)) => self.ledger.observe_remote(quota),
            Ok(Exemption::Exempt) => self.ledger.observe_remote(RemoteQuota::unlimited()),
            Ok(Exemption::Local) => {}
            Err(e) => tracing::warn!("Remote quota refresh failed: {:#}", e),
        }
    }

    fn give_back(&self, reservation: Option<Reservation>) {
        if let Some(reservation) = reservation {
            self.ledger.rollback(reservation);
        }
    }

    /// One job: check, reserve, call, record.
    ///
    /// `Err(Cancelled)` and `Err(QuotaExceeded)` stop the batch; every other
    /// failure is written to the job and reported as [`JobOutcome::Failed`].
    #[instrument(skip(self, config, on_event))]
    async fn process_job<F>(
        &self,
        job_id: &str,
        config: &ProcessingConfig,
        on_event: &F,
    ) -> Result<JobOutcome>
    where
        F: Fn(&BatchEvent) + Send + Sync,
    {
        self.token.check()?;

        let Some(job) = self.store.get(job_id) else {
            return Ok(JobOutcome::Removed);
        };
        let identity = self.ledger.identity();
        let plan = OperationPlan::for_mode(config.mode, config.target);
        let cost = plan.count();

        let exemption = match self
            .exemptions
            .resolve(&self.authority, &identity, cost)
            .await
        {
            Ok(exemption) => exemption,
            Err(e) => {
                tracing::warn!("Quota check failed, refusing job: {:#}", e);
                return Err(ProcessingError::QuotaExceeded {
                    requested: cost,
                    remaining: 0,
                });
            }
        };
        if let Exemption::Limited(quota) = exemption {
            self.ledger.observe_remote(quota);
        }
        if !exemption.is_exempt() {
            let remaining = self.ledger.remaining_processes();
            if !remaining.allows(cost) {
                return Err(ProcessingError::QuotaExceeded {
                    requested: cost,
                    remaining: remaining.as_sentinel().max(0) as u32,
                });
            }
        }

        self.token.check()?;

        let reservation = if exemption.is_exempt() {
            None
        } else {
            Some(self.ledger.reserve(cost)?)
        };

        match self.store.mark_processing(job_id, &job.model, config.mode) {
            Ok(()) => {}
            Err(ProcessingError::NotFound(_)) => {
                self.give_back(reservation);
                return Ok(JobOutcome::Removed);
            }
            Err(e) => {
                self.give_back(reservation);
                return Err(e);
            }
        }
        on_event(&BatchEvent::JobStarted {
            job_id: job_id.to_string(),
            operations: cost,
        });

        if let Err(e) = self.token.check() {
            self.give_back(reservation);
            if let Err(revert) = self.store.revert_to_pending(job_id) {
                tracing::debug!("Could not revert cancelled job: {}", revert);
            }
            on_event(&BatchEvent::JobCancelled {
                job_id: job_id.to_string(),
            });
            return Err(e);
        }

        let started = Instant::now();
        let result = self
            .processor
            .process(&job.source, &job.model, &config.output_spec())
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let usage = |success: bool| {
            UsageEvent::new(&identity, &plan, success)
                .with_duration(duration_ms)
                .with_file_size(job.source.size)
                .with_model(job.model.clone(), config.mode)
                .with_tool(config.tool.clone())
        };

        match result {
            Ok(image) => {
                match self.store.mark_completed(job_id, image, duration_ms) {
                    Ok(()) => {}
                    Err(ProcessingError::NotFound(_)) => {
                        tracing::debug!("Job removed during processing, discarding result");
                        self.give_back(reservation);
                        on_event(&BatchEvent::JobCancelled {
                            job_id: job_id.to_string(),
                        });
                        return Ok(JobOutcome::Removed);
                    }
                    Err(e) => {
                        self.give_back(reservation);
                        return Err(e);
                    }
                }
                if let Some(reservation) = reservation {
                    reservation.commit();
                }
                self.record(usage(true)).await;
                on_event(&BatchEvent::JobCompleted {
                    job_id: job_id.to_string(),
                    duration_ms,
                });
                Ok(JobOutcome::Completed)
            }
            Err(e) => {
                self.give_back(reservation);
                let message = e.user_message();
                tracing::warn!(duration_ms, "Job failed: {}", e);
                match self.store.mark_failed(job_id, message.clone(), duration_ms) {
                    Ok(()) => {}
                    Err(ProcessingError::NotFound(_)) => {
                        on_event(&BatchEvent::JobCancelled {
                            job_id: job_id.to_string(),
                        });
                        return Ok(JobOutcome::Removed);
                    }
                    Err(store_err) => return Err(store_err),
                }
                self.record(usage(false)).await;
                on_event(&BatchEvent::JobFailed {
                    job_id: job_id.to_string(),
                    error: message,
                });
                Ok(JobOutcome::Failed)
            }
        }
    }

    async fn record(&self, event: UsageEvent) {
        if let Err(e) = self.recorder.record(&event).await {
            tracing::warn!("Failed to record usage: {:#}", e);
        }
    }

    /// Remove one job. If it is mid-flight its reservation is given back and
    /// the batch moves on to the next job.
    pub fn remove_job(&self, job_id: &str) -> Result<bool> {
        Ok(self.store.remove(job_id)?.is_some())
    }

    /// Stop the running batch, drop every job and, for anonymous sessions,
    /// reset the free-usage counter. Returns the number of jobs removed.
    ///
    /// The cancellation flag clears itself after the configured delay. Image
    /// bytes are released on a deferred task. Must be called from within a
    /// tokio runtime.
    pub fn delete_all(&self) -> Result<usize> {
        let _ = self.token.cancel_then_reset(self.config.cancel_reset_delay);
        let jobs = self.store.clear()?;
        if !self.ledger.identity().is_authenticated() {
            self.ledger.reset_count();
        }
        self.set_progress(BatchProgress::default());
        let removed = jobs.len();
        let _ = cancel::release_deferred(jobs);
        tracing::info!(removed, "Deleted all jobs");
        Ok(removed)
    }
}
