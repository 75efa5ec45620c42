//! Batch orchestrator - owns the jobs and drives them one at a time

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use super::events::{BatchEvent, BatchResult};
use super::job::{Job, JobStatus, derive_output_path, is_pdf_path};
use super::runner::{self, MAX_ERROR_MESSAGE_CHARS, StageError};
use super::BatchConfig;
use crate::observability::{Metrics, MetricsSnapshot};
use crate::tsa::{HttpTimestampClient, TimestampAuthority, TsaError};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Cannot reach timestamp authority: {0}")]
    Connect(#[source] TsaError),

    #[error("No documents registered")]
    NoJobs,

    #[error("This batch has already run")]
    AlreadyRan,
}

/// Cooperative stop signal, checked between jobs.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct BatchOrchestrator {
    jobs: Vec<Job>,
    cancel: CancelHandle,
    metrics: Arc<Metrics>,
    started: bool,
}

impl BatchOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `.pdf` paths not already registered. Returns how many were added.
    pub fn register<I, P>(&mut self, paths: I) -> usize
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        if self.started {
            warn!("Batch already started, ignoring new documents");
            return 0;
        }

        let mut added = 0;
        for path in paths {
            let path = path.into();
            if !is_pdf_path(&path) {
                warn!(path = %path.display(), "Not a PDF, skipping");
                continue;
            }
            if self.jobs.iter().any(|job| job.input_path == path) {
                continue;
            }
            self.jobs.push(Job::new(path));
            added += 1;
        }
        added
    }

    pub fn remove(&mut self, id: &str) -> bool {
        if self.started {
            return false;
        }
        let before = self.jobs.len();
        self.jobs.retain(|job| job.id != id);
        self.jobs.len() != before
    }

    pub fn clear(&mut self) {
        if !self.started {
            self.jobs.clear();
        }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Connect to the configured authority and process every job.
    pub async fn run(
        &mut self,
        config: &BatchConfig,
        events: &UnboundedSender<BatchEvent>,
    ) -> Result<BatchResult, BatchError> {
        if self.started {
            return Err(BatchError::AlreadyRan);
        }
        if self.jobs.is_empty() {
            return Err(BatchError::NoJobs);
        }

        let client = match HttpTimestampClient::connect(config.tsa_client_config()).await {
            Ok(client) => client,
            Err(e) => {
                error!(url = %config.tsa_url, error = %e, "Timestamp authority unavailable, batch aborted");
                let _ = events.send(BatchEvent::Aborted {
                    reason: e.to_string(),
                });
                return Err(BatchError::Connect(e));
            }
        };

        self.run_with(&client, config, events).await
    }

    /// Process every job against `authority`.
    pub async fn run_with(
        &mut self,
        authority: &dyn TimestampAuthority,
        config: &BatchConfig,
        events: &UnboundedSender<BatchEvent>,
    ) -> Result<BatchResult, BatchError> {
        if self.started {
            return Err(BatchError::AlreadyRan);
        }
        if self.jobs.is_empty() {
            return Err(BatchError::NoJobs);
        }
        self.started = true;

        for job in &mut self.jobs {
            job.output_path = Some(derive_output_path(&job.input_path, &config.output_suffix));
        }
        let inputs: HashSet<PathBuf> = self.jobs.iter().map(|j| j.input_path.clone()).collect();

        info!(
            total = self.jobs.len(),
            tsa = authority.endpoint(),
            repair = config.repair_enabled,
            "Batch started"
        );
        let _ = events.send(BatchEvent::Started {
            total: self.jobs.len(),
        });

        for index in 0..self.jobs.len() {
            if self.cancel.is_cancelled() {
                warn!("Batch cancelled");
                break;
            }

            let job = &mut self.jobs[index];
            job.transition(JobStatus::Processing);
            let _ = events.send(BatchEvent::JobStarted {
                job_id: job.id.clone(),
            });
            info!(job_id = %job.id, "Processing document");

            let input = job.input_path.clone();
            let output = job
                .output_path
                .clone()
                .unwrap_or_else(|| derive_output_path(&input, &config.output_suffix));

            let outcome = if inputs.contains(&output) {
                Err(StageError::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("output is another input of this batch: {}", output.display()),
                )))
            } else {
                runner::process_job(&input, &output, config, authority, &self.metrics).await
            };

            let job = &mut self.jobs[index];
            match outcome {
                Ok(_) => {
                    job.transition(JobStatus::Done);
                    self.metrics.job_done();
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Document failed");
                    job.fail(runner::abbreviate(&e.to_string(), MAX_ERROR_MESSAGE_CHARS));
                    self.metrics.job_failed();
                }
            }
            let _ = events.send(BatchEvent::JobFinished {
                job_id: job.id.clone(),
                status: job.status,
                error: job.error_message.clone(),
            });
        }

        let result = self.summarize();
        info!(
            done = result.success_count,
            failed = result.failure_count,
            remaining = result.remaining,
            cancelled = result.cancelled,
            metrics = ?self.metrics.snapshot(),
            "Batch finished"
        );
        let _ = events.send(BatchEvent::Finished(result));
        Ok(result)
    }

    fn summarize(&self) -> BatchResult {
        let count = |status| self.jobs.iter().filter(|j| j.status == status).count();
        BatchResult {
            success_count: count(JobStatus::Done),
            failure_count: count(JobStatus::Failed),
            cancelled: self.cancel.is_cancelled(),
            remaining: count(JobStatus::Waiting),
        }
    }

    /// Run on a tokio task, reporting through the returned handle.
    pub fn spawn(mut self, config: BatchConfig) -> RunHandle {
        let (sender, events) = mpsc::unbounded_channel();
        let cancel = self.cancel_handle();
        let task = tokio::spawn(async move {
            let result = self.run(&config, &sender).await;
            (self, result)
        });
        RunHandle {
            events,
            cancel,
            task,
        }
    }
}

/// A batch running in the background.
#[derive(Debug)]
pub struct RunHandle {
    events: UnboundedReceiver<BatchEvent>,
    cancel: CancelHandle,
    task: JoinHandle<(BatchOrchestrator, Result<BatchResult, BatchError>)>,
}

impl RunHandle {
    /// Next event; `None` once the run is over and every event was read.
    pub async fn next_event(&mut self) -> Option<BatchEvent> {
        self.events.recv().await
    }

    pub fn events(&mut self) -> &mut UnboundedReceiver<BatchEvent> {
        &mut self.events
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the run; yields the orchestrator with final job states.
    pub async fn join(
        self,
    ) -> Result<(BatchOrchestrator, Result<BatchResult, BatchError>), JoinError> {
        self.task.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::HashAlgorithm;
    use crate::tsa::TimestampToken;
    use async_trait::async_trait;

    /// Authority that always fails, for exercising the state machine.
    struct Unavailable;

    #[async_trait]
    impl TimestampAuthority for Unavailable {
        async fn request_timestamp(
            &self,
            _digest: &[u8],
            _algorithm: HashAlgorithm,
        ) -> crate::tsa::Result<TimestampToken> {
            Err(TsaError::Network("connection refused".into()))
        }

        fn endpoint(&self) -> &str {
            "mock://unavailable"
        }
    }

    #[test]
    fn test_register_filters_and_dedups() {
        let mut orchestrator = BatchOrchestrator::new();
        let added = orchestrator.register(["/a/one.pdf", "/a/two.PDF", "/a/notes.txt", "/a/one.pdf"]);
        assert_eq!(added, 2);
        assert_eq!(orchestrator.register(["/a/two.PDF"]), 0);

        let ids: Vec<&str> = orchestrator.jobs().iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["/a/one.pdf", "/a/two.PDF"]);
        assert!(orchestrator.jobs().iter().all(|j| j.status == JobStatus::Waiting));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut orchestrator = BatchOrchestrator::new();
        orchestrator.register(["/a/one.pdf", "/a/two.pdf"]);
        assert!(orchestrator.remove("/a/one.pdf"));
        assert!(!orchestrator.remove("/a/one.pdf"));
        assert_eq!(orchestrator.jobs().len(), 1);
        orchestrator.clear();
        assert!(orchestrator.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_is_refused() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut orchestrator = BatchOrchestrator::new();
        let err = orchestrator
            .run_with(&Unavailable, &BatchConfig::default(), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::NoJobs));
    }

    #[tokio::test]
    async fn test_missing_inputs_fail_individually() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut orchestrator = BatchOrchestrator::new();
        orchestrator.register([dir.path().join("a.pdf"), dir.path().join("b.pdf")]);

        let result = orchestrator
            .run_with(&Unavailable, &BatchConfig::default(), &tx)
            .await
            .unwrap();
        assert_eq!(result.failure_count, 2);
        assert_eq!(result.success_count, 0);

        for job in orchestrator.jobs() {
            assert_eq!(job.status, JobStatus::Failed);
            let message = job.error_message.as_deref().unwrap();
            assert!(message.starts_with("I/O error"), "{message}");
            assert!(message.chars().count() <= MAX_ERROR_MESSAGE_CHARS);
        }

        assert_eq!(rx.recv().await, Some(BatchEvent::Started { total: 2 }));
        assert!(matches!(rx.recv().await, Some(BatchEvent::JobStarted { .. })));
        assert!(matches!(
            rx.recv().await,
            Some(BatchEvent::JobFinished {
                status: JobStatus::Failed,
                ..
            })
        ));

        // A finished batch does not run again or accept edits
        let again = orchestrator
            .run_with(&Unavailable, &BatchConfig::default(), &tx)
            .await;
        assert!(matches!(again, Err(BatchError::AlreadyRan)));
        assert!(!orchestrator.remove(&dir.path().join("a.pdf").to_string_lossy()));
        assert_eq!(orchestrator.metrics().jobs_failed, 2);
    }

    #[tokio::test]
    async fn test_output_colliding_with_input_fails_job() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("report.pdf");
        let second = dir.path().join("report_sealed.pdf");
        std::fs::write(&first, b"%PDF-1.4\n").unwrap();
        std::fs::write(&second, b"%PDF-1.4\n").unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut orchestrator = BatchOrchestrator::new();
        orchestrator.register([first.clone(), second.clone()]);
        orchestrator
            .run_with(&Unavailable, &BatchConfig::default(), &tx)
            .await
            .unwrap();

        let job = &orchestrator.jobs()[0];
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.as_deref().unwrap().contains("another input"));
        assert_eq!(std::fs::read(&second).unwrap(), b"%PDF-1.4\n");
    }

    #[tokio::test]
    async fn test_cancel_before_start_leaves_jobs_waiting() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut orchestrator = BatchOrchestrator::new();
        orchestrator.register(["/nonexistent/a.pdf", "/nonexistent/b.pdf"]);
        orchestrator.cancel_handle().cancel();

        let result = orchestrator
            .run_with(&Unavailable, &BatchConfig::default(), &tx)
            .await
            .unwrap();
        assert!(result.cancelled);
        assert_eq!(result.remaining, 2);
        assert!(orchestrator.jobs().iter().all(|j| j.status == JobStatus::Waiting));
    }
}
