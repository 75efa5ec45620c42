//! Observability (tracing setup and run counters)

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber. `RUST_LOG` wins over `filter`.
/// Calling it again is a no-op.
pub fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Counters for one batch run
#[derive(Debug, Default)]
pub struct Metrics {
    jobs_done: AtomicU64,
    jobs_failed: AtomicU64,
    tsa_requests: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_done(&self) {
        self.jobs_done.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_done", "Metric incremented");
    }

    pub fn job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_failed", "Metric incremented");
    }

    pub fn tsa_request(&self) {
        self.tsa_requests.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "tsa_requests", "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_done: self.jobs_done.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            tsa_requests: self.tsa_requests.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_done: u64,
    pub jobs_failed: u64,
    pub tsa_requests: u64,
}
