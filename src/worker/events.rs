//! Progress events sent to front ends

use serde::{Deserialize, Serialize};

use super::job::JobStatus;

/// Outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchResult {
    pub success_count: usize,
    pub failure_count: usize,
    /// The run was stopped through a cancel handle
    pub cancelled: bool,
    /// Jobs left `Waiting`
    pub remaining: usize,
}

impl BatchResult {
    pub fn all_succeeded(&self) -> bool {
        self.failure_count == 0 && self.remaining == 0 && !self.cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    Started {
        total: usize,
    },
    JobStarted {
        job_id: String,
    },
    JobFinished {
        job_id: String,
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Aborted {
        reason: String,
    },
    Finished(BatchResult),
}
