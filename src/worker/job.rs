//! Jobs and their state machine

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// `Waiting -> Processing -> Done | Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Waiting,
    Processing,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Waiting, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Done)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One input document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    /// The input path as given
    pub id: String,
    pub input_path: PathBuf,
    /// Derived when the run starts
    pub output_path: Option<PathBuf>,
    pub status: JobStatus,
    /// Abbreviated failure reason, set only when `Failed`
    pub error_message: Option<String>,
}

impl Job {
    pub fn new(input_path: PathBuf) -> Self {
        Self {
            id: input_path.to_string_lossy().into_owned(),
            input_path,
            output_path: None,
            status: JobStatus::Waiting,
            error_message: None,
        }
    }

    /// Move to `next` if the state machine allows it.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(job_id = %self.id, from = %self.status, to = %next, "Rejected job transition");
            return false;
        }
        self.status = next;
        true
    }

    pub fn fail(&mut self, message: String) -> bool {
        if self.transition(JobStatus::Failed) {
            self.error_message = Some(message);
            true
        } else {
            false
        }
    }
}

/// `<dir>/<stem><suffix>.pdf` next to the input.
pub fn derive_output_path(input: &Path, suffix: &str) -> PathBuf {
    let stem = input.file_stem().unwrap_or(input.as_os_str());
    let mut name = stem.to_os_string();
    name.push(suffix);
    name.push(".pdf");
    input.with_file_name(name)
}

/// True for paths with a `.pdf` extension in any letter case.
pub fn is_pdf_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_derivation() {
        assert_eq!(
            derive_output_path(Path::new("/data/report.pdf"), "_sealed"),
            PathBuf::from("/data/report_sealed.pdf")
        );
        assert_eq!(
            derive_output_path(Path::new("/data/Scan.PDF"), "_ts"),
            PathBuf::from("/data/Scan_ts.pdf")
        );
        // No implicit chaining: an already sealed file gets the suffix again
        assert_eq!(
            derive_output_path(Path::new("/data/report_sealed.pdf"), "_sealed"),
            PathBuf::from("/data/report_sealed_sealed.pdf")
        );
        assert_eq!(
            derive_output_path(Path::new("relative.pdf"), "_sealed"),
            PathBuf::from("relative_sealed.pdf")
        );
    }

    #[test]
    fn test_pdf_extension_check() {
        assert!(is_pdf_path(Path::new("/a/b.pdf")));
        assert!(is_pdf_path(Path::new("/a/b.PdF")));
        assert!(!is_pdf_path(Path::new("/a/b.txt")));
        assert!(!is_pdf_path(Path::new("/a/pdf")));
    }

    #[test]
    fn test_state_machine() {
        let mut job = Job::new(PathBuf::from("/tmp/a.pdf"));
        assert_eq!(job.id, "/tmp/a.pdf");
        assert_eq!(job.status, JobStatus::Waiting);

        assert!(!job.transition(JobStatus::Done));
        assert!(job.transition(JobStatus::Processing));
        assert!(job.fail("boom".into()));
        assert_eq!(job.error_message.as_deref(), Some("boom"));

        // Terminal states stay put
        assert!(!job.transition(JobStatus::Processing));
        assert!(!job.transition(JobStatus::Done));
        assert!(job.status.is_terminal());
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&JobStatus::Processing).unwrap(), "\"processing\"");
    }
}
