//! In-memory job tracker for long-running operations.
//!
//! Long-running API operations (install, download, node updates) return
//! immediately with a job id; clients poll `GET /jobs/{id}` for progress.
//! Records live only as long as the process; pruning drops the oldest
//! terminal records and never touches in-flight work.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::loghub::unix_time;
use crate::process::ProgressSink;

pub const MAX_JOBS: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub current: u64,
    pub total: u64,
    pub message: String,
}

#[derive(Debug, Default)]
struct JobBody {
    status: JobStatus,
    progress: JobProgress,
    result: Option<Value>,
    error: Option<String>,
    started_at: Option<f64>,
    completed_at: Option<f64>,
}

/// One tracked operation. Transitions are monotone
/// (`pending → running → completed | failed`); calls that would regress a
/// terminal record are ignored.
#[derive(Debug)]
pub struct JobRecord {
    pub job_id: String,
    pub operation: String,
    pub created_at: f64,
    body: Mutex<JobBody>,
}

/// Snapshot handed to pollers. Absent result/error serialize as `null` so
/// clients always see consistent keys.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub operation: String,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: f64,
    pub started_at: Option<f64>,
    pub completed_at: Option<f64>,
}

impl JobRecord {
    fn new(job_id: String, operation: String) -> Self {
        JobRecord {
            job_id,
            operation,
            created_at: unix_time(),
            body: Mutex::new(JobBody::default()),
        }
    }

    pub fn status(&self) -> JobStatus {
        self.body
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    pub fn start(&self) {
        let mut body = self.body.lock().unwrap_or_else(PoisonError::into_inner);
        if body.status == JobStatus::Pending {
            body.status = JobStatus::Running;
            body.started_at = Some(unix_time());
        }
    }

    pub fn complete(&self, result: Value) {
        let mut body = self.body.lock().unwrap_or_else(PoisonError::into_inner);
        if !body.status.is_terminal() {
            body.status = JobStatus::Completed;
            body.completed_at = Some(unix_time());
            body.result = Some(result);
        }
    }

    pub fn fail(&self, error: impl Into<String>) {
        let mut body = self.body.lock().unwrap_or_else(PoisonError::into_inner);
        if !body.status.is_terminal() {
            body.status = JobStatus::Failed;
            body.completed_at = Some(unix_time());
            body.error = Some(error.into());
        }
    }

    /// A `(current, total, message)` sink that mutates this job's progress
    /// fields; safe to call from any thread.
    pub fn progress_sink(self: &Arc<Self>) -> ProgressSink {
        let job = Arc::clone(self);
        Arc::new(move |current, total, message| {
            let mut body = job.body.lock().unwrap_or_else(PoisonError::into_inner);
            body.progress.current = current;
            body.progress.total = total;
            body.progress.message = message.to_string();
        })
    }

    pub fn view(&self) -> JobView {
        let body = self.body.lock().unwrap_or_else(PoisonError::into_inner);
        JobView {
            job_id: self.job_id.clone(),
            operation: self.operation.clone(),
            status: body.status,
            progress: body.progress.clone(),
            result: body.result.clone(),
            error: body.error.clone(),
            created_at: self.created_at,
            started_at: body.started_at,
            completed_at: body.completed_at,
        }
    }
}

/// Bounded table of job records, insertion-ordered (== `created_at` order).
pub struct JobRegistry {
    jobs: Mutex<Vec<Arc<JobRecord>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        JobRegistry {
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Create a new pending job and prune terminal overflow.
    pub fn create(&self, operation: &str) -> Arc<JobRecord> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);

        let mut job_id = short_id();
        while jobs.iter().any(|j| j.job_id == job_id) {
            job_id = short_id();
        }

        let job = Arc::new(JobRecord::new(job_id, operation.to_string()));
        jobs.push(Arc::clone(&job));
        Self::prune(&mut jobs);
        job
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<JobRecord>> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.iter().find(|j| j.job_id == job_id).cloned()
    }

    pub fn list(&self) -> Vec<JobView> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.iter().map(|j| j.view()).collect()
    }

    /// Drop the oldest terminal records while over `MAX_JOBS`. Pending and
    /// running jobs are never evicted, so the table can temporarily exceed
    /// the cap until something finishes.
    fn prune(jobs: &mut Vec<Arc<JobRecord>>) {
        while jobs.len() > MAX_JOBS {
            let oldest_terminal = jobs.iter().position(|j| j.status().is_terminal());
            match oldest_terminal {
                Some(index) => {
                    jobs.remove(index);
                }
                None => break,
            }
        }
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Short opaque job id: the lowercase random tail of a ULID.
fn short_id() -> String {
    let ulid = Ulid::new().to_string().to_lowercase();
    ulid[ulid.len() - 8..].to_string()
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_starts_pending_with_timestamps() {
        let registry = JobRegistry::new();
        let job = registry.create("install");
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.job_id.len(), 8);

        let view = job.view();
        assert_eq!(view.operation, "install");
        assert!(view.started_at.is_none());
        assert!(view.completed_at.is_none());
        assert!(view.result.is_none());
    }

    #[test]
    fn lifecycle_transitions_are_monotone() {
        let registry = JobRegistry::new();
        let job = registry.create("update_comfyui");

        job.start();
        assert_eq!(job.status(), JobStatus::Running);
        assert_eq!(job.status().as_str(), "running");
        job.complete(json!({"ok": true}));
        assert_eq!(job.status(), JobStatus::Completed);

        // Terminal records ignore further transitions.
        job.fail("too late");
        assert_eq!(job.status(), JobStatus::Completed);
        assert!(job.view().error.is_none());

        let view = job.view();
        let (created, started, completed) = (
            view.created_at,
            view.started_at.unwrap(),
            view.completed_at.unwrap(),
        );
        assert!(created <= started && started <= completed);
    }

    #[test]
    fn failed_jobs_keep_the_error_string() {
        let registry = JobRegistry::new();
        let job = registry.create("install_nodes");
        job.start();
        job.fail("clone failed");
        let view = job.view();
        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error.as_deref(), Some("clone failed"));
    }

    #[test]
    fn progress_sink_updates_from_another_thread() {
        let registry = JobRegistry::new();
        let job = registry.create("download_models");
        let sink = job.progress_sink();

        std::thread::spawn(move || sink(3, 10, "downloading..."))
            .join()
            .unwrap();

        let view = job.view();
        assert_eq!(view.progress.current, 3);
        assert_eq!(view.progress.total, 10);
        assert_eq!(view.progress.message, "downloading...");
    }

    #[test]
    fn ids_stay_unique() {
        let registry = JobRegistry::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let job = registry.create("op");
            // Keep records terminal so pruning can't mask duplicates.
            job.start();
            job.complete(json!(null));
            assert!(seen.insert(job.job_id.clone()), "duplicate {}", job.job_id);
        }
    }

    #[test]
    fn prune_evicts_oldest_terminal_first() {
        let registry = JobRegistry::new();
        let first = registry.create("a");
        first.start();
        first.complete(json!(1));
        let second = registry.create("b");
        second.start();
        second.complete(json!(2));

        for _ in 0..MAX_JOBS - 1 {
            registry.create("filler");
        }

        // 101 records, one over cap: only the oldest terminal goes.
        assert_eq!(registry.list().len(), MAX_JOBS);
        assert!(registry.get(&first.job_id).is_none());
        assert!(registry.get(&second.job_id).is_some());
    }

    #[test]
    fn prune_never_evicts_in_flight_jobs() {
        let registry = JobRegistry::new();
        let mut pending = Vec::new();
        for _ in 0..MAX_JOBS + 5 {
            pending.push(registry.create("busy"));
        }
        // No terminal record exists, so the table exceeds the cap.
        assert_eq!(registry.list().len(), MAX_JOBS + 5);
        for job in &pending {
            assert!(registry.get(&job.job_id).is_some());
        }
    }
}
