//! Scan job bookkeeping.
//!
//! The tracker is the only state shared between a running job and the
//! callers polling it. Readers always get a cloned snapshot.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::db::{now_timestamp, JobRecord};

const MAX_SAMPLE_ERRORS: usize = 5;
const MAX_PREVIOUS_JOBS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Idle,
    Scanning,
    Indexing,
    Completed,
    Error,
    Paused,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Scanning => "scanning",
            JobStatus::Indexing => "indexing",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Paused => "paused",
        }
    }

    /// Still holding the single job slot
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Scanning | JobStatus::Indexing | JobStatus::Paused)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Import,
    Analysis,
    Clustering,
}

impl ScanPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanPhase::Import => "import",
            ScanPhase::Analysis => "analysis",
            ScanPhase::Clustering => "clustering",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Scan,
    FaceRescan,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Scan => "scan",
            JobKind::FaceRescan => "face-rescan",
        }
    }
}

/// A scan job as seen by pollers
#[derive(Debug, Clone, PartialEq)]
pub struct ScanJob {
    pub id: String,
    pub kind: JobKind,
    pub folder: Option<PathBuf>,
    pub status: JobStatus,
    pub phase: ScanPhase,
    /// 0.0 to 1.0
    pub progress: f64,
    pub message: String,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub sample_errors: Vec<String>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

impl ScanJob {
    fn new(kind: JobKind, folder: Option<PathBuf>) -> Self {
        let (status, phase) = match kind {
            JobKind::Scan => (JobStatus::Scanning, ScanPhase::Import),
            JobKind::FaceRescan => (JobStatus::Indexing, ScanPhase::Analysis),
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            folder,
            status,
            phase,
            progress: 0.0,
            message: "Starting".to_string(),
            total: 0,
            processed: 0,
            failed: 0,
            sample_errors: Vec::new(),
            warnings: Vec::new(),
            error: None,
            started_at: now_timestamp(),
            finished_at: None,
        }
    }

    /// Count a failed photo, keeping the first few messages
    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.failed += 1;
        if self.sample_errors.len() < MAX_SAMPLE_ERRORS {
            self.sample_errors.push(message.into());
        }
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }

    pub fn set_progress(&mut self, progress: f64) {
        self.progress = progress.clamp(0.0, 1.0);
    }

    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            id: self.id.clone(),
            kind: self.kind.as_str().to_string(),
            folder: self.folder.as_ref().map(|f| f.to_string_lossy().to_string()),
            status: self.status.as_str().to_string(),
            phase: self.phase.as_str().to_string(),
            progress: self.progress,
            message: self.error.clone().unwrap_or_else(|| self.message.clone()),
            total: self.total as i64,
            processed: self.processed as i64,
            failed: self.failed as i64,
            started_at: self.started_at.clone(),
            finished_at: self.finished_at.clone(),
        }
    }
}

/// What `get_global_status` reports
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalStatus {
    pub status: JobStatus,
    pub total_photos: usize,
    pub scanned_photos: usize,
    /// 0.0 to 100.0
    pub progress_percent: f64,
    pub phase: Option<ScanPhase>,
    /// The running job, or the last one to finish
    pub current_job_id: Option<String>,
}

impl GlobalStatus {
    fn idle() -> Self {
        Self {
            status: JobStatus::Idle,
            total_photos: 0,
            scanned_photos: 0,
            progress_percent: 0.0,
            phase: None,
            current_job_id: None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobControlError {
    #[error("job {0} is already running")]
    AlreadyRunning(String),

    #[error("no job with id {0}")]
    NotFound(String),

    #[error("job {job_id} is {status}")]
    InvalidState { job_id: String, status: JobStatus },

    #[error("not a directory: {}", .0.display())]
    InvalidFolder(PathBuf),
}

#[derive(Default)]
struct TrackerState {
    current: Option<ScanJob>,
    previous: VecDeque<ScanJob>,
    pause_requested: bool,
}

/// Owns the single job slot
#[derive(Default)]
pub struct JobTracker {
    state: Mutex<TrackerState>,
    resumed: Condvar,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        // Job state stays readable even if a worker panicked mid-update
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the job slot. Fails while another job is active.
    pub fn start(&self, kind: JobKind, folder: Option<PathBuf>) -> Result<ScanJob, JobControlError> {
        let mut state = self.state();
        if let Some(current) = state.current.as_ref().filter(|j| j.status.is_active()) {
            return Err(JobControlError::AlreadyRunning(current.id.clone()));
        }

        if let Some(done) = state.current.take() {
            state.previous.push_front(done);
            state.previous.truncate(MAX_PREVIOUS_JOBS);
        }
        let job = ScanJob::new(kind, folder);
        state.current = Some(job.clone());
        state.pause_requested = false;
        Ok(job)
    }

    /// Apply `f` to the job if it is the current one and return the result
    pub fn update(&self, job_id: &str, f: impl FnOnce(&mut ScanJob)) -> Option<ScanJob> {
        let mut state = self.state();
        let job = state.current.as_mut().filter(|j| j.id == job_id)?;
        f(job);
        Some(job.clone())
    }

    pub fn snapshot(&self, job_id: &str) -> Option<ScanJob> {
        let state = self.state();
        state
            .current
            .iter()
            .chain(state.previous.iter())
            .find(|j| j.id == job_id)
            .cloned()
    }

    pub fn global(&self) -> GlobalStatus {
        let state = self.state();
        match &state.current {
            Some(job) => GlobalStatus {
                status: job.status,
                total_photos: job.total,
                scanned_photos: job.processed,
                progress_percent: (job.progress * 1000.0).round() / 10.0,
                phase: Some(job.phase),
                current_job_id: Some(job.id.clone()),
            },
            None => GlobalStatus::idle(),
        }
    }

    /// Ask the running job to pause at its next batch boundary
    pub fn request_pause(&self, job_id: &str) -> Result<ScanJob, JobControlError> {
        let mut state = self.state();
        let job = Self::current_mut(&mut state, job_id)?;
        if !job.status.is_active() {
            return Err(JobControlError::InvalidState {
                job_id: job_id.to_string(),
                status: job.status,
            });
        }
        let job = job.clone();
        state.pause_requested = true;
        Ok(job)
    }

    pub fn resume(&self, job_id: &str) -> Result<ScanJob, JobControlError> {
        let mut state = self.state();
        let paused = state.pause_requested;
        let job = Self::current_mut(&mut state, job_id)?;
        if !paused && job.status != JobStatus::Paused {
            return Err(JobControlError::InvalidState {
                job_id: job_id.to_string(),
                status: job.status,
            });
        }
        let job = job.clone();
        state.pause_requested = false;
        self.resumed.notify_all();
        Ok(job)
    }

    fn current_mut<'a>(state: &'a mut TrackerState, job_id: &str) -> Result<&'a mut ScanJob, JobControlError> {
        match state.current.as_mut() {
            Some(job) if job.id == job_id => Ok(job),
            _ if state.previous.iter().any(|j| j.id == job_id) => Err(JobControlError::InvalidState {
                job_id: job_id.to_string(),
                status: state
                    .previous
                    .iter()
                    .find(|j| j.id == job_id)
                    .map_or(JobStatus::Completed, |j| j.status),
            }),
            _ => Err(JobControlError::NotFound(job_id.to_string())),
        }
    }

    /// Called by the worker between batches. Blocks while a pause is
    /// pending. `on_pause` runs once with the job after it switches to
    /// Paused. Returns whether the job was paused.
    pub fn checkpoint(&self, job_id: &str, on_pause: impl FnOnce(&ScanJob)) -> bool {
        let mut state = self.state();
        if !state.pause_requested {
            return false;
        }

        let resume_to = match state.current.as_mut().filter(|j| j.id == job_id) {
            Some(job) => {
                let resume_to = job.status;
                job.status = JobStatus::Paused;
                job.message = format!("Paused ({}/{})", job.processed, job.total);
                on_pause(job);
                resume_to
            }
            None => return false,
        };

        while state.pause_requested {
            state = self
                .resumed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if let Some(job) = state.current.as_mut().filter(|j| j.id == job_id) {
            job.status = resume_to;
        }
        true
    }

    /// Move the job to a terminal state
    pub fn finish(&self, job_id: &str, result: Result<String, String>) -> Option<ScanJob> {
        self.update(job_id, |job| {
            match result {
                Ok(message) => {
                    job.status = JobStatus::Completed;
                    job.set_progress(1.0);
                    job.message = message;
                }
                Err(error) => {
                    job.status = JobStatus::Error;
                    job.message = format!("Failed: {}", error);
                    job.error = Some(error);
                }
            }
            job.finished_at = Some(now_timestamp());
        })
    }
}
