//! Folder scans and face-only rescans.

pub mod discovery;
pub mod job;
pub mod orchestrator;
pub mod pipeline;

pub use discovery::discover_images;
pub use job::{GlobalStatus, JobControlError, JobKind, JobStatus, JobTracker, ScanJob, ScanPhase};
pub use orchestrator::Orchestrator;
pub use pipeline::{Analyzer, PhotoOutcome};
