//! Runs scan jobs: import, analysis, clustering and geocoding, one job at a
//! time, with progress published through the [`JobTracker`].

use rayon::prelude::*;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::discovery::discover_images;
use super::job::{GlobalStatus, JobControlError, JobKind, JobStatus, JobTracker, ScanJob, ScanPhase};
use super::pipeline::{Analyzer, PhotoOutcome};
use crate::clustering::ClusteringEngine;
use crate::config::Config;
use crate::db::{Database, NewPhoto, PendingPhoto, PlaceRecord};
use crate::error::{PipelineError, PipelineResult};
use crate::geocode::{valid_coordinates, Geocoder, Place};
use crate::imaging::extract_metadata;
use crate::index::VectorIndexStore;
use crate::inference::DetectorPool;

/// Photos looked up per geocoding pass
const GEOCODE_LIMIT: usize = 1000;

enum Work {
    Scan { folder: PathBuf, recursive: bool },
    FaceRescan,
}

#[derive(Debug, Default)]
struct Totals {
    analyzed: usize,
    faces: usize,
}

struct Shared {
    config: Config,
    db: Arc<Database>,
    index: Arc<VectorIndexStore>,
    pool: Arc<DetectorPool>,
    geocoder: Arc<dyn Geocoder>,
    tracker: JobTracker,
    clustering: ClusteringEngine,
}

/// Cheap to clone; clones share the job slot
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        db: Arc<Database>,
        index: Arc<VectorIndexStore>,
        pool: Arc<DetectorPool>,
        geocoder: Arc<dyn Geocoder>,
    ) -> Self {
        let clustering = ClusteringEngine::new(config.clustering.clone());
        Self {
            shared: Arc::new(Shared {
                config,
                db,
                index,
                pool,
                geocoder,
                tracker: JobTracker::new(),
                clustering,
            }),
        }
    }

    /// Start a scan of `folder` in the background and return its job id
    pub fn start_scan(&self, folder: &Path, recursive: bool) -> Result<String, JobControlError> {
        let (job, folder) = self.shared.begin_scan(folder)?;
        let id = job.id.clone();
        let shared = Arc::clone(&self.shared);
        std::thread::spawn(move || shared.execute(job, Work::Scan { folder, recursive }));
        Ok(id)
    }

    /// Scan `folder` on the calling thread and return the finished job
    pub fn run_scan(&self, folder: &Path, recursive: bool) -> Result<ScanJob, JobControlError> {
        let (job, folder) = self.shared.begin_scan(folder)?;
        Ok(self.shared.execute(job, Work::Scan { folder, recursive }))
    }

    /// Re-detect faces on every imported photo in the background
    pub fn start_face_rescan(&self) -> Result<String, JobControlError> {
        let job = self.shared.begin(JobKind::FaceRescan, None)?;
        let id = job.id.clone();
        let shared = Arc::clone(&self.shared);
        std::thread::spawn(move || shared.execute(job, Work::FaceRescan));
        Ok(id)
    }

    pub fn run_face_rescan(&self) -> Result<ScanJob, JobControlError> {
        let job = self.shared.begin(JobKind::FaceRescan, None)?;
        Ok(self.shared.execute(job, Work::FaceRescan))
    }

    /// Request a pause. The job stops at its next batch boundary.
    pub fn pause(&self, job_id: &str) -> Result<ScanJob, JobControlError> {
        let job = self.shared.tracker.request_pause(job_id)?;
        info!(job_id, "Pause requested");
        Ok(job)
    }

    pub fn resume(&self, job_id: &str) -> Result<ScanJob, JobControlError> {
        let job = self.shared.tracker.resume(job_id)?;
        info!(job_id, "Resumed");
        Ok(job)
    }

    pub fn get_job_status(&self, job_id: &str) -> Result<ScanJob, JobControlError> {
        self.shared
            .tracker
            .snapshot(job_id)
            .ok_or_else(|| JobControlError::NotFound(job_id.to_string()))
    }

    pub fn get_global_status(&self) -> GlobalStatus {
        self.shared.tracker.global()
    }
}

impl Shared {
    fn begin_scan(&self, folder: &Path) -> Result<(ScanJob, PathBuf), JobControlError> {
        let folder = folder
            .canonicalize()
            .ok()
            .filter(|f| f.is_dir())
            .ok_or_else(|| JobControlError::InvalidFolder(folder.to_path_buf()))?;
        let job = self.begin(JobKind::Scan, Some(folder.clone()))?;
        Ok((job, folder))
    }

    fn begin(&self, kind: JobKind, folder: Option<PathBuf>) -> Result<ScanJob, JobControlError> {
        let job = self.tracker.start(kind, folder)?;
        self.mirror(&job);
        info!(job_id = %job.id, kind = kind.as_str(), "Job started");
        Ok(job)
    }

    fn execute(&self, job: ScanJob, work: Work) -> ScanJob {
        // A panic must still release the job slot
        let result = panic::catch_unwind(AssertUnwindSafe(|| match work {
            Work::Scan { folder, recursive } => self.scan(&job.id, &folder, recursive),
            Work::FaceRescan => self.face_rescan(&job.id),
        }))
        .unwrap_or_else(|payload| Err(PipelineError::Panicked(panic_message(payload.as_ref()))));

        if let Err(e) = &result {
            error!(job_id = %job.id, error = %e, "Job failed");
        }
        let finished = self
            .tracker
            .finish(&job.id, result.map_err(|e| e.to_string()))
            .unwrap_or(job);
        self.mirror(&finished);
        info!(job_id = %finished.id, status = %finished.status, message = %finished.message, "Job finished");
        finished
    }

    fn scan(&self, job_id: &str, folder: &Path, recursive: bool) -> PipelineResult<String> {
        let photo_ids = self.import(job_id, folder, recursive)?;
        let pending = self.db.pending_analysis(&photo_ids)?;
        self.update(job_id, |job| {
            job.phase = ScanPhase::Analysis;
            job.status = JobStatus::Indexing;
            job.total = pending.len();
            job.processed = 0;
            job.message = format!("Analyzing {} photos", pending.len());
        });

        let totals = self.analyze(job_id, &pending, false, 0.5)?;
        self.cluster(job_id, totals.faces)?;
        self.geocode(job_id)?;
        self.summary(job_id, &totals)
    }

    fn face_rescan(&self, job_id: &str) -> PipelineResult<String> {
        let photos = self.db.analyzable_photos()?;
        self.update(job_id, |job| {
            job.total = photos.len();
            job.message = format!("Re-detecting faces on {} photos", photos.len());
        });

        let totals = self.analyze(job_id, &photos, true, 0.0)?;
        self.cluster(job_id, totals.faces)?;
        self.summary(job_id, &totals)
    }

    /// Discover files and upsert their rows. Returns the ids of every photo
    /// found, new or not.
    fn import(&self, job_id: &str, folder: &Path, recursive: bool) -> PipelineResult<Vec<i64>> {
        let files = discover_images(folder, recursive, &self.config.scanner.image_extensions)
            .map_err(PipelineError::Discovery)?;
        info!(job_id, folder = %folder.display(), files = files.len(), "Importing");
        self.update(job_id, |job| {
            job.total = files.len();
            job.message = format!("Importing {} files", files.len());
        });

        let mut photo_ids = Vec::with_capacity(files.len());
        let mut done = 0;
        for batch in files.chunks(self.batch_size()) {
            let mut failures = Vec::new();
            for path in batch {
                match extract_metadata(path) {
                    Ok(metadata) => {
                        if let Some(header_error) = &metadata.header_error {
                            failures.push(format!("{}: {}", path.display(), header_error));
                        }
                        let photo = new_photo(path, metadata);
                        let (id, inserted) = self.db.upsert_photo(&photo)?;
                        if !inserted {
                            debug!(path = %path.display(), "Already imported");
                        }
                        photo_ids.push(id);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Could not read file");
                        failures.push(format!("{}: {:#}", path.display(), e));
                    }
                }
            }

            done += batch.len();
            let total = files.len();
            self.update(job_id, |job| {
                for failure in failures {
                    job.record_failure(failure);
                }
                job.processed = done;
                job.set_progress(0.5 * done as f64 / total as f64);
                job.message = format!("Imported {}/{} files", done, total);
            });
        }

        Ok(photo_ids)
    }

    /// Analyze `photos` in batches on a worker pool. Progress runs from
    /// `start` to 1.0.
    fn analyze(&self, job_id: &str, photos: &[PendingPhoto], faces_only: bool, start: f64) -> PipelineResult<Totals> {
        let mut totals = Totals::default();
        if photos.is_empty() {
            return Ok(totals);
        }

        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.scanner.worker_count())
            .thread_name(|i| format!("photosense-worker-{}", i))
            .build()?;
        let analyzer = Analyzer {
            db: &self.db,
            index: &self.index,
            pool: &self.pool,
            caption_model: &self.config.caption.model,
            embedding_model: &self.config.models.clip_visual,
        };

        let mut done = 0;
        for batch in photos.chunks(self.batch_size()) {
            let results: Vec<(&PendingPhoto, std::thread::Result<PipelineResult<PhotoOutcome>>)> =
                workers.install(|| {
                    batch
                        .par_iter()
                        .map(|photo| {
                            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                                if faces_only {
                                    analyzer.rescan_faces(photo)
                                } else {
                                    analyzer.analyze(photo)
                                }
                            }));
                            (photo, outcome)
                        })
                        .collect()
                });

            let mut failures = Vec::new();
            let mut store_error = None;
            for (photo, result) in results {
                match result {
                    Ok(Ok(outcome)) => {
                        if let PhotoOutcome::Analyzed { faces, .. } | PhotoOutcome::StagesFailed { faces, .. } =
                            &outcome
                        {
                            totals.analyzed += 1;
                            totals.faces += faces;
                        }
                        if let Some(failure) = outcome.failure() {
                            failures.push(format!("{}: {}", photo.path, failure));
                        }
                    }
                    Ok(Err(e)) => {
                        store_error.get_or_insert(e);
                    }
                    Err(payload) => {
                        let reason = format!("worker panicked: {}", panic_message(payload.as_ref()));
                        error!(photo_id = photo.id, path = %photo.path, error = %reason, "Photo analysis panicked");
                        if let Err(e) = self.db.record_analysis_error(photo.id, &reason) {
                            warn!(photo_id = photo.id, error = %e, "Could not record failure");
                        }
                        failures.push(format!("{}: {}", photo.path, reason));
                    }
                }
            }

            // Whatever this batch managed to queue is still made durable
            let flushed = self.index.flush_all();
            if let Some(e) = store_error {
                if let Err(flush_error) = flushed {
                    warn!(error = %flush_error, "Index flush after store error failed");
                }
                return Err(e);
            }
            flushed?;

            done += batch.len();
            let total = photos.len();
            let warnings = self.pool.warnings();
            self.update(job_id, |job| {
                for failure in failures {
                    job.record_failure(failure);
                }
                for warning in warnings {
                    job.add_warning(warning);
                }
                job.processed = done;
                job.set_progress(start + (1.0 - start) * done as f64 / total as f64);
                job.message = format!("Analyzed {}/{} photos", done, total);
            });
            self.checkpoint(job_id);
        }

        Ok(totals)
    }

    fn cluster(&self, job_id: &str, new_faces: usize) -> PipelineResult<()> {
        if new_faces == 0 && self.db.statistics()?.faces == 0 {
            return Ok(());
        }

        self.update(job_id, |job| {
            job.phase = ScanPhase::Clustering;
            job.status = JobStatus::Indexing;
            job.message = "Clustering faces".to_string();
        });

        if let Err(e) = self.clustering.run(&self.db) {
            warn!(job_id, error = %e, "Face clustering skipped");
            self.update(job_id, |job| job.add_warning(format!("Face clustering failed: {}", e)));
        }
        Ok(())
    }

    /// Resolve places for photos with GPS and no place yet. Lookup failures
    /// leave the photo for a later scan.
    fn geocode(&self, job_id: &str) -> PipelineResult<()> {
        if !self.config.geocoding.enabled {
            return Ok(());
        }

        let photos = self.db.photos_needing_geocode(GEOCODE_LIMIT)?;
        if photos.is_empty() {
            return Ok(());
        }
        self.update(job_id, |job| job.message = format!("Geocoding {} photos", photos.len()));

        let mut resolved = 0;
        for &(photo_id, latitude, longitude) in &photos {
            let place = if valid_coordinates(latitude, longitude) {
                match self.geocoder.reverse(latitude, longitude) {
                    Ok(place) => place,
                    Err(e) => {
                        debug!(photo_id, error = %e, "Geocoding failed");
                        continue;
                    }
                }
            } else {
                Place::unresolved()
            };

            if place.is_resolved() {
                resolved += 1;
            }
            self.db.save_place(&PlaceRecord {
                photo_id,
                resolved: place.is_resolved(),
                city: place.city,
                region: place.region,
                country: place.country,
            })?;
        }

        info!(job_id, photos = photos.len(), resolved, "Geocoding complete");
        Ok(())
    }

    fn summary(&self, job_id: &str, totals: &Totals) -> PipelineResult<String> {
        let people = self
            .db
            .list_persons()?
            .iter()
            .filter(|p| p.face_count > 0)
            .count();
        let failed = self.tracker.snapshot(job_id).map_or(0, |j| j.failed);

        let mut message = format!(
            "Completed: {} photos analyzed, {} faces, {} people found",
            totals.analyzed, totals.faces, people
        );
        if failed > 0 {
            message.push_str(&format!(", {} failed", failed));
        }
        Ok(message)
    }

    fn batch_size(&self) -> usize {
        self.config.scanner.batch_size.max(1)
    }

    /// Apply `f` to the job and mirror the result into the store
    fn update(&self, job_id: &str, f: impl FnOnce(&mut ScanJob)) {
        if let Some(job) = self.tracker.update(job_id, f) {
            self.mirror(&job);
        }
    }

    fn checkpoint(&self, job_id: &str) {
        let paused = self.tracker.checkpoint(job_id, |job| {
            info!(job_id, processed = job.processed, total = job.total, "Paused");
            self.mirror(job);
        });
        if paused {
            // Back to the pre-pause status
            if let Some(job) = self.tracker.snapshot(job_id) {
                self.mirror(&job);
            }
        }
    }

    fn mirror(&self, job: &ScanJob) {
        if let Err(e) = self.db.save_job(&job.to_record()) {
            warn!(job_id = %job.id, error = %e, "Could not save job record");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn new_photo(path: &Path, metadata: crate::imaging::PhotoMetadata) -> NewPhoto {
    let (width, height) = metadata.oriented_dimensions().unzip();
    NewPhoto {
        path: path.to_string_lossy().to_string(),
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        directory: path
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default(),
        size_bytes: metadata.size_bytes,
        modified_at: metadata.modified_at,
        width,
        height,
        camera_make: metadata.camera_make,
        camera_model: metadata.camera_model,
        captured_at: metadata.captured_at,
        gps_latitude: metadata.gps_latitude,
        gps_longitude: metadata.gps_longitude,
        decode_error: metadata.header_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ProcessingStage;
    use crate::geocode::DisabledGeocoder;
    use crate::imaging::{Variant, VariantKind};
    use crate::index::IndexClass;
    use crate::inference::{Capability, CapabilityError, CapabilityKind, Detection, PoolBuilder};
    use crate::testing::{
        write_corrupt_jpeg, write_face_jpeg, FailingCapability, FakeFaceCapability, PanickingCapability,
        BLUE, GREEN, RED,
    };
    use std::time::{Duration, Instant};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        photos: PathBuf,
        db: Arc<Database>,
        index: Arc<VectorIndexStore>,
        orchestrator: Orchestrator,
    }

    fn face_pool() -> PoolBuilder {
        DetectorPool::builder().with_instance(Box::new(FakeFaceCapability))
    }

    fn fixture_with(geocoder: Arc<dyn Geocoder>, geocoding: bool) -> Fixture {
        build(geocoder, geocoding, |_| face_pool().build())
    }

    fn fixture_with_pool(pool: PoolBuilder) -> Fixture {
        build(Arc::new(DisabledGeocoder), false, |_| pool.build())
    }

    fn build(
        geocoder: Arc<dyn Geocoder>,
        geocoding: bool,
        pool: impl FnOnce(Arc<Database>) -> DetectorPool,
    ) -> Fixture {
        let dir = tempdir().unwrap();
        let photos = dir.path().join("photos");
        std::fs::create_dir(&photos).unwrap();

        let mut config = Config::rooted_at(dir.path());
        config.scanner.batch_size = 2;
        config.scanner.workers = 2;
        config.geocoding.enabled = geocoding;

        let db = Arc::new(Database::open_in_memory().unwrap());
        let index = Arc::new(VectorIndexStore::open(&config.index_dir, 16).unwrap());
        let pool = Arc::new(pool(Arc::clone(&db)));
        let orchestrator = Orchestrator::new(config, db.clone(), index.clone(), pool, geocoder);
        Fixture {
            dir,
            photos,
            db,
            index,
            orchestrator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(DisabledGeocoder), false)
    }

    fn wait_for(orchestrator: &Orchestrator, job_id: &str, status: JobStatus) -> ScanJob {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let job = orchestrator.get_job_status(job_id).unwrap();
            if job.status == status || Instant::now() > deadline {
                return job;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_scan_imports_analyzes_and_clusters() {
        let f = fixture();
        write_face_jpeg(&f.photos.join("a.jpg"), &[RED, GREEN]);
        write_face_jpeg(&f.photos.join("b.jpg"), &[RED, GREEN]);
        write_face_jpeg(&f.photos.join("c.jpg"), &[BLUE]);
        write_corrupt_jpeg(&f.photos.join("broken.jpg"));

        let job = f.orchestrator.run_scan(&f.photos, true).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 1.0);
        assert_eq!(job.failed, 1);
        assert_eq!(
            job.message,
            "Completed: 3 photos analyzed, 5 faces, 2 people found, 1 failed"
        );

        assert_eq!(f.index.len(IndexClass::Face).unwrap(), 5);
        let record = f.db.get_job(&job.id).unwrap().unwrap();
        assert_eq!(record.status, "completed");

        let stats = f.db.statistics().unwrap();
        assert_eq!(stats.photos, 4);
        assert_eq!(stats.failed_photos, 1);
        assert_eq!(stats.unassigned_faces, 1);
    }

    #[test]
    fn test_rescan_of_same_folder_is_idempotent() {
        let f = fixture();
        write_face_jpeg(&f.photos.join("a.jpg"), &[RED]);
        write_face_jpeg(&f.photos.join("b.jpg"), &[RED]);

        f.orchestrator.run_scan(&f.photos, true).unwrap();
        let faces_before = f.db.face_embedding_pairs().unwrap();

        let second = f.orchestrator.run_scan(&f.photos, true).unwrap();
        assert_eq!(second.status, JobStatus::Completed);
        assert!(second.message.starts_with("Completed: 0 photos analyzed"));
        assert_eq!(f.db.face_embedding_pairs().unwrap(), faces_before);
        assert_eq!(f.db.statistics().unwrap().photos, 2);
        assert_eq!(f.index.len(IndexClass::Face).unwrap(), 2);
    }

    #[test]
    fn test_invalid_folder_rejected() {
        let f = fixture();
        let err = f
            .orchestrator
            .start_scan(&f.dir.path().join("missing"), true)
            .unwrap_err();
        assert!(matches!(err, JobControlError::InvalidFolder(_)));
        assert_eq!(f.orchestrator.get_global_status().status, JobStatus::Idle);
    }

    #[test]
    fn test_pause_then_resume_completes() {
        let f = fixture();
        for i in 0..4 {
            write_face_jpeg(&f.photos.join(format!("{}.jpg", i)), &[RED]);
        }

        let (job, folder) = f.orchestrator.shared.begin_scan(&f.photos).unwrap();
        let job_id = job.id.clone();
        f.orchestrator.pause(&job_id).unwrap();

        let shared = Arc::clone(&f.orchestrator.shared);
        let handle = std::thread::spawn(move || {
            shared.execute(job, Work::Scan { folder, recursive: true })
        });

        let paused = wait_for(&f.orchestrator, &job_id, JobStatus::Paused);
        assert_eq!(paused.status, JobStatus::Paused);
        assert_eq!(paused.message, "Paused (2/4)");
        assert_eq!(f.db.get_job(&job_id).unwrap().unwrap().status, "paused");
        assert!(matches!(
            f.orchestrator.start_face_rescan(),
            Err(JobControlError::AlreadyRunning(_))
        ));

        f.orchestrator.resume(&job_id).unwrap();
        let finished = handle.join().unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(f.db.statistics().unwrap().faces, 4);
    }

    #[test]
    fn test_face_rescan_keeps_stage_and_reindexes() {
        let f = fixture();
        write_face_jpeg(&f.photos.join("a.jpg"), &[RED, GREEN]);
        f.orchestrator.run_scan(&f.photos, true).unwrap();
        let before = f.index.ids(IndexClass::Face).unwrap();

        let job = f.orchestrator.run_face_rescan().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.kind, JobKind::FaceRescan);

        let after = f.index.ids(IndexClass::Face).unwrap();
        assert_eq!(after.len(), 2);
        assert!(before.iter().all(|id| !after.contains(id)));
        let photo = f.db.list_photos().unwrap().remove(0);
        assert_eq!(photo.stage, ProcessingStage::Full);
    }

    struct FixedGeocoder;

    impl Geocoder for FixedGeocoder {
        fn reverse(&self, _latitude: f64, _longitude: f64) -> anyhow::Result<Place> {
            Ok(Place {
                city: Some("Lisbon".into()),
                region: None,
                country: Some("Portugal".into()),
            })
        }
    }

    #[test]
    fn test_geocoding_pass_saves_places() {
        let f = fixture_with(Arc::new(FixedGeocoder), true);
        let (id, _) = f
            .db
            .upsert_photo(&NewPhoto {
                path: "/elsewhere/gps.jpg".into(),
                gps_latitude: Some(38.7),
                gps_longitude: Some(-9.1),
                ..Default::default()
            })
            .unwrap();
        let (bad, _) = f
            .db
            .upsert_photo(&NewPhoto {
                path: "/elsewhere/bad-gps.jpg".into(),
                gps_latitude: Some(120.0),
                gps_longitude: Some(0.0),
                ..Default::default()
            })
            .unwrap();

        f.orchestrator.run_scan(&f.photos, true).unwrap();

        let place = f.db.place_for_photo(id).unwrap().unwrap();
        assert_eq!(place.city.as_deref(), Some("Lisbon"));
        assert!(place.resolved);
        assert!(!f.db.place_for_photo(bad).unwrap().unwrap().resolved);
    }

    #[test]
    fn test_failed_stage_counted_per_photo() {
        let f = fixture_with_pool(
            face_pool().with_instance(Box::new(FailingCapability(CapabilityKind::Scene))),
        );
        write_face_jpeg(&f.photos.join("a.jpg"), &[RED]);
        write_face_jpeg(&f.photos.join("b.jpg"), &[RED]);

        let job = f.orchestrator.run_scan(&f.photos, true).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.failed, 2);
        assert_eq!(job.sample_errors.len(), 2);
        assert!(job
            .sample_errors
            .iter()
            .all(|e| e.ends_with("scene inference failed: synthetic failure")));
        assert_eq!(
            job.message,
            "Completed: 2 photos analyzed, 2 faces, 1 people found, 2 failed"
        );

        for photo in f.db.list_photos().unwrap() {
            assert_eq!(photo.stage, ProcessingStage::Basic);
            assert!(photo.analysis_error.is_some());
        }
    }

    #[test]
    fn test_panicking_capability_fails_photos_not_job() {
        let f = fixture_with_pool(
            face_pool().with_instance(Box::new(PanickingCapability(CapabilityKind::Scene))),
        );
        write_face_jpeg(&f.photos.join("a.jpg"), &[RED]);
        write_face_jpeg(&f.photos.join("b.jpg"), &[GREEN]);

        let job = f.orchestrator.run_scan(&f.photos, true).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.failed, 2);
        assert!(job
            .sample_errors
            .iter()
            .any(|e| e.ends_with("worker panicked: scene model crashed")));

        // The slot is free again
        let next = f.orchestrator.run_face_rescan().unwrap();
        assert_eq!(next.status, JobStatus::Completed);
    }

    struct PanickingGeocoder;

    impl Geocoder for PanickingGeocoder {
        fn reverse(&self, _latitude: f64, _longitude: f64) -> anyhow::Result<Place> {
            panic!("geocoder down")
        }
    }

    #[test]
    fn test_panic_in_job_thread_ends_job_with_error() {
        let f = fixture_with(Arc::new(PanickingGeocoder), true);
        f.db.upsert_photo(&NewPhoto {
            path: "/elsewhere/gps.jpg".into(),
            gps_latitude: Some(38.7),
            gps_longitude: Some(-9.1),
            ..Default::default()
        })
        .unwrap();

        let job_id = f.orchestrator.start_scan(&f.photos, true).unwrap();
        let job = wait_for(&f.orchestrator, &job_id, JobStatus::Error);
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("worker panicked: geocoder down"));
        assert_eq!(f.db.get_job(&job_id).unwrap().unwrap().status, "error");

        assert!(f.orchestrator.start_face_rescan().is_ok());
    }

    /// Face detector that breaks the faces table on its third call, which
    /// is the first photo of the second batch
    struct BreaksStore {
        db: Arc<Database>,
        calls: usize,
    }

    impl Capability for BreaksStore {
        fn kind(&self) -> CapabilityKind {
            CapabilityKind::Face
        }

        fn variant(&self) -> VariantKind {
            FakeFaceCapability.variant()
        }

        fn detect(&mut self, variant: &Variant) -> Result<Vec<Detection>, CapabilityError> {
            self.calls += 1;
            if self.calls == 3 {
                self.db
                    .conn()
                    .unwrap()
                    .execute("ALTER TABLE faces RENAME TO faces_gone", [])
                    .unwrap();
            }
            FakeFaceCapability.detect(variant)
        }
    }

    #[test]
    fn test_store_failure_ends_job_keeping_flushed_batches() {
        let f = build(Arc::new(DisabledGeocoder), false, |db| {
            DetectorPool::builder()
                .with_instance(Box::new(BreaksStore { db, calls: 0 }))
                .build()
        });
        for i in 0..4 {
            write_face_jpeg(&f.photos.join(format!("{}.jpg", i)), &[RED]);
        }

        let job = f.orchestrator.run_scan(&f.photos, true).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error.as_deref().unwrap().contains("faces"));
        assert_eq!(job.processed, 2);
        assert_eq!(f.db.get_job(&job.id).unwrap().unwrap().status, "error");

        let stages: Vec<ProcessingStage> = f.db.list_photos().unwrap().iter().map(|p| p.stage).collect();
        assert_eq!(stages.iter().filter(|s| **s == ProcessingStage::Full).count(), 2);
        assert_eq!(stages.iter().filter(|s| **s == ProcessingStage::Unprocessed).count(), 2);

        // The first batch is on disk
        let reopened = VectorIndexStore::open(&Config::rooted_at(f.dir.path()).index_dir, 4).unwrap();
        assert_eq!(reopened.len(IndexClass::Face).unwrap(), 2);
    }
}
