//! The facade every outer surface talks to.
//!
//! `Engine` owns the metadata store, the vector indices, the detector pool
//! and the scan orchestrator. Every operation that touches both stores goes
//! through here so their contents stay in step: rows change first, then the
//! matching index entries, then the affected classes are flushed.

use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clustering::{ClusteringEngine, ClusteringOutcome};
use crate::config::Config;
use crate::db::{
    Database, DeletedPhoto, MergeOutcome, ObjectDetection, OrphanRows, Person, Photo, PlaceSummary,
    SceneSummary, Statistics,
};
use crate::geocode::{DisabledGeocoder, Geocoder, NominatimGeocoder};
use crate::index::{IndexClass, IntegrityReport, SearchHit, VectorIndexStore};
use crate::inference::DetectorPool;
use crate::scan::{GlobalStatus, JobControlError, Orchestrator, ScanJob};

/// What a similarity search starts from
#[derive(Debug, Clone, PartialEq)]
pub enum SearchQuery {
    /// A raw embedding, searched as-is
    Vector(Vec<f32>),
    /// Free text, embedded with the text encoder and matched against photos
    Text(String),
    /// The stored embedding of a face
    Face(i64),
    /// The stored embedding of a pet detection
    Pet(i64),
    /// The stored whole-image embedding of a photo
    Photo(i64),
}

impl SearchQuery {
    /// The id to leave out of the results, for queries by stored item
    fn own_id(&self) -> Option<i64> {
        match self {
            SearchQuery::Face(id) | SearchQuery::Pet(id) | SearchQuery::Photo(id) => Some(*id),
            SearchQuery::Vector(_) | SearchQuery::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub orphan_persons: Vec<i64>,
    pub orphan_rows: OrphanRows,
    /// Index entries dropped because no row backs them, per class
    pub stale_entries: Vec<(IndexClass, usize)>,
    /// Photos whose file is gone. Reported, not deleted.
    pub missing_files: Vec<(i64, String)>,
}

impl CleanupReport {
    pub fn stale_total(&self) -> usize {
        self.stale_entries.iter().map(|(_, n)| n).sum()
    }
}

pub struct Engine {
    config: Config,
    db: Arc<Database>,
    index: Arc<VectorIndexStore>,
    pool: Arc<DetectorPool>,
    orchestrator: Orchestrator,
}

impl Engine {
    /// Open the stores named in `config` and wire the ONNX-backed pool
    pub fn open(config: Config) -> Result<Self> {
        if let Some(parent) = config.database_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let db = Database::open(&config.database_path)?;
        let index = VectorIndexStore::open(&config.index_dir, config.index.search_cache_size)?;
        let pool = DetectorPool::from_config(&config);
        let geocoder: Arc<dyn Geocoder> = if config.geocoding.enabled {
            Arc::new(NominatimGeocoder::new(&config.geocoding))
        } else {
            Arc::new(DisabledGeocoder)
        };

        Self::with_parts(config, Arc::new(db), Arc::new(index), Arc::new(pool), geocoder)
    }

    /// Assemble an engine from already opened parts. The indices are
    /// reconciled with the store before anything else runs.
    pub fn with_parts(
        config: Config,
        db: Arc<Database>,
        index: Arc<VectorIndexStore>,
        pool: Arc<DetectorPool>,
        geocoder: Arc<dyn Geocoder>,
    ) -> Result<Self> {
        reconcile_indices(&db, &index)?;
        let orchestrator = Orchestrator::new(
            config.clone(),
            Arc::clone(&db),
            Arc::clone(&index),
            Arc::clone(&pool),
            geocoder,
        );

        Ok(Self {
            config,
            db,
            index,
            pool,
            orchestrator,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn index(&self) -> &VectorIndexStore {
        &self.index
    }

    /// One line per capability that failed to load so far
    pub fn capability_warnings(&self) -> Vec<String> {
        self.pool.warnings()
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub fn start_scan(&self, folder: &Path, recursive: bool) -> Result<String, JobControlError> {
        self.orchestrator.start_scan(folder, recursive)
    }

    /// Blocking scan, for callers that have nothing else to do meanwhile
    pub fn run_scan(&self, folder: &Path, recursive: bool) -> Result<ScanJob, JobControlError> {
        self.orchestrator.run_scan(folder, recursive)
    }

    pub fn start_face_rescan(&self) -> Result<String, JobControlError> {
        self.orchestrator.start_face_rescan()
    }

    pub fn run_face_rescan(&self) -> Result<ScanJob, JobControlError> {
        self.orchestrator.run_face_rescan()
    }

    pub fn pause_scan(&self, job_id: &str) -> Result<ScanJob, JobControlError> {
        self.orchestrator.pause(job_id)
    }

    pub fn resume_scan(&self, job_id: &str) -> Result<ScanJob, JobControlError> {
        self.orchestrator.resume(job_id)
    }

    pub fn get_job_status(&self, job_id: &str) -> Result<ScanJob, JobControlError> {
        self.orchestrator.get_job_status(job_id)
    }

    pub fn get_global_status(&self) -> GlobalStatus {
        self.orchestrator.get_global_status()
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Nearest neighbours of `query` in `class`, best first. Queries by a
    /// stored item never return that item.
    pub fn search(&self, class: IndexClass, query: SearchQuery, k: usize) -> Result<Vec<SearchHit>> {
        let own_id = query.own_id();
        let vector = match query {
            SearchQuery::Vector(vector) => vector,
            SearchQuery::Text(text) => {
                if class != IndexClass::Image {
                    bail!("Text queries search the image index, not {}", class);
                }
                self.pool.embed_text(&text)?
            }
            SearchQuery::Face(id) => {
                expect_class(class, IndexClass::Face)?;
                self.db
                    .face_embedding(id)?
                    .ok_or_else(|| anyhow!("Face {} has no embedding", id))?
            }
            SearchQuery::Pet(id) => {
                expect_class(class, IndexClass::Pet)?;
                self.db
                    .pet_embedding(id)?
                    .ok_or_else(|| anyhow!("Object {} has no embedding", id))?
            }
            SearchQuery::Photo(id) => {
                expect_class(class, IndexClass::Image)?;
                self.db
                    .image_embedding(id)?
                    .ok_or_else(|| anyhow!("Photo {} has no image embedding", id))?
            }
        };

        let Some(own_id) = own_id else {
            return Ok(self.index.search(class, &vector, k)?);
        };
        let mut hits = self.index.search(class, &vector, k.saturating_add(1))?;
        hits.retain(|hit| hit.id != own_id);
        hits.truncate(k);
        Ok(hits)
    }

    // ========================================================================
    // People
    // ========================================================================

    pub fn get_person_list(&self) -> Result<Vec<Person>> {
        self.db.list_persons()
    }

    pub fn rename_person(&self, person_id: i64, name: &str) -> Result<bool> {
        self.db.rename_person(person_id, name)
    }

    pub fn merge_persons(&self, source_ids: &[i64], target_id: i64) -> Result<MergeOutcome> {
        let outcome = self.db.merge_persons(source_ids, target_id)?;
        info!(
            target = target_id,
            moved = outcome.moved_faces,
            removed = outcome.removed_persons.len(),
            "Merged persons"
        );
        Ok(outcome)
    }

    /// Delete a person. With `with_faces` their faces go too, and so do the
    /// face vectors. Returns `None` for an unknown person.
    pub fn delete_person(&self, person_id: i64, with_faces: bool) -> Result<Option<Vec<i64>>> {
        let Some(face_ids) = self.db.delete_person(person_id, with_faces)? else {
            return Ok(None);
        };
        if with_faces {
            for id in &face_ids {
                self.index.remove(IndexClass::Face, *id)?;
            }
            self.index.flush(&[IndexClass::Face])?;
        }
        Ok(Some(face_ids))
    }

    pub fn photos_of_person(&self, person_id: i64) -> Result<Vec<Photo>> {
        self.db.photos_of_person(person_id)
    }

    /// Move a face to `person_id`, or detach it with `None`. The choice
    /// survives later clustering passes. Returns false for an unknown face.
    pub fn assign_face(&self, face_id: i64, person_id: Option<i64>) -> Result<bool> {
        if let Some(person_id) = person_id {
            if self.db.get_person(person_id)?.is_none() {
                bail!("Person {} not found", person_id);
            }
        }
        self.db.assign_face(face_id, person_id)
    }

    /// Delete a single face and its vector. The person it belonged to stays
    /// until cleanup.
    pub fn delete_face(&self, face_id: i64) -> Result<bool> {
        if !self.db.delete_face(face_id)? {
            return Ok(false);
        }
        self.index.remove(IndexClass::Face, face_id)?;
        self.index.flush(&[IndexClass::Face])?;
        info!(face_id, "Deleted face");
        Ok(true)
    }

    // ========================================================================
    // Browsing
    // ========================================================================

    /// Object categories with the number of photos each appears in
    pub fn object_categories(&self) -> Result<Vec<(String, i64)>> {
        self.db.object_categories()
    }

    /// Detections of `category`, or of every category in a bare group
    pub fn objects_by_category(&self, category: &str) -> Result<Vec<ObjectDetection>> {
        self.db.objects_by_category(category)
    }

    pub fn scene_summary(&self) -> Result<Vec<SceneSummary>> {
        self.db.scene_summary()
    }

    pub fn photos_with_scene(&self, label: &str) -> Result<Vec<i64>> {
        self.db.photos_with_scene(label)
    }

    pub fn top_places(&self, limit: usize) -> Result<Vec<PlaceSummary>> {
        self.db.top_places(limit)
    }

    pub fn photos_at_place(&self, name: &str) -> Result<Vec<i64>> {
        self.db.photos_at_place(name)
    }

    /// Photos without GPS or whose coordinates did not resolve
    pub fn photos_without_place(&self) -> Result<Vec<i64>> {
        self.db.photos_without_place()
    }

    // ========================================================================
    // Photos and tags
    // ========================================================================

    pub fn delete_photo(&self, photo_id: i64) -> Result<Option<DeletedPhoto>> {
        let Some(deleted) = self.db.delete_photo(photo_id)? else {
            return Ok(None);
        };

        for id in &deleted.face_ids {
            self.index.remove(IndexClass::Face, *id)?;
        }
        for id in &deleted.pet_object_ids {
            self.index.remove(IndexClass::Pet, *id)?;
        }
        if deleted.had_image_embedding {
            self.index.remove(IndexClass::Image, photo_id)?;
        }
        self.index.flush_all()?;

        info!(photo_id, faces = deleted.face_ids.len(), "Deleted photo");
        Ok(Some(deleted))
    }

    pub fn add_tag(&self, photo_id: i64, tag: &str) -> Result<bool> {
        self.db.add_tag(photo_id, tag)
    }

    pub fn remove_tag(&self, photo_id: i64, tag: &str) -> Result<bool> {
        self.db.remove_tag(photo_id, tag)
    }

    pub fn tags(&self, photo_id: i64) -> Result<Vec<String>> {
        self.db.tags_for_photo(photo_id)
    }

    pub fn photos_with_tag(&self, tag: &str) -> Result<Vec<i64>> {
        self.db.photos_with_tag(tag)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Remove orphaned persons and rows, then drop index entries nothing
    /// backs any more
    pub fn cleanup(&self) -> Result<CleanupReport> {
        let orphan_persons = self.db.delete_orphan_persons()?;
        let orphan_rows = self.db.delete_orphan_rows()?;

        let mut stale_entries = Vec::new();
        for class in IndexClass::ALL {
            let expected: Vec<i64> = stored_embeddings(&self.db, class)?
                .into_iter()
                .map(|(id, _)| id)
                .collect();
            let report = self.index.check_integrity(class, &expected)?;
            for id in &report.stale {
                self.index.remove(class, *id)?;
            }
            if !report.stale.is_empty() {
                stale_entries.push((class, report.stale.len()));
            }
        }
        self.index.flush_all()?;

        let missing_files = self.db.missing_photo_files()?;
        if !missing_files.is_empty() {
            warn!(count = missing_files.len(), "Photos missing on disk");
        }

        let report = CleanupReport {
            orphan_persons,
            orphan_rows,
            stale_entries,
            missing_files,
        };
        info!(
            persons = report.orphan_persons.len(),
            stale = report.stale_total(),
            "Cleanup complete"
        );
        Ok(report)
    }

    /// Cluster every face again outside a scan. Refused while a job runs.
    pub fn recluster(&self) -> Result<ClusteringOutcome> {
        self.ensure_idle()?;
        let outcome = ClusteringEngine::new(self.config.clustering.clone()).run(&self.db)?;
        info!(
            faces = outcome.faces,
            clusters = outcome.clusters,
            created = outcome.created_persons.len(),
            "Reclustered faces"
        );
        Ok(outcome)
    }

    /// Rebuild one vector index from the stored embeddings. Refused while a
    /// job runs. Returns the number of vectors written.
    pub fn rebuild_index(&self, class: IndexClass) -> Result<usize> {
        self.ensure_idle()?;
        let entries = stored_embeddings(&self.db, class)?;
        Ok(self.index.rebuild(class, entries)?)
    }

    fn ensure_idle(&self) -> Result<()> {
        let status = self.get_global_status();
        if status.status.is_active() {
            bail!(
                "Job {} is {}; try again when it finishes",
                status.current_job_id.unwrap_or_default(),
                status.status
            );
        }
        Ok(())
    }

    pub fn statistics(&self) -> Result<Statistics> {
        self.db.statistics()
    }
}

fn expect_class(class: IndexClass, expected: IndexClass) -> Result<()> {
    if class != expected {
        bail!("A {} query cannot search the {} index", expected, class);
    }
    Ok(())
}

/// The rows that should back `class`
fn stored_embeddings(db: &Database, class: IndexClass) -> Result<Vec<(i64, Vec<f32>)>> {
    match class {
        IndexClass::Face => db.face_embedding_pairs(),
        IndexClass::Pet => db.pet_embeddings(),
        IndexClass::Image => db.image_embeddings(),
    }
}

/// Bring each index in line with the store. Any class that failed to load or
/// disagrees with its rows is rebuilt from them.
fn reconcile_indices(db: &Database, index: &VectorIndexStore) -> Result<Vec<(IndexClass, IntegrityReport)>> {
    let mut rebuilt = Vec::new();
    for class in IndexClass::ALL {
        let entries = stored_embeddings(db, class)?;
        let ids: Vec<i64> = entries.iter().map(|(id, _)| *id).collect();
        let report = index.check_integrity(class, &ids)?;
        if report.is_consistent() {
            continue;
        }

        warn!(
            class = %class,
            missing = report.missing.len(),
            stale = report.stale.len(),
            corrupt = report.corrupt,
            "Vector index out of step with metadata, rebuilding"
        );
        index.rebuild(class, entries)?;
        rebuilt.push((class, report));
    }
    Ok(rebuilt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PlaceRecord, ProcessingStage};
    use crate::inference::{CapabilityKind, Detection, PoolBuilder};
    use crate::scan::JobStatus;
    use crate::testing::{
        write_corrupt_jpeg, write_face_jpeg, FakeFaceCapability, FakeImageEmbedder, FakeTextEmbedder,
        StaticCapability, BLUE, GREEN, RED,
    };
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        photos: PathBuf,
        engine: Engine,
    }

    fn config(root: &Path) -> Config {
        let mut config = Config::rooted_at(root);
        config.scanner.batch_size = 3;
        config.scanner.workers = 2;
        config
    }

    fn open(dir: &TempDir, pool: PoolBuilder) -> Engine {
        let config = config(dir.path());
        std::fs::create_dir_all(&config.index_dir).unwrap();
        let db = Arc::new(Database::open(&config.database_path).unwrap());
        let index = Arc::new(VectorIndexStore::open(&config.index_dir, 16).unwrap());
        Engine::with_parts(config, db, index, Arc::new(pool.build()), Arc::new(DisabledGeocoder)).unwrap()
    }

    fn face_pool() -> PoolBuilder {
        DetectorPool::builder().with_instance(Box::new(FakeFaceCapability))
    }

    fn fixture(pool: PoolBuilder) -> Fixture {
        let dir = tempdir().unwrap();
        let photos = dir.path().join("photos");
        std::fs::create_dir(&photos).unwrap();
        let engine = open(&dir, pool);
        Fixture {
            _dir: dir,
            photos,
            engine,
        }
    }

    /// Ten files: three with the same two people, six without faces and one
    /// that cannot be decoded
    fn write_ten_photos(folder: &Path) {
        for i in 0..3 {
            write_face_jpeg(&folder.join(format!("pair-{}.jpg", i)), &[RED, GREEN]);
        }
        for i in 0..6 {
            write_face_jpeg(&folder.join(format!("empty-{}.jpg", i)), &[]);
        }
        write_corrupt_jpeg(&folder.join("corrupt.jpg"));
    }

    fn face_ids(engine: &Engine) -> Vec<i64> {
        engine
            .database()
            .face_embedding_pairs()
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    fn assert_consistent(engine: &Engine) {
        for class in IndexClass::ALL {
            let expected: Vec<i64> = stored_embeddings(engine.database(), class)
                .unwrap()
                .into_iter()
                .map(|(id, _)| id)
                .collect();
            let report = engine.index().check_integrity(class, &expected).unwrap();
            assert!(report.is_consistent(), "{} index: {:?}", class, report);
            assert_eq!(engine.index().len(class).unwrap(), expected.len());
        }
    }

    #[test]
    fn test_ten_photo_folder() {
        let f = fixture(face_pool());
        write_ten_photos(&f.photos);

        let job = f.engine.run_scan(&f.photos, true).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(
            job.message,
            "Completed: 9 photos analyzed, 6 faces, 2 people found, 1 failed"
        );

        let photos = f.engine.database().list_photos().unwrap();
        assert_eq!(photos.len(), 10);
        let (failed, ok): (Vec<_>, Vec<_>) = photos.iter().partition(|p| p.decode_error.is_some());
        assert_eq!(failed.len(), 1);
        assert!(ok.iter().all(|p| p.width.is_some() && p.height.is_some()));
        assert!(ok.iter().all(|p| p.stage == ProcessingStage::Full));

        let stats = f.engine.statistics().unwrap();
        assert_eq!(stats.faces, 6);
        assert_eq!(stats.persons, 2);
        let people = f.engine.get_person_list().unwrap();
        assert!(people.iter().all(|p| p.face_count == 3));

        assert_eq!(f.engine.index().len(IndexClass::Face).unwrap(), 6);
        assert_consistent(&f.engine);
    }

    #[test]
    fn test_rescan_changes_nothing() {
        let f = fixture(face_pool());
        write_ten_photos(&f.photos);
        f.engine.run_scan(&f.photos, true).unwrap();
        let faces = face_ids(&f.engine);
        let people = f.engine.get_person_list().unwrap();

        let job = f.engine.run_scan(&f.photos, true).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(face_ids(&f.engine), faces);
        assert_eq!(f.engine.get_person_list().unwrap(), people);
        assert_eq!(f.engine.statistics().unwrap().photos, 10);
        assert_consistent(&f.engine);
    }

    #[test]
    fn test_background_scan_with_pause() {
        let f = fixture(face_pool());
        write_ten_photos(&f.photos);

        let job_id = f.engine.start_scan(&f.photos, true).unwrap();
        // The job may already be past its last checkpoint; either way it
        // must complete once resumed
        let _ = f.engine.pause_scan(&job_id);
        let _ = f.engine.resume_scan(&job_id);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(20);
        let job = loop {
            let job = f.engine.get_job_status(&job_id).unwrap();
            if job.status.is_finished() || std::time::Instant::now() > deadline {
                break job;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        };
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(f.engine.get_global_status().status, JobStatus::Completed);
    }

    #[test]
    fn test_missing_model_degrades_to_warning() {
        let pool = face_pool().with(CapabilityKind::Scene, || Err(anyhow!("scene model not found")));
        let f = fixture(pool);
        write_face_jpeg(&f.photos.join("a.jpg"), &[RED]);

        let job = f.engine.run_scan(&f.photos, true).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(
            job.warnings,
            vec!["scene unavailable: scene model not found".to_string()]
        );
        let photo = f.engine.database().list_photos().unwrap().remove(0);
        assert_eq!(photo.stage, ProcessingStage::Basic);
        assert_eq!(f.engine.statistics().unwrap().faces, 1);
    }

    #[test]
    fn test_deleting_only_face_orphans_person_until_cleanup() {
        let f = fixture(face_pool());
        write_face_jpeg(&f.photos.join("a.jpg"), &[RED, GREEN]);
        write_face_jpeg(&f.photos.join("b.jpg"), &[RED, GREEN]);
        write_face_jpeg(&f.photos.join("solo.jpg"), &[BLUE]);
        f.engine.run_scan(&f.photos, true).unwrap();

        let db = f.engine.database();
        let solo = db
            .get_photo_by_path(&f.photos.canonicalize().unwrap().join("solo.jpg"))
            .unwrap()
            .unwrap();
        let solo_face = db.faces_for_photo(solo.id).unwrap().remove(0);
        let person = db.create_person(Some("Carol")).unwrap();
        db.assign_face(solo_face.id, Some(person)).unwrap();

        let deleted = f.engine.delete_photo(solo.id).unwrap().unwrap();
        assert_eq!(deleted.face_ids, vec![solo_face.id]);
        assert_eq!(f.engine.index().len(IndexClass::Face).unwrap(), 4);
        assert!(db.get_person(person).unwrap().is_some());

        let report = f.engine.cleanup().unwrap();
        assert_eq!(report.orphan_persons, vec![person]);
        assert!(db.get_person(person).unwrap().is_none());
        assert_eq!(f.engine.statistics().unwrap().persons, 2);
        assert_consistent(&f.engine);
    }

    #[test]
    fn test_delete_person_with_faces_drops_vectors() {
        let f = fixture(face_pool());
        write_face_jpeg(&f.photos.join("a.jpg"), &[RED, GREEN]);
        write_face_jpeg(&f.photos.join("b.jpg"), &[RED, GREEN]);
        f.engine.run_scan(&f.photos, true).unwrap();

        let person = f.engine.get_person_list().unwrap().remove(0);
        let removed = f.engine.delete_person(person.id, true).unwrap().unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(f.engine.index().len(IndexClass::Face).unwrap(), 2);
        assert!(f.engine.delete_person(person.id, true).unwrap().is_none());
        assert_consistent(&f.engine);
    }

    #[test]
    fn test_merge_then_rename() {
        let f = fixture(face_pool());
        write_face_jpeg(&f.photos.join("a.jpg"), &[RED, GREEN]);
        write_face_jpeg(&f.photos.join("b.jpg"), &[RED, GREEN]);
        f.engine.run_scan(&f.photos, true).unwrap();

        let people = f.engine.get_person_list().unwrap();
        let (target, source) = (people[0].id, people[1].id);
        let outcome = f.engine.merge_persons(&[source], target).unwrap();
        assert_eq!(outcome.moved_faces, 2);
        assert!(f.engine.rename_person(target, "Dana").unwrap());

        // Clustering again leaves the manual merge in place
        f.engine.run_face_rescan().unwrap();
        let people = f.engine.get_person_list().unwrap();
        assert_eq!(people.len(), 1);
        assert_eq!(people[0].name.as_deref(), Some("Dana"));
        assert_eq!(people[0].face_count, 4);
    }

    #[test]
    fn test_search_by_face_excludes_itself() {
        let f = fixture(face_pool());
        write_face_jpeg(&f.photos.join("a.jpg"), &[RED, GREEN]);
        write_face_jpeg(&f.photos.join("b.jpg"), &[RED]);
        f.engine.run_scan(&f.photos, true).unwrap();

        let db = f.engine.database();
        let faces = db.face_embeddings().unwrap();
        let red = faces.iter().find(|f| f.embedding[0] > 0.9).unwrap();

        let hits = f
            .engine
            .search(IndexClass::Face, SearchQuery::Face(red.face_id), 2)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.id != red.face_id));
        assert!((hits[0].score - 1.0).abs() < 1e-5);
        assert!(hits[1].score < 0.5);

        assert!(f
            .engine
            .search(IndexClass::Image, SearchQuery::Face(red.face_id), 2)
            .is_err());
    }

    #[test]
    fn test_text_search_uses_image_index() {
        let pool = face_pool()
            .with_instance(Box::new(FakeImageEmbedder))
            .with_text(|| Ok(Box::new(FakeTextEmbedder(vec![640.0, 480.0, 0.0, 0.0, 0.0]))));
        let f = fixture(pool);
        write_face_jpeg(&f.photos.join("a.jpg"), &[RED]);
        write_face_jpeg(&f.photos.join("b.jpg"), &[]);
        f.engine.run_scan(&f.photos, true).unwrap();
        assert_eq!(f.engine.index().len(IndexClass::Image).unwrap(), 2);

        let hits = f
            .engine
            .search(IndexClass::Image, SearchQuery::Text("a dark room".into()), 5)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(f
            .engine
            .search(IndexClass::Face, SearchQuery::Text("a dark room".into()), 5)
            .is_err());

        let photo = hits[0].id;
        let similar = f
            .engine
            .search(IndexClass::Image, SearchQuery::Photo(photo), 5)
            .unwrap();
        assert_eq!(similar.len(), 1);
        assert_ne!(similar[0].id, photo);
    }

    #[test]
    fn test_reopen_rebuilds_corrupt_index() {
        let dir = tempdir().unwrap();
        let photos = dir.path().join("photos");
        std::fs::create_dir(&photos).unwrap();
        write_face_jpeg(&photos.join("a.jpg"), &[RED, GREEN]);

        let engine = open(&dir, face_pool());
        engine.run_scan(&photos, true).unwrap();
        let faces_path = engine.index().dir().join(IndexClass::Face.file_name());
        drop(engine);

        std::fs::write(&faces_path, b"not an index").unwrap();
        let engine = open(&dir, face_pool());
        assert_eq!(engine.index().len(IndexClass::Face).unwrap(), 2);
        assert!(!engine.index().needs_rebuild(IndexClass::Face).unwrap());
        assert_consistent(&engine);
    }

    #[test]
    fn test_tags() {
        let pool = DetectorPool::builder().with_instance(Box::new(StaticCapability::tags("tag:sunset", 0.8)));
        let f = fixture(pool);
        write_face_jpeg(&f.photos.join("a.jpg"), &[]);
        f.engine.run_scan(&f.photos, true).unwrap();
        let photo = f.engine.database().list_photos().unwrap().remove(0);

        assert!(f.engine.add_tag(photo.id, "Holiday").unwrap());
        assert!(!f.engine.add_tag(photo.id, "holiday").unwrap());
        assert_eq!(f.engine.tags(photo.id).unwrap(), vec!["holiday".to_string()]);
        assert_eq!(f.engine.photos_with_tag("HOLIDAY").unwrap(), vec![photo.id]);
        assert!(f.engine.remove_tag(photo.id, "holiday").unwrap());
        assert!(f.engine.tags(photo.id).unwrap().is_empty());
    }

    #[test]
    fn test_delete_and_reassign_single_faces() {
        let f = fixture(face_pool());
        write_face_jpeg(&f.photos.join("a.jpg"), &[RED, GREEN]);
        write_face_jpeg(&f.photos.join("b.jpg"), &[RED]);
        f.engine.run_scan(&f.photos, true).unwrap();

        let db = f.engine.database();
        let red = db
            .face_embeddings()
            .unwrap()
            .into_iter()
            .filter(|f| f.embedding[0] > 0.9)
            .map(|f| f.face_id)
            .collect::<Vec<_>>();
        assert_eq!(red.len(), 2);
        let person = db.get_face(red[0]).unwrap().unwrap().person_id.unwrap();
        assert_eq!(f.engine.photos_of_person(person).unwrap().len(), 2);

        // Unknown people are refused, None detaches the face
        assert!(f.engine.assign_face(red[0], Some(9999)).is_err());
        assert!(f.engine.assign_face(red[0], None).unwrap());
        assert_eq!(db.get_face(red[0]).unwrap().unwrap().person_id, None);
        assert_eq!(f.engine.photos_of_person(person).unwrap().len(), 1);
        assert!(!f.engine.assign_face(9999, None).unwrap());

        assert!(f.engine.delete_face(red[1]).unwrap());
        assert!(!f.engine.delete_face(red[1]).unwrap());
        assert_eq!(f.engine.index().len(IndexClass::Face).unwrap(), 2);
        assert!(f.engine.photos_of_person(person).unwrap().is_empty());
        assert!(db.get_person(person).unwrap().is_some());
        assert_consistent(&f.engine);
    }

    #[test]
    fn test_browse_objects_scenes_and_places() {
        let dog = Detection::Object {
            label: "animal:dog".into(),
            confidence: 0.8,
            bbox: crate::db::BoundingBox { x: 400, y: 300, width: 100, height: 80 },
            embedding: None,
        };
        let pool = DetectorPool::builder()
            .with_instance(Box::new(StaticCapability::objects(vec![dog])))
            .with_instance(Box::new(StaticCapability::scene("scene:beach", 0.7)));
        let f = fixture(pool);
        write_face_jpeg(&f.photos.join("a.jpg"), &[]);
        write_face_jpeg(&f.photos.join("b.jpg"), &[]);
        f.engine.run_scan(&f.photos, true).unwrap();
        let ids: Vec<i64> = f.engine.database().list_photos().unwrap().iter().map(|p| p.id).collect();

        assert_eq!(f.engine.object_categories().unwrap(), vec![("animal:dog".to_string(), 2)]);
        assert_eq!(f.engine.objects_by_category("animal").unwrap().len(), 2);
        assert!(f.engine.objects_by_category("vehicle").unwrap().is_empty());
        let scenes = f.engine.scene_summary().unwrap();
        assert_eq!(scenes.len(), 1);
        assert_eq!(scenes[0].photo_count, 2);
        assert_eq!(f.engine.photos_with_scene("scene:beach").unwrap(), ids);

        // Without GPS nothing has a place yet
        assert_eq!(f.engine.photos_without_place().unwrap(), ids);
        f.engine
            .database()
            .save_place(&PlaceRecord {
                photo_id: ids[0],
                city: Some("Lisbon".into()),
                region: None,
                country: Some("Portugal".into()),
                resolved: true,
            })
            .unwrap();
        assert_eq!(f.engine.photos_at_place("lisbon").unwrap(), vec![ids[0]]);
        assert_eq!(f.engine.photos_at_place("Portugal").unwrap(), vec![ids[0]]);
        let places = f.engine.top_places(10).unwrap();
        assert_eq!(places.len(), 1);
        assert_eq!(places[0].photo_count, 1);
    }

    #[test]
    fn test_recluster_and_rebuild_index() {
        let f = fixture(face_pool());
        write_face_jpeg(&f.photos.join("a.jpg"), &[RED, GREEN]);
        write_face_jpeg(&f.photos.join("b.jpg"), &[RED, GREEN]);
        f.engine.run_scan(&f.photos, true).unwrap();

        for person in f.engine.get_person_list().unwrap() {
            f.engine.delete_person(person.id, false).unwrap();
        }
        assert_eq!(f.engine.statistics().unwrap().persons, 0);

        let outcome = f.engine.recluster().unwrap();
        assert_eq!(outcome.faces, 4);
        assert_eq!(outcome.clusters, 2);
        assert_eq!(outcome.created_persons.len(), 2);
        assert!(f.engine.get_person_list().unwrap().iter().all(|p| p.face_count == 2));

        let faces_path = f.engine.index().dir().join(IndexClass::Face.file_name());
        std::fs::write(&faces_path, b"not an index").unwrap();
        assert_eq!(f.engine.rebuild_index(IndexClass::Face).unwrap(), 4);
        assert_eq!(f.engine.rebuild_index(IndexClass::Image).unwrap(), 0);
        assert_consistent(&f.engine);
    }
}
