//! Vector indices for faces, pets and whole images.
//!
//! Writers mutate a per-class working set behind a mutex. Searches read the
//! last flushed snapshot, so an entry only becomes searchable after the
//! batch that produced it has been flushed.

pub mod flat;
mod persist;

use lru::LruCache;
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use flat::FlatIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexClass {
    Face,
    Pet,
    Image,
}

impl IndexClass {
    pub const ALL: [IndexClass; 3] = [IndexClass::Face, IndexClass::Pet, IndexClass::Image];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexClass::Face => "face",
            IndexClass::Pet => "pet",
            IndexClass::Image => "image",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.idx", self.as_str())
    }
}

impl fmt::Display for IndexClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "face" | "faces" => Ok(IndexClass::Face),
            "pet" | "pets" => Ok(IndexClass::Pet),
            "image" | "images" | "photo" => Ok(IndexClass::Image),
            other => Err(format!("unknown index class '{}'", other)),
        }
    }
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index I/O failed on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("index file {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("{class} index expects dimension {expected}, got {actual}")]
    DimensionMismatch {
        class: IndexClass,
        expected: usize,
        actual: usize,
    },

    #[error("{class} index has no entry {id}")]
    UnknownEntry { class: IndexClass, id: i64 },

    #[error("{0} index lock poisoned")]
    Poisoned(IndexClass),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub id: i64,
    pub score: f32,
}

/// Outcome of comparing an index with the rows that should back it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Rows with an embedding but no index entry
    pub missing: Vec<i64>,
    /// Index entries with no backing row
    pub stale: Vec<i64>,
    /// The file failed to load and the class started empty
    pub corrupt: bool,
}

impl IntegrityReport {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.stale.is_empty() && !self.corrupt
    }
}

struct WorkingSet {
    index: FlatIndex,
    dirty: bool,
    needs_rebuild: bool,
}

/// Query cache key: k plus the query quantized to 1e-4
type CacheKey = (usize, Vec<u8>);

/// The searchable copy. `generation` goes up on every publish.
struct Published {
    index: Arc<FlatIndex>,
    generation: u64,
}

struct ClassIndex {
    class: IndexClass,
    path: PathBuf,
    working: Mutex<WorkingSet>,
    snapshot: RwLock<Published>,
    /// Hits tagged with the generation they were computed from. Entries
    /// from an older generation are never served.
    cache: Mutex<LruCache<CacheKey, (u64, Arc<Vec<SearchHit>>)>>,
}

impl ClassIndex {
    fn open(class: IndexClass, dir: &Path, cache_size: NonZeroUsize) -> Self {
        let path = dir.join(class.file_name());
        let (index, needs_rebuild) = match persist::read(&path) {
            Ok(index) => {
                debug!(class = %class, entries = index.len(), "Loaded vector index");
                (index, false)
            }
            Err(e) => {
                warn!(class = %class, error = %e, "Vector index unreadable, will rebuild");
                (FlatIndex::new(), true)
            }
        };

        Self {
            class,
            path,
            snapshot: RwLock::new(Published {
                index: Arc::new(index.clone()),
                generation: 0,
            }),
            working: Mutex::new(WorkingSet {
                index,
                dirty: false,
                needs_rebuild,
            }),
            cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    fn working(&self) -> Result<MutexGuard<'_, WorkingSet>, IndexError> {
        self.working
            .lock()
            .map_err(|_| IndexError::Poisoned(self.class))
    }

    fn snapshot(&self) -> Result<(Arc<FlatIndex>, u64), IndexError> {
        self.snapshot
            .read()
            .map(|s| (Arc::clone(&s.index), s.generation))
            .map_err(|_| IndexError::Poisoned(self.class))
    }

    fn invalidate_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    /// Persist and publish the working set. Caller holds the working lock.
    fn publish(&self, working: &mut WorkingSet) -> Result<(), IndexError> {
        persist::write(&self.path, &working.index)?;
        {
            let mut snapshot = self
                .snapshot
                .write()
                .map_err(|_| IndexError::Poisoned(self.class))?;
            snapshot.index = Arc::new(working.index.clone());
            snapshot.generation += 1;
        }
        working.dirty = false;
        working.needs_rebuild = false;
        self.invalidate_cache();
        Ok(())
    }
}

/// One index per [`IndexClass`], persisted under a single directory
pub struct VectorIndexStore {
    dir: PathBuf,
    classes: BTreeMap<IndexClass, ClassIndex>,
}

impl VectorIndexStore {
    /// Load every class from `dir`. Unreadable files leave that class empty
    /// and flagged for rebuild rather than failing the open.
    pub fn open(dir: &Path, cache_size: usize) -> Result<Self, IndexError> {
        std::fs::create_dir_all(dir).map_err(|source| IndexError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        let classes = IndexClass::ALL
            .iter()
            .map(|&class| (class, ClassIndex::open(class, dir, cache_size)))
            .collect();

        Ok(Self {
            dir: dir.to_path_buf(),
            classes,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn class(&self, class: IndexClass) -> &ClassIndex {
        // Every class is created in open()
        &self.classes[&class]
    }

    /// Add or replace a vector. Not searchable until the next flush.
    pub fn insert(&self, class: IndexClass, id: i64, vector: Vec<f32>) -> Result<(), IndexError> {
        let index = self.class(class);
        let mut working = index.working()?;
        let actual = vector.len();
        working
            .index
            .insert(id, vector)
            .map_err(|expected| IndexError::DimensionMismatch {
                class,
                expected,
                actual,
            })?;
        working.dirty = true;
        drop(working);
        index.invalidate_cache();
        Ok(())
    }

    /// Returns false if the id was not present
    pub fn remove(&self, class: IndexClass, id: i64) -> Result<bool, IndexError> {
        let index = self.class(class);
        let mut working = index.working()?;
        let removed = working.index.remove(id);
        if removed {
            working.dirty = true;
        }
        drop(working);
        index.invalidate_cache();
        Ok(removed)
    }

    /// Persist the dirty classes among `classes` and publish them to readers
    pub fn flush(&self, classes: &[IndexClass]) -> Result<usize, IndexError> {
        let mut flushed = 0;
        for &class in classes {
            let index = self.class(class);
            let mut working = index.working()?;
            if !working.dirty {
                continue;
            }
            index.publish(&mut working)?;
            debug!(class = %class, entries = working.index.len(), "Flushed vector index");
            flushed += 1;
        }
        Ok(flushed)
    }

    pub fn flush_all(&self) -> Result<usize, IndexError> {
        self.flush(&IndexClass::ALL)
    }

    /// Nearest `k` entries in the last flushed snapshot
    pub fn search(&self, class: IndexClass, query: &[f32], k: usize) -> Result<Vec<SearchHit>, IndexError> {
        let index = self.class(class);
        let key = (k, quantize(query));
        let (snapshot, generation) = index.snapshot()?;

        if let Ok(mut cache) = index.cache.lock() {
            if let Some((cached_at, hits)) = cache.get(&key) {
                if *cached_at == generation {
                    return Ok(hits.to_vec());
                }
            }
        }

        if let Some(dim) = snapshot.dim() {
            if dim != query.len() {
                return Err(IndexError::DimensionMismatch {
                    class,
                    expected: dim,
                    actual: query.len(),
                });
            }
        }

        let hits = snapshot.search(query, k);
        if let Ok(mut cache) = index.cache.lock() {
            cache.put(key, (generation, Arc::new(hits.clone())));
        }
        Ok(hits)
    }

    /// Stored vector for an id, from the working set
    pub fn vector(&self, class: IndexClass, id: i64) -> Result<Vec<f32>, IndexError> {
        let working = self.class(class).working()?;
        working
            .index
            .get(id)
            .map(|v| v.to_vec())
            .ok_or(IndexError::UnknownEntry { class, id })
    }

    /// Entries visible to search
    pub fn len(&self, class: IndexClass) -> Result<usize, IndexError> {
        Ok(self.class(class).snapshot()?.0.len())
    }

    /// Entries in the working set, flushed or not
    pub fn pending_len(&self, class: IndexClass) -> Result<usize, IndexError> {
        Ok(self.class(class).working()?.index.len())
    }

    pub fn ids(&self, class: IndexClass) -> Result<Vec<i64>, IndexError> {
        Ok(self.class(class).working()?.index.ids())
    }

    pub fn is_dirty(&self, class: IndexClass) -> Result<bool, IndexError> {
        Ok(self.class(class).working()?.dirty)
    }

    pub fn needs_rebuild(&self, class: IndexClass) -> Result<bool, IndexError> {
        Ok(self.class(class).working()?.needs_rebuild)
    }

    /// Compare the working set with the ids that have an embedding in the
    /// metadata store
    pub fn check_integrity(&self, class: IndexClass, expected_ids: &[i64]) -> Result<IntegrityReport, IndexError> {
        let working = self.class(class).working()?;
        let mut expected: Vec<i64> = expected_ids.to_vec();
        expected.sort_unstable();
        expected.dedup();

        let missing = expected
            .iter()
            .copied()
            .filter(|id| !working.index.contains(*id))
            .collect();
        let stale = working
            .index
            .ids()
            .into_iter()
            .filter(|id| expected.binary_search(id).is_err())
            .collect();

        Ok(IntegrityReport {
            missing,
            stale,
            corrupt: working.needs_rebuild,
        })
    }

    /// Replace a class wholesale and flush it. The dimension is reset, so
    /// the entries may use a different model than before.
    pub fn rebuild(&self, class: IndexClass, entries: Vec<(i64, Vec<f32>)>) -> Result<usize, IndexError> {
        let index = self.class(class);
        let mut working = index.working()?;

        let mut rebuilt = FlatIndex::new();
        for (id, vector) in entries {
            let actual = vector.len();
            rebuilt
                .insert(id, vector)
                .map_err(|expected| IndexError::DimensionMismatch {
                    class,
                    expected,
                    actual,
                })?;
        }

        working.index = rebuilt;
        working.dirty = true;
        index.publish(&mut working)?;
        let count = working.index.len();
        info!(class = %class, entries = count, "Rebuilt vector index");
        Ok(count)
    }
}

fn quantize(query: &[f32]) -> Vec<u8> {
    query
        .iter()
        .flat_map(|v| ((v * 10_000.0).round() as i32).to_le_bytes())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &Path) -> VectorIndexStore {
        VectorIndexStore::open(dir, 8).unwrap()
    }

    #[test]
    fn test_search_sees_only_flushed_entries() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        store.insert(IndexClass::Face, 1, vec![1.0, 0.0]).unwrap();
        assert!(store.is_dirty(IndexClass::Face).unwrap());
        assert_eq!(store.pending_len(IndexClass::Face).unwrap(), 1);
        assert_eq!(store.len(IndexClass::Face).unwrap(), 0);
        assert!(store.search(IndexClass::Face, &[1.0, 0.0], 5).unwrap().is_empty());

        assert_eq!(store.flush_all().unwrap(), 1);
        assert!(!store.is_dirty(IndexClass::Face).unwrap());
        let hits = store.search(IndexClass::Face, &[1.0, 0.0], 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 1);
    }

    #[test]
    fn test_cache_invalidated_on_insert_and_flush() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.insert(IndexClass::Image, 1, vec![1.0, 0.0]).unwrap();
        store.flush_all().unwrap();

        let first = store.search(IndexClass::Image, &[0.0, 1.0], 5).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(store.class(IndexClass::Image).cache.lock().unwrap().len(), 1);

        store.insert(IndexClass::Image, 2, vec![0.0, 1.0]).unwrap();
        assert!(store.class(IndexClass::Image).cache.lock().unwrap().is_empty());

        // Unflushed: the fresh cache entry still reflects the old snapshot
        assert_eq!(store.search(IndexClass::Image, &[0.0, 1.0], 5).unwrap().len(), 1);

        store.flush(&[IndexClass::Image]).unwrap();
        assert!(store.class(IndexClass::Image).cache.lock().unwrap().is_empty());
        let hits = store.search(IndexClass::Image, &[0.0, 1.0], 5).unwrap();
        assert_eq!(hits[0].id, 2);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_hits_cached_before_flush_not_served_after() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.insert(IndexClass::Face, 1, vec![1.0, 0.0]).unwrap();
        store.flush_all().unwrap();

        // A search that read the snapshot, then lost the race with a flush
        let index = store.class(IndexClass::Face);
        let (old, generation) = index.snapshot().unwrap();
        store.insert(IndexClass::Face, 2, vec![0.0, 1.0]).unwrap();
        store.flush_all().unwrap();
        let query = [0.0, 1.0];
        index
            .cache
            .lock()
            .unwrap()
            .put((1, quantize(&query)), (generation, Arc::new(old.search(&query, 1))));

        let hits = store.search(IndexClass::Face, &query, 1).unwrap();
        assert_eq!(hits[0].id, 2);
        let (_, current) = index.snapshot().unwrap();
        assert_eq!(current, generation + 1);
        assert_eq!(index.cache.lock().unwrap().peek(&(1, quantize(&query))).unwrap().0, current);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store.insert(IndexClass::Face, 1, vec![1.0; 4]).unwrap();

        let err = store.insert(IndexClass::Face, 2, vec![1.0; 3]).unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch { expected: 4, actual: 3, .. }
        ));
        // Other classes fix their own dimension
        store.insert(IndexClass::Pet, 1, vec![1.0; 3]).unwrap();
    }

    #[test]
    fn test_reopen_restores_flushed_state() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path());
            store.insert(IndexClass::Pet, 10, vec![0.5, 0.5]).unwrap();
            store.insert(IndexClass::Pet, 11, vec![0.1, 0.9]).unwrap();
            store.flush_all().unwrap();
            store.insert(IndexClass::Pet, 12, vec![0.9, 0.1]).unwrap();
        }

        let store = open(dir.path());
        assert_eq!(store.ids(IndexClass::Pet).unwrap(), vec![10, 11]);
        assert_eq!(store.len(IndexClass::Pet).unwrap(), 2);
        assert!(!store.needs_rebuild(IndexClass::Pet).unwrap());
    }

    #[test]
    fn test_corrupt_file_flags_rebuild() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path());
            store.insert(IndexClass::Face, 1, vec![1.0, 0.0]).unwrap();
            store.flush_all().unwrap();
        }
        let path = dir.path().join("face.idx");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let store = open(dir.path());
        assert_eq!(store.pending_len(IndexClass::Face).unwrap(), 0);
        let report = store.check_integrity(IndexClass::Face, &[1]).unwrap();
        assert!(report.corrupt);
        assert_eq!(report.missing, vec![1]);

        store
            .rebuild(IndexClass::Face, vec![(1, vec![1.0, 0.0])])
            .unwrap();
        assert!(store
            .check_integrity(IndexClass::Face, &[1])
            .unwrap()
            .is_consistent());
        assert_eq!(store.len(IndexClass::Face).unwrap(), 1);
    }

    #[test]
    fn test_remove_and_integrity() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        for id in 1..=3 {
            store.insert(IndexClass::Face, id, vec![id as f32, 1.0]).unwrap();
        }
        store.flush_all().unwrap();

        assert!(store.remove(IndexClass::Face, 2).unwrap());
        assert!(!store.remove(IndexClass::Face, 42).unwrap());
        store.flush_all().unwrap();

        let report = store.check_integrity(IndexClass::Face, &[1, 3, 4]).unwrap();
        assert_eq!(report.missing, vec![4]);
        assert!(report.stale.is_empty());
        let report = store.check_integrity(IndexClass::Face, &[1]).unwrap();
        assert_eq!(report.stale, vec![3]);
    }

    #[test]
    fn test_concurrent_inserts_serialize() {
        let dir = tempdir().unwrap();
        let store = Arc::new(open(dir.path()));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        store
                            .insert(IndexClass::Image, t * 100 + i, vec![1.0, i as f32])
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        store.flush_all().unwrap();
        assert_eq!(store.len(IndexClass::Image).unwrap(), 100);
    }

    #[test]
    fn test_class_parsing() {
        assert_eq!("Faces".parse::<IndexClass>().unwrap(), IndexClass::Face);
        assert_eq!("image".parse::<IndexClass>().unwrap(), IndexClass::Image);
        assert!("car".parse::<IndexClass>().is_err());
    }
}
