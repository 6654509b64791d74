//! Grouping face embeddings into persons.
//!
//! A pass reloads every face with an embedding, clusters them with DBSCAN
//! and reconciles the clusters against the persons already in the store,
//! so repeated passes keep person ids (and their names) stable.

pub mod dbscan;
pub mod reconcile;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::ClusteringConfig;
use crate::db::{Database, FaceEmbedding, PersonRef};

pub use dbscan::dbscan;
pub use reconcile::{reconcile, PriorFace, Reconciliation};

#[derive(Error, Debug)]
pub enum ClusteringError {
    #[error("face {face_id} has a {actual}-d embedding, expected {expected}")]
    DimensionMismatch {
        face_id: i64,
        expected: usize,
        actual: usize,
    },

    #[error("clustering store access failed: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Summary of one clustering pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusteringOutcome {
    /// Faces that took part
    pub faces: usize,
    pub clusters: usize,
    /// Faces left without a person (noise or below the confidence floor)
    pub noise: usize,
    pub matched_persons: usize,
    pub created_persons: Vec<i64>,
}

pub struct ClusteringEngine {
    config: ClusteringConfig,
}

impl ClusteringEngine {
    pub fn new(config: ClusteringConfig) -> Self {
        Self { config }
    }

    /// Run one full pass and apply it in a single transaction. Nothing is
    /// written when the embeddings disagree on dimension.
    pub fn run(&self, db: &Database) -> Result<ClusteringOutcome, ClusteringError> {
        let faces = db.face_embeddings()?;
        if faces.is_empty() {
            return Ok(ClusteringOutcome::default());
        }
        check_dimensions(&faces)?;

        let (eligible, filtered): (Vec<&FaceEmbedding>, Vec<&FaceEmbedding>) = faces
            .iter()
            .partition(|f| f.confidence >= self.config.min_confidence);

        let points: Vec<Vec<f32>> = eligible.iter().map(|f| f.embedding.clone()).collect();
        let labels = dbscan(&points, self.config.eps, self.config.min_samples);
        let cluster_count = labels.iter().flatten().max().map_or(0, |max| max + 1);

        let mut clusters: Vec<Vec<PriorFace>> = vec![Vec::new(); cluster_count];
        let mut assignments: Vec<(i64, Option<PersonRef>)> = Vec::with_capacity(faces.len());
        for (face, label) in eligible.iter().zip(&labels) {
            match label {
                Some(label) => clusters[*label].push(PriorFace {
                    face_id: face.face_id,
                    person_id: face.person_id,
                    locked: face.locked,
                }),
                None if !face.locked => assignments.push((face.face_id, None)),
                None => {}
            }
        }
        for face in filtered.iter().filter(|f| !f.locked) {
            assignments.push((face.face_id, None));
        }
        let noise = assignments.len();

        let reconciliation = reconcile(&clusters, self.config.overlap_threshold);
        for (members, target) in clusters.iter().zip(&reconciliation.targets) {
            for face in members.iter().filter(|f| !f.locked) {
                assignments.push((face.face_id, *target));
            }
        }

        let created_persons = db.apply_assignments(reconciliation.new_persons, &assignments)?;
        let matched_persons = reconciliation
            .targets
            .iter()
            .filter(|t| matches!(t, Some(PersonRef::Existing(_))))
            .count();

        info!(
            faces = faces.len(),
            clusters = cluster_count,
            noise,
            matched = matched_persons,
            created = created_persons.len(),
            "Face clustering complete"
        );

        Ok(ClusteringOutcome {
            faces: faces.len(),
            clusters: cluster_count,
            noise,
            matched_persons,
            created_persons,
        })
    }
}

fn check_dimensions(faces: &[FaceEmbedding]) -> Result<(), ClusteringError> {
    let Some(expected) = faces.first().map(|f| f.embedding.len()) else {
        return Ok(());
    };
    if let Some(face) = faces.iter().find(|f| f.embedding.len() != expected) {
        debug!(face_id = face.face_id, "Embedding dimension mismatch");
        return Err(ClusteringError::DimensionMismatch {
            face_id: face.face_id,
            expected,
            actual: face.embedding.len(),
        });
    }
    Ok(())
}
