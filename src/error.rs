//! Job-boundary error. Anything that escapes a photo's own handling and
//! stops a scan ends up here, and its message becomes the job's error.

use thiserror::Error;

use crate::clustering::ClusteringError;
use crate::index::IndexError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("metadata store error: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error("vector index error: {0}")]
    Index(#[from] IndexError),

    #[error("clustering error: {0}")]
    Clustering(#[from] ClusteringError),

    #[error("could not list folder: {0:#}")]
    Discovery(anyhow::Error),

    #[error("could not start workers: {0}")]
    Workers(#[from] rayon::ThreadPoolBuildError),

    #[error("worker panicked: {0}")]
    Panicked(String),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexClass;

    #[test]
    fn test_messages_carry_the_cause() {
        let err: PipelineError = anyhow::anyhow!("disk full").context("saving photo 3").into();
        assert_eq!(err.to_string(), "metadata store error: saving photo 3: disk full");

        let err: PipelineError = IndexError::DimensionMismatch {
            class: IndexClass::Face,
            expected: 512,
            actual: 128,
        }
        .into();
        assert!(err.to_string().contains("expects dimension 512, got 128"));
    }
}
