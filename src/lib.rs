//! Local photo indexing: detection and embedding of faces, pets, scenes and
//! whole images, vector search over the embeddings and clustering of faces
//! into people.

pub mod clustering;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod geocode;
pub mod imaging;
pub mod index;
pub mod inference;
pub mod logging;
pub mod scan;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use engine::{CleanupReport, Engine, SearchQuery};
pub use error::{PipelineError, PipelineResult};
