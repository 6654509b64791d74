//! Decoding photos once and sharing sized copies between pipeline stages.

pub mod cache;
pub mod metadata;

use std::path::{Path, PathBuf};
use thiserror::Error;

pub use cache::{DecodedImage, ImageCache, Variant, VariantKind};
pub use metadata::{extract_metadata, PhotoMetadata};

/// A photo that could not be turned into pixels. Recorded against the photo;
/// never aborts a batch.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode {}: {reason}", path.display())]
    Image { path: PathBuf, reason: String },
}

impl DecodeError {
    fn from_image(path: &Path, err: image::ImageError) -> Self {
        match err {
            image::ImageError::IoError(source) => DecodeError::Io {
                path: path.to_path_buf(),
                source,
            },
            other => DecodeError::Image {
                path: path.to_path_buf(),
                reason: other.to_string(),
            },
        }
    }
}
