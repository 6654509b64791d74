use anyhow::{anyhow, bail, Context, Result};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::ModelsConfig;

/// Models with a known public download location. Others must be placed in
/// the models directory by hand.
const DOWNLOAD_SOURCES: &[(&str, &str)] = &[
    (
        "arcface-resnet100.onnx",
        "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/arcface/model/arcfaceresnet100-11-int8.onnx",
    ),
    (
        "ultraface-320.onnx",
        "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx",
    ),
    (
        "clip-vit-b32-vision.onnx",
        "https://huggingface.co/Qdrant/clip-ViT-B-32-vision/resolve/main/model.onnx",
    ),
    (
        "clip-vit-b32-text.onnx",
        "https://huggingface.co/Qdrant/clip-ViT-B-32-text/resolve/main/model.onnx",
    ),
    (
        "clip-vocab.json",
        "https://huggingface.co/Qdrant/clip-ViT-B-32-text/resolve/main/vocab.json",
    ),
    (
        "clip-merges.txt",
        "https://huggingface.co/Qdrant/clip-ViT-B-32-text/resolve/main/merges.txt",
    ),
];

/// Locates model files and opens inference sessions
#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
    allow_download: bool,
    intra_threads: usize,
}

impl ModelStore {
    pub fn from_config(models: &ModelsConfig) -> Self {
        Self {
            dir: models.models_dir.clone(),
            allow_download: models.allow_download,
            intra_threads: models.intra_threads.max(1),
        }
    }

    pub fn path(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    /// Path to a model file, downloading it first if that is allowed and
    /// the file has a known source
    pub fn ensure(&self, filename: &str) -> Result<PathBuf> {
        let model_path = self.path(filename);
        if model_path.exists() {
            return Ok(model_path);
        }

        let url = DOWNLOAD_SOURCES
            .iter()
            .find(|(name, _)| *name == filename)
            .map(|(_, url)| *url);

        match url {
            Some(url) if self.allow_download => {
                download(url, &model_path)?;
                Ok(model_path)
            }
            Some(_) => bail!(
                "model file not found: {} (downloads are disabled)",
                model_path.display()
            ),
            None => bail!(
                "model file not found: {} (place it in {})",
                model_path.display(),
                self.dir.display()
            ),
        }
    }

    pub fn session(&self, filename: &str) -> Result<Session> {
        let model_path = self.ensure(filename)?;

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(self.intra_threads)?
            .commit_from_file(&model_path)
            .with_context(|| format!("Failed to load model {}", model_path.display()))?;

        info!(model = %filename, "Model loaded");
        Ok(session)
    }
}

/// Download a model file to `dest` through a temporary file so a partial
/// download is never mistaken for a model
fn download(url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    info!(url = %url, "Downloading model...");
    let response = ureq::get(url)
        .call()
        .map_err(|e| anyhow!("Failed to download model: {}", e))?;

    let partial = dest.with_extension("part");
    let mut file = std::fs::File::create(&partial)?;
    std::io::copy(&mut response.into_reader(), &mut file)?;
    std::fs::rename(&partial, dest)?;

    info!(path = ?dest, "Model downloaded");
    Ok(())
}

/// Pack an RGB image into an NCHW tensor, normalizing each channel with
/// `(value / 255 - mean) / std`
pub(crate) fn nchw_tensor(
    rgb: &image::RgbImage,
    mean: [f32; 3],
    std: [f32; 3],
) -> Result<Tensor<f32>> {
    let (width, height) = (rgb.width() as usize, rgb.height() as usize);
    let plane = width * height;
    let mut input_data = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * width + x as usize;
        for c in 0..3 {
            input_data[c * plane + idx] = (pixel[c] as f32 / 255.0 - mean[c]) / std[c];
        }
    }

    Ok(Tensor::from_array((
        [1usize, 3, height, width],
        input_data.into_boxed_slice(),
    ))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path, allow_download: bool) -> ModelStore {
        ModelStore {
            dir: dir.to_path_buf(),
            allow_download,
            intra_threads: 1,
        }
    }

    #[test]
    fn test_existing_model_is_used_in_place() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("custom.onnx"), b"onnx").unwrap();

        let path = store(dir.path(), false).ensure("custom.onnx").unwrap();
        assert_eq!(path, dir.path().join("custom.onnx"));
    }

    #[test]
    fn test_missing_model_without_download() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), false);

        let err = store.ensure("arcface-resnet100.onnx").unwrap_err();
        assert!(err.to_string().contains("downloads are disabled"));

        let err = store.ensure("yolov8n.onnx").unwrap_err();
        assert!(err.to_string().contains("place it in"));
    }
}
