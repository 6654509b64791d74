use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default)]
    pub clustering: ClusteringConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub caption: CaptionConfig,

    #[serde(default)]
    pub geocoding: GeocodingConfig,
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("photosense")
}

fn default_database_path() -> PathBuf {
    data_dir().join("photosense.db")
}

fn default_index_dir() -> PathBuf {
    data_dir().join("indices")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_extensions")]
    pub image_extensions: Vec<String>,

    /// Photos analyzed between index flushes
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Worker threads per batch (0 = min(4, available CPUs))
    #[serde(default)]
    pub workers: usize,

    #[serde(default = "default_true")]
    pub recursive: bool,
}

fn default_extensions() -> Vec<String> {
    vec![
        "jpg".into(),
        "jpeg".into(),
        "png".into(),
        "gif".into(),
        "webp".into(),
        "bmp".into(),
        "tiff".into(),
        "tif".into(),
        "heic".into(),
        "heif".into(),
        "raw".into(),
        "cr2".into(),
        "nef".into(),
        "arw".into(),
    ]
}

fn default_batch_size() -> usize {
    8
}

fn default_true() -> bool {
    true
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_extensions(),
            batch_size: default_batch_size(),
            workers: 0,
            recursive: true,
        }
    }
}

impl ScannerConfig {
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(4)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Fetch missing model files on first use
    #[serde(default = "default_true")]
    pub allow_download: bool,

    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,

    #[serde(default = "default_face_detector")]
    pub face_detector: String,

    #[serde(default = "default_face_embedder")]
    pub face_embedder: String,

    #[serde(default = "default_object_detector")]
    pub object_detector: String,

    #[serde(default = "default_scene_classifier")]
    pub scene_classifier: String,

    #[serde(default = "default_scene_labels")]
    pub scene_labels: String,

    #[serde(default = "default_clip_visual")]
    pub clip_visual: String,

    #[serde(default = "default_clip_text")]
    pub clip_text: String,

    #[serde(default = "default_true")]
    pub enable_scene: bool,

    #[serde(default = "default_true")]
    pub enable_tagging: bool,

    #[serde(default = "default_true")]
    pub enable_image_embedding: bool,

    #[serde(default = "default_face_confidence")]
    pub face_confidence: f32,

    #[serde(default = "default_object_confidence")]
    pub object_confidence: f32,

    #[serde(default = "default_scene_confidence")]
    pub scene_confidence: f32,

    #[serde(default = "default_tag_confidence")]
    pub tag_confidence: f32,

    #[serde(default = "default_tag_top_k")]
    pub tag_top_k: usize,
}

fn default_models_dir() -> PathBuf {
    data_dir().join("models")
}

fn default_intra_threads() -> usize {
    2
}

fn default_face_detector() -> String {
    "scrfd_10g_bnkps.onnx".to_string()
}

fn default_face_embedder() -> String {
    "arcface-resnet100.onnx".to_string()
}

fn default_object_detector() -> String {
    "yolov8n.onnx".to_string()
}

fn default_scene_classifier() -> String {
    "resnet18_places365.onnx".to_string()
}

fn default_scene_labels() -> String {
    "categories_places365.txt".to_string()
}

fn default_clip_visual() -> String {
    "clip-vit-b32-vision.onnx".to_string()
}

fn default_clip_text() -> String {
    "clip-vit-b32-text.onnx".to_string()
}

fn default_face_confidence() -> f32 {
    0.5
}

fn default_object_confidence() -> f32 {
    0.55
}

fn default_scene_confidence() -> f32 {
    0.1
}

fn default_tag_confidence() -> f32 {
    0.15
}

fn default_tag_top_k() -> usize {
    5
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            allow_download: true,
            intra_threads: default_intra_threads(),
            face_detector: default_face_detector(),
            face_embedder: default_face_embedder(),
            object_detector: default_object_detector(),
            scene_classifier: default_scene_classifier(),
            scene_labels: default_scene_labels(),
            clip_visual: default_clip_visual(),
            clip_text: default_clip_text(),
            enable_scene: true,
            enable_tagging: true,
            enable_image_embedding: true,
            face_confidence: default_face_confidence(),
            object_confidence: default_object_confidence(),
            scene_confidence: default_scene_confidence(),
            tag_confidence: default_tag_confidence(),
            tag_top_k: default_tag_top_k(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Maximum cosine distance between neighbors
    #[serde(default = "default_eps")]
    pub eps: f32,

    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Faces detected below this confidence are left out of clustering
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,

    /// Share of a cluster's previously assigned faces that must point at one
    /// person for the cluster to inherit that person (strictly greater than)
    #[serde(default = "default_overlap_threshold")]
    pub overlap_threshold: f32,
}

fn default_eps() -> f32 {
    0.5
}

fn default_min_samples() -> usize {
    2
}

fn default_min_confidence() -> f32 {
    0.6
}

fn default_overlap_threshold() -> f32 {
    0.5
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            eps: default_eps(),
            min_samples: default_min_samples(),
            min_confidence: default_min_confidence(),
            overlap_threshold: default_overlap_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_search_cache_size")]
    pub search_cache_size: usize,
}

fn default_search_cache_size() -> usize {
    128
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            search_cache_size: default_search_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_caption_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_caption_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_caption_prompt")]
    pub prompt: String,

    #[serde(default = "default_caption_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_caption_timeout")]
    pub timeout_secs: u64,
}

fn default_caption_endpoint() -> String {
    "http://localhost:1234/v1".to_string()
}

fn default_caption_model() -> String {
    "local-model".to_string()
}

fn default_caption_prompt() -> String {
    "Describe this photo in one short sentence.".to_string()
}

fn default_caption_max_tokens() -> u32 {
    120
}

fn default_caption_timeout() -> u64 {
    60
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_caption_endpoint(),
            model: default_caption_model(),
            api_key: None,
            prompt: default_caption_prompt(),
            max_tokens: default_caption_max_tokens(),
            timeout_secs: default_caption_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocodingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_geocoding_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

fn default_geocoding_endpoint() -> String {
    "https://nominatim.openstreetmap.org/reverse".to_string()
}

fn default_user_agent() -> String {
    format!("photosense/{}", env!("CARGO_PKG_VERSION"))
}

fn default_min_interval_ms() -> u64 {
    1000
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_geocoding_endpoint(),
            user_agent: default_user_agent(),
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            index_dir: default_index_dir(),
            scanner: ScannerConfig::default(),
            models: ModelsConfig::default(),
            clustering: ClusteringConfig::default(),
            index: IndexConfig::default(),
            caption: CaptionConfig::default(),
            geocoding: GeocodingConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photosense")
            .join("config.toml")
    }

    /// Config rooted in a single directory, used by tests and portable installs
    pub fn rooted_at(root: &Path) -> Self {
        let mut config = Config::default();
        config.database_path = root.join("photosense.db");
        config.index_dir = root.join("indices");
        config.models.models_dir = root.join("models");
        config.models.allow_download = false;
        config
    }
}
