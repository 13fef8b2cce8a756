use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub library: LibraryConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub faces: FacesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Directories that are walked when importing photos.
    #[serde(default)]
    pub media_dirs: Vec<PathBuf>,

    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,

    /// Where face thumbnails are written during indexing.
    #[serde(default = "default_thumbnail_dir")]
    pub thumbnail_dir: PathBuf,

    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,

    /// Where removed duplicates go when they are trashed rather than deleted.
    #[serde(default = "default_trash_dir")]
    pub trash_dir: PathBuf,
}

fn default_image_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "heic".to_string(),
    ]
}

fn default_thumbnail_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("yearbook/faces")
}

fn default_thumbnail_size() -> u32 {
    150
}

fn default_trash_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("yearbook/trash")
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            media_dirs: Vec::new(),
            image_extensions: default_image_extensions(),
            thumbnail_dir: default_thumbnail_dir(),
            thumbnail_size: default_thumbnail_size(),
            trash_dir: default_trash_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Worker threads in the batch pool (0 lets rayon decide).
    #[serde(default)]
    pub workers: usize,

    /// Items processed between two cancellation checks.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,

    #[serde(default = "default_import_batch_size")]
    pub import_batch_size: usize,

    #[serde(default = "default_index_batch_size")]
    pub index_batch_size: usize,

    #[serde(default = "default_auto_assign_batch_size")]
    pub auto_assign_batch_size: usize,

    /// Batch size for jobs that move, copy or remove files.
    #[serde(default = "default_file_batch_size")]
    pub file_batch_size: usize,

    /// Delay before the completion watcher starts polling.
    #[serde(default = "default_watch_delay_secs")]
    pub watch_delay_secs: u64,

    /// Base wait before a job is force-completed.
    #[serde(default = "default_watch_max_wait_secs")]
    pub watch_max_wait_secs: u64,

    /// Extra wait granted per unit of work on top of the base wait.
    #[serde(default = "default_watch_wait_per_item_ms")]
    pub watch_wait_per_item_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Deadline for a single extraction call. `None` disables it.
    #[serde(default = "default_item_timeout_secs")]
    pub item_timeout_secs: Option<u64>,
}

fn default_checkpoint_interval() -> usize {
    5
}

fn default_import_batch_size() -> usize {
    250
}

fn default_index_batch_size() -> usize {
    10
}

fn default_auto_assign_batch_size() -> usize {
    100
}

fn default_file_batch_size() -> usize {
    100
}

fn default_watch_delay_secs() -> u64 {
    2
}

fn default_watch_max_wait_secs() -> u64 {
    30
}

fn default_watch_wait_per_item_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_item_timeout_secs() -> Option<u64> {
    Some(120)
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            checkpoint_interval: default_checkpoint_interval(),
            import_batch_size: default_import_batch_size(),
            index_batch_size: default_index_batch_size(),
            auto_assign_batch_size: default_auto_assign_batch_size(),
            file_batch_size: default_file_batch_size(),
            watch_delay_secs: default_watch_delay_secs(),
            watch_max_wait_secs: default_watch_max_wait_secs(),
            watch_wait_per_item_ms: default_watch_wait_per_item_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            item_timeout_secs: default_item_timeout_secs(),
        }
    }
}

impl JobsConfig {
    pub fn watch_delay(&self) -> Duration {
        Duration::from_secs(self.watch_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn item_timeout(&self) -> Option<Duration> {
        self.item_timeout_secs.map(Duration::from_secs)
    }

    /// Maximum wait for a job of `task_count` units before forced completion.
    pub fn max_wait_for(&self, task_count: u64) -> Duration {
        Duration::from_secs(self.watch_max_wait_secs)
            + Duration::from_millis(self.watch_wait_per_item_ms.saturating_mul(task_count))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacesConfig {
    /// Minimum cosine similarity for an auto-assign match.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Discovery distance threshold; scaled into the DBSCAN radius.
    #[serde(default = "default_distance_threshold")]
    pub distance_threshold: f32,

    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    #[serde(default = "default_detection_confidence")]
    pub detection_confidence: f32,

    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

fn default_similarity_threshold() -> f32 {
    0.95
}

fn default_distance_threshold() -> f32 {
    5.0
}

fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("yearbook/models")
}

fn default_detection_confidence() -> f32 {
    0.7
}

fn default_intra_threads() -> usize {
    4
}

impl Default for FacesConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            distance_threshold: default_distance_threshold(),
            models_dir: default_models_dir(),
            detection_confidence: default_detection_confidence(),
            intra_threads: default_intra_threads(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("yearbook")
        .join("yearbook.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            library: LibraryConfig::default(),
            jobs: JobsConfig::default(),
            faces: FacesConfig::default(),
        }
    }
}

impl Config {
    /// Load from `YEARBOOK_CONFIG` or the default location, writing defaults
    /// out when no file exists yet.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("YEARBOOK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::config_path());

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("yearbook")
    }

    fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}
