use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration: optional TOML file, then `ROLLCALL_*` overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite identity store.
    pub db_path: PathBuf,
    /// Cosine similarity required for a positive identification.
    pub similarity_threshold: f32,
    /// Freshness window of the live-feed detection cache.
    pub cache_window: Duration,
    /// Eye distance in the aligned crop, in pixels.
    pub desired_eye_distance: f32,
    /// Equalize live frames before detection.
    pub enhance_live_frames: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// On-disk shape; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    similarity_threshold: Option<f32>,
    cache_window_ms: Option<u64>,
    desired_eye_distance: Option<f32>,
    enhance_live_frames: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: rollcall_core::default_model_dir(),
            db_path: data_dir().join("faces.db"),
            similarity_threshold: 0.6,
            cache_window: rollcall_core::locator::DEFAULT_CACHE_WINDOW,
            desired_eye_distance: rollcall_core::alignment::DESIRED_EYE_DISTANCE,
            enhance_live_frames: false,
        }
    }
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (must exist) or the XDG config file (may
    /// be absent), then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();
        let (path, required) = match env("ROLLCALL_CONFIG") {
            Some(p) => (PathBuf::from(p), true),
            None => (config_dir().join("rollcall/config.toml"), false),
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => {
                tracing::debug!(path = %path.display(), "loaded config file");
                Some(text)
            }
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        Self::from_sources(text.as_deref(), &path, env)
    }

    /// Build from file contents (if any) and an environment lookup.
    pub fn from_sources(
        file: Option<&str>,
        origin: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let parsed: FileConfig = match file {
            Some(text) => toml::from_str(text).map_err(|source| ConfigError::Parse {
                path: origin.to_path_buf(),
                source,
            })?,
            None => FileConfig::default(),
        };

        let mut config = Self::default();
        if let Some(dir) = parsed.model_dir {
            config.model_dir = dir;
        }
        if let Some(path) = parsed.db_path {
            config.db_path = path;
        }
        if let Some(t) = parsed.similarity_threshold {
            config.similarity_threshold = t;
        }
        if let Some(ms) = parsed.cache_window_ms {
            config.cache_window = Duration::from_millis(ms);
        }
        if let Some(d) = parsed.desired_eye_distance {
            config.desired_eye_distance = d;
        }
        if let Some(on) = parsed.enhance_live_frames {
            config.enhance_live_frames = on;
        }

        if let Some(dir) = env("ROLLCALL_MODEL_DIR") {
            config.model_dir = PathBuf::from(dir);
        }
        if let Some(path) = env("ROLLCALL_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(t) = env_parse(&env, "ROLLCALL_SIMILARITY_THRESHOLD") {
            config.similarity_threshold = t;
        }
        if let Some(ms) = env_parse(&env, "ROLLCALL_CACHE_WINDOW_MS") {
            config.cache_window = Duration::from_millis(ms);
        }
        if let Some(d) = env_parse(&env, "ROLLCALL_EYE_DISTANCE") {
            config.desired_eye_distance = d;
        }
        if let Some(on) = env_parse(&env, "ROLLCALL_ENHANCE_LIVE") {
            config.enhance_live_frames = on;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity_threshold {} is outside [-1, 1]",
                self.similarity_threshold
            )));
        }
        if !(self.desired_eye_distance.is_finite() && self.desired_eye_distance > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "desired_eye_distance {} must be positive",
                self.desired_eye_distance
            )));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(rollcall_core::SCRFD_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join(rollcall_core::ARCFACE_MODEL_FILE)
    }
}

/// Unparseable values are ignored with a warning.
fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("rollcall")
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}
