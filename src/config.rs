use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::matcher::{DEFAULT_STATIC_PREFIX, DEFAULT_THRESHOLD, DEFAULT_TOP_K};

const CONFIG_FILE: &str = "config.yaml";

/// Default image model (CLIP ViT-B/32, 512 dimensions)
const DEFAULT_MODEL: &str = "clip-vit-b-32";
/// Uploads wider than this are downsampled before embedding
const DEFAULT_MAX_IMAGE_WIDTH: u32 = 1024;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = crate::fetch::DEFAULT_FETCH_TIMEOUT.as_secs();
const DEFAULT_LISTEN: &str = "0.0.0.0:8000";
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const DEFAULT_CACHE_DIR: &str = ".fastembed_cache";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Image model name (e.g., "clip-vit-b-32")
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_max_image_width")]
    pub max_image_width: u32,

    /// Timeout for downloading `image_url` queries
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    /// Cosine similarity floor [-1.0, 1.0]
    #[serde(default = "default_threshold")]
    pub default_threshold: f32,

    /// URL prefix the data directory is served under
    #[serde(default = "default_static_prefix")]
    pub static_prefix: String,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub model_download_timeout_secs: u64,

    /// Model cache, relative to the data directory unless absolute
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(skip_serializing, skip_deserializing)]
    data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_image_width: DEFAULT_MAX_IMAGE_WIDTH,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            listen: default_listen(),
            default_top_k: DEFAULT_TOP_K,
            default_threshold: DEFAULT_THRESHOLD,
            static_prefix: default_static_prefix(),
            model_download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            cache_dir: default_cache_dir(),
            data_dir: PathBuf::new(),
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_image_width() -> u32 {
    DEFAULT_MAX_IMAGE_WIDTH
}

fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_threshold() -> f32 {
    DEFAULT_THRESHOLD
}

fn default_static_prefix() -> String {
    DEFAULT_STATIC_PREFIX.to_string()
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_DIR)
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_image_width == 0 {
            bail!("max_image_width must be greater than 0");
        }

        if self.fetch_timeout_secs == 0 {
            bail!("fetch_timeout_secs must be greater than 0");
        }

        if self.model_download_timeout_secs == 0 {
            bail!("model_download_timeout_secs must be greater than 0");
        }

        if !(-1.0..=1.0).contains(&self.default_threshold) {
            bail!(
                "default_threshold must be between -1.0 and 1.0, got {}",
                self.default_threshold
            );
        }

        let prefix = &self.static_prefix;
        if !prefix.starts_with('/') || prefix.trim_end_matches('/').is_empty() {
            bail!(
                "static_prefix must start with '/' and name a path, got '{}'",
                self.static_prefix
            );
        }

        Ok(())
    }

    /// Apply `MODEL_NAME`, `MAX_IMAGE_WIDTH` and `PORT` from the environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(model) = var("MODEL_NAME") {
            self.model = model;
        }

        if let Some(width) = var("MAX_IMAGE_WIDTH") {
            self.max_image_width = width
                .parse()
                .with_context(|| format!("MAX_IMAGE_WIDTH is not a number: {width}"))?;
        }

        if let Some(port) = var("PORT") {
            let port: u16 = port
                .parse()
                .with_context(|| format!("PORT is not a valid port: {port}"))?;
            let host = self
                .listen
                .rsplit_once(':')
                .map(|(host, _)| host)
                .unwrap_or("0.0.0.0");
            self.listen = format!("{host}:{port}");
        }

        Ok(())
    }

    /// Load `config.yaml` from `data_dir`, creating it with defaults when it
    /// does not exist and re-saving it when new fields were filled in.
    pub fn load_with(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let path = data_dir.join(CONFIG_FILE);
        if !path.exists() {
            let mut config = Self::default();
            config.data_dir = data_dir.to_path_buf();
            config.save()?;
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.data_dir = data_dir.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_str = serde_yml::to_string(&self)?;
        let path = self.data_dir.join(CONFIG_FILE);
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, config_str)?;
        std::fs::rename(&temp_path, &path)?;
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn model_cache_dir(&self) -> PathBuf {
        if self.cache_dir.is_absolute() {
            self.cache_dir.clone()
        } else {
            self.data_dir.join(&self.cache_dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_creates_default_config() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_with(tmp.path()).unwrap();

        assert!(tmp.path().join(CONFIG_FILE).exists());
        assert_eq!(config.model, "clip-vit-b-32");
        assert_eq!(config.max_image_width, 1024);
        assert_eq!(config.default_top_k, 6);
        assert_eq!(config.default_threshold, 0.0);
        assert_eq!(config.data_dir(), tmp.path());
        assert_eq!(config.model_cache_dir(), tmp.path().join(".fastembed_cache"));
    }

    #[test]
    fn test_partial_config_is_filled_and_resaved() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "max_image_width: 512\n").unwrap();

        let config = Config::load_with(tmp.path()).unwrap();
        assert_eq!(config.max_image_width, 512);
        assert_eq!(config.fetch_timeout_secs, 8);

        let saved = std::fs::read_to_string(tmp.path().join(CONFIG_FILE)).unwrap();
        assert!(saved.contains("fetch_timeout_secs"));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "default_threshold: 1.5\n").unwrap();
        assert!(Config::load_with(tmp.path()).is_err());

        std::fs::write(tmp.path().join(CONFIG_FILE), "static_prefix: static\n").unwrap();
        assert!(Config::load_with(tmp.path()).is_err());

        std::fs::write(tmp.path().join(CONFIG_FILE), "static_prefix: /\n").unwrap();
        assert!(Config::load_with(tmp.path()).is_err());

        std::fs::write(tmp.path().join(CONFIG_FILE), "max_image_width: 0\n").unwrap();
        assert!(Config::load_with(tmp.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("MODEL_NAME", "resnet50"),
            ("MAX_IMAGE_WIDTH", "640"),
            ("PORT", "9000"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.model, "resnet50");
        assert_eq!(config.max_image_width, 640);
        assert_eq!(config.listen, "0.0.0.0:9000");
    }

    #[test]
    fn test_bad_env_override_is_an_error() {
        let mut config = Config::default();
        let result = config.apply_overrides(|key| (key == "PORT").then(|| "http".to_string()));
        assert!(result.is_err());
    }
}
