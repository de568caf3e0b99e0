use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::embeddings::{embed_normalized, ClipEmbedder, ImageEmbedder};
use crate::errors::MatchError;
use crate::fetch::ImageFetcher;
use crate::images;
use crate::index::Artifacts;
use crate::matcher::{MatchParams, Matcher, ProductMatch};

/// Where the query image comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Upload(Vec<u8>),
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub products: usize,
    pub images: usize,
    pub dimensions: usize,
    pub model: String,
}

/// Process-wide state: built once before serving, never mutated afterwards.
pub struct AppContext {
    config: Config,
    artifacts: Artifacts,
    embedder: Arc<dyn ImageEmbedder>,
    fetcher: ImageFetcher,
}

impl AppContext {
    pub fn new(
        config: Config,
        artifacts: Artifacts,
        embedder: Arc<dyn ImageEmbedder>,
    ) -> Result<Self> {
        if artifacts.dimensions() != embedder.dimensions() {
            anyhow::bail!(
                "artifacts have {} dimensions but model '{}' produces {}; rebuild with `vpm build`",
                artifacts.dimensions(),
                embedder.model_name(),
                embedder.dimensions()
            );
        }

        let fetcher = ImageFetcher::new(Duration::from_secs(config.fetch_timeout_secs))?;

        Ok(Self {
            config,
            artifacts,
            embedder,
            fetcher,
        })
    }

    /// Load the configured model and the artifacts from the data directory.
    pub fn load(config: Config) -> Result<Self> {
        let embedder = load_embedder(&config)?;
        let artifacts = Artifacts::load(
            config.data_dir(),
            &embedder.model_id_hash(),
            embedder.dimensions(),
        )?;

        Self::new(config, artifacts, embedder)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn artifacts(&self) -> &Artifacts {
        &self.artifacts
    }

    pub fn stats(&self) -> Stats {
        Stats {
            products: self.artifacts.products.len(),
            images: self.artifacts.image_index.len(),
            dimensions: self.artifacts.dimensions(),
            model: self.embedder.model_name().to_string(),
        }
    }

    /// Request parameters with config defaults filled in.
    pub fn params(
        &self,
        top_k: Option<usize>,
        threshold: Option<f32>,
        price_min: Option<f64>,
        price_max: Option<f64>,
    ) -> MatchParams {
        MatchParams {
            top_k: top_k.unwrap_or(self.config.default_top_k),
            threshold: threshold.unwrap_or(self.config.default_threshold),
            price: crate::price::PriceRange::new(price_min, price_max),
        }
    }

    /// Turn a request source into image bytes. Uploads win over URLs.
    pub async fn read_source(&self, source: Option<ImageSource>) -> Result<Vec<u8>, MatchError> {
        match source {
            Some(ImageSource::Upload(bytes)) if bytes.is_empty() => Err(MatchError::EmptyUpload),
            Some(ImageSource::Upload(bytes)) => Ok(bytes),
            Some(ImageSource::Url(url)) => self.fetcher.fetch(&url).await,
            None => Err(MatchError::NoImage),
        }
    }

    /// Normalized query embedding for raw image bytes.
    pub fn query_embedding(&self, bytes: &[u8]) -> Result<Vec<f32>, MatchError> {
        if bytes.is_empty() {
            return Err(MatchError::EmptyUpload);
        }

        let image = images::prepare_query_image(bytes, self.config.max_image_width).map_err(|err| {
            log::debug!(
                "query image failed to decode (detected format: {:?})",
                images::detect_format(bytes)
            );
            err
        })?;

        Ok(embed_normalized(self.embedder.as_ref(), &image)?)
    }

    /// Embed `bytes` and rank the catalog against it.
    pub fn match_image(
        &self,
        bytes: &[u8],
        params: &MatchParams,
    ) -> Result<Vec<ProductMatch>, MatchError> {
        // a panic while embedding or ranking fails this request only; the
        // artifacts are read-only and the model lock recovers from poisoning
        let matcher = Matcher::new(&self.artifacts, &self.config.static_prefix);
        std::panic::catch_unwind(AssertUnwindSafe(|| -> Result<_, MatchError> {
            let query = self.query_embedding(bytes)?;
            Ok(matcher.find_matches(&query, params))
        }))
        .map_err(|panic| {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            MatchError::Unexpected(anyhow::anyhow!("match panicked: {msg}"))
        })?
    }
}

pub fn load_embedder(config: &Config) -> Result<Arc<dyn ImageEmbedder>> {
    let embedder = ClipEmbedder::new(
        &config.model,
        config.model_cache_dir(),
        Some(Duration::from_secs(config.model_download_timeout_secs)),
    )
    .with_context(|| format!("failed to load model '{}'", config.model))?;

    Ok(Arc::new(embedder))
}
