//! Image embedding model wrapper.
//!
//! The matcher only ever talks to [`ImageEmbedder`]; the production
//! implementation wraps fastembed's CLIP image model:
//! - Model download with configurable cache directory and timeout
//! - Dimension probing on load
//! - L2 normalization of every produced vector

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{mpsc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fastembed::{ImageEmbedding, ImageEmbeddingModel, ImageInitOptions};
use image::{DynamicImage, ImageFormat};

/// Default download timeout for model files (5 minutes)
const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Added to the norm so an all-zero vector normalizes to itself.
pub const NORM_EPSILON: f32 = 1e-10;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Model download timed out after {0} seconds")]
    DownloadTimeout(u64),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Opaque `image -> vector` function used by both the index builder and the matcher.
///
/// Implementations must be deterministic for a given image. Returned vectors are
/// raw model output; callers normalize with [`l2_normalize`].
pub trait ImageEmbedder: Send + Sync {
    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>, EmbeddingError>;

    /// SHA256 of the model name, stamped into matrix files so artifacts built
    /// with another model are rejected on load.
    fn model_id_hash(&self) -> [u8; 32] {
        model_id_hash(self.model_name())
    }
}

pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// Scale `v` to unit length in place. The norm is epsilon-guarded.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = l2_norm(v) + NORM_EPSILON;
    for x in v.iter_mut() {
        *x /= norm;
    }
}

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Embed and normalize, checking the vector has the embedder's dimensionality.
pub fn embed_normalized(
    embedder: &dyn ImageEmbedder,
    image: &DynamicImage,
) -> Result<Vec<f32>, EmbeddingError> {
    let mut embedding = embedder.embed(image)?;
    if embedding.len() != embedder.dimensions() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: embedder.dimensions(),
            got: embedding.len(),
        });
    }
    l2_normalize(&mut embedding);
    Ok(embedding)
}

/// Wrapper around fastembed's ImageEmbedding model.
/// Uses a Mutex because fastembed's embed requires &mut self.
pub struct ClipEmbedder {
    model: Mutex<ImageEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl ClipEmbedder {
    /// Load the named image model, downloading it into `cache_dir/models` on
    /// first use.
    ///
    /// Download and session setup run on a separate thread; if they do not
    /// finish within `download_timeout` the load fails with
    /// [`EmbeddingError::DownloadTimeout`] and the thread is left to finish on
    /// its own.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;
        let timeout = download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let options = ImageInitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);

        let (model, dimensions) = run_with_timeout(timeout, move || {
            let mut model = ImageEmbedding::try_new(options)
                .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;
            let dimensions = Self::probe_dimensions(&mut model)?;
            Ok((model, dimensions))
        })?;
        log::info!("loaded image model '{model_name}' ({dimensions} dimensions)");

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    fn parse_model_name(name: &str) -> Result<ImageEmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "clip-vit-b-32" | "clipvitb32" => Ok(ImageEmbeddingModel::ClipVitB32),
            "resnet50" => Ok(ImageEmbeddingModel::Resnet50),
            "unicom-vit-b-16" | "unicomvitb16" => Ok(ImageEmbeddingModel::UnicomVitB16),
            "unicom-vit-b-32" | "unicomvitb32" => Ok(ImageEmbeddingModel::UnicomVitB32),
            "nomic-embed-vision-v1.5" | "nomicembedvisionv15" => {
                Ok(ImageEmbeddingModel::NomicEmbedVisionV15)
            }
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: clip-vit-b-32, resnet50, unicom-vit-b-16, unicom-vit-b-32, nomic-embed-vision-v1.5",
                name
            ))),
        }
    }

    /// Probe the model with a blank image to determine embedding dimensions.
    fn probe_dimensions(model: &mut ImageEmbedding) -> Result<usize, EmbeddingError> {
        let probe = DynamicImage::new_rgb8(32, 32);
        let bytes = encode_png(&probe)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

        let embeddings = model
            .embed_bytes(&[bytes.as_slice()], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

        embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

impl ImageEmbedder for ClipEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>, EmbeddingError> {
        // fastembed runs its own decode + CLIP preprocessing, so hand it a
        // lossless encoding of the already-normalized image.
        let bytes = encode_png(image).map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        let mut model = lock_session(&self.model);

        let embeddings = model
            .embed_bytes(&[bytes.as_slice()], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }
}

/// Lock a model session, recovering it if an earlier call panicked while
/// holding the lock. A session keeps no partial state across calls.
pub fn lock_session<T>(session: &Mutex<T>) -> MutexGuard<'_, T> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run `init` on its own thread and wait at most `timeout` for the result.
fn run_with_timeout<T, F>(timeout: Duration, init: F) -> Result<T, EmbeddingError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EmbeddingError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("model-init".into())
        .spawn(move || {
            let _ = tx.send(init());
        })
        .map_err(|e| EmbeddingError::InitFailed(format!("Failed to spawn model loader: {}", e)))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            Err(EmbeddingError::DownloadTimeout(timeout.as_secs()))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(EmbeddingError::InitFailed(
            "model loader exited without a result".to_string(),
        )),
    }
}

fn encode_png(image: &DynamicImage) -> image::ImageResult<Vec<u8>> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}
