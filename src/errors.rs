use crate::embeddings::EmbeddingError;

/// Everything that can go wrong while answering a match request.
#[derive(thiserror::Error, Debug)]
pub enum MatchError {
    #[error("No image provided (send file or image_url)")]
    NoImage,

    #[error("Uploaded file is empty")]
    EmptyUpload,

    #[error("Downloaded image is empty")]
    EmptyDownload,

    #[error("Failed to download image_url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Failed to download image_url: unsupported scheme {0}")]
    UnsupportedScheme(String),

    #[error("Failed to download image_url: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("Failed to download image_url: server answered {0}")]
    FetchStatus(reqwest::StatusCode),

    #[error("Image decoding/encoding failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Image decoding/encoding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Invalid form field: {0}")]
    InvalidForm(String),

    #[error("unexpected error: {0:?}")]
    Unexpected(#[from] anyhow::Error),
}

impl MatchError {
    /// Client errors map to 4xx; only `Unexpected` is the server's fault.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, MatchError::Unexpected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(MatchError::NoImage.is_client_error());
        assert!(MatchError::EmptyUpload.is_client_error());
        assert!(MatchError::FetchStatus(reqwest::StatusCode::NOT_FOUND).is_client_error());
        assert!(MatchError::InvalidForm("top_k".into()).is_client_error());
        assert!(!MatchError::Unexpected(anyhow::anyhow!("boom")).is_client_error());
    }

    #[test]
    fn test_messages_carry_cause() {
        let err = MatchError::from(url::Url::parse("not a url").unwrap_err());
        assert!(err.to_string().starts_with("Failed to download image_url:"));

        let err = MatchError::from(EmbeddingError::EmbeddingFailed("session closed".into()));
        assert!(err.to_string().contains("session closed"));
    }
}
