//! Remote query image download.

use std::time::Duration;

use crate::errors::MatchError;

/// Default timeout for downloading a remote query image.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(8);

const USER_AGENT: &str = concat!("vpm/", env!("CARGO_PKG_VERSION"));

/// Single-attempt GET of an http(s) image URL with a bounded timeout.
pub struct ImageFetcher {
    client: reqwest::Client,
}

impl ImageFetcher {
    pub fn new(timeout: Duration) -> Result<Self, MatchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { client })
    }

    pub async fn fetch(&self, image_url: &str) -> Result<Vec<u8>, MatchError> {
        let url = url::Url::parse(image_url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(MatchError::UnsupportedScheme(url.scheme().to_string()));
        }

        log::debug!("fetching query image {url}");

        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(MatchError::FetchStatus(status));
        }

        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(MatchError::EmptyDownload);
        }

        Ok(bytes.to_vec())
    }
}
