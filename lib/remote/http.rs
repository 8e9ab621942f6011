use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use tracing::{debug, instrument, warn};

use super::{RemoteError, RemoteSource};
use crate::fs::Superblock;

/// A [`RemoteSource`] serving files over plain HTTP GET/HEAD beneath a base URL.
///
/// The superblock is expected at `{url}/.superblock.txt`; a missing one means an empty tree.
#[derive(Debug, Clone)]
pub struct HttpSource {
    base: String,
    client: reqwest::Client,
}

impl HttpSource {
    const SUPERBLOCK_PATH: &'static str = "/.superblock.txt";

    /// A source rooted at `url` with the given request timeout.
    #[must_use]
    pub fn new(url: &str, timeout: Duration) -> Self {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(e) => {
                warn!(url, error = %e, "failed to build HTTP client, using defaults without a timeout");
                reqwest::Client::new()
            }
        };
        Self::from_client(url, client)
    }

    /// A source rooted at `url` using an existing client.
    #[must_use]
    pub fn from_client(url: &str, client: reqwest::Client) -> Self {
        Self {
            base: url.trim_end_matches('/').to_owned(),
            client,
        }
    }

    /// The base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base)
        } else {
            format!("{}/{path}", self.base)
        }
    }

    fn check(path: &str, status: StatusCode) -> Result<(), RemoteError> {
        if status == StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound(path.to_owned()));
        }
        if !status.is_success() {
            return Err(RemoteError::Status {
                path: path.to_owned(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    #[instrument(name = "HttpSource::load_superblock", skip(self), fields(base = %self.base))]
    async fn load_superblock(&self) -> Result<Superblock, RemoteError> {
        let response = self
            .client
            .get(self.url_for(Self::SUPERBLOCK_PATH))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("remote has no superblock, starting empty");
            return Ok(Superblock::empty());
        }
        Self::check(Self::SUPERBLOCK_PATH, response.status())?;
        let text = response.text().await.map_err(map_reqwest_error)?;
        Ok(Superblock::parse_text(&text)?)
    }

    #[instrument(name = "HttpSource::read_file", skip(self))]
    async fn read_file(&self, path: &str) -> Result<Bytes, RemoteError> {
        let response = self
            .client
            .get(self.url_for(path))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        Self::check(path, response.status())?;
        response.bytes().await.map_err(map_reqwest_error)
    }

    #[instrument(name = "HttpSource::size_file", skip(self))]
    async fn size_file(&self, path: &str) -> Result<u64, RemoteError> {
        let response = self
            .client
            .head(self.url_for(path))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        Self::check(path, response.status())?;
        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| RemoteError::Status {
                path: path.to_owned(),
                status: response.status().as_u16(),
            })
    }
}

/// Map a reqwest error to a [`RemoteError`].
fn map_reqwest_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else if err.is_connect() {
        RemoteError::Connection(err.to_string())
    } else {
        RemoteError::Transport(Box::new(err))
    }
}
