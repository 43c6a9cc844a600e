//! The HTTP capability the pipeline consumes.
//!
//! [`Transport`] is the only seam between the patch pipeline and the network;
//! [`HttpTransport`] is the production implementation.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::config::TransportConfig;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} responded with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("failed to read response from {url}: {details}")]
    Body { url: String, details: String },
}

/// A response body delivered chunk by chunk.
pub struct RemoteBody {
    /// Declared `Content-Length`, when the server sent one.
    pub content_length: Option<u64>,
    pub chunks: BoxStream<'static, Result<Vec<u8>, TransportError>>,
}

impl std::fmt::Debug for RemoteBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// GET `url` and return the body as text. Non-success statuses are
    /// errors.
    async fn get_text(&self, url: &str) -> Result<String, TransportError>;

    /// GET `url` and return the body as a stream. Non-success statuses are
    /// errors.
    async fn get_stream(&self, url: &str) -> Result<RemoteBody, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with the configured timeouts and user agent.
    ///
    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be constructed.
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .read_timeout(config.read_timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(TransportError::ClientBuild)?;
        Ok(Self::with_client(client))
    }

    /// Use a caller-built client, e.g. one with a proxy or extra root
    /// certificates.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_text(&self, url: &str) -> Result<String, TransportError> {
        self.send(url)
            .await?
            .text()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })
    }

    async fn get_stream(&self, url: &str) -> Result<RemoteBody, TransportError> {
        let response = self.send(url).await?;
        let content_length = response.content_length();
        let url = url.to_string();
        let chunks = response
            .bytes_stream()
            .map(move |chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|source| TransportError::Request {
                        url: url.clone(),
                        source,
                    })
            })
            .boxed();
        Ok(RemoteBody {
            content_length,
            chunks,
        })
    }
}
