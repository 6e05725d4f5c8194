use std::{io, path::Path, time::Duration};

use protocol::{
    CACHE_PATH, CacheRequest, FetchSource, TRIGGER_PATH, TriggerRequest, TriggerResult,
};
use reqwest::{Method, Response, StatusCode};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::download::CacheOrigin;

/// HTTP client for one coordinator, carrying the shared secret.
#[derive(Clone)]
pub struct CoordinatorClient {
    http: reqwest::Client,
    base_url: String,
    secret: String,
    poll_timeout: Duration,
}

#[derive(Debug)]
pub enum ClientError {
    Transport(reqwest::Error),
    Status { path: String, status: StatusCode },
    Decode(String),
    Io(io::Error),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Transport(err) => write!(f, "coordinator transport error: {err}"),
            ClientError::Status { path, status } => {
                write!(f, "coordinator answered {status} for {path}")
            }
            ClientError::Decode(message) => {
                write!(f, "could not decode coordinator response: {message}")
            }
            ClientError::Io(err) => write!(f, "local file error: {err}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl CoordinatorClient {
    pub fn new(base_url: &str, secret: impl Into<String>, poll_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: normalize_base_url(base_url),
            secret: secret.into(),
            poll_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Binds this client to one fetch source for the download algorithm.
    pub fn origin(&self, source: FetchSource) -> SourceOrigin<'_> {
        SourceOrigin {
            client: self,
            source,
        }
    }

    pub async fn trigger_count(&self, trigger: &str) -> Result<TriggerResult, ClientError> {
        let body = TriggerRequest {
            secret: self.secret.clone(),
            trigger: trigger.to_string(),
        };
        let response = self
            .send(Method::GET, TRIGGER_PATH, &body, Some(self.poll_timeout))
            .await?;
        response
            .json::<TriggerResult>()
            .await
            .map_err(|err| ClientError::Decode(err.to_string()))
    }

    pub async fn increment_trigger(&self, trigger: &str) -> Result<TriggerResult, ClientError> {
        let body = TriggerRequest {
            secret: self.secret.clone(),
            trigger: trigger.to_string(),
        };
        let response = self
            .send(Method::POST, TRIGGER_PATH, &body, Some(self.poll_timeout))
            .await?;
        response
            .json::<TriggerResult>()
            .await
            .map_err(|err| ClientError::Decode(err.to_string()))
    }

    /// Asks the coordinator to (re)fetch `url` into its cache.
    pub async fn request_fetch(&self, source: FetchSource, url: &str) -> Result<(), ClientError> {
        let body = CacheRequest {
            secret: self.secret.clone(),
            url: url.to_string(),
        };
        self.send(Method::POST, source.cache_path(), &body, None)
            .await?;
        Ok(())
    }

    /// Streams the coordinator's cached copy of `url` into `dest`.
    ///
    /// `dest` is only created once the coordinator has answered 200, so a
    /// cache miss leaves any existing file untouched.
    pub async fn download_cached(&self, url: &str, dest: &Path) -> Result<u64, ClientError> {
        let body = CacheRequest {
            secret: self.secret.clone(),
            url: url.to_string(),
        };
        let mut response = self.send(Method::GET, CACHE_PATH, &body, None).await?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(ClientError::Io)?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(ClientError::Transport)? {
            file.write_all(&chunk).await.map_err(ClientError::Io)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(ClientError::Io)?;
        debug!("downloaded {written} bytes url={url} dest={}", dest.display());
        Ok(written)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: &impl Serialize,
        timeout: Option<Duration>,
    ) -> Result<Response, ClientError> {
        let mut request = self
            .http
            .request(method, format!("{}{path}", self.base_url))
            .json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await.map_err(ClientError::Transport)?;
        if response.status() != StatusCode::OK {
            return Err(ClientError::Status {
                path: path.to_string(),
                status: response.status(),
            });
        }
        Ok(response)
    }
}

/// A [`CoordinatorClient`] paired with the fetch source a step asked for.
pub struct SourceOrigin<'a> {
    client: &'a CoordinatorClient,
    source: FetchSource,
}

impl CacheOrigin for SourceOrigin<'_> {
    async fn request_fetch(&self, url: &str) -> Result<(), ClientError> {
        self.client.request_fetch(self.source, url).await
    }

    async fn serve_cached(&self, url: &str, dest: &Path) -> Result<u64, ClientError> {
        self.client.download_cached(url, dest).await
    }
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_loses_trailing_slashes() {
        let client = CoordinatorClient::new("http://coordinator:9100//", "s", Duration::ZERO);
        assert_eq!(client.base_url(), "http://coordinator:9100");
    }

    #[test]
    fn only_404_counts_as_not_found() {
        let missing = ClientError::Status {
            path: "/cache".to_string(),
            status: StatusCode::NOT_FOUND,
        };
        let forbidden = ClientError::Status {
            path: "/cache".to_string(),
            status: StatusCode::FORBIDDEN,
        };
        assert!(missing.is_not_found());
        assert!(!forbidden.is_not_found());
    }
}
