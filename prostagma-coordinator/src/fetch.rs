use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use protocol::FetchSource;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;
use url::Url;

/// Pulls remote files into the cache directory.
///
/// HTTP(S) sources are downloaded directly; object-storage sources are handed
/// to an external `aws`-compatible CLI (`<cli> s3 cp <url> <file>`).
pub struct Fetcher {
    client: reqwest::Client,
    aws_cli: PathBuf,
}

#[derive(Debug)]
pub enum FetchError {
    /// The URL cannot be fetched through the requested source at all.
    InvalidUrl(String),
    /// The remote side refused or failed to produce the file.
    Refused(String),
    /// The remote side stopped sending for longer than the stall timeout.
    Stalled(String),
    /// Writing the local copy failed.
    Io(io::Error),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::InvalidUrl(message) => write!(f, "invalid source url: {message}"),
            FetchError::Refused(message) => write!(f, "remote fetch failed: {message}"),
            FetchError::Stalled(message) => write!(f, "remote fetch stalled: {message}"),
            FetchError::Io(err) => write!(f, "failed to write cache file: {err}"),
        }
    }
}

impl std::error::Error for FetchError {}

impl Fetcher {
    /// `stall_timeout` bounds connecting and each read from the remote, not the
    /// whole transfer.
    pub fn new(aws_cli: PathBuf, stall_timeout: Duration) -> io::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(stall_timeout)
            .read_timeout(stall_timeout)
            .build()
            .map_err(io::Error::other)?;
        Ok(Self { client, aws_cli })
    }

    /// Checks that `raw` is a URL the given source knows how to retrieve.
    pub fn parse_source_url(source: FetchSource, raw: &str) -> Result<Url, FetchError> {
        let url = Url::parse(raw.trim()).map_err(|err| FetchError::InvalidUrl(err.to_string()))?;
        let accepted = match source {
            FetchSource::Http => matches!(url.scheme(), "http" | "https"),
            FetchSource::S3 => url.scheme() == "s3",
        };
        if !accepted {
            return Err(FetchError::InvalidUrl(format!(
                "scheme '{}' is not supported by the {source} fetcher",
                url.scheme()
            )));
        }
        Ok(url)
    }

    pub async fn fetch(&self, source: FetchSource, url: &Url, dest: &Path) -> Result<(), FetchError> {
        match source {
            FetchSource::Http => self.fetch_http(url, dest).await,
            FetchSource::S3 => self.fetch_s3(url, dest).await,
        }
    }

    async fn fetch_http(&self, url: &Url, dest: &Path) -> Result<(), FetchError> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(transfer_error)?;
        if !response.status().is_success() {
            return Err(FetchError::Refused(format!(
                "upstream answered {}",
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(dest).await.map_err(FetchError::Io)?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(transfer_error)?
        {
            file.write_all(&chunk).await.map_err(FetchError::Io)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(FetchError::Io)?;
        debug!("fetched {written} bytes url={url} path={}", dest.display());
        Ok(())
    }

    async fn fetch_s3(&self, url: &Url, dest: &Path) -> Result<(), FetchError> {
        let output = Command::new(&self.aws_cli)
            .arg("s3")
            .arg("cp")
            .arg(url.as_str())
            .arg(dest)
            .output()
            .await
            .map_err(|err| {
                FetchError::Io(io::Error::new(
                    err.kind(),
                    format!("failed to invoke {}: {err}", self.aws_cli.display()),
                ))
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(FetchError::Refused(format!(
                "{} exited with {}: {}",
                self.aws_cli.display(),
                output.status,
                combined.trim()
            )));
        }
        debug!("object-storage copy finished url={url} output={}", combined.trim());
        Ok(())
    }
}

fn transfer_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Stalled(err.to_string())
    } else {
        FetchError::Refused(err.to_string())
    }
}
