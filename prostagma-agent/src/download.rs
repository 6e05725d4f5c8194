use std::{future::Future, path::Path};

use tracing::{info, warn};

use crate::{client::ClientError, logging::category_cache};

/// The two coordinator operations a download step relies on.
pub trait CacheOrigin {
    /// Ask the coordinator to (re)fetch `url` into its cache.
    fn request_fetch(&self, url: &str) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Copy the coordinator's cached bytes for `url` into `dest`.
    fn serve_cached(
        &self,
        url: &str,
        dest: &Path,
    ) -> impl Future<Output = Result<u64, ClientError>> + Send;
}

/// Makes `dest` hold the content of `url`, going through the coordinator's
/// cache.
///
/// A warm cache is trusted first. When serving fails the coordinator is asked
/// to fetch once and serving is retried once, so a call makes at most two
/// fetch requests and two serve attempts. With `use_cache` off a fetch is
/// always requested up front. Fetch failures are returned immediately.
pub async fn ensure_file<O: CacheOrigin>(
    origin: &O,
    url: &str,
    dest: &Path,
    use_cache: bool,
) -> Result<u64, ClientError> {
    if !use_cache {
        request_fetch(origin, url).await?;
    }

    match origin.serve_cached(url, dest).await {
        Ok(bytes) => {
            info!(
                "{} served url={url} dest={} bytes={bytes}",
                category_cache(),
                dest.display()
            );
            return Ok(bytes);
        }
        Err(err) => {
            info!(
                "{} first serve attempt failed url={url}: {err}; asking coordinator to fetch",
                category_cache()
            );
        }
    }

    request_fetch(origin, url).await?;

    match origin.serve_cached(url, dest).await {
        Ok(bytes) => {
            info!(
                "{} served after fetch url={url} dest={} bytes={bytes}",
                category_cache(),
                dest.display()
            );
            Ok(bytes)
        }
        Err(err) => {
            warn!("{} could not download url={url}: {err}", category_cache());
            Err(err)
        }
    }
}

async fn request_fetch<O: CacheOrigin>(origin: &O, url: &str) -> Result<(), ClientError> {
    origin.request_fetch(url).await.inspect_err(|err| {
        warn!(
            "{} coordinator could not fetch url={url}: {err}",
            category_cache()
        );
    })
}
