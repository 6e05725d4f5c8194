mod secret;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use secret::SharedSecret;

pub const CACHE_PATH: &str = "/cache";
pub const CACHE_S3_PATH: &str = "/cache/s3";
pub const TRIGGER_PATH: &str = "/trigger";
pub const HEALTHZ_PATH: &str = "/healthz";

/// Body of every `/cache` and `/cache/s3` request.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheRequest {
    pub secret: String,
    pub url: String,
}

/// Body of every `/trigger` request.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerRequest {
    pub secret: String,
    pub trigger: String,
}

/// Reply to both reading and incrementing a trigger.
///
/// `boot_id` is minted once per coordinator process. Coordinators that do not
/// send it are still understood; agents then fall back to the count-decrease
/// heuristic alone.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerResult {
    pub trigger: String,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: String,
}

/// Where the coordinator pulls a file from when asked to cache it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FetchSource {
    Http,
    S3,
}

impl FetchSource {
    pub fn cache_path(self) -> &'static str {
        match self {
            FetchSource::Http => CACHE_PATH,
            FetchSource::S3 => CACHE_S3_PATH,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FetchSource::Http => "http",
            FetchSource::S3 => "s3",
        }
    }
}

impl fmt::Display for FetchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl fmt::Debug for CacheRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRequest")
            .field("secret", &"<redacted>")
            .field("url", &self.url)
            .finish()
    }
}

impl fmt::Debug for TriggerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerRequest")
            .field("secret", &"<redacted>")
            .field("trigger", &self.trigger)
            .finish()
    }
}
