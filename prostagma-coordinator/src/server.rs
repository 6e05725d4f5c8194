use std::{
    io,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    extract::{ConnectInfo, Request, State},
    http::{
        Method, StatusCode,
        header::{CONTENT_LENGTH, CONTENT_TYPE},
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use protocol::{
    CACHE_PATH, CACHE_S3_PATH, CacheRequest, ErrorResponse, FetchSource, HEALTHZ_PATH,
    SharedSecret, StatusResponse, TRIGGER_PATH, TriggerRequest, TriggerResult,
};
use serde::de::DeserializeOwned;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    cache::CacheStore,
    fetch::{FetchError, Fetcher},
    triggers::TriggerStore,
};

mod handlers;

use handlers::*;

const MAX_REQUEST_BYTES: usize = 64 * 1024;
const DEFAULT_AWS_CLI: &str = "/usr/local/bin/aws";
const DEFAULT_FETCH_STALL_TIMEOUT_MS: u64 = 60_000;

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub secret: SharedSecret,
    pub cache_dir: PathBuf,
    pub aws_cli: PathBuf,
    pub fetch_stall_timeout_ms: u64,
}

impl CoordinatorConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: SharedSecret::new(secret),
            cache_dir: default_cache_dir(),
            aws_cli: PathBuf::from(DEFAULT_AWS_CLI),
            fetch_stall_timeout_ms: DEFAULT_FETCH_STALL_TIMEOUT_MS,
        }
    }
}

pub fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join("prostagma_cache")
}

#[derive(Clone)]
pub struct CoordinatorState {
    cache: Arc<CacheStore>,
    triggers: Arc<TriggerStore>,
    fetcher: Arc<Fetcher>,
    secret: SharedSecret,
    boot_id: Arc<str>,
}

impl CoordinatorState {
    /// Builds fresh state, wiping the cache directory. Failing here is fatal
    /// for the process.
    pub fn new(config: CoordinatorConfig) -> io::Result<Self> {
        let cache = CacheStore::open(&config.cache_dir)?;
        let fetcher = Fetcher::new(
            config.aws_cli,
            Duration::from_millis(config.fetch_stall_timeout_ms),
        )?;
        Ok(Self {
            cache: Arc::new(cache),
            triggers: Arc::new(TriggerStore::new()),
            fetcher: Arc::new(fetcher),
            secret: config.secret,
            boot_id: Arc::from(Uuid::new_v4().to_string()),
        })
    }

    pub fn boot_id(&self) -> &str {
        &self.boot_id
    }

    /// Backing file currently published for `url`, without a secret check.
    /// For embedding code and tests that inspect the store directly.
    pub async fn cached_path(&self, url: &str) -> Option<PathBuf> {
        self.cache.lookup(url).await
    }

    /// Number of URLs with a published file. Inspection only, like
    /// [`Self::cached_path`].
    pub async fn cached_url_count(&self) -> usize {
        self.cache.len().await
    }

    /// Reads a counter without creating it, unlike `GET /trigger`.
    pub async fn peek_trigger(&self, trigger: &str) -> Option<u64> {
        self.triggers.peek(trigger).await
    }

    /// Number of distinct trigger names seen so far. Inspection only.
    pub async fn trigger_name_count(&self) -> usize {
        self.triggers.len().await
    }

    fn authorize(&self, provided: &str, caller: &str) -> Result<(), CoordinatorError> {
        if self.secret.matches(provided) {
            return Ok(());
        }
        warn!(caller, "client provided a bad secret");
        Err(CoordinatorError::Forbidden)
    }

    fn trigger_result(&self, trigger: String, count: u64) -> TriggerResult {
        TriggerResult {
            trigger,
            count,
            boot_id: Some(self.boot_id.to_string()),
        }
    }
}

#[derive(Debug)]
pub enum CoordinatorError {
    BadRequest(String),
    Forbidden,
    NotFound(String),
    UpstreamStalled(String),
    Internal(String),
}

impl CoordinatorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            CoordinatorError::BadRequest(_) => StatusCode::BAD_REQUEST,
            CoordinatorError::Forbidden => StatusCode::FORBIDDEN,
            CoordinatorError::NotFound(_) => StatusCode::NOT_FOUND,
            CoordinatorError::UpstreamStalled(_) => StatusCode::GATEWAY_TIMEOUT,
            CoordinatorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorError::BadRequest(message) => write!(f, "bad request: {message}"),
            CoordinatorError::Forbidden => write!(f, "bad secret"),
            CoordinatorError::NotFound(message) => write!(f, "not found: {message}"),
            CoordinatorError::UpstreamStalled(message) => {
                write!(f, "upstream stalled: {message}")
            }
            CoordinatorError::Internal(message) => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl From<FetchError> for CoordinatorError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::InvalidUrl(_) => CoordinatorError::BadRequest(err.to_string()),
            FetchError::Refused(_) => CoordinatorError::NotFound(err.to_string()),
            FetchError::Stalled(_) => CoordinatorError::UpstreamStalled(err.to_string()),
            FetchError::Io(_) => CoordinatorError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for CoordinatorError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn build_coordinator_app(state: CoordinatorState) -> Router {
    Router::new()
        .route(HEALTHZ_PATH, get(healthz_handler))
        .route(
            CACHE_PATH,
            get(serve_cached_handler).post(cache_http_handler),
        )
        .route(CACHE_S3_PATH, post(cache_s3_handler))
        .route(
            TRIGGER_PATH,
            get(trigger_count_handler).post(increment_trigger_handler),
        )
        .layer(middleware::from_fn(access_log_middleware))
        .with_state(state)
}

fn caller_addr(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn decode_body<T: DeserializeOwned>(
    request: Request,
    caller: &str,
) -> Result<T, CoordinatorError> {
    let bytes = to_bytes(request.into_body(), MAX_REQUEST_BYTES)
        .await
        .map_err(|err| {
            info!(caller, "client sent an unreadable request body: {err}");
            CoordinatorError::BadRequest(format!("unreadable request body: {err}"))
        })?;
    serde_json::from_slice(&bytes).map_err(|err| {
        info!(caller, "client provided a bad request body: {err}");
        CoordinatorError::BadRequest(format!("invalid request body: {err}"))
    })
}

async fn discard_partial_file(path: &std::path::Path) {
    if let Err(err) = tokio::fs::remove_file(path).await
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!(
            "failed to remove partial cache file path={} err={err}",
            path.display()
        );
    }
}
