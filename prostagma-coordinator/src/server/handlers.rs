use super::*;

pub(super) async fn access_log_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let caller = caller_addr(&request);
    let started = Instant::now();
    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started.elapsed().as_millis();
    // agents sample triggers every few seconds; keep those out of the info stream
    if method == Method::GET && path == TRIGGER_PATH {
        debug!(
            method = %method,
            path = %path,
            caller = %caller,
            status = status.as_u16(),
            elapsed_ms = elapsed_ms,
            "http access"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            caller = %caller,
            status = status.as_u16(),
            elapsed_ms = elapsed_ms,
            "http access"
        );
    }
    response
}

pub(super) async fn healthz_handler() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
    })
}

pub(super) async fn serve_cached_handler(
    State(state): State<CoordinatorState>,
    request: Request,
) -> Result<Response, CoordinatorError> {
    let caller = caller_addr(&request);
    let message: CacheRequest = decode_body(request, &caller).await?;
    state.authorize(&message.secret, &caller)?;

    let Some(path) = state.cache.lookup(&message.url).await else {
        info!(caller = %caller, url = %message.url, "client asked for uncached file");
        return Err(CoordinatorError::NotFound(format!(
            "{} is not cached",
            message.url
        )));
    };

    // a concurrent re-fetch may delete this file between lookup and open; once
    // open, the handle keeps the old bytes readable until the stream ends
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!(
                caller = %caller,
                url = %message.url,
                path = %path.display(),
                "cached file was superseded before it could be served"
            );
            return Err(CoordinatorError::NotFound(format!(
                "{} is no longer cached",
                message.url
            )));
        }
        Err(err) => {
            return Err(CoordinatorError::Internal(format!(
                "failed to open cached file: {err}"
            )));
        }
    };
    let len = file
        .metadata()
        .await
        .map_err(|err| CoordinatorError::Internal(format!("failed to stat cached file: {err}")))?
        .len();

    info!(
        caller = %caller,
        url = %message.url,
        path = %path.display(),
        bytes = len,
        "serving cached file"
    );
    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, "application/octet-stream".to_string()),
            (CONTENT_LENGTH, len.to_string()),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

pub(super) async fn cache_http_handler(
    State(state): State<CoordinatorState>,
    request: Request,
) -> Result<Json<StatusResponse>, CoordinatorError> {
    cache_file(state, request, FetchSource::Http).await
}

pub(super) async fn cache_s3_handler(
    State(state): State<CoordinatorState>,
    request: Request,
) -> Result<Json<StatusResponse>, CoordinatorError> {
    cache_file(state, request, FetchSource::S3).await
}

async fn cache_file(
    state: CoordinatorState,
    request: Request,
    source: FetchSource,
) -> Result<Json<StatusResponse>, CoordinatorError> {
    let caller = caller_addr(&request);
    let message: CacheRequest = decode_body(request, &caller).await?;
    state.authorize(&message.secret, &caller)?;

    let url = Fetcher::parse_source_url(source, &message.url)?;
    let path = state.cache.allocate_path();
    info!(
        caller = %caller,
        source = %source,
        url = %message.url,
        "attempting to download and cache file"
    );

    if let Err(err) = state.fetcher.fetch(source, &url, &path).await {
        discard_partial_file(&path).await;
        warn!(
            caller = %caller,
            source = %source,
            url = %message.url,
            "failed to cache file: {err}"
        );
        return Err(err.into());
    }

    let superseded = state.cache.publish(&message.url, path.clone()).await;
    info!(
        caller = %caller,
        url = %message.url,
        path = %path.display(),
        replaced = superseded.is_some(),
        "cached file"
    );
    Ok(Json(StatusResponse {
        status: "cached".to_string(),
    }))
}

pub(super) async fn trigger_count_handler(
    State(state): State<CoordinatorState>,
    request: Request,
) -> Result<Json<TriggerResult>, CoordinatorError> {
    let caller = caller_addr(&request);
    let message: TriggerRequest = decode_body(request, &caller).await?;
    state.authorize(&message.secret, &caller)?;

    let count = state.triggers.get(&message.trigger).await;
    debug!(
        caller = %caller,
        trigger = %message.trigger,
        count = count,
        "providing trigger count"
    );
    Ok(Json(state.trigger_result(message.trigger, count)))
}

pub(super) async fn increment_trigger_handler(
    State(state): State<CoordinatorState>,
    request: Request,
) -> Result<Json<TriggerResult>, CoordinatorError> {
    let caller = caller_addr(&request);
    let message: TriggerRequest = decode_body(request, &caller).await?;
    state.authorize(&message.secret, &caller)?;

    let count = state.triggers.increment(&message.trigger).await;
    info!(
        caller = %caller,
        trigger = %message.trigger,
        count = count,
        "trigger incremented"
    );
    Ok(Json(state.trigger_result(message.trigger, count)))
}
