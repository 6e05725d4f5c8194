use std::{env, net::SocketAddr, path::PathBuf};

use prostagma_coordinator::{
    CoordinatorConfig, CoordinatorState, build_coordinator_app, default_cache_dir,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if wants_version_flag() {
        println!("{}", binary_version_text());
        return Ok(());
    }

    init_logging();
    info!("{}", binary_version_text());

    let addr = parse_addr("PROSTAGMA_ADDR", "0.0.0.0:9100")?;
    let secret = env::var("PROSTAGMA_SECRET").unwrap_or_default();
    if secret.is_empty() {
        return Err("PROSTAGMA_SECRET must be set to a non-empty value".into());
    }

    let mut config = CoordinatorConfig::new(secret);
    config.cache_dir = parse_path("PROSTAGMA_CACHE_DIR", default_cache_dir());
    config.aws_cli = parse_path("PROSTAGMA_AWS_CLI", config.aws_cli);
    config.fetch_stall_timeout_ms = parse_u64(
        "PROSTAGMA_FETCH_STALL_TIMEOUT_MS",
        config.fetch_stall_timeout_ms,
    )?;

    let state = CoordinatorState::new(config.clone()).map_err(|err| {
        format!(
            "could not create cache directory {}: {err}",
            config.cache_dir.display()
        )
    })?;
    info!(
        "cache directory ready path={} boot_id={}",
        config.cache_dir.display(),
        state.boot_id()
    );

    let app = build_coordinator_app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("coordinator listening on http://{}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    info!("coordinator stopped");
    Ok(())
}

fn init_logging() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn parse_addr(key: &str, default: &str) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    let value = env::var(key).unwrap_or_else(|_| default.to_string());
    Ok(value.parse()?)
}

fn parse_u64(key: &str, default: u64) -> Result<u64, Box<dyn std::error::Error>> {
    match env::var(key) {
        Ok(value) => Ok(value.parse()?),
        Err(_) => Ok(default),
    }
}

fn parse_path(key: &str, default: PathBuf) -> PathBuf {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
        _ => default,
    }
}

fn wants_version_flag() -> bool {
    env::args()
        .skip(1)
        .any(|arg| matches!(arg.as_str(), "-V" | "--version"))
}

fn binary_version_text() -> String {
    buildinfo::version_text(
        env!("CARGO_PKG_NAME"),
        option_env!("PROSTAGMA_BUILD_GIT_TAG"),
        option_env!("PROSTAGMA_BUILD_GIT_COMMIT"),
        option_env!("PROSTAGMA_BUILD_GIT_DIRTY"),
    )
}
