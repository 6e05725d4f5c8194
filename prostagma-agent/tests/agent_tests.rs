use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use agent::{Agent, AgentConfig, CoordinatorClient, PollOutcome, ensure_file};
use axum::{Router, routing::get};
use prostagma_coordinator::{CoordinatorConfig, CoordinatorState, build_coordinator_app};
use protocol::FetchSource;
use tempfile::TempDir;
use tokio::task::JoinHandle;

const SECRET: &str = "agent-secret";

async fn spawn_coordinator(cache_root: &TempDir) -> (SocketAddr, JoinHandle<()>, CoordinatorState) {
    let mut config = CoordinatorConfig::new(SECRET);
    config.cache_dir = cache_root.path().join("cache");
    let state = CoordinatorState::new(config).expect("state should build");
    let app = build_coordinator_app(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have addr");
    let handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("coordinator should run");
    });
    (addr, handle, state)
}

/// Origin whose `/counted.bin` reports how many times it was fetched.
async fn spawn_origin() -> (SocketAddr, JoinHandle<()>, Arc<AtomicU64>) {
    let hits = Arc::new(AtomicU64::new(0));
    let counter = hits.clone();
    let app = Router::new()
        .route("/kernel.img", get(|| async { b"kernel-image".to_vec() }))
        .route(
            "/counted.bin",
            get(move || {
                let counter = counter.clone();
                async move {
                    let next = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    format!("fetch-{next}")
                }
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("origin should bind");
    let addr = listener.local_addr().expect("origin should have addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("origin should run");
    });
    (addr, handle, hits)
}

fn client_for(addr: SocketAddr, secret: &str) -> CoordinatorClient {
    CoordinatorClient::new(&format!("http://{addr}"), secret, Duration::from_secs(5))
}

fn agent_config(addr: SocketAddr, secret: &str, script_path: PathBuf) -> AgentConfig {
    AgentConfig {
        coordinator_url: format!("http://{addr}/"),
        secret: secret.to_string(),
        trigger: "nightly".to_string(),
        script_path,
        shell: "/bin/sh".to_string(),
        poll_interval_ms: 100,
        rpc_timeout_ms: 5_000,
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn cold_cache_download_fetches_once_then_serves() {
    let cache_root = tempfile::tempdir().expect("tempdir");
    let work = tempfile::tempdir().expect("tempdir");
    let (addr, handle, state) = spawn_coordinator(&cache_root).await;
    let (origin, origin_handle, hits) = spawn_origin().await;
    let client = client_for(addr, SECRET);
    let url = format!("http://{origin}/counted.bin");
    let dest = work.path().join("counted.bin");

    let written = ensure_file(&client.origin(FetchSource::Http), &url, &dest, true)
        .await
        .expect("download should succeed");
    assert_eq!(written, "fetch-1".len() as u64);
    assert_eq!(std::fs::read(&dest).expect("dest"), b"fetch-1");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(state.cached_path(&url).await.is_some());

    // warm cache: served again without touching the origin
    let again = work.path().join("again.bin");
    ensure_file(&client.origin(FetchSource::Http), &url, &again, true)
        .await
        .expect("download should succeed");
    assert_eq!(std::fs::read(&again).expect("again"), b"fetch-1");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    handle.abort();
    origin_handle.abort();
}

#[tokio::test]
async fn bypassing_the_cache_always_refetches() {
    let cache_root = tempfile::tempdir().expect("tempdir");
    let work = tempfile::tempdir().expect("tempdir");
    let (addr, handle, _state) = spawn_coordinator(&cache_root).await;
    let (origin, origin_handle, hits) = spawn_origin().await;
    let client = client_for(addr, SECRET);
    let url = format!("http://{origin}/counted.bin");
    let dest = work.path().join("counted.bin");

    for expected in 1..=2u64 {
        ensure_file(&client.origin(FetchSource::Http), &url, &dest, false)
            .await
            .expect("download should succeed");
        assert_eq!(
            std::fs::read_to_string(&dest).expect("dest"),
            format!("fetch-{expected}")
        );
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    handle.abort();
    origin_handle.abort();
}

#[tokio::test]
async fn missing_remote_file_fails_and_leaves_no_destination() {
    let cache_root = tempfile::tempdir().expect("tempdir");
    let work = tempfile::tempdir().expect("tempdir");
    let (addr, handle, state) = spawn_coordinator(&cache_root).await;
    let (origin, origin_handle, _hits) = spawn_origin().await;
    let client = client_for(addr, SECRET);
    let url = format!("http://{origin}/does-not-exist");
    let dest = work.path().join("missing.bin");

    let err = ensure_file(&client.origin(FetchSource::Http), &url, &dest, true)
        .await
        .expect_err("download should fail");
    assert!(err.is_not_found(), "unexpected error: {err}");
    assert!(!dest.exists());
    assert_eq!(state.cached_url_count().await, 0);

    handle.abort();
    origin_handle.abort();
}

#[tokio::test]
async fn fire_and_sample_share_one_counter() {
    let cache_root = tempfile::tempdir().expect("tempdir");
    let (addr, handle, state) = spawn_coordinator(&cache_root).await;
    let client = client_for(addr, SECRET);

    let first = client.trigger_count("deploy").await.expect("count");
    assert_eq!(first.count, 0);
    assert_eq!(first.boot_id.as_deref(), Some(state.boot_id()));

    let fired = client.increment_trigger("deploy").await.expect("increment");
    assert_eq!(fired.count, 1);
    assert_eq!(client.trigger_count("deploy").await.expect("count").count, 1);

    handle.abort();
}

#[cfg(unix)]
#[tokio::test]
async fn agent_builds_once_per_rising_edge() {
    let cache_root = tempfile::tempdir().expect("tempdir");
    let work = tempfile::tempdir().expect("tempdir");
    let (addr, handle, _state) = spawn_coordinator(&cache_root).await;
    let log = work.path().join("builds.log");
    let script_path = work.path().join("build.yaml");
    std::fs::write(
        &script_path,
        format!("steps:\n  - shell: echo built >> {}\n", log.display()),
    )
    .expect("script should be written");

    let mut agent = Agent::new(agent_config(addr, SECRET, script_path));
    agent.prime().await;
    assert_eq!(agent.last_seen(), 0);

    assert_eq!(agent.poll_once().await, Some(PollOutcome::Unchanged));
    assert_eq!(agent.builds_started(), 0);

    let fire = client_for(addr, SECRET);
    for _ in 0..3 {
        fire.increment_trigger("nightly").await.expect("increment");
    }

    assert_eq!(
        agent.poll_once().await,
        Some(PollOutcome::Increased { from: 0, to: 3 })
    );
    assert_eq!(agent.builds_started(), 1);
    assert_eq!(read_lines(&log), vec!["built".to_string()]);

    assert_eq!(agent.poll_once().await, Some(PollOutcome::Unchanged));
    assert_eq!(agent.builds_started(), 1);
    assert_eq!(agent.last_seen(), 3);

    handle.abort();
}

#[cfg(unix)]
#[tokio::test]
async fn script_is_reread_for_every_build() {
    let cache_root = tempfile::tempdir().expect("tempdir");
    let work = tempfile::tempdir().expect("tempdir");
    let (addr, handle, _state) = spawn_coordinator(&cache_root).await;
    let log = work.path().join("builds.log");
    let script_path = work.path().join("build.yaml");
    std::fs::write(
        &script_path,
        format!("steps:\n  - shell: echo first >> {}\n", log.display()),
    )
    .expect("script should be written");

    let mut agent = Agent::new(agent_config(addr, SECRET, script_path.clone()));
    agent.prime().await;
    let fire = client_for(addr, SECRET);

    fire.increment_trigger("nightly").await.expect("increment");
    agent.poll_once().await;

    std::fs::write(
        &script_path,
        format!("steps:\n  - shell: echo second >> {}\n", log.display()),
    )
    .expect("script should be rewritten");
    fire.increment_trigger("nightly").await.expect("increment");
    agent.poll_once().await;

    assert_eq!(
        read_lines(&log),
        vec!["first".to_string(), "second".to_string()]
    );

    handle.abort();
}

#[tokio::test]
async fn rejected_sample_keeps_previous_count() {
    let cache_root = tempfile::tempdir().expect("tempdir");
    let work = tempfile::tempdir().expect("tempdir");
    let (addr, handle, _state) = spawn_coordinator(&cache_root).await;

    let fire = client_for(addr, SECRET);
    fire.increment_trigger("nightly").await.expect("increment");

    let mut agent = Agent::new(agent_config(
        addr,
        "wrong-secret",
        work.path().join("build.yaml"),
    ));
    agent.prime().await;
    assert_eq!(agent.last_seen(), 0);
    assert_eq!(agent.poll_once().await, None);
    assert_eq!(agent.last_seen(), 0);
    assert_eq!(agent.builds_started(), 0);

    handle.abort();
}

#[cfg(unix)]
#[tokio::test]
async fn failing_step_stops_the_build() {
    let cache_root = tempfile::tempdir().expect("tempdir");
    let work = tempfile::tempdir().expect("tempdir");
    let (addr, handle, _state) = spawn_coordinator(&cache_root).await;
    let log = work.path().join("builds.log");
    let script_path = work.path().join("build.yaml");
    std::fs::write(
        &script_path,
        format!(
            "steps:\n  - shell: |\n      echo before >> {log}\n      false\n      echo after >> {log}\n",
            log = log.display()
        ),
    )
    .expect("script should be written");

    let mut agent = Agent::new(agent_config(addr, SECRET, script_path));
    let err = agent.run_build().await.expect_err("build should fail");
    assert!(matches!(err, agent::ScriptError::CommandFailed { .. }));
    assert_eq!(read_lines(&log), vec!["before".to_string()]);

    handle.abort();
}

#[cfg(unix)]
#[tokio::test]
async fn download_step_lands_the_file() {
    let cache_root = tempfile::tempdir().expect("tempdir");
    let work = tempfile::tempdir().expect("tempdir");
    let (addr, handle, _state) = spawn_coordinator(&cache_root).await;
    let (origin, origin_handle, _hits) = spawn_origin().await;
    let dest = work.path().join("kernel.img");
    let script_path = work.path().join("build.yaml");
    std::fs::write(
        &script_path,
        format!(
            "steps:\n  - download:\n      cache: true\n      url: http://{origin}/kernel.img\n      dest: {}\n",
            dest.display()
        ),
    )
    .expect("script should be written");

    let mut agent = Agent::new(agent_config(addr, SECRET, script_path));
    agent.run_build().await.expect("build should succeed");
    assert_eq!(std::fs::read(&dest).expect("dest"), b"kernel-image");

    handle.abort();
    origin_handle.abort();
}
