//! Supervisor behaviour against real backend processes.

use std::sync::Arc;
use std::time::Duration;

use aspnetcore_forwarder::process::{platform, ProcessState};
use aspnetcore_forwarder::{ProcessError, ProxyRuntime};
use axum::http::StatusCode;
use tokio::net::TcpStream;
use tokio::time::Instant;

mod common;

use common::{client, test_config, TestForwarder};

#[tokio::test]
async fn test_process_started_on_demand_and_reused() {
    let forwarder = TestForwarder::start(test_config("")).await;
    assert!(forwarder.runtime.manager().snapshot().await.is_empty());

    let client = client();
    let first = client.get(forwarder.url("/pid")).send().await.unwrap().text().await.unwrap();
    let second = client.get(forwarder.url("/pid")).send().await.unwrap().text().await.unwrap();
    assert_eq!(first, second);

    let processes = forwarder.runtime.manager().snapshot().await;
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].pid.to_string(), first);
    assert_eq!(processes[0].state, ProcessState::Ready);

    forwarder.stop().await;
}

#[tokio::test]
async fn test_recycle_starts_fresh_process() {
    let forwarder = TestForwarder::start(test_config("")).await;
    let client = client();

    let before = client.get(forwarder.url("/pid")).send().await.unwrap().text().await.unwrap();
    assert_eq!(forwarder.runtime.recycle().await, 1);
    let after = client.get(forwarder.url("/pid")).send().await.unwrap().text().await.unwrap();

    assert_ne!(before, after);
    assert_eq!(forwarder.runtime.manager().launch_count(), 2);

    forwarder.stop().await;
}

#[tokio::test]
async fn test_reload_after_shutdown_is_ignored() {
    let runtime = ProxyRuntime::new(test_config(""));
    runtime.manager().get_process(true).await.unwrap();
    runtime.shutdown_backends().await;

    assert_eq!(runtime.apply_config(test_config("")).await, 0);
    assert!(runtime.manager().snapshot().await.is_empty());
    assert_eq!(runtime.manager().launch_count(), 1);
}

#[tokio::test]
async fn test_rapid_failures_disable_application() {
    let mut config = test_config("crash");
    config.application.rapid_fails_per_minute = 2;
    let runtime = ProxyRuntime::with_rapid_fail_window(config, Duration::from_secs(60));
    let manager = runtime.manager();

    for _ in 0..2 {
        let err = manager.get_process(true).await.unwrap_err();
        assert!(matches!(err, ProcessError::CreateFailed { attempts: 3, .. }), "{err}");
    }
    let launches = manager.launch_count();

    let err = manager.get_process(true).await.unwrap_err();
    assert!(matches!(err, ProcessError::ServerDisabled { failures: 2 }), "{err}");
    assert_eq!(manager.launch_count(), launches);

    runtime.shutdown_backends().await;
}

#[tokio::test]
async fn test_rapid_fail_window_expires() {
    let mut config = test_config("crash");
    config.application.rapid_fails_per_minute = 1;
    let runtime = ProxyRuntime::with_rapid_fail_window(config, Duration::from_millis(200));
    let manager = runtime.manager();

    assert!(matches!(manager.get_process(true).await, Err(ProcessError::CreateFailed { .. })));
    assert!(matches!(manager.get_process(true).await, Err(ProcessError::ServerDisabled { .. })));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(matches!(manager.get_process(true).await, Err(ProcessError::CreateFailed { .. })));

    runtime.shutdown_backends().await;
}

#[tokio::test]
async fn test_shutdown_stops_backend_and_rejects_requests() {
    let forwarder = TestForwarder::start(test_config("")).await;
    let res = client().get(forwarder.url("/pid")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let port = forwarder.runtime.manager().snapshot().await[0].port;
    let runtime = forwarder.runtime.clone();
    forwarder.stop().await;

    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    assert!(matches!(
        runtime.manager().get_process(true).await,
        Err(ProcessError::ApplicationExiting)
    ));
}

#[tokio::test]
async fn test_backend_ignoring_shutdown_is_killed() {
    let forwarder = TestForwarder::start(test_config("ignore-shutdown")).await;
    let res = client().get(forwarder.url("/pid")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let port = forwarder.runtime.manager().snapshot().await[0].port;
    forwarder.stop().await;

    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

/// Poll `done` every 50 ms for up to 10 s.
async fn eventually(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_crash_after_ready_frees_slot() {
    let runtime = ProxyRuntime::new(test_config(""));
    let manager = runtime.manager();

    let first = manager.get_process(true).await.unwrap();
    let crashed_pid = first.pid();
    assert_eq!(manager.rapid_fail_count(), 0);

    platform::kill_process(crashed_pid).unwrap();
    eventually("the crash to be counted", || manager.rapid_fail_count() == 1).await;
    assert!(first.is_exited());
    assert!(manager.snapshot().await.is_empty());

    let second = manager.get_process(true).await.unwrap();
    assert_ne!(second.pid(), crashed_pid);
    assert_eq!(second.state(), ProcessState::Ready);
    assert_eq!(manager.launch_count(), 2);

    runtime.shutdown_backends().await;
}

#[tokio::test]
async fn test_recycled_process_outlives_its_holders() {
    let runtime = ProxyRuntime::new(test_config(""));
    let manager = runtime.manager();

    let holders: Vec<_> = vec![
        manager.get_process(true).await.unwrap(),
        manager.get_process(true).await.unwrap(),
        manager.get_process(true).await.unwrap(),
    ];
    assert!(holders.iter().all(|p| Arc::ptr_eq(p, &holders[0])));
    let pid = holders[0].pid();
    let port = holders[0].port();
    let tracked = Arc::downgrade(&holders[0]);

    assert_eq!(manager.recycle(None).await, 1);
    assert!(manager.snapshot().await.is_empty());

    // The retired process stops, but every holder still sees the same object.
    eventually("the retired process to stop", || holders[0].state() == ProcessState::Stopped).await;
    assert_eq!(holders[2].pid(), pid);
    assert_eq!(holders[1].port(), port);
    assert!(tracked.upgrade().is_some());

    drop(holders);
    eventually("the last reference to go", || tracked.upgrade().is_none()).await;

    let replacement = manager.get_process(true).await.unwrap();
    assert_ne!(replacement.pid(), pid);

    runtime.shutdown_backends().await;
}
