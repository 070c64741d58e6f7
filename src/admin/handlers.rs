use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::process::ProcessSnapshot;
use crate::runtime::ProxyRuntime;

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub process_path: String,
    pub processes_per_application: usize,
    pub launches: u64,
    pub rapid_failures: usize,
    pub cached_connections: usize,
}

#[derive(Debug, Serialize)]
pub struct RecycleResult {
    pub retired: usize,
}

pub async fn get_status(State(runtime): State<Arc<ProxyRuntime>>) -> Json<SystemStatus> {
    let manager = runtime.manager();
    let application = manager.config();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: if manager.is_stopping() { "stopping" } else { "operational" },
        uptime_secs: runtime.uptime().as_secs(),
        process_path: application.process_path.clone(),
        processes_per_application: application.processes_per_application,
        launches: manager.launch_count(),
        rapid_failures: manager.rapid_fail_count(),
        cached_connections: runtime.cache().len(),
    })
}

pub async fn get_processes(State(runtime): State<Arc<ProxyRuntime>>) -> Json<Vec<ProcessSnapshot>> {
    Json(runtime.manager().snapshot().await)
}

/// Retire every running process; new ones start on the next request.
pub async fn post_recycle(State(runtime): State<Arc<ProxyRuntime>>) -> Json<RecycleResult> {
    let retired = runtime.recycle().await;
    tracing::info!(retired, "Application recycled through admin API");
    Json(RecycleResult { retired })
}
