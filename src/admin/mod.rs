//! Admin API for inspecting and recycling the supervised application.
//!
//! Served on its own listener, never on the forwarding front end, so no
//! backend path can shadow it.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::runtime::ProxyRuntime;

pub fn setup_admin_router(runtime: Arc<ProxyRuntime>) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/processes", get(get_processes))
        .route("/admin/recycle", post(post_recycle))
        .layer(middleware::from_fn_with_state(Arc::clone(&runtime), admin_auth_middleware))
        .with_state(runtime)
}
