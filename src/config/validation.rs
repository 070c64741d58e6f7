//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (pool size, ports, time limits)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ForwarderConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use crate::config::schema::{ForwarderConfig, MAX_PORT, MIN_PORT};

/// Largest pool the supervisor will manage.
pub const MAX_PROCESSES_PER_APPLICATION: usize = 100;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("application.process_path must not be empty")]
    MissingProcessPath,

    #[error("application.processes_per_application must be between 1 and 100, got {0}")]
    PoolSize(usize),

    #[error("application.port must be between 1025 and 48000, got {0}")]
    PortOutOfRange(u16),

    #[error("application.startup_time_limit_secs must be greater than zero")]
    ZeroStartupLimit,

    #[error("application.app_path must start with '/', got {0:?}")]
    RelativeAppPath(String),

    #[error("admin.api_key must be set when the admin API is enabled")]
    MissingAdminKey,

    #[error("protocol.{0} must be greater than zero")]
    ZeroBuffer(&'static str),
}

/// Check a parsed configuration for semantic errors.
pub fn validate_config(config: &ForwarderConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let app = &config.application;

    if app.process_path.trim().is_empty() {
        errors.push(ValidationError::MissingProcessPath);
    }

    if app.processes_per_application == 0 || app.processes_per_application > MAX_PROCESSES_PER_APPLICATION {
        errors.push(ValidationError::PoolSize(app.processes_per_application));
    }

    if let Some(port) = app.port {
        if !(MIN_PORT..=MAX_PORT).contains(&port) {
            errors.push(ValidationError::PortOutOfRange(port));
        }
    }

    if app.startup_time_limit_secs == 0 {
        errors.push(ValidationError::ZeroStartupLimit);
    }

    if !app.app_path.starts_with('/') {
        errors.push(ValidationError::RelativeAppPath(app.app_path.clone()));
    }

    if config.admin.enabled && config.admin.api_key.is_empty() {
        errors.push(ValidationError::MissingAdminKey);
    }

    if config.protocol.max_response_header_size == 0 {
        errors.push(ValidationError::ZeroBuffer("max_response_header_size"));
    }

    if config.protocol.websocket_buffer_size == 0 {
        errors.push(ValidationError::ZeroBuffer("websocket_buffer_size"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
