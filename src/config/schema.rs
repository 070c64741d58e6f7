//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the forwarder.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lowest port handed out when no explicit port is configured.
pub const MIN_PORT: u16 = 1025;

/// Highest port handed out when no explicit port is configured.
pub const MAX_PORT: u16 = 48000;

/// Root configuration for the forwarder.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Client-facing listener.
    pub listener: ListenerConfig,

    /// The supervised backend application.
    pub application: ApplicationConfig,

    /// Header and buffering policy for forwarded requests.
    pub protocol: ProtocolConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Whether clients reach this listener over TLS terminated in front of it.
    /// Only reported to the backend through the SSL header.
    pub https: bool,

    /// Default `Server` header the host would emit. Removed when the backend
    /// does not send one of its own.
    pub server_header: Option<String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            https: false,
            server_header: None,
        }
    }
}

/// Authentication schemes enabled on the front end, reported to the backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthenticationConfig {
    pub windows: bool,
    pub basic: bool,
    pub anonymous: bool,
}

impl Default for AuthenticationConfig {
    fn default() -> Self {
        Self {
            windows: false,
            basic: false,
            anonymous: true,
        }
    }
}

/// Backend application definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Executable to launch. `%ASPNETCORE_PORT%` is expanded.
    pub process_path: String,

    /// Command line arguments. `%ASPNETCORE_PORT%` is expanded.
    pub arguments: String,

    /// Extra environment variables for the backend.
    pub environment: BTreeMap<String, String>,

    /// Application virtual path, e.g. "/" or "/shop".
    pub app_path: String,

    /// Fixed listening port. A random free port is chosen when absent.
    pub port: Option<u16>,

    /// Number of backend processes in the pool.
    pub processes_per_application: usize,

    /// Failures tolerated within a rolling minute before the application is disabled.
    pub rapid_fails_per_minute: u32,

    /// Time allowed for a launched process to start listening.
    pub startup_time_limit_secs: u64,

    /// Time allowed for a graceful stop after the shutdown message.
    pub shutdown_time_limit_secs: u64,

    /// Time allowed after the stop signal before the process tree is killed.
    pub signal_time_limit_secs: u64,

    /// Per-request timeout for backend I/O.
    pub request_timeout_secs: u64,

    /// Redirect backend stdout/stderr into a log file.
    pub stdout_log_enabled: bool,

    /// Log file prefix; a timestamp and pid are appended.
    pub stdout_log_file: String,

    /// Forward the negotiated Windows identity token to the backend.
    pub forward_windows_auth_token: bool,

    /// Answer start failures with a bare status instead of an error page.
    pub disable_startup_error_page: bool,

    /// Allow WebSocket upgrades to be relayed.
    pub websockets_enabled: bool,

    /// Hosting startup assemblies appended to the backend environment.
    pub hosting_startup_assemblies: Vec<String>,

    /// Authentication schemes enabled on the front end.
    pub authentication: AuthenticationConfig,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            process_path: String::new(),
            arguments: String::new(),
            environment: BTreeMap::new(),
            app_path: "/".to_string(),
            port: None,
            processes_per_application: 1,
            rapid_fails_per_minute: 10,
            startup_time_limit_secs: 120,
            shutdown_time_limit_secs: 10,
            signal_time_limit_secs: 5,
            request_timeout_secs: 120,
            stdout_log_enabled: false,
            stdout_log_file: "logs/stdout".to_string(),
            forward_windows_auth_token: true,
            disable_startup_error_page: false,
            websockets_enabled: true,
            hosting_startup_assemblies: vec!["Microsoft.AspNetCore.Server.IISIntegration".to_string()],
            authentication: AuthenticationConfig::default(),
        }
    }
}

impl ApplicationConfig {
    pub fn startup_time_limit(&self) -> Duration {
        Duration::from_secs(self.startup_time_limit_secs)
    }

    pub fn shutdown_time_limit(&self) -> Duration {
        Duration::from_secs(self.shutdown_time_limit_secs)
    }

    pub fn signal_time_limit(&self) -> Duration {
        Duration::from_secs(self.signal_time_limit_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Full command line, used in failure logs.
    pub fn command_line(&self) -> String {
        if self.arguments.is_empty() {
            self.process_path.clone()
        } else {
            format!("{} {}", self.process_path, self.arguments)
        }
    }
}

/// Header and buffering policy applied to every forwarded request.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Reuse backend connections across requests.
    pub keep_alive: bool,

    /// Send the client's Host header to the backend instead of the loopback address.
    pub preserve_host_header: bool,

    /// Rewrite backend-host URLs in Location, Content-Location and Set-Cookie.
    pub reverse_rewrite_headers: bool,

    pub x_forwarded_for_header: String,

    pub ssl_header: String,

    pub client_cert_header: String,

    /// Append the client port to the forwarded-for value.
    pub include_port_in_xff: bool,

    /// Bytes accumulated before a flush to the client. Zero streams every read.
    pub min_response_buffer: usize,

    /// Upper bound on bytes held before a forced flush.
    pub response_buffer_limit: usize,

    /// Largest response header block accepted from a backend.
    pub max_response_header_size: usize,

    /// WebSocket payload bytes moved per read, in each direction.
    pub websocket_buffer_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            keep_alive: true,
            preserve_host_header: true,
            reverse_rewrite_headers: false,
            x_forwarded_for_header: "X-Forwarded-For".to_string(),
            ssl_header: "X-Forwarded-Proto".to_string(),
            client_cert_header: "MS-ASPNETCORE-CLIENTCERT".to_string(),
            include_port_in_xff: true,
            min_response_buffer: 0,
            response_buffer_limit: 4 * 1024 * 1024,
            max_response_header_size: 64 * 1024,
            websocket_buffer_size: 4 * 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the human-readable format.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
