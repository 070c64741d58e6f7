//! Out-of-process forwarder for ASP.NET Core applications.

pub mod admin;
pub mod config;
pub mod connection;
pub mod error;
pub mod forwarding;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod process;
pub mod resilience;
pub mod runtime;
pub mod websocket;

pub use config::schema::ForwarderConfig;
pub use error::{ForwardError, ProcessError};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use runtime::ProxyRuntime;
