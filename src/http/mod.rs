//! HTTP front end.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request ID, tracing)
//!     → request.rs (client address, scheme, upstream identities)
//!     → forwarding::handler (backend exchange)
//!     → response.rs (answers generated by the forwarder itself)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{ClientInfo, X_REQUEST_ID};
pub use server::HttpServer;
