//! The forwarding engine.
//!
//! # Data Flow
//! ```text
//! client request
//!     → request_headers.rs (strip, inject token and forwarded-for headers)
//!     → url.rs (backend request target)
//!     → handler.rs (exchange with the backend over handle.rs)
//!     → response_headers.rs + rewrite.rs (replay the backend head)
//!     → body.rs + chunked.rs (stream the body back with backpressure)
//! ```
//!
//! # Design Decisions
//! - One exchange task per request; the front end waits only for the head
//! - status.rs tracks progress and completion, disconnect.rs client loss

pub mod body;
pub mod chunked;
pub mod disconnect;
pub mod handle;
pub mod handler;
pub mod request_headers;
pub mod response_headers;
pub mod rewrite;
pub mod status;
pub mod url;

pub use handler::{forward_request, ForwardedResponse};
pub use status::RequestStatus;
