//! Backend connections.
//!
//! A small HTTP/1.1 client over loopback TCP: one shared
//! [`ForwarderConnection`] per backend port, buffered streams that keep
//! read-ahead bytes for the body or an upgraded session, and raw response
//! head capture.

pub mod cache;
pub mod head;
pub mod stream;

pub use cache::{ConnectionCache, ForwarderConnection};
pub use head::RawResponseHead;
pub use stream::BackendStream;
