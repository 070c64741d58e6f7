//! WebSocket relay.
//!
//! # Data Flow
//! ```text
//! forwarding::handler sees 101 from the backend
//!     → client connection upgraded by the front end
//!     → relay.rs pumps frames between the two raw connections
//!     → frame.rs reads headers and payload pieces, re-encodes close frames
//! ```

pub mod frame;
pub mod relay;

pub use relay::{relay, relay_upgraded, CleanupReason};
