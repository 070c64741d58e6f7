//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Pool slot needs a process:
//!     → circuit_breaker.rs (reject if too many failures in the last minute)
//!     → retries.rs (bounded relaunch of transient failures)
//!     → backoff.rs (delay between attempts)
//!
//! Request to backend:
//!     → timeouts.rs (per-operation deadline, off under a debugger)
//! ```
//!
//! # Design Decisions
//! - Critical failures never retry
//! - The breaker counts both failed launches and crashes

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::RapidFailBreaker;
pub use retries::StartRetryPolicy;
pub use timeouts::OperationTimeout;
