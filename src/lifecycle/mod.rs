//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Logging → Metrics → Runtime → Watcher → Listeners
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Stop backend processes → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     SIGHUP → Reload config and recycle the application
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - Ordered shutdown: stop accept, stop backends, exit

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
