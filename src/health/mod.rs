//! Backend health subsystem.
//!
//! # Data Flow
//! ```text
//! Launch (active.rs):
//!     Poll the backend port every 200 ms
//!     → ready once it listens (owner verified against the process tree)
//!     → fail on early exit or startup timeout
//!
//! Running (passive.rs):
//!     Exit monitor waits on the child
//!     → publishes ExitInfo on a watch channel
//!     → supervisor re-checks the port and tears the slot down
//! ```
//!
//! # Design Decisions
//! - Health is per process, not per request; a refused connection only
//!   triggers a re-check
//! - Connection refused during startup means "not yet"

pub mod active;
pub mod passive;
