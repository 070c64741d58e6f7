//! Backend process supervision.
//!
//! # Data Flow
//! ```text
//! Request needs a backend:
//!     → manager.rs (round robin over pool.rs slots)
//!     → slot ready? return it
//!     → else: breaker check → server.rs launch
//!         → port.rs (pick port) → environment.rs (env block, args)
//!         → platform.rs (own process group) → health::active (wait for listener)
//!
//! Backend exits:
//!     → health::passive publishes the exit
//!     → manager.rs re-checks the port, clears the slot, counts a rapid failure
//!
//! Stop:
//!     → shutdown.rs (shutdown message → stop signal → kill group)
//! ```

pub mod environment;
pub mod manager;
pub mod platform;
pub mod pool;
pub mod port;
pub mod server;
pub mod shutdown;
pub mod state;
pub mod stdout;

pub use manager::ProcessManager;
pub use port::PortProbe;
pub use server::{ProcessSnapshot, ServerProcess};
pub use state::ProcessState;
