//! ASP.NET Core forwarder
//!
//! Supervises a pool of backend application processes and forwards every
//! client request to one of them over loopback HTTP/1.1.
//!
//! # Architecture Overview
//!
//! ```text
//!                         ┌──────────────────────────────────────────────────────┐
//!                         │                      FORWARDER                        │
//!                         │                                                       │
//!     Client Request      │  ┌─────────┐    ┌────────────┐    ┌──────────────┐   │
//!     ────────────────────┼─▶│  http   │───▶│ forwarding │───▶│   process    │   │
//!                         │  │ server  │    │  handler   │    │   manager    │   │
//!                         │  └─────────┘    └─────┬──────┘    └──────┬───────┘   │
//!                         │                       │                  │ spawn      │
//!                         │                       ▼                  ▼            │
//!     Client Response     │  ┌─────────┐    ┌────────────┐    ┌──────────────┐   │
//!     ◀───────────────────┼──│websocket│◀───│ connection │◀──▶│   backend    │   │
//!                         │  │  relay  │    │   cache    │    │  127.0.0.1   │   │
//!                         │  └─────────┘    └────────────┘    └──────────────┘   │
//!                         │                                                       │
//!                         │  config · health · resilience · observability         │
//!                         │  lifecycle · admin                                    │
//!                         └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use aspnetcore_forwarder::lifecycle::startup::bootstrap;

#[derive(Parser)]
#[command(name = "aspnetcore-forwarder", version)]
#[command(about = "Forward HTTP traffic to supervised ASP.NET Core processes", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "forwarder.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let forwarder = bootstrap(&args.config).await?;
    tracing::info!(address = %forwarder.local_addr()?, "Listening for connections");
    forwarder.run().await?;

    Ok(())
}
