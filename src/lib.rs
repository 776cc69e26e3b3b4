//! # xarm-bridge - Cloud to Serial Bridge for xARM Controllers
//!
//! xarm-bridge connects a cloud message bus to one controller board attached over a
//! serial line. Three independent flows share the single half-duplex link:
//!
//! - **Telemetry**: unsolicited device lines are forwarded to the cloud.
//! - **Downlink**: cloud pushes are written to the device, fire-and-forget.
//! - **Methods**: cloud method calls are written as commands and answered with the
//!   device's reply, or a timeout sentinel when it stays silent.
//!
//! ## Features
//!
//! - **Exclusive Channel**: every exchange runs under one mutex, so replies are
//!   never stolen by another flow.
//! - **Transparent Reconnect**: any transport error drops the link; the next user
//!   reopens it with exponential backoff (2s doubling to 30s).
//! - **Command Validation**: method calls are checked against the controller's
//!   vocabulary before anything reaches the wire.
//! - **Reported State**: replies to position commands keep a per-position state
//!   document that is published to the cloud.
//! - **Cooperative Shutdown**: loops stop at their next wait; in-flight method calls
//!   are still answered.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use xarm_bridge::bridge::Bridge;
//! use xarm_bridge::cloud::ChannelCloud;
//! use xarm_bridge::config::Config;
//! use xarm_bridge::serial::SerialPortOpener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let opener = SerialPortOpener::new(
//!         config.serial.port.clone(),
//!         config.serial.baud_rate,
//!         config.serial.read_timeout(),
//!     );
//!     let (cloud, harness) = ChannelCloud::pair();
//!     // hand `harness` to whatever talks to the real cloud
//!     # drop(harness);
//!     Bridge::new(&config, Box::new(opener), cloud).run().await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`bridge`] - the three loops, the channel mutex and their orchestration
//! - [`serial`] - serial link ownership, line I/O and reconnect backoff
//! - [`cloud`] - the cloud collaborator trait and its in-process/stdio implementations
//! - [`command`] - controller command vocabulary and validation
//! - [`config`] - configuration loading and validation
//! - [`error`] - error types shared across the crate
//! - [`metrics`] - runtime counters
//! - [`shutdown`] - cooperative shutdown signal
//! - [`logutil`] - helpers for logging device traffic
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐  ┌───────────┐  ┌───────────┐
//! │ Telemetry │  │ Downlink  │  │  Methods  │ ← loops, one task each
//! └───────────┘  └───────────┘  └───────────┘
//!        └──────────────┼──────────────┘
//!               ┌───────────────┐
//!               │ ChannelMutex  │ ← one exchange at a time
//!               └───────────────┘
//!                       │
//!               ┌───────────────┐
//!               │ SerialChannel │ ← lazy open, backoff, fault
//!               └───────────────┘
//! ```

pub mod bridge;
pub mod cloud;
pub mod command;
pub mod config;
pub mod error;
pub mod logutil;
pub mod metrics;
pub mod serial;
pub mod shutdown;
