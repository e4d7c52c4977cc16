//! Modbus RTU gateway service
//!
//! Hosts the `rtu_gateway` core: opens the RS-485 port, serves Modbus TCP
//! and UDP clients, and persists the slave statistics.
//!
//! ```text
//! ┌──────────────┐   ClientEvent   ┌──────────────┐  SerialCommand  ┌──────────────┐
//! │ TCP / UDP    │───────────────►│ Engine task  │────────────────►│ Serial task  │
//! │ listeners    │◄───────────────│  (Gateway)   │◄────────────────│ tokio-serial │
//! └──────────────┘  ChannelSink   └──────────────┘    SerialRx     └──────────────┘
//! ```

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod persistence;
pub mod runtime;
pub mod serial;
pub mod shutdown;

pub use error::{GatewaySrvError, Result};
pub use runtime::{run_service, EngineTask, MonotonicClock};
