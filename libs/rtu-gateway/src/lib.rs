//! Modbus RTU to Modbus TCP/UDP gateway core
//!
//! Multiplexes requests from many network clients onto a single RS-485
//! Modbus RTU bus. The core is synchronous and tick-driven: the host feeds
//! client messages, serial bytes and a monotonic millisecond clock, and
//! receives encoded responses through a [`ResponseSink`]. All buffers are
//! fixed-size, so the request path never allocates.
//!
//! # Architecture
//!
//! ```text
//! client ADU -> Gateway -> RequestQueue -> RtuEngine <-> SerialLine
//!                  ^                          |
//!                  +------ Completion --------+
//! ```
//!
//! - [`frame`]: RTU and MBAP codecs
//! - [`queue`]: bounded FIFO (entry count and payload byte budget)
//! - [`engine`]: one transaction at a time, retries and timeouts
//! - [`scanner`]: slave discovery through the same queue and engine
//! - [`stats`]: per-slave and gateway-wide counters
//! - [`gateway`]: dispatcher routing outcomes back to clients

pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod frame;
pub mod gateway;
pub mod queue;
pub mod request;
pub mod scanner;
pub mod stats;

// Re-export common types for convenience
pub use config::{EngineConfig, GatewayConfig, Parity, SerialConfig, SerialFormat};
pub use engine::{Completion, EngineState, Outcome, RtuEngine, SerialLine, Transaction};
pub use error::{CodecError, GatewayError, QueueError, Result};
pub use frame::{decode_adu, decode_rtu_frame, encode_adu, encode_rtu_frame, Adu, RtuFrame};
pub use gateway::{Gateway, ResponseSink};
pub use queue::RequestQueue;
pub use request::{Framing, Origin, Request, RequestKind, ScanProbe, SessionId, Transport};
pub use scanner::{DiscoveryEvent, Scanner};
pub use stats::{GatewayCounters, GatewayStats, SlaveStats, SlaveStatus, StatsSnapshot};
