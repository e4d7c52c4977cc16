//! Statistics counters
//!
//! Per-slave counters indexed by address 1..=247 plus gateway-wide
//! diagnostics. Mutated only by the gateway's single logical thread;
//! snapshots are exported for persistence and restored at startup.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{MAX_RESPONSE_LEN, MAX_SLAVES, MAX_SLAVE_ADDRESS};
use crate::frame::RtuFrame;

/// Result of the last transaction with a slave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaveStatus {
    /// Normal response
    Ok,
    /// Slave answered with an exception code
    Exception(u8),
    /// Request rejected because the queue was full
    Rejected,
    /// No response after all attempts
    Timeout,
    /// Final attempt ended on a corrupt frame
    Error,
}

/// Per-slave counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlaveStats {
    pub requests: u32,
    pub errors: u32,
    pub timeouts: u32,
    /// Monotonic timestamp (ms) of the last valid frame from this slave
    pub last_seen: Option<u64>,
    pub status: Option<SlaveStatus>,
    not_responding: bool,
    /// Correlation of the one request let through while not responding
    gate_holder: Option<u16>,
    response: [u8; MAX_RESPONSE_LEN],
    response_len: usize,
}

impl SlaveStats {
    const EMPTY: Self = Self {
        requests: 0,
        errors: 0,
        timeouts: 0,
        last_seen: None,
        status: None,
        not_responding: false,
        gate_holder: None,
        response: [0; MAX_RESPONSE_LEN],
        response_len: 0,
    };

    /// Leading bytes of the last response PDU
    pub fn last_response(&self) -> &[u8] {
        &self.response[..self.response_len]
    }

    /// Last transaction timed out and no valid frame has arrived since
    pub fn is_not_responding(&self) -> bool {
        self.not_responding
    }
}

impl Default for SlaveStats {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Gateway-wide diagnostic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayCounters {
    /// Client messages dropped as malformed
    pub invalid_requests: u32,
    /// RTU frames discarded for CRC or length errors
    pub frame_errors: u32,
    /// Transactions that exhausted all attempts
    pub timeouts: u32,
    /// Client requests refused (queue full or slave not responding)
    pub rejections: u32,
    pub serial_tx_bytes: u64,
    pub serial_rx_bytes: u64,
    pub client_rx_bytes: u64,
    pub client_tx_bytes: u64,
}

/// Counters for every slave address plus gateway-wide diagnostics
#[derive(Debug, Clone)]
pub struct GatewayStats {
    slaves: [SlaveStats; MAX_SLAVES],
    counters: GatewayCounters,
}

#[inline]
fn index(address: u8) -> Option<usize> {
    if (1..=MAX_SLAVE_ADDRESS).contains(&address) {
        Some(usize::from(address) - 1)
    } else {
        None
    }
}

impl GatewayStats {
    pub fn new() -> Self {
        Self {
            slaves: [SlaveStats::EMPTY; MAX_SLAVES],
            counters: GatewayCounters::default(),
        }
    }

    fn slave_mut(&mut self, address: u8) -> Option<&mut SlaveStats> {
        index(address).map(|i| &mut self.slaves[i])
    }

    /// Counters of one slave, `None` for broadcast or out-of-range addresses
    pub fn slave(&self, address: u8) -> Option<&SlaveStats> {
        index(address).map(|i| &self.slaves[i])
    }

    /// All slave counters, index 0 is address 1
    pub fn slaves(&self) -> &[SlaveStats] {
        &self.slaves
    }

    pub fn counters(&self) -> &GatewayCounters {
        &self.counters
    }

    // ========================================================================
    // Slave gate
    // ========================================================================

    /// A slave marked as not responding admits a single request, until that
    /// request's terminal outcome or removal from the queue
    pub fn gate_closed(&self, address: u8) -> bool {
        self.slave(address)
            .is_some_and(|s| s.not_responding && s.gate_holder.is_some())
    }

    /// Hand the gate to `correlation` if the slave is not responding
    pub fn take_gate(&mut self, address: u8, correlation: u16) {
        if let Some(slave) = self.slave_mut(address) {
            if slave.not_responding && slave.gate_holder.is_none() {
                slave.gate_holder = Some(correlation);
            }
        }
    }

    /// Reopen the gate, only when `correlation` holds it
    pub fn release_gate(&mut self, address: u8, correlation: u16) {
        if let Some(slave) = self.slave_mut(address) {
            if slave.gate_holder == Some(correlation) {
                slave.gate_holder = None;
            }
        }
    }

    // ========================================================================
    // Transaction outcomes
    // ========================================================================

    pub fn record_request(&mut self, address: u8) {
        if let Some(slave) = self.slave_mut(address) {
            slave.requests = slave.requests.wrapping_add(1);
        }
    }

    /// Valid frame from `address`, normal or exception
    pub fn record_response(&mut self, frame: &RtuFrame, now: u64) {
        let Some(slave) = self.slave_mut(frame.address()) else {
            return;
        };
        slave.last_seen = Some(now);
        slave.not_responding = false;
        slave.status = Some(match frame.exception_code() {
            Some(code) => SlaveStatus::Exception(code),
            None => SlaveStatus::Ok,
        });

        let mut pdu = [0u8; MAX_RESPONSE_LEN];
        pdu[0] = frame.function();
        let len = frame.data().len().min(MAX_RESPONSE_LEN - 1);
        pdu[1..1 + len].copy_from_slice(&frame.data()[..len]);
        slave.response = pdu;
        slave.response_len = 1 + len;
    }

    pub fn record_timeout(&mut self, address: u8) {
        self.counters.timeouts = self.counters.timeouts.wrapping_add(1);
        if let Some(slave) = self.slave_mut(address) {
            slave.timeouts = slave.timeouts.wrapping_add(1);
            slave.status = Some(SlaveStatus::Timeout);
            if !slave.not_responding {
                debug!("Slave {} marked not responding", address);
            }
            slave.not_responding = true;
        }
    }

    pub fn record_error(&mut self, address: u8) {
        if let Some(slave) = self.slave_mut(address) {
            slave.errors = slave.errors.wrapping_add(1);
            slave.status = Some(SlaveStatus::Error);
        }
    }

    pub fn record_rejected(&mut self, address: u8) {
        self.counters.rejections = self.counters.rejections.wrapping_add(1);
        if let Some(slave) = self.slave_mut(address) {
            slave.status = Some(SlaveStatus::Rejected);
        }
    }

    // ========================================================================
    // Gateway-wide diagnostics
    // ========================================================================

    pub fn record_invalid_request(&mut self) {
        self.counters.invalid_requests = self.counters.invalid_requests.wrapping_add(1);
    }

    pub fn record_frame_error(&mut self) {
        self.counters.frame_errors = self.counters.frame_errors.wrapping_add(1);
    }

    pub fn record_serial_tx(&mut self, bytes: usize) {
        self.counters.serial_tx_bytes += bytes as u64;
    }

    pub fn record_serial_rx(&mut self, bytes: usize) {
        self.counters.serial_rx_bytes += bytes as u64;
    }

    pub fn record_client_rx(&mut self, bytes: usize) {
        self.counters.client_rx_bytes += bytes as u64;
    }

    pub fn record_client_tx(&mut self, bytes: usize) {
        self.counters.client_tx_bytes += bytes as u64;
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Export counters of every slave that has any activity
    pub fn snapshot(&self) -> StatsSnapshot {
        let slaves = self
            .slaves
            .iter()
            .zip(1..=MAX_SLAVE_ADDRESS)
            .filter(|(s, _)| s.requests > 0 || s.errors > 0 || s.timeouts > 0 || s.status.is_some())
            .map(|(s, address)| SlaveSnapshot {
                address,
                requests: s.requests,
                errors: s.errors,
                timeouts: s.timeouts,
                status: s.status,
            })
            .collect();

        StatsSnapshot {
            counters: self.counters,
            slaves,
        }
    }

    /// Replace all counters with a persisted snapshot
    ///
    /// Timestamps and the not-responding gate are runtime state and start cleared.
    pub fn restore(&mut self, snapshot: &StatsSnapshot) {
        *self = Self::new();
        self.counters = snapshot.counters;
        for entry in &snapshot.slaves {
            match self.slave_mut(entry.address) {
                Some(slave) => {
                    slave.requests = entry.requests;
                    slave.errors = entry.errors;
                    slave.timeouts = entry.timeouts;
                    slave.status = entry.status;
                },
                None => debug!("Skipping stats for invalid slave {}", entry.address),
            }
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Persisted counters of one slave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveSnapshot {
    pub address: u8,
    #[serde(default)]
    pub requests: u32,
    #[serde(default)]
    pub errors: u32,
    #[serde(default)]
    pub timeouts: u32,
    #[serde(default)]
    pub status: Option<SlaveStatus>,
}

/// Persisted statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    #[serde(default)]
    pub counters: GatewayCounters,
    #[serde(default)]
    pub slaves: Vec<SlaveSnapshot>,
}
