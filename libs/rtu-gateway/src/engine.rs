//! RTU transaction engine
//!
//! Owns the serial bus. Dequeues one request at a time, transmits it with
//! transmit-enable held for the frame plus the inter-frame delay, collects
//! the response until t3.5 of line silence, and retries on timeout. All
//! waiting is expressed as deadlines checked by `poll`, nothing blocks.

use std::io;

use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::constants::MODBUS_SIZE;
use crate::error::{CodecError, GatewayError, Result};
use crate::frame::{decode_rtu_frame, encode_rtu_frame, RtuFrame};
use crate::queue::RequestQueue;
use crate::request::Request;
use crate::stats::GatewayStats;

/// Half-duplex serial bus with RS-485 direction control
pub trait SerialLine {
    /// Drive the transceiver's transmit-enable (DE/RTS) line
    fn set_transmit_enable(&mut self, enabled: bool);

    /// Queue bytes for transmission, must not block
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl<T: SerialLine + ?Sized> SerialLine for &mut T {
    fn set_transmit_enable(&mut self, enabled: bool) {
        (**self).set_transmit_enable(enabled)
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write(bytes)
    }
}

/// Engine state, at most one transaction is outside `Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    /// Transmit-enable asserted, frame and inter-frame delay in progress
    Sending,
    /// Transmit-enable released, response countdown running
    AwaitingResponse,
}

/// Terminal result of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Well-formed frame from the addressed slave (possibly an exception)
    Response(RtuFrame),
    /// Broadcast transmitted, no response expected
    BroadcastSent,
    /// No valid response after all attempts
    Timeout,
    /// Final attempt ended on a frame that failed to decode
    Corrupted(CodecError),
}

/// Request together with its terminal outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub request: Request,
    pub outcome: Outcome,
    /// Transmissions made
    pub attempts: u8,
}

/// Working state of the single in-flight request
#[derive(Debug, Clone)]
pub struct Transaction {
    request: Request,
    attempts: u8,
    max_attempts: u8,
    timeout_ms: u64,
    tx_len: usize,
    /// Last transmission start
    sent_at: u64,
    /// Transmit-enable release time of the current attempt
    release_at: u64,
    /// Response deadline of the current attempt
    deadline: u64,
    /// Decode error seen during the current attempt
    last_error: Option<CodecError>,
}

impl Transaction {
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    pub fn sent_at(&self) -> u64 {
        self.sent_at
    }

    /// Response deadline, meaningful while awaiting a response
    pub fn deadline(&self) -> u64 {
        self.deadline
    }
}

/// Single-bus Modbus RTU master
pub struct RtuEngine {
    config: EngineConfig,
    state: EngineState,
    transaction: Option<Transaction>,
    tx_buf: [u8; MODBUS_SIZE],
    rx_buf: [u8; MODBUS_SIZE],
    rx_len: usize,
    rx_overflow: bool,
    last_rx_at: u64,
}

impl RtuEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: EngineState::Idle,
            transaction: None,
            tx_buf: [0; MODBUS_SIZE],
            rx_buf: [0; MODBUS_SIZE],
            rx_len: 0,
            rx_overflow: false,
            last_rx_at: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> EngineState {
        self.state
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state != EngineState::Idle
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Swap serial timing and retry policy, only while idle
    pub fn reconfigure(&mut self, config: EngineConfig) -> Result<()> {
        if self.is_active() {
            return Err(GatewayError::busy("transaction in progress"));
        }
        debug!(
            "Engine reconfigured: {} baud {}, timeout {}ms, attempts {}",
            config.baud_rate, config.format, config.response_timeout_ms, config.attempts
        );
        self.config = config;
        Ok(())
    }

    /// Feed one received serial byte
    ///
    /// Bytes are kept only while awaiting a response; echo during
    /// transmission and noise while idle are dropped. A byte arriving after
    /// t3.5 of silence closes the previous frame first.
    pub fn on_byte(&mut self, byte: u8, now: u64, stats: &mut GatewayStats) -> Option<Completion> {
        stats.record_serial_rx(1);
        match self.state {
            EngineState::AwaitingResponse => {
                let completion = if self.silence_elapsed(now) {
                    self.end_of_frame(now, stats)
                } else {
                    None
                };
                if completion.is_none() {
                    self.push_rx(byte, now);
                }
                completion
            },
            EngineState::Sending => {
                trace!("RTU echo byte dropped: 0x{:02X}", byte);
                None
            },
            EngineState::Idle => {
                trace!("RTU idle byte dropped: 0x{:02X}", byte);
                None
            },
        }
    }

    /// Advance timers; starts the next queued request when idle
    pub fn poll<const N: usize, const D: usize, S: SerialLine>(
        &mut self,
        now: u64,
        queue: &mut RequestQueue<N, D>,
        serial: &mut S,
        stats: &mut GatewayStats,
    ) -> Option<Completion> {
        match self.state {
            EngineState::Idle => {
                let request = queue.dequeue().ok()?;
                self.begin(request, now, serial, stats)
            },
            EngineState::Sending => self.poll_sending(now, serial),
            EngineState::AwaitingResponse => self.poll_awaiting(now, serial, stats),
        }
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    fn begin<S: SerialLine>(
        &mut self,
        request: Request,
        now: u64,
        serial: &mut S,
        stats: &mut GatewayStats,
    ) -> Option<Completion> {
        let tx_len = match encode_rtu_frame(&request.frame, &mut self.tx_buf) {
            Ok(len) => len,
            Err(e) => {
                warn!("RTU encode failed for slave {}: {}", request.slave(), e);
                return Some(Completion {
                    request,
                    outcome: Outcome::Corrupted(e),
                    attempts: 0,
                });
            },
        };

        let (max_attempts, timeout_ms) = if request.is_broadcast() {
            (1, 0)
        } else if request.is_scan() {
            (1, u64::from(self.config.scan_timeout_ms))
        } else {
            (
                self.config.attempts.max(1),
                u64::from(self.config.response_timeout_ms),
            )
        };

        self.transaction = Some(Transaction {
            request,
            attempts: 0,
            max_attempts,
            timeout_ms,
            tx_len,
            sent_at: now,
            release_at: now,
            deadline: now,
            last_error: None,
        });
        self.transmit(now, serial, stats);
        None
    }

    fn transmit<S: SerialLine>(&mut self, now: u64, serial: &mut S, stats: &mut GatewayStats) {
        let Some(tx) = self.transaction.as_mut() else {
            return;
        };
        tx.attempts += 1;
        tx.sent_at = now;
        tx.release_at = now
            + self.config.transmit_time_ms(tx.tx_len)
            + self.config.frame_delay_ms();
        tx.last_error = None;

        serial.set_transmit_enable(true);
        match serial.write(&self.tx_buf[..tx.tx_len]) {
            Ok(()) => stats.record_serial_tx(tx.tx_len),
            Err(e) => warn!("RTU write failed: {}", e),
        }
        debug!(
            "RTU TX: {}B to slave {} (attempt {}/{})",
            tx.tx_len,
            tx.request.slave(),
            tx.attempts,
            tx.max_attempts
        );

        self.rx_len = 0;
        self.rx_overflow = false;
        self.state = EngineState::Sending;
    }

    fn poll_sending<S: SerialLine>(&mut self, now: u64, serial: &mut S) -> Option<Completion> {
        let tx = self.transaction.as_mut()?;
        if now < tx.release_at {
            return None;
        }
        serial.set_transmit_enable(false);

        if tx.request.is_broadcast() {
            trace!("RTU broadcast sent");
            return self.complete(Outcome::BroadcastSent);
        }

        tx.deadline = now + tx.timeout_ms;
        self.state = EngineState::AwaitingResponse;
        None
    }

    fn poll_awaiting<S: SerialLine>(
        &mut self,
        now: u64,
        serial: &mut S,
        stats: &mut GatewayStats,
    ) -> Option<Completion> {
        if self.silence_elapsed(now) {
            if let Some(completion) = self.end_of_frame(now, stats) {
                return Some(completion);
            }
        }

        let tx = self.transaction.as_ref()?;
        if now < tx.deadline {
            return None;
        }

        // Deadline hit mid-frame: let the slave finish before judging, bounded
        // by the time a maximum-length frame needs
        if self.rx_len > 0 && now < tx.deadline + self.frame_overrun_ms() {
            return None;
        }
        if self.rx_len > 0 {
            if let Some(completion) = self.end_of_frame(now, stats) {
                return Some(completion);
            }
        }

        let tx = self.transaction.as_ref()?;
        if tx.attempts < tx.max_attempts {
            warn!(
                "Slave {} timeout, retry {}/{}",
                tx.request.slave(),
                tx.attempts + 1,
                tx.max_attempts
            );
            self.transmit(now, serial, stats);
            return None;
        }

        let outcome = match tx.last_error {
            Some(e) => Outcome::Corrupted(e),
            None => Outcome::Timeout,
        };
        debug!(
            "Slave {} gave no valid response after {} attempts",
            tx.request.slave(),
            tx.attempts
        );
        self.complete(outcome)
    }

    fn complete(&mut self, outcome: Outcome) -> Option<Completion> {
        let tx = self.transaction.take()?;
        self.state = EngineState::Idle;
        self.rx_len = 0;
        self.rx_overflow = false;
        Some(Completion {
            request: tx.request,
            outcome,
            attempts: tx.attempts,
        })
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    fn push_rx(&mut self, byte: u8, now: u64) {
        if self.rx_len < MODBUS_SIZE {
            self.rx_buf[self.rx_len] = byte;
            self.rx_len += 1;
        } else {
            self.rx_overflow = true;
        }
        self.last_rx_at = now;
    }

    fn silence_elapsed(&self, now: u64) -> bool {
        self.rx_len > 0 && now.saturating_sub(self.last_rx_at) >= self.config.end_of_frame_ms()
    }

    fn frame_overrun_ms(&self) -> u64 {
        self.config.transmit_time_ms(MODBUS_SIZE) + self.config.end_of_frame_ms()
    }

    /// Judge the buffered frame; a matching response completes the transaction
    fn end_of_frame(&mut self, now: u64, stats: &mut GatewayStats) -> Option<Completion> {
        let len = std::mem::take(&mut self.rx_len);
        let overflow = std::mem::take(&mut self.rx_overflow);
        if len == 0 {
            return None;
        }

        let decoded = if overflow {
            Err(CodecError::FrameTooLarge {
                len: MODBUS_SIZE + 1,
                max: MODBUS_SIZE,
            })
        } else {
            decode_rtu_frame(&self.rx_buf[..len])
        };

        let expected = self.transaction.as_ref()?.request.slave();
        match decoded {
            Ok(frame) if frame.address() == expected => {
                debug!("RTU RX: {}B from slave {}", len, expected);
                stats.record_response(&frame, now);
                self.complete(Outcome::Response(frame))
            },
            Ok(frame) => {
                warn!(
                    "RTU frame from slave {} discarded, expecting {}",
                    frame.address(),
                    expected
                );
                None
            },
            Err(e) => {
                warn!("RTU frame discarded: {}B, {}", len, e);
                stats.record_frame_error();
                if let Some(tx) = self.transaction.as_mut() {
                    tx.last_error = Some(e);
                }
                None
            },
        }
    }
}

impl std::fmt::Debug for RtuEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtuEngine")
            .field("state", &self.state)
            .field("transaction", &self.transaction)
            .field("rx_len", &self.rx_len)
            .finish()
    }
}
