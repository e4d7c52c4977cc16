//! Gateway dispatcher
//!
//! Entry point of the core. Turns client ADUs into queued requests, drives
//! the transaction engine and scanner from `tick`, and routes each outcome
//! back to the originating session through a `ResponseSink`.

use std::ops::RangeInclusive;

use tracing::{debug, info, warn};

use crate::config::{EngineConfig, GatewayConfig};
use crate::constants::{exception, MAX_ADU_SIZE, MAX_QUEUE_REQUESTS};
use crate::engine::{Completion, EngineState, Outcome, RtuEngine, SerialLine};
use crate::error::{CodecError, Result};
use crate::frame::{
    check_unit_id, decode_adu, decode_rtu_frame, encode_adu, encode_rtu_frame, Adu, RtuFrame,
};
use crate::queue::RequestQueue;
use crate::request::{Framing, Origin, Request, RequestKind, SessionId, Transport};
use crate::scanner::{DiscoveryEvent, Scanner};
use crate::stats::{GatewayStats, SlaveStats, StatsSnapshot};

/// Send path back to network clients
pub trait ResponseSink {
    /// Hand an encoded response to the session's transport
    ///
    /// Sessions that have gone away are expected to drop the bytes silently.
    fn deliver(&mut self, transport: Transport, session: SessionId, bytes: &[u8]);

    /// Scanner result for one address
    fn discovered(&mut self, event: DiscoveryEvent) {
        let _ = event;
    }
}

/// Every queued request plus the one in flight
const PENDING_SLOTS: usize = MAX_QUEUE_REQUESTS + 1;

/// Client awaiting a response, keyed by correlation id
#[derive(Debug, Clone, Copy)]
struct Pending {
    correlation: u16,
    origin: Origin,
    framing: Framing,
    /// Session closed, discard the response
    orphaned: bool,
}

fn free_pending(table: &mut [Option<Pending>], correlation: u16) -> Option<Pending> {
    table
        .iter_mut()
        .find(|slot| matches!(slot, Some(p) if p.correlation == correlation))
        .and_then(Option::take)
}

/// Modbus RTU master shared by TCP and UDP clients
pub struct Gateway<S: SerialLine, K: ResponseSink> {
    queue: RequestQueue,
    engine: RtuEngine,
    scanner: Scanner,
    stats: GatewayStats,
    pending: [Option<Pending>; PENDING_SLOTS],
    correlation_seq: u16,
    framing: Framing,
    serial: S,
    sink: K,
    out_buf: [u8; MAX_ADU_SIZE],
}

impl<S: SerialLine, K: ResponseSink> Gateway<S, K> {
    pub fn new(config: &GatewayConfig, serial: S, sink: K) -> Self {
        Self {
            queue: RequestQueue::new(),
            engine: RtuEngine::new(EngineConfig::from(config)),
            scanner: Scanner::new(),
            stats: GatewayStats::new(),
            pending: [None; PENDING_SLOTS],
            correlation_seq: 0,
            framing: framing_of(config),
            serial,
            sink,
            out_buf: [0; MAX_ADU_SIZE],
        }
    }

    // ========================================================================
    // Client requests
    // ========================================================================

    /// Accept one client message, fire-and-forget
    ///
    /// Malformed messages are counted and dropped. Rejections are answered
    /// with a Modbus exception unless the request was a broadcast.
    pub fn submit_client_request(
        &mut self,
        transport: Transport,
        session: SessionId,
        raw: &[u8],
        now: u64,
    ) {
        self.stats.record_client_rx(raw.len());

        let framing = self.framing;
        let (frame, transaction_id) = match decode_client(framing, raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    "Invalid {:?} request from session {}: {}",
                    transport, session, e
                );
                self.stats.record_invalid_request();
                return;
            },
        };

        let origin = Origin {
            transport,
            session,
            transaction_id,
        };
        let slave = frame.address();
        let broadcast = frame.is_broadcast();

        if !broadcast && self.stats.gate_closed(slave) {
            debug!("Slave {} not responding, request rejected", slave);
            self.stats.record_rejected(slave);
            let reply = RtuFrame::exception(
                slave,
                frame.function(),
                exception::GATEWAY_TARGET_DEVICE_FAILED_TO_RESPOND,
            );
            self.respond(origin, framing, &reply);
            return;
        }

        let correlation = if broadcast {
            0
        } else {
            match self.allocate(origin, framing) {
                Some(correlation) => correlation,
                None => {
                    self.reject_busy(origin, framing, &frame);
                    return;
                },
            }
        };
        if !broadcast {
            self.stats.take_gate(slave, correlation);
        }

        let request = Request::client(correlation, origin, frame, now);
        match self.queue.enqueue(&request) {
            Ok(()) => debug!(
                "Queued FC {:02X} for slave {} ({}/{})",
                request.function(),
                slave,
                self.queue.len(),
                self.queue.capacity()
            ),
            Err(_) => {
                if !broadcast {
                    free_pending(&mut self.pending, correlation);
                    self.stats.release_gate(slave, correlation);
                }
                self.reject_busy(origin, framing, &request.frame);
            },
        }
    }

    fn reject_busy(&mut self, origin: Origin, framing: Framing, frame: &RtuFrame) {
        let slave = frame.address();
        warn!("Queue full, request for slave {} rejected", slave);
        self.stats.record_rejected(slave);
        if !frame.is_broadcast() {
            let reply = RtuFrame::exception(slave, frame.function(), exception::SERVER_DEVICE_BUSY);
            self.respond(origin, framing, &reply);
        }
    }

    fn allocate(&mut self, origin: Origin, framing: Framing) -> Option<u16> {
        let index = self.pending.iter().position(Option::is_none)?;
        let correlation = loop {
            self.correlation_seq = self.correlation_seq.wrapping_add(1);
            if self.correlation_seq == 0 {
                self.correlation_seq = 1;
            }
            let seq = self.correlation_seq;
            if !self.pending.iter().flatten().any(|p| p.correlation == seq) {
                break seq;
            }
        };
        self.pending[index] = Some(Pending {
            correlation,
            origin,
            framing,
            orphaned: false,
        });
        Some(correlation)
    }

    // ========================================================================
    // Serial side
    // ========================================================================

    /// Feed one byte received from the serial bus
    pub fn on_serial_byte(&mut self, byte: u8, now: u64) {
        if let Some(completion) = self.engine.on_byte(byte, now, &mut self.stats) {
            self.finish(completion);
        }
    }

    /// Advance timers, queue scan probes and start the next transaction
    pub fn tick(&mut self, now: u64) {
        if let Some(probe) = self.scanner.next_probe(now) {
            if self.queue.enqueue(&probe).is_ok() {
                self.scanner.probe_queued();
            }
        }

        while let Some(completion) =
            self.engine
                .poll(now, &mut self.queue, &mut self.serial, &mut self.stats)
        {
            self.finish(completion);
        }
    }

    fn finish(&mut self, completion: Completion) {
        let Completion {
            request,
            outcome,
            attempts,
        } = completion;
        let slave = request.slave();

        let (correlation, origin) = match request.kind {
            RequestKind::Scan(probe) => {
                let responded = matches!(outcome, Outcome::Response(_));
                if let Some(event) = self.scanner.on_completion(slave, probe, responded) {
                    self.sink.discovered(event);
                }
                return;
            },
            RequestKind::Client {
                correlation,
                origin,
            } => (correlation, origin),
        };

        self.stats.record_request(slave);
        self.stats.release_gate(slave, correlation);
        let reply = match outcome {
            Outcome::BroadcastSent => return,
            Outcome::Response(frame) => frame,
            Outcome::Timeout => {
                warn!("Slave {} timeout after {} attempts", slave, attempts);
                self.stats.record_timeout(slave);
                RtuFrame::exception(
                    slave,
                    request.function(),
                    exception::GATEWAY_TARGET_DEVICE_FAILED_TO_RESPOND,
                )
            },
            Outcome::Corrupted(e) => {
                warn!("Slave {} failed: {}", slave, e);
                self.stats.record_error(slave);
                RtuFrame::exception(
                    slave,
                    request.function(),
                    exception::GATEWAY_TARGET_DEVICE_FAILED_TO_RESPOND,
                )
            },
        };

        let Some(pending) = free_pending(&mut self.pending, correlation) else {
            debug!("No pending client for correlation {}", correlation);
            return;
        };
        if pending.orphaned {
            debug!(
                "Session {} closed, response from slave {} dropped",
                origin.session, slave
            );
            return;
        }
        self.respond(pending.origin, pending.framing, &reply);
    }

    fn respond(&mut self, origin: Origin, framing: Framing, frame: &RtuFrame) {
        let encoded = match framing {
            Framing::Mbap => encode_adu(
                &Adu {
                    transaction_id: origin.transaction_id,
                    frame: frame.clone(),
                },
                &mut self.out_buf,
            ),
            Framing::RtuOverTcp => encode_rtu_frame(frame, &mut self.out_buf),
        };
        match encoded {
            Ok(len) => {
                self.stats.record_client_tx(len);
                self.sink
                    .deliver(origin.transport, origin.session, &self.out_buf[..len]);
            },
            Err(e) => warn!("Response encode failed: {}", e),
        }
    }

    // ========================================================================
    // Session and queue management
    // ========================================================================

    /// Forget a closed session: drop its queued requests and discard its
    /// in-flight response
    pub fn close_session(&mut self, transport: Transport, session: SessionId) -> usize {
        let pending = &mut self.pending;
        let stats = &mut self.stats;
        let removed = self.queue.retain(|request| match request.kind {
            RequestKind::Client {
                correlation,
                origin,
            } if origin.is_session(transport, session) => {
                free_pending(pending, correlation);
                stats.release_gate(request.slave(), correlation);
                false
            },
            _ => true,
        });

        for entry in self.pending.iter_mut().flatten() {
            if entry.origin.is_session(transport, session) {
                entry.orphaned = true;
            }
        }
        if removed > 0 {
            debug!(
                "{:?} session {} closed, {} queued requests dropped",
                transport, session, removed
            );
        }
        removed
    }

    /// Drop queued requests older than `max_age_ms`, without replying
    pub fn purge_older_than(&mut self, now: u64, max_age_ms: u64) -> usize {
        let pending = &mut self.pending;
        let stats = &mut self.stats;
        let scanner = &mut self.scanner;
        let removed = self.queue.retain(|request| {
            if now.saturating_sub(request.enqueued_at) <= max_age_ms {
                return true;
            }
            match request.kind {
                RequestKind::Client { correlation, .. } => {
                    free_pending(pending, correlation);
                    stats.release_gate(request.slave(), correlation);
                },
                RequestKind::Scan(_) => scanner.probe_dropped(),
            }
            false
        });
        if removed > 0 {
            info!("Purged {} requests older than {}ms", removed, max_age_ms);
        }
        removed
    }

    /// Apply new serial timing, retry policy and client framing
    ///
    /// Refused with `GatewayError::Busy` while a transaction is active.
    pub fn reconfigure(&mut self, config: &GatewayConfig) -> Result<()> {
        config.validate()?;
        self.engine.reconfigure(EngineConfig::from(config))?;
        self.framing = framing_of(config);
        Ok(())
    }

    // ========================================================================
    // Scanner
    // ========================================================================

    /// Probe every address of `range` for a live slave
    pub fn trigger_scan(&mut self, range: RangeInclusive<u8>) -> Result<()> {
        self.scanner.start(range)
    }

    pub fn cancel_scan(&mut self) {
        self.scanner.cancel();
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_active()
    }

    // ========================================================================
    // Statistics and accessors
    // ========================================================================

    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    /// Per-slave counters, index 0 is address 1
    pub fn slave_stats(&self) -> &[SlaveStats] {
        self.stats.slaves()
    }

    pub fn snapshot_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn restore_stats(&mut self, snapshot: &StatsSnapshot) {
        self.stats.restore(snapshot);
    }

    pub fn engine_state(&self) -> EngineState {
        self.engine.state()
    }

    pub fn is_busy(&self) -> bool {
        self.engine.is_active()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn serial(&self) -> &S {
        &self.serial
    }

    pub fn serial_mut(&mut self) -> &mut S {
        &mut self.serial
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut K {
        &mut self.sink
    }
}

fn framing_of(config: &GatewayConfig) -> Framing {
    if config.rtu_over_tcp {
        Framing::RtuOverTcp
    } else {
        Framing::Mbap
    }
}

/// Decode a client message into its frame and client transaction id
fn decode_client(
    framing: Framing,
    raw: &[u8],
) -> std::result::Result<(RtuFrame, u16), CodecError> {
    match framing {
        Framing::Mbap => decode_adu(raw).map(|adu| (adu.frame, adu.transaction_id)),
        Framing::RtuOverTcp => {
            let frame = decode_rtu_frame(raw)?;
            check_unit_id(frame.address())?;
            Ok((frame, 0))
        },
    }
}
