//! Gateway Scenario Tests
//!
//! Drives a complete `Gateway` against a simulated RTU bus:
//! - Retry bound and ordered timeout replies
//! - Broadcast handling
//! - Serialized bus access across sessions
//! - Slave scan with fallback function
//! - Queue rejection, session close and not-responding gate

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::io;

use rtu_gateway::constants::{exception, MAX_ADU_SIZE, MAX_QUEUE_REQUESTS, MODBUS_SIZE};
use rtu_gateway::{
    decode_adu, decode_rtu_frame, encode_adu, encode_rtu_frame, Adu, DiscoveryEvent, EngineState,
    Gateway, GatewayConfig, Parity, ResponseSink, RtuFrame, SerialConfig, SerialFormat,
    SerialLine, SessionId, SlaveStatus, Transport,
};

// ============================================================================
// Simulated bus
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum BusEvent {
    TxEnable(bool),
    Write(Vec<u8>),
}

#[derive(Default)]
struct RecordingSerial {
    events: Vec<BusEvent>,
}

impl RecordingSerial {
    fn writes(&self) -> Vec<Vec<u8>> {
        self.events
            .iter()
            .filter_map(|e| match e {
                BusEvent::Write(bytes) => Some(bytes.clone()),
                BusEvent::TxEnable(_) => None,
            })
            .collect()
    }
}

impl SerialLine for RecordingSerial {
    fn set_transmit_enable(&mut self, enabled: bool) {
        self.events.push(BusEvent::TxEnable(enabled));
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.events.push(BusEvent::Write(bytes.to_vec()));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    replies: Vec<(Transport, SessionId, Vec<u8>)>,
    discoveries: Vec<DiscoveryEvent>,
}

impl ResponseSink for RecordingSink {
    fn deliver(&mut self, transport: Transport, session: SessionId, bytes: &[u8]) {
        self.replies.push((transport, session, bytes.to_vec()));
    }

    fn discovered(&mut self, event: DiscoveryEvent) {
        self.discoveries.push(event);
    }
}

type Responder = Box<dyn FnMut(&RtuFrame) -> Option<RtuFrame>>;

/// Gateway plus a scripted set of slaves answering 10ms after each request
struct Sim {
    gw: Gateway<RecordingSerial, RecordingSink>,
    now: u64,
    responder: Responder,
    scheduled: Vec<(u64, Vec<u8>)>,
    seen_writes: usize,
    states: Vec<EngineState>,
}

// 115200 8N1 with no extra delay: an 8-byte request releases the bus after 3ms
fn test_config() -> GatewayConfig {
    GatewayConfig {
        serial: SerialConfig {
            device: "/dev/null".to_string(),
            baud_rate: 115_200,
            format: SerialFormat::new(8, Parity::None, 1),
        },
        inter_frame_delay_ms: 0,
        response_timeout_ms: 100,
        attempts: 3,
        ..GatewayConfig::default()
    }
}

impl Sim {
    fn new(responder: Responder) -> Self {
        Self::with_config(&test_config(), responder)
    }

    fn with_config(config: &GatewayConfig, responder: Responder) -> Self {
        Self {
            gw: Gateway::new(config, RecordingSerial::default(), RecordingSink::default()),
            now: 0,
            responder,
            scheduled: Vec::new(),
            seen_writes: 0,
            states: Vec::new(),
        }
    }

    fn silent() -> Self {
        Self::new(Box::new(|_: &RtuFrame| None))
    }

    fn submit(&mut self, transport: Transport, session: SessionId, raw: &[u8]) {
        self.gw.submit_client_request(transport, session, raw, self.now);
    }

    fn step(&mut self) {
        let now = self.now;
        let due: Vec<Vec<u8>> = self
            .scheduled
            .iter()
            .filter(|(at, _)| *at == now)
            .map(|(_, bytes)| bytes.clone())
            .collect();
        self.scheduled.retain(|(at, _)| *at != now);
        for bytes in due {
            for b in bytes {
                self.gw.on_serial_byte(b, now);
            }
        }

        self.gw.tick(now);
        self.states.push(self.gw.engine_state());

        let writes = self.gw.serial().writes();
        for raw in &writes[self.seen_writes..] {
            let request = decode_rtu_frame(raw).unwrap();
            if request.is_broadcast() {
                continue;
            }
            if let Some(reply) = (self.responder)(&request) {
                self.scheduled.push((now + 10, rtu_bytes(&reply)));
            }
        }
        self.seen_writes = writes.len();
        self.now += 1;
    }

    fn run_for(&mut self, ms: u64) {
        for _ in 0..ms {
            self.step();
        }
    }

    fn replies(&self) -> &[(Transport, SessionId, Vec<u8>)] {
        &self.gw.sink().replies
    }
}

fn rtu_bytes(frame: &RtuFrame) -> Vec<u8> {
    let mut buf = [0u8; MODBUS_SIZE];
    let len = encode_rtu_frame(frame, &mut buf).unwrap();
    buf[..len].to_vec()
}

fn mbap(transaction_id: u16, unit: u8, function: u8, data: &[u8]) -> Vec<u8> {
    let adu = Adu {
        transaction_id,
        frame: RtuFrame::new(unit, function, data).unwrap(),
    };
    let mut buf = [0u8; MAX_ADU_SIZE];
    let len = encode_adu(&adu, &mut buf).unwrap();
    buf[..len].to_vec()
}

fn read_registers(transaction_id: u16, unit: u8) -> Vec<u8> {
    mbap(transaction_id, unit, 0x03, &[0x00, 0x00, 0x00, 0x01])
}

/// Slaves answer a register read with the value of their address
fn echo_address(request: &RtuFrame) -> Option<RtuFrame> {
    RtuFrame::new(request.address(), request.function(), &[0x02, 0x00, request.address()]).ok()
}

// ============================================================================
// Retry and timeout
// ============================================================================

#[test]
fn test_three_requests_to_silent_slave() {
    let mut sim = Sim::silent();
    for id in 1..=3 {
        sim.submit(Transport::Tcp, 1, &read_registers(id, 5));
    }
    sim.run_for(1_500);

    assert_eq!(sim.gw.serial().writes().len(), 9);

    let replies: Vec<Adu> = sim
        .replies()
        .iter()
        .map(|(_, _, raw)| decode_adu(raw).unwrap())
        .collect();
    assert_eq!(replies.len(), 3);
    for (adu, id) in replies.iter().zip(1..=3) {
        assert_eq!(adu.transaction_id, id);
        assert_eq!(adu.frame.address(), 5);
        assert_eq!(adu.frame.function(), 0x83);
        assert_eq!(
            adu.frame.exception_code(),
            Some(exception::GATEWAY_TARGET_DEVICE_FAILED_TO_RESPOND)
        );
    }

    let slave = sim.gw.stats().slave(5).unwrap();
    assert_eq!(slave.requests, 3);
    assert_eq!(slave.timeouts, 3);
    assert_eq!(slave.status, Some(SlaveStatus::Timeout));
}

#[test]
fn test_retries_resend_identical_bytes() {
    let mut sim = Sim::silent();
    sim.submit(Transport::Udp, 3, &read_registers(0x1234, 17));
    sim.run_for(500);

    let writes = sim.gw.serial().writes();
    assert_eq!(writes.len(), 3);
    assert!(writes.iter().all(|w| *w == writes[0]));
}

#[test]
fn test_successful_round_trip() {
    let mut sim = Sim::new(Box::new(echo_address));
    sim.submit(Transport::Tcp, 7, &read_registers(0x00AB, 12));
    sim.run_for(100);

    assert_eq!(sim.gw.serial().writes().len(), 1);
    let (transport, session, raw) = &sim.replies()[0];
    assert_eq!((*transport, *session), (Transport::Tcp, 7));
    assert_eq!(
        raw,
        &vec![0x00, 0xAB, 0x00, 0x00, 0x00, 0x05, 12, 0x03, 0x02, 0x00, 12]
    );

    let slave = sim.gw.stats().slave(12).unwrap();
    assert_eq!(slave.requests, 1);
    assert_eq!(slave.status, Some(SlaveStatus::Ok));
    assert_eq!(slave.last_response(), &[0x03, 0x02, 0x00, 12]);
}

#[test]
fn test_slave_exception_forwarded() {
    let mut sim = Sim::new(Box::new(|req: &RtuFrame| {
        Some(RtuFrame::exception(
            req.address(),
            req.function(),
            exception::ILLEGAL_DATA_ADDRESS,
        ))
    }));
    sim.submit(Transport::Tcp, 1, &read_registers(9, 2));
    sim.run_for(100);

    let adu = decode_adu(&sim.replies()[0].2).unwrap();
    assert_eq!(adu.frame.function(), 0x83);
    assert_eq!(adu.frame.exception_code(), Some(exception::ILLEGAL_DATA_ADDRESS));
    assert_eq!(
        sim.gw.stats().slave(2).unwrap().status,
        Some(SlaveStatus::Exception(exception::ILLEGAL_DATA_ADDRESS))
    );
}

#[test]
fn test_rtu_over_tcp_round_trip() {
    let config = GatewayConfig {
        rtu_over_tcp: true,
        ..test_config()
    };
    let mut sim = Sim::with_config(&config, Box::new(echo_address));
    let request = RtuFrame::new(4, 0x03, &[0x00, 0x00, 0x00, 0x01]).unwrap();
    sim.submit(Transport::Udp, 2, &rtu_bytes(&request));
    sim.run_for(100);

    let reply = decode_rtu_frame(&sim.replies()[0].2).unwrap();
    assert_eq!(reply, echo_address(&request).unwrap());
}

// ============================================================================
// Broadcast
// ============================================================================

#[test]
fn test_broadcast_single_transmission() {
    let mut sim = Sim::silent();
    sim.submit(Transport::Tcp, 1, &mbap(5, 0, 0x06, &[0x00, 0x01, 0x00, 0x03]));
    sim.run_for(1_000);

    assert_eq!(sim.gw.serial().writes().len(), 1);
    assert!(sim.replies().is_empty());
    assert!(!sim.states.contains(&EngineState::AwaitingResponse));
    assert_eq!(sim.gw.engine_state(), EngineState::Idle);
}

// ============================================================================
// Bus serialization
// ============================================================================

#[test]
fn test_one_transaction_at_a_time() {
    let mut sim = Sim::new(Box::new(echo_address));
    // Clients arrive while earlier requests are still on the bus
    for round in 0..4u16 {
        sim.submit(Transport::Tcp, 1, &read_registers(round, 1));
        sim.submit(Transport::Udp, 2, &read_registers(round, 2));
        sim.run_for(5);
    }
    sim.run_for(500);

    // Every write is followed by a release before the next assert
    let mut enabled = false;
    for event in &sim.gw.serial().events {
        match event {
            BusEvent::TxEnable(true) => {
                assert!(!enabled);
                enabled = true;
            },
            BusEvent::TxEnable(false) => enabled = false,
            BusEvent::Write(_) => assert!(enabled),
        }
    }

    // Each transaction finishes before the next request is written
    assert_eq!(sim.gw.serial().writes().len(), 8);
    assert_eq!(sim.replies().len(), 8);
    let order: Vec<(Transport, u8)> = sim
        .replies()
        .iter()
        .map(|(t, _, raw)| (*t, decode_adu(raw).unwrap().frame.address()))
        .collect();
    assert_eq!(
        order,
        [
            (Transport::Tcp, 1),
            (Transport::Udp, 2),
            (Transport::Tcp, 1),
            (Transport::Udp, 2),
            (Transport::Tcp, 1),
            (Transport::Udp, 2),
            (Transport::Tcp, 1),
            (Transport::Udp, 2),
        ]
    );
}

// ============================================================================
// Slave scan
// ============================================================================

#[test]
fn test_scan_finds_responding_slave() {
    let mut sim = Sim::new(Box::new(|req: &RtuFrame| {
        (req.address() == 3 && req.function() == 0x03)
            .then(|| RtuFrame::new(3, 0x03, &[0x02, 0x00, 0x00]).ok())
            .flatten()
    }));
    sim.gw.trigger_scan(1..=5).unwrap();
    assert!(sim.gw.is_scanning());
    sim.run_for(2_000);
    assert!(!sim.gw.is_scanning());

    let discoveries = &sim.gw.sink().discoveries;
    let presence: Vec<(u8, bool)> = discoveries.iter().map(|e| (e.address, e.present)).collect();
    assert_eq!(
        presence,
        vec![(1, false), (2, false), (3, true), (4, false), (5, false)]
    );
    assert_eq!(discoveries[2].function, Some(0x03));

    let probes: Vec<(u8, u8)> = sim
        .gw
        .serial()
        .writes()
        .iter()
        .map(|raw| {
            let frame = decode_rtu_frame(raw).unwrap();
            (frame.address(), frame.function())
        })
        .collect();
    assert_eq!(probes.iter().filter(|(a, _)| *a == 3).count(), 1);
    assert!(probes.contains(&(4, 0x04)));
    assert_eq!(probes.len(), 9);

    // Scan traffic is not client traffic
    assert_eq!(sim.gw.stats().slave(1).unwrap().requests, 0);
    assert!(sim.replies().is_empty());
}

#[test]
fn test_scan_shares_bus_with_clients() {
    let mut sim = Sim::new(Box::new(echo_address));
    sim.gw.trigger_scan(10..=11).unwrap();
    sim.step();
    sim.submit(Transport::Tcp, 1, &read_registers(1, 20));
    sim.run_for(500);

    assert_eq!(sim.replies().len(), 1);
    assert_eq!(sim.gw.sink().discoveries.len(), 2);
    assert!(sim.gw.sink().discoveries.iter().all(|e| e.present));
}

// ============================================================================
// Rejections and sessions
// ============================================================================

#[test]
fn test_queue_full_rejected_with_busy() {
    let mut sim = Sim::silent();
    for id in 0..MAX_QUEUE_REQUESTS as u16 {
        sim.submit(Transport::Tcp, 1, &read_registers(id, 8));
    }
    sim.submit(Transport::Tcp, 2, &read_registers(0x0100, 8));

    assert_eq!(sim.gw.queue_len(), MAX_QUEUE_REQUESTS);
    let adu = decode_adu(&sim.replies()[0].2).unwrap();
    assert_eq!(adu.transaction_id, 0x0100);
    assert_eq!(adu.frame.exception_code(), Some(exception::SERVER_DEVICE_BUSY));
    assert_eq!(sim.gw.stats().counters().rejections, 1);

    // Dequeueing the first request makes room again
    sim.step();
    sim.submit(Transport::Tcp, 2, &read_registers(0x0101, 8));
    assert_eq!(sim.gw.queue_len(), MAX_QUEUE_REQUESTS);
    assert_eq!(sim.replies().len(), 1);
}

#[test]
fn test_closed_session_response_discarded() {
    let mut sim = Sim::new(Box::new(echo_address));
    sim.submit(Transport::Tcp, 1, &read_registers(1, 1));
    sim.submit(Transport::Tcp, 1, &read_registers(2, 2));
    sim.submit(Transport::Tcp, 2, &read_registers(3, 3));
    sim.step();

    // First request is on the bus, second still queued
    assert_eq!(sim.gw.close_session(Transport::Tcp, 1), 1);
    sim.run_for(500);

    assert_eq!(sim.gw.serial().writes().len(), 2);
    assert_eq!(sim.replies().len(), 1);
    assert_eq!(sim.replies()[0].1, 2);
}

#[test]
fn test_not_responding_slave_gate() {
    let mut sim = Sim::silent();
    sim.submit(Transport::Tcp, 1, &read_registers(1, 9));
    sim.run_for(400);
    assert_eq!(sim.replies().len(), 1);
    assert!(sim.gw.stats().slave(9).unwrap().is_not_responding());

    // One more request is let through, the next is refused immediately
    sim.submit(Transport::Tcp, 1, &read_registers(2, 9));
    sim.submit(Transport::Tcp, 1, &read_registers(3, 9));
    assert_eq!(sim.gw.queue_len(), 1);
    let refused = decode_adu(&sim.replies()[1].2).unwrap();
    assert_eq!(refused.transaction_id, 3);
    assert_eq!(
        refused.frame.exception_code(),
        Some(exception::GATEWAY_TARGET_DEVICE_FAILED_TO_RESPOND)
    );
    assert_eq!(sim.gw.stats().slave(9).unwrap().status, Some(SlaveStatus::Rejected));

    // Other slaves are unaffected
    sim.submit(Transport::Tcp, 1, &read_registers(4, 10));
    assert_eq!(sim.gw.queue_len(), 2);
}

#[test]
fn test_gate_held_until_admitted_request_finishes() {
    let mut sim = Sim::silent();
    sim.submit(Transport::Tcp, 1, &read_registers(1, 9));
    sim.submit(Transport::Tcp, 1, &read_registers(2, 9));
    // First request exhausts its attempts at 309, the second goes on the bus
    sim.run_for(320);
    assert_eq!(sim.replies().len(), 1);
    assert!(sim.gw.stats().slave(9).unwrap().is_not_responding());

    sim.submit(Transport::Tcp, 1, &read_registers(3, 9));
    sim.submit(Transport::Tcp, 1, &read_registers(4, 9));
    assert_eq!(sim.gw.queue_len(), 1);
    assert_eq!(sim.replies().len(), 2);

    // Request 2 was queued before the slave went silent; its timeout must
    // not reopen the gate held by request 3
    sim.run_for(400);
    assert_eq!(sim.replies().len(), 3);
    assert_eq!(decode_adu(&sim.replies()[2].2).unwrap().transaction_id, 2);
    assert!(sim.gw.is_busy());

    sim.submit(Transport::Tcp, 1, &read_registers(5, 9));
    assert_eq!(sim.gw.queue_len(), 0);
    assert_eq!(sim.replies().len(), 4);
    let refused = decode_adu(&sim.replies()[3].2).unwrap();
    assert_eq!(refused.transaction_id, 5);
    assert_eq!(
        refused.frame.exception_code(),
        Some(exception::GATEWAY_TARGET_DEVICE_FAILED_TO_RESPOND)
    );

    // Request 3 times out and hands the gate back
    sim.run_for(400);
    assert_eq!(sim.replies().len(), 5);
    sim.submit(Transport::Tcp, 1, &read_registers(6, 9));
    assert_eq!(sim.gw.queue_len(), 1);
}

#[test]
fn test_gate_released_when_holder_session_closes() {
    let mut sim = Sim::silent();
    sim.submit(Transport::Tcp, 1, &read_registers(1, 9));
    sim.run_for(400);
    assert!(sim.gw.stats().slave(9).unwrap().is_not_responding());

    // Keep the bus busy with slave 10 so the gate holder stays queued
    sim.submit(Transport::Tcp, 2, &read_registers(2, 10));
    sim.step();
    sim.submit(Transport::Tcp, 1, &read_registers(3, 9));
    sim.submit(Transport::Tcp, 1, &read_registers(4, 9));
    assert_eq!(sim.replies().len(), 2);

    assert_eq!(sim.gw.close_session(Transport::Tcp, 1), 1);
    sim.submit(Transport::Tcp, 3, &read_registers(5, 9));
    assert_eq!(sim.gw.queue_len(), 1);
    assert_eq!(sim.replies().len(), 2);
}

#[test]
fn test_invalid_client_messages_counted() {
    let mut sim = Sim::silent();
    let mut bad_length = read_registers(1, 1);
    bad_length[5] = 0x09;
    sim.submit(Transport::Tcp, 1, &bad_length);
    // Function code 0
    sim.submit(Transport::Udp, 1, &[0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01, 0x00]);
    sim.run_for(10);

    assert!(sim.gw.serial().writes().is_empty());
    assert!(sim.replies().is_empty());
    assert_eq!(sim.gw.stats().counters().invalid_requests, 2);
}

#[test]
fn test_stats_snapshot_after_traffic() {
    let mut sim = Sim::new(Box::new(echo_address));
    sim.submit(Transport::Tcp, 1, &read_registers(1, 1));
    sim.submit(Transport::Tcp, 1, &read_registers(2, 2));
    sim.run_for(200);

    let snapshot = sim.gw.snapshot_stats();
    assert_eq!(snapshot.slaves.len(), 2);
    assert_eq!(snapshot.counters.serial_tx_bytes, 16);
    assert_eq!(snapshot.counters.serial_rx_bytes, 14);
    assert!(snapshot.counters.client_tx_bytes > 0);

    let mut fresh = Sim::silent();
    fresh.gw.restore_stats(&snapshot);
    assert_eq!(fresh.gw.stats().slave(2).unwrap().requests, 1);
    assert_eq!(fresh.gw.slave_stats()[1].requests, 1);
}
