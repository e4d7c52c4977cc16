//! Gateway request data model
//!
//! A `Request` is created by the gateway on receipt of a client ADU (or by
//! the slave scanner), lives in the request queue until the transaction
//! engine dequeues it, and is consumed by exactly one transaction.

use crate::constants::{SCAN_DATA_ADDRESS, SCAN_FUNCTION_FIRST, SCAN_FUNCTION_SECOND};
use crate::error::CodecError;
use crate::frame::RtuFrame;

/// Network session identifier assigned by the transport listener
pub type SessionId = u32;

/// Client transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Client framing of requests and responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// MBAP header + PDU
    Mbap,
    /// Raw RTU frame (address + PDU + CRC) carried over TCP/UDP
    RtuOverTcp,
}

/// Originating client of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub transport: Transport,
    pub session: SessionId,
    /// Transaction ID from the client protocol (0 for RTU over TCP)
    pub transaction_id: u16,
}

impl Origin {
    pub fn is_session(&self, transport: Transport, session: SessionId) -> bool {
        self.transport == transport && self.session == session
    }
}

/// Scan probe attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanProbe {
    First,
    Second,
}

impl ScanProbe {
    /// Function code sent by this probe
    pub fn function(self) -> u8 {
        match self {
            ScanProbe::First => SCAN_FUNCTION_FIRST,
            ScanProbe::Second => SCAN_FUNCTION_SECOND,
        }
    }
}

/// Request kind, lets scan probes share the queue and engine with client traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Request from a network client, `correlation` keys the gateway's pending table
    Client { correlation: u16, origin: Origin },
    /// Slave scanner probe
    Scan(ScanProbe),
}

/// Pending Modbus request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestKind,
    /// Target slave address and PDU
    pub frame: RtuFrame,
    /// Monotonic timestamp (ms) of enqueueing
    pub enqueued_at: u64,
}

impl Request {
    pub fn client(correlation: u16, origin: Origin, frame: RtuFrame, now: u64) -> Self {
        Self {
            kind: RequestKind::Client { correlation, origin },
            frame,
            enqueued_at: now,
        }
    }

    /// Read one register at the scan data address
    pub fn scan(address: u8, probe: ScanProbe, now: u64) -> Result<Self, CodecError> {
        let [hi, lo] = SCAN_DATA_ADDRESS.to_be_bytes();
        let frame = RtuFrame::new(address, probe.function(), &[hi, lo, 0x00, 0x01])?;
        Ok(Self {
            kind: RequestKind::Scan(probe),
            frame,
            enqueued_at: now,
        })
    }

    #[inline]
    pub fn slave(&self) -> u8 {
        self.frame.address()
    }

    #[inline]
    pub fn function(&self) -> u8 {
        self.frame.function()
    }

    /// Payload bytes counted against the queue's byte budget
    #[inline]
    pub fn payload(&self) -> &[u8] {
        self.frame.data()
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.frame.is_broadcast()
    }

    #[inline]
    pub fn is_scan(&self) -> bool {
        matches!(self.kind, RequestKind::Scan(_))
    }

    /// Client origin, `None` for scan probes
    pub fn origin(&self) -> Option<&Origin> {
        match &self.kind {
            RequestKind::Client { origin, .. } => Some(origin),
            RequestKind::Scan(_) => None,
        }
    }
}
