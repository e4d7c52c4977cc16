//! Fixed-capacity request queue
//!
//! FIFO of pending requests bounded by both an entry count and a total
//! payload byte budget. Payload bytes live in a shared ring buffer so the
//! queue never allocates; a request is admitted only if both bounds hold.

use tracing::{debug, warn};

use crate::constants::{MAX_PDU_DATA, MAX_QUEUE_DATA, MAX_QUEUE_REQUESTS};
use crate::error::QueueError;
use crate::frame::RtuFrame;
use crate::request::{Request, RequestKind};

/// Queued request header, payload bytes are stored in the data ring
#[derive(Debug, Clone, Copy)]
struct Slot {
    kind: RequestKind,
    address: u8,
    function: u8,
    data_len: usize,
    enqueued_at: u64,
}

/// Bounded FIFO of pending requests
///
/// `ENTRIES` bounds the number of queued requests, `DATA` bounds the sum of
/// their payload lengths.
pub struct RequestQueue<const ENTRIES: usize = MAX_QUEUE_REQUESTS, const DATA: usize = MAX_QUEUE_DATA>
{
    slots: [Option<Slot>; ENTRIES],
    head: usize,
    count: usize,
    data: [u8; DATA],
    data_head: usize,
    data_used: usize,
}

impl<const ENTRIES: usize, const DATA: usize> RequestQueue<ENTRIES, DATA> {
    pub fn new() -> Self {
        Self {
            slots: [None; ENTRIES],
            head: 0,
            count: 0,
            data: [0; DATA],
            data_head: 0,
            data_used: 0,
        }
    }

    /// Append a request, leaving the queue untouched if either bound would be exceeded
    pub fn enqueue(&mut self, request: &Request) -> Result<(), QueueError> {
        let payload = request.payload();
        if self.count >= ENTRIES || self.data_used + payload.len() > DATA {
            debug!(
                "Queue full: {}/{} entries, {}/{} bytes, need {}B",
                self.count,
                ENTRIES,
                self.data_used,
                DATA,
                payload.len()
            );
            return Err(QueueError::Full);
        }

        if !payload.is_empty() {
            let tail = (self.data_head + self.data_used) % DATA;
            let first = payload.len().min(DATA - tail);
            self.data[tail..tail + first].copy_from_slice(&payload[..first]);
            self.data[..payload.len() - first].copy_from_slice(&payload[first..]);
        }

        self.slots[(self.head + self.count) % ENTRIES] = Some(Slot {
            kind: request.kind,
            address: request.slave(),
            function: request.function(),
            data_len: payload.len(),
            enqueued_at: request.enqueued_at,
        });
        self.count += 1;
        self.data_used += payload.len();
        Ok(())
    }

    /// Remove and return the oldest request
    pub fn dequeue(&mut self) -> Result<Request, QueueError> {
        if self.count == 0 {
            return Err(QueueError::Empty);
        }
        let slot = self.slots[self.head].take().ok_or(QueueError::Empty)?;

        let mut payload = [0u8; MAX_PDU_DATA];
        let len = slot.data_len;
        if len > 0 {
            let first = len.min(DATA - self.data_head);
            payload[..first].copy_from_slice(&self.data[self.data_head..self.data_head + first]);
            payload[first..len].copy_from_slice(&self.data[..len - first]);
            self.data_head = (self.data_head + len) % DATA;
        }

        self.head = (self.head + 1) % ENTRIES;
        self.count -= 1;
        self.data_used -= len;
        if self.count == 0 {
            self.head = 0;
            self.data_head = 0;
        }

        Ok(Request {
            kind: slot.kind,
            frame: RtuFrame::from_parts(slot.address, slot.function, &payload[..len]),
            enqueued_at: slot.enqueued_at,
        })
    }

    /// Keep only the requests for which `keep` returns true, preserving order
    ///
    /// Returns the number of removed requests.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&Request) -> bool,
    {
        let mut removed = 0;
        for _ in 0..self.count {
            let Ok(request) = self.dequeue() else {
                break;
            };
            if !keep(&request) {
                removed += 1;
                continue;
            }
            if let Err(e) = self.enqueue(&request) {
                warn!("Requeue failed for slave {}: {}", request.slave(), e);
                removed += 1;
            }
        }
        removed
    }

    /// Drop requests that have waited longer than `max_age_ms`
    pub fn purge_older_than(&mut self, now: u64, max_age_ms: u64) -> usize {
        let removed = self.retain(|r| now.saturating_sub(r.enqueued_at) <= max_age_ms);
        if removed > 0 {
            debug!("Purged {} stale requests", removed);
        }
        removed
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Payload bytes currently held
    #[inline]
    pub fn data_used(&self) -> usize {
        self.data_used
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        ENTRIES
    }

    #[inline]
    pub const fn data_capacity(&self) -> usize {
        DATA
    }
}

impl<const ENTRIES: usize, const DATA: usize> Default for RequestQueue<ENTRIES, DATA> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const ENTRIES: usize, const DATA: usize> std::fmt::Debug for RequestQueue<ENTRIES, DATA> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("len", &self.count)
            .field("capacity", &ENTRIES)
            .field("data_used", &self.data_used)
            .field("data_capacity", &DATA)
            .finish()
    }
}
