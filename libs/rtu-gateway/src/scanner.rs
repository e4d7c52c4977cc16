//! Slave scanner
//!
//! Walks a range of slave addresses, probing each with the first scan
//! function and falling back to the second before declaring the address
//! absent. Probes are ordinary queued requests of the scan kind, so they
//! share the engine and the serial bus with client traffic.

use std::ops::RangeInclusive;

use tracing::{debug, info};

use crate::constants::MAX_SLAVE_ADDRESS;
use crate::error::{GatewayError, Result};
use crate::request::{Request, ScanProbe};

/// Result of scanning one address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub address: u8,
    pub present: bool,
    /// Function code the slave answered, `None` when absent
    pub function: Option<u8>,
}

/// Sequential scan over a slave address range, one probe in flight at a time
#[derive(Debug, Default)]
pub struct Scanner {
    /// Next probe to queue
    pending: Option<(u8, ScanProbe)>,
    last: u8,
    outstanding: bool,
}

impl Scanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin scanning `range`
    pub fn start(&mut self, range: RangeInclusive<u8>) -> Result<()> {
        if self.is_active() {
            return Err(GatewayError::busy("scan already running"));
        }
        let (first, last) = (*range.start(), *range.end());
        if first == 0 || last > MAX_SLAVE_ADDRESS || first > last {
            return Err(GatewayError::config(format!(
                "Invalid scan range {first}-{last}, expected 1-{MAX_SLAVE_ADDRESS}"
            )));
        }

        info!("Slave scan started: {}-{}", first, last);
        self.pending = Some((first, ScanProbe::First));
        self.last = last;
        self.outstanding = false;
        Ok(())
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.pending.is_some() || self.outstanding
    }

    /// Stop scanning; an already queued probe still completes
    pub fn cancel(&mut self) {
        if self.pending.take().is_some() {
            info!("Slave scan cancelled");
        }
    }

    /// Probe to queue next, if none is in flight
    pub fn next_probe(&self, now: u64) -> Option<Request> {
        if self.outstanding {
            return None;
        }
        let (address, probe) = self.pending?;
        Request::scan(address, probe, now).ok()
    }

    /// The probe returned by `next_probe` was queued
    pub fn probe_queued(&mut self) {
        self.outstanding = true;
    }

    /// The queued probe was removed unserved, it will be queued again
    pub fn probe_dropped(&mut self) {
        self.outstanding = false;
    }

    /// Record a finished probe
    ///
    /// Returns the discovery event once the address is settled: present on
    /// any well-formed frame, absent after both probe functions went unanswered.
    pub fn on_completion(
        &mut self,
        address: u8,
        probe: ScanProbe,
        responded: bool,
    ) -> Option<DiscoveryEvent> {
        self.outstanding = false;

        let event = if responded {
            DiscoveryEvent {
                address,
                present: true,
                function: Some(probe.function()),
            }
        } else if probe == ScanProbe::First {
            if self.pending.is_some() {
                self.pending = Some((address, ScanProbe::Second));
            }
            return None;
        } else {
            DiscoveryEvent {
                address,
                present: false,
                function: None,
            }
        };

        if event.present {
            info!("Slave {} found (FC {:02X})", address, probe.function());
        } else {
            debug!("Slave {} absent", address);
        }

        if self.pending.is_some() {
            self.pending = if address < self.last {
                Some((address + 1, ScanProbe::First))
            } else {
                info!("Slave scan finished");
                None
            };
        }
        Some(event)
    }
}
