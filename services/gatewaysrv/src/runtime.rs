//! Service runtime
//!
//! A single engine task owns the [`Gateway`]. Listeners and the serial task
//! talk to it over channels, so all protocol state stays on one task.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use rtu_gateway::{Gateway, GatewayConfig, ResponseSink, SerialLine};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::network::{self, ChannelSink, ClientEvent, SessionRegistry, TcpSettings};
use crate::persistence::StatsStore;
use crate::serial::{self, ChannelSerialLine, SerialRx};

/// Engine tick period
const TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Queued requests older than this are dropped without a reply
pub const STALE_REQUEST_MS: u64 = 30_000;

const PURGE_INTERVAL: Duration = Duration::from_secs(1);

/// Client and serial channel depth
const CHANNEL_CAPACITY: usize = 256;

/// Milliseconds since service start
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Engine task
// ============================================================================

/// Drives one `Gateway` from client events, serial bytes and the clock
pub struct EngineTask<S: SerialLine, K: ResponseSink> {
    gateway: Gateway<S, K>,
    clock: MonotonicClock,
    store: Option<StatsStore>,
    flush_interval: Duration,
}

impl<S: SerialLine, K: ResponseSink> EngineTask<S, K> {
    pub fn new(gateway: Gateway<S, K>, clock: MonotonicClock) -> Self {
        Self {
            gateway,
            clock,
            store: None,
            flush_interval: Duration::from_secs(6 * 3600),
        }
    }

    /// Restore counters from `store` and flush them every `interval`
    pub fn with_stats_store(mut self, store: StatsStore, interval: Duration) -> Self {
        let snapshot = store.load_or_default();
        if !snapshot.slaves.is_empty() {
            info!("Stats restored: {} slaves", snapshot.slaves.len());
        }
        self.gateway.restore_stats(&snapshot);
        self.store = Some(store);
        self.flush_interval = interval;
        self
    }

    pub fn gateway(&self) -> &Gateway<S, K> {
        &self.gateway
    }

    pub fn gateway_mut(&mut self) -> &mut Gateway<S, K> {
        &mut self.gateway
    }

    pub fn handle_event(&mut self, event: ClientEvent) {
        let now = self.clock.now_ms();
        match event {
            ClientEvent::Request {
                transport,
                session,
                bytes,
            } => {
                self.gateway
                    .submit_client_request(transport, session, &bytes, now);
            },
            ClientEvent::Closed { transport, session } => {
                self.gateway.close_session(transport, session);
            },
        }
        self.gateway.tick(now);
    }

    /// Feed one serial read
    ///
    /// The OS hands bytes over in chunks, so every byte of a chunk carries
    /// the chunk's arrival time. Gaps inside a chunk are invisible and gaps
    /// between chunks include host latency; `min_silence_ms` raises the
    /// end-of-frame silence for adapters that deliver late bursts.
    pub fn handle_serial(&mut self, rx: &SerialRx) {
        for &byte in rx.bytes.iter() {
            self.gateway.on_serial_byte(byte, rx.at_ms);
        }
    }

    fn flush_stats(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.gateway.snapshot_stats()) {
                warn!("Stats flush failed: {}", e);
            }
        }
    }

    /// Run until cancelled or an input channel closes, then flush statistics
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ClientEvent>,
        mut serial_rx: mpsc::Receiver<SerialRx>,
        token: CancellationToken,
    ) -> Gateway<S, K> {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut purge = tokio::time::interval_at(Instant::now() + PURGE_INTERVAL, PURGE_INTERVAL);
        let mut flush =
            tokio::time::interval_at(Instant::now() + self.flush_interval, self.flush_interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                rx = serial_rx.recv() => match rx {
                    Some(rx) => self.handle_serial(&rx),
                    None => {
                        error!("Serial input closed");
                        break;
                    },
                },
                _ = tick.tick() => self.gateway.tick(self.clock.now_ms()),
                _ = purge.tick() => {
                    self.gateway
                        .purge_older_than(self.clock.now_ms(), STALE_REQUEST_MS);
                },
                _ = flush.tick() => self.flush_stats(),
            }
        }

        self.flush_stats();
        debug!("Engine task stopped");
        self.gateway
    }
}

// ============================================================================
// Service
// ============================================================================

/// Open the port, bind the listeners and serve until `token` is cancelled
pub async fn run_service(
    config: GatewayConfig,
    scan: Option<RangeInclusive<u8>>,
    token: CancellationToken,
) -> Result<()> {
    let clock = MonotonicClock::new();
    let port = serial::open_port(&config.serial)?;
    let listener =
        network::bind_tcp(&format!("{}:{}", config.bind_address, config.tcp_port)).await?;
    let udp = Arc::new(
        network::bind_udp(&format!("{}:{}", config.bind_address, config.udp_port)).await?,
    );

    let sessions = Arc::new(SessionRegistry::new());
    let (line, commands) = ChannelSerialLine::new();
    let sink = ChannelSink::new(Arc::clone(&sessions), Some(Arc::clone(&udp)));
    let mut engine = EngineTask::new(Gateway::new(&config, line, sink), clock);
    if let Some(path) = &config.stats_file {
        let interval = Duration::from_secs(config.stats_flush_interval_h.saturating_mul(3600));
        engine = engine.with_stats_store(StatsStore::new(path), interval);
    }
    if let Some(range) = scan {
        info!("Scan: slaves {}-{}", range.start(), range.end());
        engine.gateway_mut().trigger_scan(range)?;
    }

    let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (serial_tx, serial_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let serial_task = tokio::spawn(serial::run_serial_task(
        port,
        commands,
        serial_tx,
        clock,
        token.child_token(),
    ));
    let settings = TcpSettings {
        framing: engine.gateway().framing(),
        idle_timeout: (config.tcp_idle_timeout_s > 0)
            .then(|| Duration::from_secs(config.tcp_idle_timeout_s)),
    };
    let tcp_task = tokio::spawn(network::run_tcp_listener(
        listener,
        settings,
        Arc::clone(&sessions),
        event_tx.clone(),
        token.child_token(),
    ));
    let udp_task = tokio::spawn(network::run_udp_listener(
        udp,
        (config.udp_idle_timeout_s > 0).then(|| Duration::from_secs(config.udp_idle_timeout_s)),
        sessions,
        event_tx,
        token.child_token(),
    ));

    info!("Gateway running");
    engine.run(event_rx, serial_rx, token.clone()).await;

    // Stop everything else if the engine ended on its own
    token.cancel();
    let _ = tcp_task.await;
    let _ = udp_task.await;
    match serial_task.await {
        Ok(result) => result,
        Err(e) => {
            warn!("Serial task join failed: {}", e);
            Ok(())
        },
    }
}
