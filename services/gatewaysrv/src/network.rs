//! TCP and UDP client listeners
//!
//! Every client message is forwarded to the engine task as a
//! [`ClientEvent`]. Responses come back through [`ChannelSink`], which looks
//! the session up in the shared [`SessionRegistry`].

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::StreamExt;
use rtu_gateway::constants::{MAX_ADU_SIZE, MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MODBUS_SIZE};
use rtu_gateway::{DiscoveryEvent, Framing, ResponseSink, SessionId, Transport};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{GatewaySrvError, Result};

/// Responses buffered per TCP session before new ones are dropped
const SESSION_SEND_BUFFER: usize = 16;

/// Upper bound on the period of the idle UDP peer sweep
const UDP_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Message from a listener to the engine task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Request {
        transport: Transport,
        session: SessionId,
        bytes: Bytes,
    },
    Closed {
        transport: Transport,
        session: SessionId,
    },
}

// ============================================================================
// Sessions
// ============================================================================

/// Live client sessions shared by the listeners and the response sink
#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_id: AtomicU32,
    tcp: DashMap<SessionId, mpsc::Sender<Bytes>>,
    udp_peers: DashMap<SessionId, SocketAddr>,
    udp_sessions: DashMap<SocketAddr, UdpPeer>,
}

#[derive(Debug, Clone, Copy)]
struct UdpPeer {
    session: SessionId,
    last_seen: Instant,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub fn open_tcp(&self, sender: mpsc::Sender<Bytes>) -> SessionId {
        let session = self.allocate();
        self.tcp.insert(session, sender);
        session
    }

    pub fn close_tcp(&self, session: SessionId) {
        self.tcp.remove(&session);
    }

    pub fn tcp_sender(&self, session: SessionId) -> Option<mpsc::Sender<Bytes>> {
        self.tcp.get(&session).map(|entry| entry.value().clone())
    }

    pub fn tcp_count(&self) -> usize {
        self.tcp.len()
    }

    /// Session id of a UDP peer, stable until the peer is evicted as idle
    pub fn udp_session(&self, peer: SocketAddr, now: Instant) -> SessionId {
        let mut entry = self.udp_sessions.entry(peer).or_insert_with(|| {
            let session = self.allocate();
            self.udp_peers.insert(session, peer);
            debug!("UDP session {} for {}", session, peer);
            UdpPeer {
                session,
                last_seen: now,
            }
        });
        entry.last_seen = now;
        entry.session
    }

    pub fn udp_peer(&self, session: SessionId) -> Option<SocketAddr> {
        self.udp_peers.get(&session).map(|entry| *entry.value())
    }

    pub fn udp_count(&self) -> usize {
        self.udp_sessions.len()
    }

    /// Forget peers silent for at least `idle`, returning their sessions
    pub fn evict_idle_udp(&self, now: Instant, idle: Duration) -> Vec<SessionId> {
        let mut evicted = Vec::new();
        self.udp_sessions.retain(|_, peer| {
            let active = now.saturating_duration_since(peer.last_seen) < idle;
            if !active {
                evicted.push(peer.session);
            }
            active
        });
        for session in &evicted {
            if let Some((_, addr)) = self.udp_peers.remove(session) {
                debug!("UDP session {} from {} idle, evicted", session, addr);
            }
        }
        evicted
    }
}

/// `ResponseSink` backed by the session registry
pub struct ChannelSink {
    sessions: Arc<SessionRegistry>,
    udp: Option<Arc<UdpSocket>>,
}

impl ChannelSink {
    pub fn new(sessions: Arc<SessionRegistry>, udp: Option<Arc<UdpSocket>>) -> Self {
        Self { sessions, udp }
    }
}

impl ResponseSink for ChannelSink {
    fn deliver(&mut self, transport: Transport, session: SessionId, bytes: &[u8]) {
        match transport {
            Transport::Tcp => match self.sessions.tcp_sender(session) {
                Some(sender) => {
                    if let Err(e) = sender.try_send(Bytes::copy_from_slice(bytes)) {
                        debug!("TCP session {} response dropped: {}", session, e);
                    }
                },
                None => trace!("TCP session {} gone, response dropped", session),
            },
            Transport::Udp => {
                let (Some(socket), Some(peer)) = (&self.udp, self.sessions.udp_peer(session))
                else {
                    trace!("UDP session {} gone, response dropped", session);
                    return;
                };
                if let Err(e) = socket.try_send_to(bytes, peer) {
                    debug!("UDP send to {} failed: {}", peer, e);
                }
            },
        }
    }

    fn discovered(&mut self, event: DiscoveryEvent) {
        if event.present {
            info!(
                "Scan: slave {} present (fc 0x{:02X})",
                event.address,
                event.function.unwrap_or_default()
            );
        } else {
            debug!("Scan: slave {} absent", event.address);
        }
    }
}

// ============================================================================
// Stream framing
// ============================================================================

/// Splits a TCP byte stream into client messages
///
/// MBAP: the 6-byte header then `length` bytes (unit id + PDU). RTU over
/// TCP carries no length, so whatever one read delivers is one frame.
#[derive(Debug, Clone, Copy)]
pub struct ClientCodec {
    framing: Framing,
}

impl ClientCodec {
    pub fn new(framing: Framing) -> Self {
        Self { framing }
    }
}

impl Decoder for ClientCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        match self.framing {
            Framing::RtuOverTcp => {
                if src.is_empty() {
                    return Ok(None);
                }
                let len = src.len().min(MODBUS_SIZE);
                Ok(Some(src.split_to(len).freeze()))
            },
            Framing::Mbap => {
                if src.len() < MBAP_HEADER_LEN {
                    return Ok(None);
                }
                let length = usize::from(u16::from_be_bytes([src[4], src[5]]));
                if length == 0 || length > MAX_MBAP_LENGTH {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid MBAP length {}", length),
                    ));
                }
                let total = MBAP_HEADER_LEN + length;
                if src.len() < total {
                    src.reserve(total - src.len());
                    return Ok(None);
                }
                Ok(Some(src.split_to(total).freeze()))
            },
        }
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// Settings shared by every TCP connection
#[derive(Debug, Clone, Copy)]
pub struct TcpSettings {
    pub framing: Framing,
    /// `None` keeps idle sessions open
    pub idle_timeout: Option<Duration>,
}

pub async fn bind_tcp(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| GatewaySrvError::NetworkError(format!("TCP bind {} failed: {}", addr, e)))
}

pub async fn bind_udp(addr: &str) -> Result<UdpSocket> {
    UdpSocket::bind(addr)
        .await
        .map_err(|e| GatewaySrvError::NetworkError(format!("UDP bind {} failed: {}", addr, e)))
}

/// Accept TCP clients until cancelled
pub async fn run_tcp_listener(
    listener: TcpListener,
    settings: TcpSettings,
    sessions: Arc<SessionRegistry>,
    events: mpsc::Sender<ClientEvent>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_tcp_connection(
                        stream,
                        peer,
                        settings,
                        Arc::clone(&sessions),
                        events.clone(),
                        token.child_token(),
                    ));
                },
                Err(e) => warn!("TCP accept failed: {}", e),
            },
        }
    }
    debug!("TCP listener stopped");
}

async fn handle_tcp_connection(
    stream: TcpStream,
    peer: SocketAddr,
    settings: TcpSettings,
    sessions: Arc<SessionRegistry>,
    events: mpsc::Sender<ClientEvent>,
    token: CancellationToken,
) {
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Bytes>(SESSION_SEND_BUFFER);
    let session = sessions.open_tcp(tx);
    info!("TCP session {} from {}", session, peer);

    let mut frames = FramedRead::with_capacity(reader, ClientCodec::new(settings.framing), MAX_ADU_SIZE);

    loop {
        let next = async {
            match settings.idle_timeout {
                Some(idle) => tokio::time::timeout(idle, frames.next()).await.ok(),
                None => Some(frames.next().await),
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            response = rx.recv() => {
                let Some(response) = response else { break };
                if let Err(e) = writer.write_all(&response).await {
                    debug!("TCP session {} write failed: {}", session, e);
                    break;
                }
            },
            frame = next => match frame {
                None => {
                    info!("TCP session {} idle, closing", session);
                    break;
                },
                Some(None) => break,
                Some(Some(Err(e))) => {
                    warn!("TCP session {} framing error: {}", session, e);
                    break;
                },
                Some(Some(Ok(bytes))) => {
                    trace!("TCP RX: {}B from session {}", bytes.len(), session);
                    let event = ClientEvent::Request {
                        transport: Transport::Tcp,
                        session,
                        bytes,
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                },
            },
        }
    }

    sessions.close_tcp(session);
    let _ = events
        .send(ClientEvent::Closed {
            transport: Transport::Tcp,
            session,
        })
        .await;
    info!("TCP session {} closed", session);
}

/// Receive UDP datagrams until cancelled
///
/// Peers silent for `idle_timeout` are evicted and reported as closed
/// sessions; `None` keeps them for the process lifetime.
pub async fn run_udp_listener(
    socket: Arc<UdpSocket>,
    idle_timeout: Option<Duration>,
    sessions: Arc<SessionRegistry>,
    events: mpsc::Sender<ClientEvent>,
    token: CancellationToken,
) {
    let mut sweep = idle_timeout.map(|idle| {
        let period = idle.min(UDP_SWEEP_INTERVAL);
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        (idle, interval)
    });
    let mut buf = [0u8; MAX_ADU_SIZE];

    loop {
        let next_sweep = async {
            match sweep.as_mut() {
                Some((idle, interval)) => {
                    interval.tick().await;
                    *idle
                },
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            idle = next_sweep => {
                for session in sessions.evict_idle_udp(Instant::now(), idle) {
                    let event = ClientEvent::Closed {
                        transport: Transport::Udp,
                        session,
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            },
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, peer)) => {
                    let session = sessions.udp_session(peer, Instant::now());
                    trace!("UDP RX: {}B from {} (session {})", n, peer, session);
                    let event = ClientEvent::Request {
                        transport: Transport::Udp,
                        session,
                        bytes: Bytes::copy_from_slice(&buf[..n]),
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                },
                Err(e) => warn!("UDP receive failed: {}", e),
            },
        }
    }
    debug!("UDP listener stopped");
}
