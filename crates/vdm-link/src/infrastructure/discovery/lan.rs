//! UDP broadcast discovery on the local network.
//!
//! The host binds an ephemeral UDP socket and periodically broadcasts an
//! `Announce` datagram naming the service to the discovery port.  Clients
//! subscribing to that service listen on the discovery port; the first
//! announce from a host yields `ServiceDiscovered`.  After that both sides
//! talk unicast to the source address they last heard the other from.
//!
//! # Datagram format
//!
//! ```text
//! [magic:4 "VDMD"][kind:1][sender:16][service_len:1][service:N][payload_len:2][payload:M]
//! ```
//!
//! | kind | meaning                                        | payload        |
//! |------|------------------------------------------------|----------------|
//! | 1    | Announce – host publishes the service          | empty          |
//! | 2    | Message – short out-of-band message to a peer  | message bytes  |
//! | 3    | Endpoint – host advertises its TCP port        | port (u16 BE)  |
//! | 4    | Bye – sender closed its session                | empty          |
//!
//! # Threads and read timeout
//!
//! Each session runs one blocking thread.  The socket has a short read
//! timeout; on each timeout the thread checks its `running` flag (and, on the
//! host, whether an announce is due) so `close()` takes effect promptly.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    DiscoveryError, DiscoveryEvent, DiscoveryEventSender, DiscoveryHandle, DiscoveryRole,
    DiscoverySession, DiscoveryTransport, PeerHandle,
};
use crate::sync::lock_unpoisoned;

/// Default UDP port clients listen on for host announcements.
pub const DEFAULT_DISCOVERY_PORT: u16 = 24810;

const MAGIC: &[u8; 4] = b"VDMD";
const MAX_DATAGRAM_SIZE: usize = 2048;
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Settings for [`LanDiscovery`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanDiscoveryConfig {
    /// UDP port clients listen on and hosts announce to.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Destination address of host announcements.
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,
    /// Interval between two host announcements.
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}

fn default_announce_interval_ms() -> u64 {
    1000
}

impl Default for LanDiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            broadcast_address: default_broadcast_address(),
            announce_interval_ms: default_announce_interval_ms(),
        }
    }
}

// ── Datagram codec ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum DatagramKind {
    Announce = 1,
    Message = 2,
    Endpoint = 3,
    Bye = 4,
}

impl TryFrom<u8> for DatagramKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            1 => Ok(DatagramKind::Announce),
            2 => Ok(DatagramKind::Message),
            3 => Ok(DatagramKind::Endpoint),
            4 => Ok(DatagramKind::Bye),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Datagram {
    kind: DatagramKind,
    sender: PeerHandle,
    service: String,
    payload: Vec<u8>,
}

fn encode_datagram(d: &Datagram) -> Vec<u8> {
    let service = &d.service.as_bytes()[..d.service.len().min(u8::MAX as usize)];
    let payload = &d.payload[..d.payload.len().min(u16::MAX as usize)];
    let mut buf = Vec::with_capacity(24 + service.len() + payload.len());
    buf.extend_from_slice(MAGIC);
    buf.push(d.kind as u8);
    buf.extend_from_slice(d.sender.0.as_bytes());
    buf.push(service.len() as u8);
    buf.extend_from_slice(service);
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Parses a datagram; `None` for anything that is not ours or is truncated.
fn decode_datagram(buf: &[u8]) -> Option<Datagram> {
    if buf.len() < 22 || &buf[..4] != MAGIC {
        return None;
    }
    let kind = DatagramKind::try_from(buf[4]).ok()?;
    let sender = PeerHandle(Uuid::from_slice(&buf[5..21]).ok()?);
    let service_len = buf[21] as usize;
    let service_end = 22 + service_len;
    let service = std::str::from_utf8(buf.get(22..service_end)?).ok()?.to_string();
    let len_bytes = buf.get(service_end..service_end + 2)?;
    let payload_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    let payload = buf.get(service_end + 2..service_end + 2 + payload_len)?.to_vec();
    Some(Datagram {
        kind,
        sender,
        service,
        payload,
    })
}

/// Returns `true` for OS timeout / would-block errors that should be retried.
fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

// ── Transport and handle ──────────────────────────────────────────────────────

/// Production discovery adapter for hosts and clients on the same LAN.
pub struct LanDiscovery {
    config: LanDiscoveryConfig,
}

impl LanDiscovery {
    pub fn new(config: LanDiscoveryConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DiscoveryTransport for LanDiscovery {
    async fn attach(&self) -> Result<Arc<dyn DiscoveryHandle>, DiscoveryError> {
        let ip: IpAddr = self.config.broadcast_address.parse().map_err(|e| {
            DiscoveryError::Unavailable(format!(
                "invalid broadcast address '{}': {e}",
                self.config.broadcast_address
            ))
        })?;

        // UDP broadcast must be usable at all before handing out a handle.
        let check = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .map_err(|e| DiscoveryError::Unavailable(format!("cannot open UDP socket: {e}")))?;
        check
            .set_broadcast(true)
            .map_err(|e| DiscoveryError::Unavailable(format!("UDP broadcast not permitted: {e}")))?;

        Ok(Arc::new(LanDiscoveryHandle {
            announce_target: SocketAddr::new(ip, self.config.discovery_port),
            discovery_port: self.config.discovery_port,
            announce_interval: Duration::from_millis(self.config.announce_interval_ms.max(50)),
        }))
    }
}

struct LanDiscoveryHandle {
    announce_target: SocketAddr,
    discovery_port: u16,
    announce_interval: Duration,
}

impl LanDiscoveryHandle {
    fn start(
        &self,
        role: DiscoveryRole,
        service_name: &str,
        events: DiscoveryEventSender,
    ) -> Result<(), DiscoveryError> {
        let bind_port = match role {
            DiscoveryRole::Host => 0,
            DiscoveryRole::Client => self.discovery_port,
        };
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, bind_port)).map_err(|e| {
            DiscoveryError::HandshakeFailure(format!("cannot bind UDP port {bind_port}: {e}"))
        })?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        let shared = Arc::new(LanSessionShared {
            socket,
            me: PeerHandle(Uuid::new_v4()),
            role,
            service: service_name.to_string(),
            announce_target: self.announce_target,
            announce_interval: self.announce_interval,
            running: AtomicBool::new(true),
            state: Mutex::new(LanSessionState::default()),
            events,
        });

        let worker = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("vdm-discovery-{}", role_label(role)))
            .spawn(move || session_loop(&worker))?;

        let session: Arc<dyn DiscoverySession> = Arc::new(LanDiscoverySession {
            shared: Arc::clone(&shared),
        });
        let started = match role {
            DiscoveryRole::Host => DiscoveryEvent::Published(session),
            DiscoveryRole::Client => DiscoveryEvent::Subscribed(session),
        };
        let _ = shared.events.send(started);
        info!(
            "lan discovery: {} '{}' as {}",
            role_label(role),
            service_name,
            shared.me
        );
        Ok(())
    }
}

fn role_label(role: DiscoveryRole) -> &'static str {
    match role {
        DiscoveryRole::Host => "publish",
        DiscoveryRole::Client => "subscribe",
    }
}

#[async_trait]
impl DiscoveryHandle for LanDiscoveryHandle {
    async fn publish(&self, service_name: &str, events: DiscoveryEventSender) -> Result<(), DiscoveryError> {
        self.start(DiscoveryRole::Host, service_name, events)
    }

    async fn subscribe(&self, service_name: &str, events: DiscoveryEventSender) -> Result<(), DiscoveryError> {
        self.start(DiscoveryRole::Client, service_name, events)
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct LanSessionState {
    peers: HashMap<PeerHandle, SocketAddr>,
    offered_endpoints: HashMap<PeerHandle, SocketAddr>,
    network_requested: HashSet<PeerHandle>,
}

struct LanSessionShared {
    socket: UdpSocket,
    me: PeerHandle,
    role: DiscoveryRole,
    service: String,
    announce_target: SocketAddr,
    announce_interval: Duration,
    running: AtomicBool,
    state: Mutex<LanSessionState>,
    events: DiscoveryEventSender,
}

impl LanSessionShared {
    fn send(&self, kind: DatagramKind, payload: &[u8], dest: SocketAddr) -> Result<(), DiscoveryError> {
        let bytes = encode_datagram(&Datagram {
            kind,
            sender: self.me,
            service: self.service.clone(),
            payload: payload.to_vec(),
        });
        self.socket.send_to(&bytes, dest)?;
        Ok(())
    }

    fn peer_addr(&self, peer: PeerHandle) -> Result<SocketAddr, DiscoveryError> {
        lock_unpoisoned(&self.state)
            .peers
            .get(&peer)
            .copied()
            .ok_or(DiscoveryError::UnknownPeer(peer))
    }

    fn emit(&self, event: DiscoveryEvent) {
        if self.events.send(event).is_err() {
            debug!("lan discovery: event receiver dropped");
        }
    }

    fn handle_datagram(&self, d: Datagram, src: SocketAddr) {
        match d.kind {
            DatagramKind::Announce => {
                if self.role != DiscoveryRole::Client {
                    return;
                }
                let is_new = lock_unpoisoned(&self.state).peers.insert(d.sender, src).is_none();
                if is_new {
                    debug!("lan discovery: found host {} at {src}", d.sender);
                    self.emit(DiscoveryEvent::ServiceDiscovered { peer: d.sender });
                }
            }
            DatagramKind::Message => {
                lock_unpoisoned(&self.state).peers.insert(d.sender, src);
                self.emit(DiscoveryEvent::PeerMessage {
                    peer: d.sender,
                    message: d.payload,
                });
            }
            DatagramKind::Endpoint => {
                if d.payload.len() < 2 {
                    warn!("lan discovery: endpoint datagram from {src} without a port");
                    return;
                }
                let addr = SocketAddr::new(src.ip(), u16::from_be_bytes([d.payload[0], d.payload[1]]));
                let requested = {
                    let mut state = lock_unpoisoned(&self.state);
                    state.offered_endpoints.insert(d.sender, addr);
                    state.network_requested.contains(&d.sender)
                };
                if requested {
                    self.emit(DiscoveryEvent::NetworkAvailable { peer: d.sender, addr });
                }
            }
            DatagramKind::Bye => {
                let known = lock_unpoisoned(&self.state).peers.remove(&d.sender).is_some();
                if known {
                    info!("lan discovery: peer {} left", d.sender);
                    self.emit(DiscoveryEvent::NetworkLost);
                }
            }
        }
    }
}

/// The main receive loop executed on the session thread.
fn session_loop(shared: &LanSessionShared) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut next_announce = Instant::now();

    while shared.running.load(Ordering::Relaxed) {
        if shared.role == DiscoveryRole::Host && Instant::now() >= next_announce {
            if let Err(e) = shared.send(DatagramKind::Announce, &[], shared.announce_target) {
                warn!("lan discovery: announce to {} failed: {e}", shared.announce_target);
            }
            next_announce = Instant::now() + shared.announce_interval;
        }

        let (len, src) = match shared.socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if is_timeout_error(&e) => continue,
            Err(e) => {
                if shared.running.load(Ordering::Relaxed) {
                    error!("lan discovery recv error: {e}");
                    shared.emit(DiscoveryEvent::Failed(e.to_string()));
                }
                break;
            }
        };

        match decode_datagram(&buf[..len]) {
            Some(d) if d.sender == shared.me || d.service != shared.service => {}
            Some(d) => shared.handle_datagram(d, src),
            None => debug!("lan discovery: ignoring foreign datagram from {src}"),
        }
    }

    debug!("lan discovery session {} stopped", shared.me);
}

/// Handle given to the coordinator for one publish/subscribe session.
struct LanDiscoverySession {
    shared: Arc<LanSessionShared>,
}

impl DiscoverySession for LanDiscoverySession {
    fn send_message(&self, peer: PeerHandle, message: &[u8]) -> Result<(), DiscoveryError> {
        if !self.shared.running.load(Ordering::Relaxed) {
            return Err(DiscoveryError::Closed);
        }
        let dest = self.shared.peer_addr(peer)?;
        self.shared.send(DatagramKind::Message, message, dest)
    }

    fn request_network(&self, peer: PeerHandle, port: Option<u16>) -> Result<(), DiscoveryError> {
        if !self.shared.running.load(Ordering::Relaxed) {
            return Err(DiscoveryError::Closed);
        }
        match port {
            Some(port) => {
                let dest = self.shared.peer_addr(peer)?;
                self.shared.send(DatagramKind::Endpoint, &port.to_be_bytes(), dest)
            }
            None => {
                let offered = {
                    let mut state = lock_unpoisoned(&self.shared.state);
                    state.network_requested.insert(peer);
                    state.offered_endpoints.get(&peer).copied()
                };
                if let Some(addr) = offered {
                    self.shared.emit(DiscoveryEvent::NetworkAvailable { peer, addr });
                }
                Ok(())
            }
        }
    }

    fn release_network(&self) {
        let mut state = lock_unpoisoned(&self.shared.state);
        state.network_requested.clear();
        state.offered_endpoints.clear();
    }

    fn close(&self) {
        if !self.shared.running.swap(false, Ordering::Relaxed) {
            return;
        }
        let peers: Vec<SocketAddr> = lock_unpoisoned(&self.shared.state).peers.values().copied().collect();
        for dest in peers {
            if let Err(e) = self.shared.send(DatagramKind::Bye, &[], dest) {
                debug!("lan discovery: bye to {dest} failed: {e}");
            }
        }
        self.shared.emit(DiscoveryEvent::Terminated);
    }
}

impl Drop for LanDiscoverySession {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
