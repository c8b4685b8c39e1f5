//! In-process discovery network for tests.
//!
//! [`MockDiscoveryNetwork`] is a shared "air" that any number of host and
//! client coordinators in the same process can attach to.  Publishing and
//! subscribing, short messages and network requests are delivered between them
//! exactly as a real adapter would report them, while the test keeps control
//! over failures (`set_available`, `set_reject_sessions`) and can inject
//! faults (`simulate_network_lost`, `inject_peer_message`).
//!
//! Network requests resolve to `127.0.0.1:<port>`, so the data path is a real
//! loopback TCP connection.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::{
    DiscoveryError, DiscoveryEvent, DiscoveryEventSender, DiscoveryHandle, DiscoveryRole,
    DiscoverySession, DiscoveryTransport, PeerHandle,
};
use crate::sync::lock_unpoisoned;

struct Endpoint {
    peer: PeerHandle,
    role: DiscoveryRole,
    service: String,
    events: DiscoveryEventSender,
    open: bool,
    network_requested_from: HashSet<PeerHandle>,
}

#[derive(Default)]
struct Air {
    unavailable: bool,
    reject_sessions: bool,
    endpoints: Vec<Endpoint>,
    /// (offering peer, peer it is offered to) → listening port.
    offers: HashMap<(PeerHandle, PeerHandle), u16>,
    attach_count: usize,
    publish_count: usize,
    subscribe_count: usize,
}

impl Air {
    fn endpoint(&self, peer: PeerHandle) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.peer == peer && e.open)
    }

    fn endpoint_mut(&mut self, peer: PeerHandle) -> Option<&mut Endpoint> {
        self.endpoints.iter_mut().find(|e| e.peer == peer && e.open)
    }
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Shared in-process discovery medium.
#[derive(Clone, Default)]
pub struct MockDiscoveryNetwork {
    air: Arc<Mutex<Air>>,
}

impl MockDiscoveryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a transport attached to this network.
    pub fn transport(&self) -> Arc<dyn DiscoveryTransport> {
        Arc::new(MockDiscoveryTransport {
            air: Arc::clone(&self.air),
        })
    }

    /// When `false`, `attach` fails with [`DiscoveryError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        lock_unpoisoned(&self.air).unavailable = !available;
    }

    /// When `true`, `publish` / `subscribe` fail with
    /// [`DiscoveryError::HandshakeFailure`].
    pub fn set_reject_sessions(&self, reject: bool) {
        lock_unpoisoned(&self.air).reject_sessions = reject;
    }

    pub fn attach_count(&self) -> usize {
        lock_unpoisoned(&self.air).attach_count
    }

    pub fn publish_count(&self) -> usize {
        lock_unpoisoned(&self.air).publish_count
    }

    pub fn subscribe_count(&self) -> usize {
        lock_unpoisoned(&self.air).subscribe_count
    }

    /// Number of publish/subscribe sessions that have not been closed.
    pub fn open_session_count(&self) -> usize {
        lock_unpoisoned(&self.air).endpoints.iter().filter(|e| e.open).count()
    }

    /// Reports `NetworkLost` to every open session.
    pub fn simulate_network_lost(&self) {
        let air = lock_unpoisoned(&self.air);
        for endpoint in air.endpoints.iter().filter(|e| e.open) {
            let _ = endpoint.events.send(DiscoveryEvent::NetworkLost);
        }
    }

    /// Delivers `message` from a fabricated peer to every open session of `role`.
    ///
    /// Returns the fabricated peer handle.
    pub fn inject_peer_message(&self, role: DiscoveryRole, message: &[u8]) -> PeerHandle {
        let stranger = PeerHandle(Uuid::new_v4());
        let air = lock_unpoisoned(&self.air);
        for endpoint in air.endpoints.iter().filter(|e| e.open && e.role == role) {
            let _ = endpoint.events.send(DiscoveryEvent::PeerMessage {
                peer: stranger,
                message: message.to_vec(),
            });
        }
        stranger
    }

    /// Reports a data endpoint at `addr`, offered by a fabricated peer, to
    /// every open session of `role`.
    pub fn inject_network_available(&self, role: DiscoveryRole, addr: SocketAddr) -> PeerHandle {
        let stranger = PeerHandle(Uuid::new_v4());
        let air = lock_unpoisoned(&self.air);
        for endpoint in air.endpoints.iter().filter(|e| e.open && e.role == role) {
            let _ = endpoint.events.send(DiscoveryEvent::NetworkAvailable { peer: stranger, addr });
        }
        stranger
    }
}

struct MockDiscoveryTransport {
    air: Arc<Mutex<Air>>,
}

#[async_trait]
impl DiscoveryTransport for MockDiscoveryTransport {
    async fn attach(&self) -> Result<Arc<dyn DiscoveryHandle>, DiscoveryError> {
        let mut air = lock_unpoisoned(&self.air);
        air.attach_count += 1;
        if air.unavailable {
            return Err(DiscoveryError::Unavailable("mock network switched off".to_string()));
        }
        Ok(Arc::new(MockDiscoveryHandle {
            air: Arc::clone(&self.air),
        }))
    }
}

struct MockDiscoveryHandle {
    air: Arc<Mutex<Air>>,
}

impl MockDiscoveryHandle {
    fn open_session(
        &self,
        role: DiscoveryRole,
        service_name: &str,
        events: DiscoveryEventSender,
    ) -> Result<(), DiscoveryError> {
        let mut air = lock_unpoisoned(&self.air);
        match role {
            DiscoveryRole::Host => air.publish_count += 1,
            DiscoveryRole::Client => air.subscribe_count += 1,
        }
        if air.reject_sessions {
            return Err(DiscoveryError::HandshakeFailure(format!(
                "mock network rejected {role:?} session"
            )));
        }

        let me = PeerHandle(Uuid::new_v4());
        let session: Arc<dyn DiscoverySession> = Arc::new(MockDiscoverySession {
            air: Arc::clone(&self.air),
            me,
        });
        let started = match role {
            DiscoveryRole::Host => DiscoveryEvent::Published(session),
            DiscoveryRole::Client => DiscoveryEvent::Subscribed(session),
        };
        let _ = events.send(started);

        // Match publishers with subscribers of the same service.
        for other in air.endpoints.iter().filter(|e| e.open && e.service == service_name) {
            match (role, other.role) {
                (DiscoveryRole::Host, DiscoveryRole::Client) => {
                    let _ = other.events.send(DiscoveryEvent::ServiceDiscovered { peer: me });
                }
                (DiscoveryRole::Client, DiscoveryRole::Host) => {
                    let _ = events.send(DiscoveryEvent::ServiceDiscovered { peer: other.peer });
                }
                _ => {}
            }
        }

        debug!("mock discovery: {role:?} session {me} opened for '{service_name}'");
        air.endpoints.push(Endpoint {
            peer: me,
            role,
            service: service_name.to_string(),
            events,
            open: true,
            network_requested_from: HashSet::new(),
        });
        Ok(())
    }
}

#[async_trait]
impl DiscoveryHandle for MockDiscoveryHandle {
    async fn publish(&self, service_name: &str, events: DiscoveryEventSender) -> Result<(), DiscoveryError> {
        self.open_session(DiscoveryRole::Host, service_name, events)
    }

    async fn subscribe(&self, service_name: &str, events: DiscoveryEventSender) -> Result<(), DiscoveryError> {
        self.open_session(DiscoveryRole::Client, service_name, events)
    }
}

struct MockDiscoverySession {
    air: Arc<Mutex<Air>>,
    me: PeerHandle,
}

impl DiscoverySession for MockDiscoverySession {
    fn send_message(&self, peer: PeerHandle, message: &[u8]) -> Result<(), DiscoveryError> {
        let air = lock_unpoisoned(&self.air);
        if air.endpoint(self.me).is_none() {
            return Err(DiscoveryError::Closed);
        }
        let target = air.endpoint(peer).ok_or(DiscoveryError::UnknownPeer(peer))?;
        let _ = target.events.send(DiscoveryEvent::PeerMessage {
            peer: self.me,
            message: message.to_vec(),
        });
        Ok(())
    }

    fn request_network(&self, peer: PeerHandle, port: Option<u16>) -> Result<(), DiscoveryError> {
        let mut air = lock_unpoisoned(&self.air);
        if air.endpoint(self.me).is_none() {
            return Err(DiscoveryError::Closed);
        }
        match port {
            Some(port) => {
                air.offers.insert((self.me, peer), port);
                if let Some(target) = air.endpoint(peer) {
                    if target.network_requested_from.contains(&self.me) {
                        let _ = target.events.send(DiscoveryEvent::NetworkAvailable {
                            peer: self.me,
                            addr: loopback(port),
                        });
                    }
                }
            }
            None => {
                let offered = air.offers.get(&(peer, self.me)).copied();
                let me = air.endpoint_mut(self.me).ok_or(DiscoveryError::Closed)?;
                me.network_requested_from.insert(peer);
                if let Some(port) = offered {
                    let _ = me.events.send(DiscoveryEvent::NetworkAvailable {
                        peer,
                        addr: loopback(port),
                    });
                }
            }
        }
        Ok(())
    }

    fn release_network(&self) {
        let mut air = lock_unpoisoned(&self.air);
        let me = self.me;
        air.offers.retain(|(offerer, _), _| *offerer != me);
        if let Some(endpoint) = air.endpoint_mut(me) {
            endpoint.network_requested_from.clear();
        }
    }

    fn close(&self) {
        let mut air = lock_unpoisoned(&self.air);
        let me = self.me;
        air.offers.retain(|(offerer, _), _| *offerer != me);
        if let Some(endpoint) = air.endpoint_mut(me) {
            endpoint.open = false;
            let _ = endpoint.events.send(DiscoveryEvent::Terminated);
            debug!("mock discovery: session {me} closed");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
