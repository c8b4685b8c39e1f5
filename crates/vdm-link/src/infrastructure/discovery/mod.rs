//! Out-of-band peer discovery.
//!
//! Discovery is how a host and a client find each other before any byte
//! stream exists between them.  It is modelled as three capability traits so
//! the session coordinator can run unchanged over a real network adapter
//! ([`lan::LanDiscovery`]) or an in-process fake
//! ([`mock::MockDiscoveryNetwork`]):
//!
//! 1. [`DiscoveryTransport::attach`] obtains a [`DiscoveryHandle`] (the right
//!    to use the discovery medium at all).
//! 2. The handle *publishes* (host) or *subscribes to* (client) a service name.
//!    Progress is reported as [`DiscoveryEvent`]s on the channel passed in.
//! 3. The [`DiscoverySession`] delivered by `Published` / `Subscribed` sends
//!    short messages to a peer and requests a data-path network to it.
//!
//! # Event flow for one successful connection
//!
//! ```text
//! host                                    client
//! ────                                    ──────
//! publish ─▶ Published(session)           subscribe ─▶ Subscribed(session)
//!                                         ServiceDiscovered(host)
//!            PeerMessage(client, id) ◀─── send_message(host, id)
//! request_network(client, Some(port))
//! send_message(client, id) ─────────────▶ PeerMessage(host, id)
//!                                         request_network(host, None)
//!                                         NetworkAvailable(host_addr:port)
//! accept() ◀──────────── TCP ──────────── connect()
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub mod lan;
pub mod mock;

/// Errors reported by discovery adapters.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The discovery medium cannot be used (radio off, no permission, no network).
    #[error("discovery unavailable: {0}")]
    Unavailable(String),

    /// Publishing or subscribing was rejected.
    #[error("discovery handshake failed: {0}")]
    HandshakeFailure(String),

    /// The peer handle does not refer to a peer this session has seen.
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerHandle),

    /// The session was closed.
    #[error("discovery session closed")]
    Closed,

    /// Socket-level failure.
    #[error("discovery I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque reference to a remote peer within one discovery session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle(pub Uuid);

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the rendezvous a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryRole {
    Host,
    Client,
}

/// Everything a discovery session reports, in one tagged enum.
///
/// Events for one role arrive on one channel and are consumed by a single
/// state-machine function in the coordinator.
#[derive(Clone)]
pub enum DiscoveryEvent {
    /// The service is being published (host).
    Published(Arc<dyn DiscoverySession>),
    /// The subscription is active (client).
    Subscribed(Arc<dyn DiscoverySession>),
    /// A host publishing the service was found (client).
    ServiceDiscovered { peer: PeerHandle },
    /// A short out-of-band message arrived from a peer.
    PeerMessage { peer: PeerHandle, message: Vec<u8> },
    /// The data-path network requested from a peer is up; connect to `addr`.
    NetworkAvailable { peer: PeerHandle, addr: SocketAddr },
    /// Connectivity to the peer was lost.
    NetworkLost,
    /// The discovery session ended.
    Terminated,
    /// The session failed after it had started.
    Failed(String),
}

impl fmt::Debug for DiscoveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryEvent::Published(_) => f.write_str("Published"),
            DiscoveryEvent::Subscribed(_) => f.write_str("Subscribed"),
            DiscoveryEvent::ServiceDiscovered { peer } => {
                f.debug_struct("ServiceDiscovered").field("peer", peer).finish()
            }
            DiscoveryEvent::PeerMessage { peer, message } => f
                .debug_struct("PeerMessage")
                .field("peer", peer)
                .field("len", &message.len())
                .finish(),
            DiscoveryEvent::NetworkAvailable { peer, addr } => f
                .debug_struct("NetworkAvailable")
                .field("peer", peer)
                .field("addr", addr)
                .finish(),
            DiscoveryEvent::NetworkLost => f.write_str("NetworkLost"),
            DiscoveryEvent::Terminated => f.write_str("Terminated"),
            DiscoveryEvent::Failed(reason) => f.debug_tuple("Failed").field(reason).finish(),
        }
    }
}

/// Sender half handed to adapters for reporting [`DiscoveryEvent`]s.
pub type DiscoveryEventSender = mpsc::UnboundedSender<DiscoveryEvent>;

/// Entry point of a discovery medium.
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    /// Obtains a handle on the discovery medium.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::Unavailable`] when the medium cannot be used.
    async fn attach(&self) -> Result<Arc<dyn DiscoveryHandle>, DiscoveryError>;
}

/// An attached discovery medium, able to publish or subscribe.
#[async_trait]
pub trait DiscoveryHandle: Send + Sync {
    /// Starts publishing `service_name`; `Published` follows on `events`.
    async fn publish(&self, service_name: &str, events: DiscoveryEventSender) -> Result<(), DiscoveryError>;

    /// Starts subscribing to `service_name`; `Subscribed` follows on `events`.
    async fn subscribe(&self, service_name: &str, events: DiscoveryEventSender) -> Result<(), DiscoveryError>;
}

/// A live publish or subscribe session.
///
/// Calls are synchronous and must not block for long: they are made from the
/// coordinator's event task.
pub trait DiscoverySession: Send + Sync {
    /// Sends a short out-of-band message to `peer`.
    fn send_message(&self, peer: PeerHandle, message: &[u8]) -> Result<(), DiscoveryError>;

    /// Requests a data-path network to `peer`.
    ///
    /// The host passes the port it listens on, which is advertised to the
    /// peer; the client passes `None` and later receives `NetworkAvailable`.
    fn request_network(&self, peer: PeerHandle, port: Option<u16>) -> Result<(), DiscoveryError>;

    /// Withdraws any pending network request.
    fn release_network(&self);

    /// Ends the session.  Idempotent.
    fn close(&self);
}
