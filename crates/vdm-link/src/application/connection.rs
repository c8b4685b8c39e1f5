//! Session coordinator: discovery, rendezvous and the connection lifecycle.
//!
//! [`ConnectionManager`] owns the one allowed session of a process.  It walks
//! the discovery medium from "nothing" to a connected byte stream, hands that
//! stream to [`RemoteIo`], and reports every step to the registered
//! [`ConnectionCallback`]s.
//!
//! # Lifecycle (for beginners)
//!
//! ```text
//!  Idle ──start_*_session──▶ Attaching ──publish/subscribe──▶ Published / Subscribed
//!   ▲                                                              │ identity message
//!   │                                                              ▼
//!   └────────────── disconnect() / network lost ◀── Connected ◀── Connecting
//! ```
//!
//! 1. **Attaching**: the discovery handle is obtained once and shared; a
//!    failed attach is retried `attach_retries` times and is not cached.
//! 2. **Published / Subscribed**: the host publishes the service name, the
//!    client subscribes to it.  `on_initialized` fires.
//! 3. **Connecting**: the client sends its identity to the discovered host.
//!    The host answers by listening on an ephemeral TCP port, advertising it
//!    out-of-band and sending its own identity.  On receiving the other
//!    side's identity both fire `on_connecting(peer)`.
//! 4. **Connected**: the client connects to the advertised address, the host
//!    accepts, both attach the socket to `RemoteIo` and fire
//!    `on_connected(peer)`.
//!
//! # Epochs
//!
//! Every start and every disconnect bumps an epoch counter.  Asynchronous work
//! (the event loop, accept/connect tasks, socket-closed callbacks) remembers
//! the epoch it was started in and does nothing once it is stale, so a late
//! event from a torn-down session can never touch a newer one.
//!
//! # Locks
//!
//! Connection state and the callback list each have their own lock.  Callbacks
//! are invoked from a snapshot with neither lock held, so a callback may call
//! back into the manager (for example `disconnect()`).

use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, error, info, warn};

use crate::config::LinkConfig;
use crate::infrastructure::discovery::{
    DiscoveryError, DiscoveryEvent, DiscoveryHandle, DiscoveryRole, DiscoverySession,
    DiscoveryTransport, PeerHandle,
};
use crate::infrastructure::remote_io::{ClosedCallback, RemoteIo, TransportError};
use crate::sync::lock_unpoisoned;

/// Errors raised while handing a socket over to the transport.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("cannot listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accepting the peer connection failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("peer did not complete the handshake within {0:?}")]
    Timeout(Duration),

    #[error("socket setup failed: {0}")]
    Socket(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// Observer of connection lifecycle events.  All methods default to no-ops.
pub trait ConnectionCallback: Send + Sync {
    fn on_initialized(&self) {}
    fn on_connecting(&self, _remote_device_name: &str) {}
    fn on_connected(&self, _remote_device_name: &str) {}
    fn on_disconnected(&self) {}
    fn on_error(&self, _message: &str) {}
}

/// Snapshot of the connection as reported by [`ConnectionManager::connection_status`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Identity of the peer, known from the first identity message on.
    pub remote_device_name: Option<String>,
    pub connected: bool,
}

#[derive(Default)]
struct SessionState {
    initiated: bool,
    discovery: Option<Arc<dyn DiscoverySession>>,
    status: ConnectionStatus,
    socket: Option<std::net::TcpStream>,
    epoch: u64,
}

struct Inner {
    config: LinkConfig,
    transport: Arc<dyn DiscoveryTransport>,
    remote_io: RemoteIo,
    runtime: Handle,
    session: Mutex<SessionState>,
    callbacks: Mutex<Vec<Arc<dyn ConnectionCallback>>>,
    attach: OnceCell<Arc<dyn DiscoveryHandle>>,
}

/// Connection lifecycle owner.  Cloning is cheap; clones share one session.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Creates a manager whose discovery work runs on `runtime`.
    pub fn new(config: LinkConfig, transport: Arc<dyn DiscoveryTransport>, remote_io: RemoteIo, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                remote_io,
                runtime,
                session: Mutex::new(SessionState::default()),
                callbacks: Mutex::new(Vec::new()),
                attach: OnceCell::new(),
            }),
        }
    }

    /// Publishes the service and waits for a client.  Does nothing while a
    /// session is already initiated.
    pub fn start_host_session(&self) {
        self.start_session(DiscoveryRole::Host);
    }

    /// Subscribes to the service and connects to the first host found.  Does
    /// nothing while a session is already initiated.
    pub fn start_client_session(&self) {
        self.start_session(DiscoveryRole::Client);
    }

    fn start_session(&self, role: DiscoveryRole) {
        let epoch = {
            let mut state = lock_unpoisoned(&self.inner.session);
            if state.initiated {
                debug!("{role:?} session already initiated");
                return;
            }
            state.initiated = true;
            state.epoch += 1;
            state.epoch
        };
        info!("starting {role:?} session for '{}'", self.inner.config.service_name);
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            inner.run_session(role, epoch).await;
        });
    }

    /// Ends the session.  Fires `on_disconnected` once; further calls are
    /// no-ops until a new session is started.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        lock_unpoisoned(&self.inner.session).status.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock_unpoisoned(&self.inner.session).status.connected
    }

    pub fn add_connection_callback(&self, callback: Arc<dyn ConnectionCallback>) {
        lock_unpoisoned(&self.inner.callbacks).push(callback);
    }

    /// Removes a callback previously added.  Returns `false` if it was not
    /// registered.
    pub fn remove_connection_callback(&self, callback: &Arc<dyn ConnectionCallback>) -> bool {
        let mut callbacks = lock_unpoisoned(&self.inner.callbacks);
        let before = callbacks.len();
        callbacks.retain(|existing| !Arc::ptr_eq(existing, callback));
        callbacks.len() != before
    }

    /// The message bus the connected socket is attached to.
    pub fn remote_io(&self) -> &RemoteIo {
        &self.inner.remote_io
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }
}

// ── Session internals ────────────────────────────────────────────────────────

impl Inner {
    fn notify(&self, event: impl Fn(&dyn ConnectionCallback)) {
        let snapshot: Vec<_> = lock_unpoisoned(&self.callbacks).clone();
        for callback in &snapshot {
            event(callback.as_ref());
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        lock_unpoisoned(&self.session).epoch == epoch
    }

    fn current_session(&self, epoch: u64) -> Option<Arc<dyn DiscoverySession>> {
        let state = lock_unpoisoned(&self.session);
        if state.epoch == epoch {
            state.discovery.clone()
        } else {
            None
        }
    }

    async fn attach_discovery(&self) -> Result<Arc<dyn DiscoveryHandle>, DiscoveryError> {
        let handle = self
            .attach
            .get_or_try_init(|| async {
                let mut attempt = 0;
                loop {
                    match self.transport.attach().await {
                        Ok(handle) => return Ok(handle),
                        Err(e) if attempt < self.config.attach_retries => {
                            attempt += 1;
                            warn!("discovery attach failed ({e}); retry {attempt}");
                            tokio::time::sleep(self.config.attach_retry_delay()).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
            })
            .await?;
        Ok(Arc::clone(handle))
    }

    /// Returns to Idle after a failed start and reports `reason`.
    fn abort_start(&self, epoch: u64, reason: String) {
        {
            let mut state = lock_unpoisoned(&self.session);
            if state.epoch != epoch {
                return;
            }
            state.initiated = false;
            state.epoch += 1;
        }
        error!("{reason}");
        self.notify(|cb| cb.on_error(&reason));
    }

    async fn run_session(self: Arc<Self>, role: DiscoveryRole, epoch: u64) {
        let handle = match self.attach_discovery().await {
            Ok(handle) => handle,
            Err(e) => {
                self.abort_start(epoch, format!("discovery unavailable: {e}"));
                return;
            }
        };
        if !self.is_current(epoch) {
            return;
        }

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let service = self.config.service_name.as_str();
        let started = match role {
            DiscoveryRole::Host => handle.publish(service, events_tx).await,
            DiscoveryRole::Client => handle.subscribe(service, events_tx).await,
        };
        if let Err(e) = started {
            let e = match e {
                e @ DiscoveryError::HandshakeFailure(_) => e,
                other => DiscoveryError::HandshakeFailure(other.to_string()),
            };
            self.abort_start(epoch, e.to_string());
            return;
        }

        while let Some(event) = events.recv().await {
            if !self.is_current(epoch) {
                if let DiscoveryEvent::Published(session) | DiscoveryEvent::Subscribed(session) = event {
                    session.close();
                }
                break;
            }
            debug!("{role:?} discovery event: {event:?}");
            if !self.handle_event(role, event, epoch).await {
                break;
            }
        }
        debug!("{role:?} discovery event loop finished");
    }

    /// Applies one discovery event.  Returns `false` when the loop should end.
    async fn handle_event(self: &Arc<Self>, role: DiscoveryRole, event: DiscoveryEvent, epoch: u64) -> bool {
        match event {
            DiscoveryEvent::Published(session) | DiscoveryEvent::Subscribed(session) => {
                {
                    let mut state = lock_unpoisoned(&self.session);
                    if state.epoch != epoch {
                        drop(state);
                        session.close();
                        return false;
                    }
                    state.discovery = Some(session);
                }
                info!("{role:?} session initialised");
                self.notify(|cb| cb.on_initialized());
            }
            DiscoveryEvent::ServiceDiscovered { peer } => {
                if role == DiscoveryRole::Client {
                    self.introduce(peer, epoch);
                }
            }
            DiscoveryEvent::PeerMessage { peer, message } => {
                self.on_identity(role, peer, &message, epoch).await;
            }
            DiscoveryEvent::NetworkAvailable { peer, addr } => {
                if role == DiscoveryRole::Client {
                    debug!("network to {peer} available at {addr}");
                    self.spawn_connect(addr, epoch);
                }
            }
            DiscoveryEvent::NetworkLost => {
                warn!("discovery network lost");
                self.disconnect();
            }
            DiscoveryEvent::Terminated => return false,
            DiscoveryEvent::Failed(reason) => {
                error!("discovery session failed: {reason}");
                self.notify(|cb| cb.on_error(&reason));
                self.disconnect();
                return false;
            }
        }
        true
    }

    /// Sends this device's identity to `peer`.
    fn introduce(&self, peer: PeerHandle, epoch: u64) {
        let Some(session) = self.current_session(epoch) else {
            return;
        };
        if let Err(e) = session.send_message(peer, self.config.device_name.as_bytes()) {
            warn!("cannot send identity to {peer}: {e}");
        }
    }

    async fn on_identity(self: &Arc<Self>, role: DiscoveryRole, peer: PeerHandle, message: &[u8], epoch: u64) {
        let name = String::from_utf8_lossy(message).into_owned();
        {
            let mut state = lock_unpoisoned(&self.session);
            if state.epoch != epoch {
                return;
            }
            if state.status.connected || state.status.remote_device_name.is_some() {
                debug!("ignoring identity '{name}' from {peer}: session already in use");
                return;
            }
            state.status.remote_device_name = Some(name.clone());
        }
        info!("connecting to '{name}'");
        self.notify(|cb| cb.on_connecting(&name));

        let Some(session) = self.current_session(epoch) else {
            return;
        };
        let result = match role {
            DiscoveryRole::Host => self.offer_endpoint(&session, peer, epoch).await,
            DiscoveryRole::Client => session.request_network(peer, None).map_err(ConnectionError::from),
        };
        if let Err(e) = result {
            self.handshake_failed(epoch, e);
        }
    }

    /// Host side: listen, advertise the port, answer with our identity and
    /// accept in the background.
    async fn offer_endpoint(
        self: &Arc<Self>,
        session: &Arc<dyn DiscoverySession>,
        peer: PeerHandle,
        epoch: u64,
    ) -> Result<(), ConnectionError> {
        let address = format!("{}:0", self.config.bind_address);
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| ConnectionError::Bind { address, source })?;
        let port = listener.local_addr()?.port();
        session.request_network(peer, Some(port))?;
        session.send_message(peer, self.config.device_name.as_bytes())?;
        debug!("listening for {peer} on port {port}");

        let inner = Arc::clone(self);
        let timeout = self.config.handshake_timeout();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    debug!("accepted data connection from {addr}");
                    inner.on_socket_available(stream, epoch);
                }
                Ok(Err(e)) => inner.handshake_failed(epoch, ConnectionError::Accept(e)),
                Err(_) => inner.handshake_failed(epoch, ConnectionError::Timeout(timeout)),
            }
        });
        Ok(())
    }

    fn spawn_connect(self: &Arc<Self>, addr: SocketAddr, epoch: u64) {
        let inner = Arc::clone(self);
        let timeout = self.config.handshake_timeout();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => inner.on_socket_available(stream, epoch),
                Ok(Err(source)) => inner.handshake_failed(epoch, ConnectionError::Connect { addr, source }),
                Err(_) => inner.handshake_failed(epoch, ConnectionError::Timeout(timeout)),
            }
        });
    }

    /// Reports a failed handshake and goes back to waiting for a peer.
    fn handshake_failed(&self, epoch: u64, error: ConnectionError) {
        {
            let mut state = lock_unpoisoned(&self.session);
            if state.epoch == epoch && !state.status.connected {
                state.status.remote_device_name = None;
                if let Some(session) = &state.discovery {
                    session.release_network();
                }
            }
        }
        error!("handshake failed: {error}");
        let message = error.to_string();
        self.notify(|cb| cb.on_error(&message));
    }

    fn on_socket_available(self: &Arc<Self>, stream: TcpStream, epoch: u64) {
        if let Err(e) = self.attach_socket(stream, epoch) {
            self.handshake_failed(epoch, e);
        }
    }

    fn attach_socket(self: &Arc<Self>, stream: TcpStream, epoch: u64) -> Result<(), ConnectionError> {
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        let owned = stream.try_clone()?;

        // The session is claimed before RemoteIo sees the streams, so a late
        // or duplicate connection never replaces the live writer.
        let name = {
            let mut state = lock_unpoisoned(&self.session);
            if state.epoch != epoch || state.status.connected {
                drop(state);
                debug!("dropping data connection: session finished or already connected");
                let _ = stream.shutdown(Shutdown::Both);
                return Ok(());
            }
            state.status.connected = true;
            state.socket = Some(owned);
            state.status.remote_device_name.clone().unwrap_or_default()
        };

        let on_closed = self.closed_callback(epoch);
        self.remote_io.attach_output_stream(writer, Arc::clone(&on_closed));
        if let Err(e) = self.remote_io.attach_input_stream(reader, on_closed) {
            self.remote_io.detach_output_stream();
            {
                let mut state = lock_unpoisoned(&self.session);
                if state.epoch == epoch {
                    state.status.connected = false;
                    state.socket = None;
                }
            }
            let _ = stream.shutdown(Shutdown::Both);
            return Err(e.into());
        }

        if !self.is_current(epoch) {
            debug!("session ended while the data connection was attached");
            self.remote_io.detach_output_stream();
            return Ok(());
        }
        info!("connected to '{name}'");
        self.notify(|cb| cb.on_connected(&name));
        Ok(())
    }

    fn closed_callback(self: &Arc<Self>, epoch: u64) -> ClosedCallback {
        let weak: Weak<Self> = Arc::downgrade(self);
        Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                if inner.is_current(epoch) {
                    warn!("data connection lost");
                    inner.disconnect();
                }
            }
        })
    }

    fn disconnect(&self) {
        let (discovery, socket) = {
            let mut state = lock_unpoisoned(&self.session);
            if !state.initiated && !state.status.connected {
                return;
            }
            state.initiated = false;
            state.epoch += 1;
            state.status = ConnectionStatus::default();
            (state.discovery.take(), state.socket.take())
        };
        info!("disconnecting");
        if let Some(discovery) = discovery {
            discovery.release_network();
            discovery.close();
        }
        self.remote_io.detach_output_stream();
        if let Some(socket) = socket {
            let _ = socket.shutdown(Shutdown::Both);
        }
        self.notify(|cb| cb.on_disconnected());
    }
}
