//! Message transport over a pair of raw byte streams.
//!
//! [`RemoteIo`] turns the socket handed over by Discovery into a
//! publish/subscribe bus of typed [`RemoteMessage`]s.  It knows nothing about
//! displays or sessions: it frames, it decodes, it fans out, it writes.
//!
//! # Threads
//!
//! Every attached *input* stream gets its own reader thread.  The thread reads
//! one header, then exactly `payload_len` bytes, decodes the message and hands
//! it to every registered consumer in registration order.  When the stream
//! reaches end-of-file or fails, the thread fires that stream's `on_closed`
//! callback exactly once and exits.
//!
//! `send` may be called from any thread.  Writes are serialised under a single
//! writer lock so two messages never interleave on the wire.
//!
//! # Consumers and backpressure
//!
//! The consumer list is copy-on-write: a fan-out iterates over a snapshot, so
//! consumers may add or remove consumers (including themselves) while a
//! message is being dispatched.  A removed consumer can still see the message
//! that was in flight when it was removed.
//!
//! Fan-out is synchronous.  A consumer that blocks (a decoder pipeline whose
//! pending queue is full) stalls delivery to every later consumer on the same
//! stream; this is the only backpressure mechanism in the session.
//!
//! # Malformed input
//!
//! A message whose header is intact but whose payload does not decode
//! (unknown type, truncated field) is logged and dropped; the reader already
//! consumed the right number of bytes and continues.  A framing error (wrong
//! protocol version, absurd payload length) ends the read loop, which the
//! session then treats as a lost connection.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use thiserror::Error;
use tracing::{debug, error, trace, warn};
use vdm_core::protocol::{
    decode_header, decode_payload, encode_message, messages::HEADER_SIZE, RemoteMessage,
};

use crate::sync::lock_unpoisoned;

/// Callback receiving every decoded inbound message.
pub type MessageConsumer = Arc<dyn Fn(&RemoteMessage) + Send + Sync>;

/// Callback fired once when an attached stream closes or fails.
pub type ClosedCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by [`RemoteIo::add_message_consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(u64);

/// Errors raised while attaching streams.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The OS refused to start the reader thread.
    #[error("failed to spawn remote stream reader thread: {0}")]
    SpawnReader(#[source] std::io::Error),
}

struct OutputStream {
    writer: Box<dyn Write + Send>,
    on_closed: ClosedCallback,
}

struct RemoteIoInner {
    consumers: Mutex<Arc<Vec<(ConsumerId, MessageConsumer)>>>,
    next_consumer_id: AtomicU64,
    output: Mutex<Option<OutputStream>>,
}

/// Shared message bus over the session's byte streams.
///
/// Cloning is cheap; all clones refer to the same bus.
#[derive(Clone)]
pub struct RemoteIo {
    inner: Arc<RemoteIoInner>,
}

impl RemoteIo {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RemoteIoInner {
                consumers: Mutex::new(Arc::new(Vec::new())),
                next_consumer_id: AtomicU64::new(0),
                output: Mutex::new(None),
            }),
        }
    }

    /// Starts a reader thread for `reader`.
    ///
    /// `on_closed` fires exactly once, from the reader thread, when the stream
    /// hits end-of-file, an I/O error, or a framing error.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SpawnReader`] if the thread cannot be started;
    /// `on_closed` is not fired in that case.
    pub fn attach_input_stream<R>(&self, reader: R, on_closed: ClosedCallback) -> Result<(), TransportError>
    where
        R: Read + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("vdm-remote-io-reader".to_string())
            .spawn(move || {
                read_loop(&inner, reader);
                on_closed();
            })
            .map_err(TransportError::SpawnReader)?;
        Ok(())
    }

    /// Installs `writer` as the output stream, replacing any previous one.
    ///
    /// `on_closed` fires once if a later write fails.  A replaced or detached
    /// stream never fires its callback.
    pub fn attach_output_stream<W>(&self, writer: W, on_closed: ClosedCallback)
    where
        W: Write + Send + 'static,
    {
        let previous = lock_unpoisoned(&self.inner.output).replace(OutputStream {
            writer: Box::new(writer),
            on_closed,
        });
        if previous.is_some() {
            debug!("replaced previously attached output stream");
        }
    }

    /// Drops the output stream without firing its callback.
    pub fn detach_output_stream(&self) {
        if lock_unpoisoned(&self.inner.output).take().is_some() {
            debug!("output stream detached");
        }
    }

    pub fn is_output_attached(&self) -> bool {
        lock_unpoisoned(&self.inner.output).is_some()
    }

    /// Encodes `msg` and writes it atomically to the output stream.
    ///
    /// Never fails to the caller.  With no output attached the message is
    /// dropped.  On a write error the stream is detached and its `on_closed`
    /// fires once, after the writer lock has been released.
    pub fn send(&self, msg: &RemoteMessage) {
        let bytes = match encode_message(msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to encode {:?}: {e}", msg.message_type());
                return;
            }
        };

        let failed = {
            let mut guard = lock_unpoisoned(&self.inner.output);
            let Some(stream) = guard.as_mut() else {
                trace!("no output stream attached; dropping {:?}", msg.message_type());
                return;
            };
            match stream.writer.write_all(&bytes).and_then(|()| stream.writer.flush()) {
                Ok(()) => None,
                Err(e) => {
                    warn!("write to remote stream failed: {e}");
                    guard.take()
                }
            }
        };

        if let Some(stream) = failed {
            (stream.on_closed)();
        }
    }

    /// Registers `consumer` at the end of the fan-out order.
    pub fn add_message_consumer<F>(&self, consumer: F) -> ConsumerId
    where
        F: Fn(&RemoteMessage) + Send + Sync + 'static,
    {
        let id = ConsumerId(self.inner.next_consumer_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = lock_unpoisoned(&self.inner.consumers);
        let mut next = Vec::clone(&guard);
        next.push((id, Arc::new(consumer) as MessageConsumer));
        *guard = Arc::new(next);
        id
    }

    /// Removes a consumer.  Returns `false` if it was not registered.
    pub fn remove_message_consumer(&self, id: ConsumerId) -> bool {
        let mut guard = lock_unpoisoned(&self.inner.consumers);
        if !guard.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        let next: Vec<_> = guard.iter().filter(|(existing, _)| *existing != id).cloned().collect();
        *guard = Arc::new(next);
        true
    }

    pub fn consumer_count(&self) -> usize {
        lock_unpoisoned(&self.inner.consumers).len()
    }
}

impl Default for RemoteIo {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads framed messages from `reader` until it ends or the framing breaks.
fn read_loop<R: Read>(inner: &RemoteIoInner, mut reader: R) {
    let mut header_buf = [0u8; HEADER_SIZE];
    loop {
        if let Err(e) = reader.read_exact(&mut header_buf) {
            if e.kind() == ErrorKind::UnexpectedEof {
                debug!("remote stream reached end of file");
            } else {
                warn!("read error on remote stream: {e}");
            }
            return;
        }

        let header = match decode_header(&header_buf) {
            Ok(header) => header,
            Err(e) => {
                error!("unrecoverable framing error on remote stream: {e}");
                return;
            }
        };

        let mut payload = vec![0u8; header.payload_length as usize];
        if let Err(e) = reader.read_exact(&mut payload) {
            warn!("remote stream ended mid-message: {e}");
            return;
        }

        match decode_payload(header.message_type, &payload) {
            Ok(msg) => dispatch(inner, &msg),
            Err(e) => warn!("dropping malformed message: {e}"),
        }
    }
}

fn dispatch(inner: &RemoteIoInner, msg: &RemoteMessage) {
    let snapshot = Arc::clone(&lock_unpoisoned(&inner.consumers));
    trace!("dispatching {:?} to {} consumers", msg.message_type(), snapshot.len());
    for (_, consumer) in snapshot.iter() {
        consumer(msg);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
