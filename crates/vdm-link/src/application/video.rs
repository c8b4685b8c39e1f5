//! Per-display streaming pipeline.
//!
//! A [`VideoManager`] drives one video codec for one display.  On the host it
//! wraps an **encoder**: every output buffer the codec produces becomes a
//! `DisplayFrame` message sent over [`RemoteIo`].  On the client it wraps a
//! **decoder**: `DisplayFrame` messages for its display are queued and fed to
//! the codec in arrival order by a dedicated worker thread.
//!
//! # Queues and backpressure (for beginners)
//!
//! Two bounded FIFOs, both of capacity [`QUEUE_CAPACITY`], sit between the
//! codec and the network:
//!
//! ```text
//!                 codec thread                      worker thread
//! on_input_buffer_available(i) ──▶ [free inputs] ──▶ take i ─┐
//! RemoteIo fan-out ─ DisplayFrame ──▶ [pending]  ──▶ take f ─┴▶ queue_input_buffer(i, f)
//! ```
//!
//! - The *free input* queue holds indices of codec input buffers nobody is
//!   filling yet.  The codec never announces more buffers than it owns, so an
//!   overflow means the pipeline lost track of its buffers: it is logged and
//!   recorded as [`PipelineError::ResourceExhausted`].
//! - The *pending* queue holds received frames.  When it is full the RemoteIo
//!   fan-out blocks inside the decoder's consumer until the worker catches up.
//!   Nothing is ever dropped.
//!
//! # Stopping safely
//!
//! Codec callbacks run on a codec-owned thread and may race with [`stop`].
//! All codec access goes through one lock around an `Option`; `stop` takes
//! the codec out under that lock and tears it down after releasing it, so a
//! late callback finds `None` and does nothing.  Threads parked on a queue are
//! woken by dropping the run's cancel sender.
//!
//! # Recording
//!
//! A pipeline built [`VideoManager::with_recorder`] also appends the raw
//! bitstream it handles to a file: encoded output on the host, received
//! frames on the client.  The file can be played with any tool that reads an
//! elementary H.264 stream.
//!
//! [`stop`]: VideoManager::stop

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, select, Receiver, Sender, TrySendError};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};
use vdm_core::protocol::{
    frame_flags, ContinuityTracker, DisplayFrameMessage, FrameContinuity, FrameCounter, RemoteMessage,
};
use vdm_core::DisplayId;

use crate::infrastructure::codec::{
    BufferInfo, CodecCallback, CodecError, CodecFactory, CodecRole, VideoCodec, VideoFormat,
};
use crate::infrastructure::remote_io::{ConsumerId, RemoteIo};
use crate::sync::lock_unpoisoned;

/// Capacity of the free-input-buffer queue and of the pending-frame queue.
pub const QUEUE_CAPACITY: usize = 100;

/// Errors and faults of a streaming pipeline.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A bounded queue overflowed.
    #[error("{queue} queue exhausted (capacity {capacity})")]
    ResourceExhausted { queue: &'static str, capacity: usize },

    /// The decoder received a frame index other than the one it expected.
    /// Recorded as a fault only; the frame is decoded anyway.
    #[error("frame discontinuity: expected {expected}, received {received}")]
    FrameDiscontinuity { expected: u64, received: u64 },

    /// The pipeline is not running.
    #[error("pipeline stopped")]
    Stopped,
}

// ── Recording ────────────────────────────────────────────────────────────────

/// Appends the bitstream of one pipeline to a file.
pub struct StreamRecorder {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

impl StreamRecorder {
    /// Creates (or truncates) the file at `path`.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, data: &[u8]) {
        if let Err(e) = lock_unpoisoned(&self.file).write_all(data) {
            warn!("cannot record to {}: {e}", self.path.display());
        }
    }

    fn flush(&self) {
        if let Err(e) = lock_unpoisoned(&self.file).flush() {
            warn!("cannot flush recording {}: {e}", self.path.display());
        }
    }
}

// ── Shared run state ─────────────────────────────────────────────────────────

/// State shared between the manager, the codec callback and the worker for
/// one start/stop cycle.  A reset builds a fresh one, so callbacks from a
/// previous codec can never touch the new queues.
struct PipelineShared {
    display_id: DisplayId,
    role: CodecRole,
    remote_io: RemoteIo,
    codec: Mutex<Option<Box<dyn VideoCodec>>>,
    free_inputs_tx: Sender<usize>,
    free_inputs_rx: Receiver<usize>,
    frames: FrameCounter,
    fault: Arc<Mutex<Option<PipelineError>>>,
    recorder: Option<Arc<StreamRecorder>>,
}

impl PipelineShared {
    fn record_fault(&self, fault: PipelineError) {
        *lock_unpoisoned(&self.fault) = Some(fault);
    }

    fn on_input_available(&self, index: usize) {
        if lock_unpoisoned(&self.codec).is_none() {
            return;
        }
        match self.free_inputs_tx.try_send(index) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                error!(
                    "display {}: free input queue full, dropping buffer {index}",
                    self.display_id
                );
                self.record_fault(PipelineError::ResourceExhausted {
                    queue: "free input",
                    capacity: QUEUE_CAPACITY,
                });
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn on_output_available(&self, index: usize, info: BufferInfo) {
        match self.role {
            CodecRole::Encoder => self.publish_encoded(index, info),
            CodecRole::Decoder => self.render_decoded(index),
        }
    }

    fn publish_encoded(&self, index: usize, info: BufferInfo) {
        let frame = {
            let mut guard = lock_unpoisoned(&self.codec);
            let Some(codec) = guard.as_mut() else {
                return;
            };
            let data = codec.output_buffer(index).map(|buffer| {
                let end = info.offset.saturating_add(info.size).min(buffer.len());
                buffer[info.offset.min(end)..end].to_vec()
            });
            if let Err(e) = codec.release_output_buffer(index, false) {
                warn!("display {}: cannot release encoder output {index}: {e}", self.display_id);
            }
            match data {
                Some(data) if !data.is_empty() => DisplayFrameMessage {
                    display_id: self.display_id,
                    frame_index: self.frames.next(),
                    presentation_time_us: info.presentation_time_us,
                    flags: info.flags,
                    data,
                },
                Some(_) if info.flags & frame_flags::END_OF_STREAM != 0 => {
                    debug!("display {}: encoder reached end of stream", self.display_id);
                    return;
                }
                Some(_) => return,
                None => {
                    warn!("display {}: encoder announced unknown output {index}", self.display_id);
                    return;
                }
            }
        };
        trace!(
            "display {}: frame {} ({} bytes)",
            frame.display_id,
            frame.frame_index,
            frame.data.len()
        );
        if let Some(recorder) = &self.recorder {
            recorder.write(&frame.data);
        }
        self.remote_io.send(&RemoteMessage::DisplayFrame(frame));
    }

    fn render_decoded(&self, index: usize) {
        let mut guard = lock_unpoisoned(&self.codec);
        let Some(codec) = guard.as_mut() else {
            return;
        };
        if let Err(e) = codec.release_output_buffer(index, true) {
            warn!("display {}: cannot render decoder output {index}: {e}", self.display_id);
        }
    }

    /// Copies `frame` into input buffer `index` and hands it to the decoder.
    fn queue_frame(&self, index: usize, frame: &DisplayFrameMessage) -> Result<(), PipelineError> {
        let mut guard = lock_unpoisoned(&self.codec);
        let codec = guard.as_mut().ok_or(PipelineError::Stopped)?;
        let buffer = codec.input_buffer(index).ok_or(CodecError::InvalidBuffer(index))?;
        buffer.clear();
        buffer.extend_from_slice(&frame.data);
        codec.queue_input_buffer(index, frame.data.len(), frame.presentation_time_us, frame.flags)?;
        if let Some(recorder) = &self.recorder {
            recorder.write(&frame.data);
        }
        Ok(())
    }
}

/// Adapter from codec callbacks to the shared run state.
///
/// Holds a weak reference: once a run is torn down and dropped, callbacks
/// still in flight on the codec thread do nothing.
struct PipelineCallback {
    shared: Weak<PipelineShared>,
}

impl CodecCallback for PipelineCallback {
    fn on_input_buffer_available(&self, index: usize) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_input_available(index);
        }
    }

    fn on_output_buffer_available(&self, index: usize, info: BufferInfo) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_output_available(index, info);
        }
    }

    fn on_error(&self, error: CodecError) {
        if let Some(shared) = self.shared.upgrade() {
            error!("display {}: codec failure: {error}", shared.display_id);
            shared.record_fault(PipelineError::Codec(error));
        }
    }
}

// ── Decoder worker ───────────────────────────────────────────────────────────

fn decode_loop(shared: Arc<PipelineShared>, pending: Receiver<DisplayFrameMessage>, cancel: Receiver<()>) {
    let mut continuity = ContinuityTracker::new();
    loop {
        let index = select! {
            recv(shared.free_inputs_rx) -> index => match index {
                Ok(index) => index,
                Err(_) => break,
            },
            recv(cancel) -> _ => break,
        };
        let frame = select! {
            recv(pending) -> frame => match frame {
                Ok(frame) => frame,
                Err(_) => break,
            },
            recv(cancel) -> _ => break,
        };

        match continuity.observe(frame.frame_index) {
            FrameContinuity::InOrder => {}
            FrameContinuity::Restarted => {
                info!("display {}: encoder stream restarted", shared.display_id);
            }
            FrameContinuity::Discontinuity { expected, received } => {
                error!(
                    "display {}: expected frame {expected}, received {received}",
                    shared.display_id
                );
                shared.record_fault(PipelineError::FrameDiscontinuity { expected, received });
            }
        }

        match shared.queue_frame(index, &frame) {
            Ok(()) => trace!("display {}: decoding frame {}", shared.display_id, frame.frame_index),
            Err(PipelineError::Stopped) => break,
            Err(e) => {
                error!("display {}: cannot queue frame {}: {e}", shared.display_id, frame.frame_index);
                shared.record_fault(e);
            }
        }
    }
    debug!("display {}: decoder worker exiting", shared.display_id);
}

// ── VideoManager ─────────────────────────────────────────────────────────────

struct DecoderRun {
    consumer: ConsumerId,
    pending_tx: Sender<DisplayFrameMessage>,
    pending_rx: Receiver<DisplayFrameMessage>,
    worker: JoinHandle<()>,
}

struct PipelineRun {
    shared: Arc<PipelineShared>,
    /// Dropped to cancel; nothing is ever sent on it.
    cancel_tx: Sender<()>,
    cancel_rx: Receiver<()>,
    decoder: Option<DecoderRun>,
}

/// Streaming pipeline for one display.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use vdm_link::application::video::VideoManager;
/// use vdm_link::infrastructure::codec::{passthrough::PassthroughCodecFactory, VideoFormat};
/// use vdm_link::infrastructure::remote_io::RemoteIo;
///
/// let pipeline = VideoManager::encoder(1, RemoteIo::new(), Arc::new(PassthroughCodecFactory::new()));
/// pipeline.start(&VideoFormat::encoder(640, 480, 60)).unwrap();
/// assert!(pipeline.is_running());
/// pipeline.stop();
/// assert!(!pipeline.is_running());
/// ```
pub struct VideoManager {
    display_id: DisplayId,
    role: CodecRole,
    remote_io: RemoteIo,
    factory: Arc<dyn CodecFactory>,
    run: Mutex<Option<PipelineRun>>,
    fault: Arc<Mutex<Option<PipelineError>>>,
    recorder: Option<Arc<StreamRecorder>>,
}

impl VideoManager {
    /// Pipeline that encodes the content of `display_id` and sends frames.
    pub fn encoder(display_id: DisplayId, remote_io: RemoteIo, factory: Arc<dyn CodecFactory>) -> Self {
        Self::new(display_id, CodecRole::Encoder, remote_io, factory)
    }

    /// Pipeline that decodes frames received for `display_id`.
    pub fn decoder(display_id: DisplayId, remote_io: RemoteIo, factory: Arc<dyn CodecFactory>) -> Self {
        Self::new(display_id, CodecRole::Decoder, remote_io, factory)
    }

    fn new(display_id: DisplayId, role: CodecRole, remote_io: RemoteIo, factory: Arc<dyn CodecFactory>) -> Self {
        Self {
            display_id,
            role,
            remote_io,
            factory,
            run: Mutex::new(None),
            fault: Arc::new(Mutex::new(None)),
            recorder: None,
        }
    }

    /// Records the bitstream of every run of this pipeline with `recorder`.
    pub fn with_recorder(mut self, recorder: StreamRecorder) -> Self {
        info!(
            "display {}: recording {:?} stream to {}",
            self.display_id,
            self.role,
            recorder.path().display()
        );
        self.recorder = Some(Arc::new(recorder));
        self
    }

    pub fn display_id(&self) -> DisplayId {
        self.display_id
    }

    pub fn role(&self) -> CodecRole {
        self.role
    }

    pub fn is_running(&self) -> bool {
        lock_unpoisoned(&self.run).is_some()
    }

    /// The last fault recorded since the pipeline was (re)started.
    ///
    /// Faults never stop the pipeline; this is the only place they surface
    /// besides the log.
    pub fn fault(&self) -> Option<PipelineError> {
        lock_unpoisoned(&self.fault).clone()
    }

    /// Number of frames the current encoder run has emitted.
    pub fn frames_emitted(&self) -> u64 {
        lock_unpoisoned(&self.run)
            .as_ref()
            .map_or(0, |run| run.shared.frames.emitted())
    }

    /// Creates, configures and starts a codec.  Does nothing if the pipeline
    /// is already running.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Codec`] when the codec cannot be created, configured
    /// or started; the pipeline stays stopped.
    pub fn start(&self, format: &VideoFormat) -> Result<(), PipelineError> {
        let mut run_slot = lock_unpoisoned(&self.run);
        if run_slot.is_some() {
            debug!("display {}: pipeline already running", self.display_id);
            return Ok(());
        }
        *lock_unpoisoned(&self.fault) = None;

        let codec = self.factory.create(self.role, &format.mime_type)?;
        let (free_inputs_tx, free_inputs_rx) = channel::bounded(QUEUE_CAPACITY);
        let shared = Arc::new(PipelineShared {
            display_id: self.display_id,
            role: self.role,
            remote_io: self.remote_io.clone(),
            codec: Mutex::new(None),
            free_inputs_tx,
            free_inputs_rx,
            frames: FrameCounter::new(),
            fault: Arc::clone(&self.fault),
            recorder: self.recorder.clone(),
        });
        let callback = Arc::new(PipelineCallback {
            shared: Arc::downgrade(&shared),
        });

        // The codec goes into the slot before it starts so that callbacks
        // fired by `start` wait for the lock instead of seeing `None`.
        {
            let mut guard = lock_unpoisoned(&shared.codec);
            let codec = guard.insert(codec);
            let started = codec.configure(format, callback).and_then(|()| codec.start());
            if let Err(e) = started {
                if let Some(mut codec) = guard.take() {
                    codec.release();
                }
                error!("display {}: cannot start {:?}: {e}", self.display_id, self.role);
                return Err(e.into());
            }
        }

        let (cancel_tx, cancel_rx) = channel::bounded::<()>(0);
        let decoder = match self.role {
            CodecRole::Encoder => None,
            CodecRole::Decoder => match self.start_decoding(&shared, &cancel_rx) {
                Ok(decoder) => Some(decoder),
                Err(e) => {
                    if let Some(mut codec) = lock_unpoisoned(&shared.codec).take() {
                        codec.release();
                    }
                    return Err(e);
                }
            },
        };

        info!(
            "display {}: {:?} started at {}x{}",
            self.display_id, self.role, format.width, format.height
        );
        *run_slot = Some(PipelineRun {
            shared,
            cancel_tx,
            cancel_rx,
            decoder,
        });
        Ok(())
    }

    fn start_decoding(
        &self,
        shared: &Arc<PipelineShared>,
        cancel_rx: &Receiver<()>,
    ) -> Result<DecoderRun, PipelineError> {
        let (pending_tx, pending_rx) = channel::bounded::<DisplayFrameMessage>(QUEUE_CAPACITY);

        let worker = {
            let shared = Arc::clone(shared);
            let pending = pending_rx.clone();
            let cancel = cancel_rx.clone();
            thread::Builder::new()
                .name(format!("vdm-decoder-{}", self.display_id))
                .spawn(move || decode_loop(shared, pending, cancel))
                .map_err(|e| CodecError::Backend(format!("cannot spawn decoder worker: {e}")))?
        };

        let display_id = self.display_id;
        let queue = pending_tx.clone();
        let cancel = cancel_rx.clone();
        let consumer = self.remote_io.add_message_consumer(move |msg| {
            if let RemoteMessage::DisplayFrame(frame) = msg {
                if frame.display_id == display_id {
                    let _ = push_pending(&queue, &cancel, frame.clone());
                }
            }
        });

        Ok(DecoderRun {
            consumer,
            pending_tx,
            pending_rx,
            worker,
        })
    }

    /// Queues a received frame for decoding, blocking while the pending queue
    /// is full.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Stopped`] if this is not a running decoder, or if it
    /// was stopped while the caller was blocked.
    pub fn enqueue_frame(&self, frame: DisplayFrameMessage) -> Result<(), PipelineError> {
        let (queue, cancel) = {
            let run = lock_unpoisoned(&self.run);
            let decoder_run = run.as_ref().and_then(|run| {
                run.decoder
                    .as_ref()
                    .map(|decoder| (decoder.pending_tx.clone(), run.cancel_rx.clone()))
            });
            decoder_run.ok_or(PipelineError::Stopped)?
        };
        push_pending(&queue, &cancel, frame)
    }

    /// Feeds raw display content into the encoder, waiting for a free input
    /// buffer.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Stopped`] if this is not a running encoder or it was
    /// stopped while waiting; [`PipelineError::Codec`] if the codec rejects
    /// the buffer.
    pub fn submit_frame(&self, data: &[u8], presentation_time_us: i64, flags: u32) -> Result<(), PipelineError> {
        if self.role != CodecRole::Encoder {
            return Err(PipelineError::Stopped);
        }
        let (shared, cancel) = {
            let run = lock_unpoisoned(&self.run);
            let run = run.as_ref().ok_or(PipelineError::Stopped)?;
            (Arc::clone(&run.shared), run.cancel_rx.clone())
        };
        let index = select! {
            recv(shared.free_inputs_rx) -> index => index.map_err(|_| PipelineError::Stopped)?,
            recv(cancel) -> _ => return Err(PipelineError::Stopped),
        };

        let mut guard = lock_unpoisoned(&shared.codec);
        let codec = guard.as_mut().ok_or(PipelineError::Stopped)?;
        let buffer = codec.input_buffer(index).ok_or(CodecError::InvalidBuffer(index))?;
        buffer.clear();
        buffer.extend_from_slice(data);
        codec.queue_input_buffer(index, data.len(), presentation_time_us, flags)?;
        Ok(())
    }

    /// Tears the pipeline down.  Idempotent; safe to call while codec
    /// callbacks are running, and from inside one (a failed frame send can
    /// close the session on the codec's callback thread).
    pub fn stop(&self) {
        let Some(run) = lock_unpoisoned(&self.run).take() else {
            return;
        };
        let PipelineRun {
            shared,
            cancel_tx,
            cancel_rx,
            decoder,
        } = run;

        if let Some(decoder) = &decoder {
            self.remote_io.remove_message_consumer(decoder.consumer);
        }
        drop(cancel_tx);
        drop(cancel_rx);

        if let Some(decoder) = decoder {
            if decoder.worker.thread().id() == thread::current().id() {
                debug!("display {}: stopped from the decoder worker", self.display_id);
            } else if decoder.worker.join().is_err() {
                error!("display {}: decoder worker panicked", self.display_id);
            }
            drop(decoder.pending_tx);
            let drained = decoder.pending_rx.try_iter().count();
            if drained > 0 {
                debug!("display {}: discarded {drained} pending frames", self.display_id);
            }
        }

        let codec = lock_unpoisoned(&shared.codec).take();
        if let Some(mut codec) = codec {
            if self.role == CodecRole::Encoder {
                if let Err(e) = codec.signal_end_of_input_stream() {
                    debug!("display {}: end of stream not signalled: {e}", self.display_id);
                }
            }
            if let Err(e) = codec.flush() {
                warn!("display {}: codec flush failed: {e}", self.display_id);
            }
            if let Err(e) = codec.stop() {
                warn!("display {}: codec stop failed: {e}", self.display_id);
            }
            codec.release();
        }
        if let Some(recorder) = &self.recorder {
            recorder.flush();
        }
        info!("display {}: {:?} stopped", self.display_id, self.role);
    }

    /// Tears down and recreates codec and queues with `format`.  Frames queued
    /// before the reset are discarded.
    pub fn reset(&self, format: &VideoFormat) -> Result<(), PipelineError> {
        self.stop();
        self.start(format)
    }
}

impl Drop for VideoManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Blocks until `frame` fits in the pending queue or the run is cancelled.
fn push_pending(
    queue: &Sender<DisplayFrameMessage>,
    cancel: &Receiver<()>,
    frame: DisplayFrameMessage,
) -> Result<(), PipelineError> {
    select! {
        send(queue, frame) -> sent => sent.map_err(|_| PipelineError::Stopped),
        recv(cancel) -> _ => Err(PipelineError::Stopped),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::codec::mock::MockCodecFactory;
    use crate::infrastructure::codec::passthrough::PassthroughCodecFactory;
    use std::io::{Cursor, ErrorKind, Write};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use vdm_core::protocol::{decode_message, encode_message};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn messages(&self) -> Vec<RemoteMessage> {
            let bytes = self.0.lock().unwrap().clone();
            let mut offset = 0;
            let mut out = Vec::new();
            while offset < bytes.len() {
                let (msg, used) = decode_message(&bytes[offset..]).unwrap();
                out.push(msg);
                offset += used;
            }
            out
        }
    }

    /// Output whose peer has gone away.
    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(ErrorKind::BrokenPipe, "peer closed"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn frame(display_id: DisplayId, frame_index: u64) -> DisplayFrameMessage {
        DisplayFrameMessage {
            display_id,
            frame_index,
            presentation_time_us: frame_index as i64 * 16_666,
            flags: 0,
            data: frame_index.to_be_bytes().to_vec(),
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not met in time");
    }

    fn noop_closed() -> crate::infrastructure::remote_io::ClosedCallback {
        Arc::new(|| {})
    }

    #[test]
    fn test_encoder_output_is_published_with_incrementing_index() {
        // Arrange
        let io = RemoteIo::new();
        let out = SharedBuffer::default();
        io.attach_output_stream(out.clone(), noop_closed());
        let factory = MockCodecFactory::new();
        let pipeline = VideoManager::encoder(7, io, Arc::new(factory.clone()));
        pipeline.start(&VideoFormat::encoder(640, 480, 60)).unwrap();
        let codec = factory.last().unwrap();

        // Act
        codec.emit_output(0, b"key", 0, frame_flags::KEY_FRAME);
        codec.emit_output(1, b"delta", 16_666, 0);

        // Assert
        let frames: Vec<_> = out
            .messages()
            .into_iter()
            .map(|m| match m {
                RemoteMessage::DisplayFrame(f) => f,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].display_id, 7);
        assert_eq!(frames[0].frame_index, 0);
        assert_eq!(frames[0].data, b"key");
        assert_eq!(frames[0].flags, frame_flags::KEY_FRAME);
        assert_eq!(frames[1].frame_index, 1);
        assert_eq!(frames[1].presentation_time_us, 16_666);
        assert_eq!(codec.released_outputs(), vec![(0, false), (1, false)]);
        assert_eq!(pipeline.frames_emitted(), 2);
    }

    #[test]
    fn test_recorder_keeps_encoded_stream_across_reset() {
        // Arrange
        let path = std::env::temp_dir().join(format!("vdm-record-{}.h264", uuid::Uuid::new_v4()));
        let factory = MockCodecFactory::new();
        let pipeline = VideoManager::encoder(2, RemoteIo::new(), Arc::new(factory.clone()))
            .with_recorder(StreamRecorder::create(&path).unwrap());
        pipeline.start(&VideoFormat::encoder(640, 480, 60)).unwrap();

        // Act
        factory.last().unwrap().emit_output(0, b"first", 0, frame_flags::KEY_FRAME);
        pipeline.reset(&VideoFormat::encoder(320, 240, 60)).unwrap();
        factory.last().unwrap().emit_output(0, b"second", 0, 0);
        pipeline.stop();

        // Assert
        assert_eq!(std::fs::read(&path).unwrap(), b"firstsecond");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_free_input_overflow_records_resource_exhaustion() {
        // Arrange
        let factory = MockCodecFactory::new();
        let pipeline = VideoManager::encoder(1, RemoteIo::new(), Arc::new(factory.clone()));
        pipeline.start(&VideoFormat::encoder(640, 480, 60)).unwrap();
        let codec = factory.last().unwrap();

        // Act
        for index in 0..=QUEUE_CAPACITY {
            codec.offer_input_buffer(index);
        }

        // Assert
        assert_eq!(
            pipeline.fault(),
            Some(PipelineError::ResourceExhausted {
                queue: "free input",
                capacity: QUEUE_CAPACITY
            })
        );
    }

    #[test]
    fn test_submit_frame_fills_offered_input_buffer() {
        // Arrange
        let factory = MockCodecFactory::new();
        let pipeline = VideoManager::encoder(1, RemoteIo::new(), Arc::new(factory.clone()));
        pipeline.start(&VideoFormat::encoder(640, 480, 60)).unwrap();
        let codec = factory.last().unwrap();
        codec.offer_input_buffer(3);

        // Act
        pipeline.submit_frame(b"pixels", 99, 0).unwrap();

        // Assert
        let queued = codec.queued_inputs();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].index, 3);
        assert_eq!(queued[0].data, b"pixels");
        assert_eq!(queued[0].presentation_time_us, 99);
    }

    #[test]
    fn test_decoder_applies_frames_in_arrival_order() {
        // Arrange
        let io = RemoteIo::new();
        let factory = MockCodecFactory::new();
        let pipeline = VideoManager::decoder(2, io.clone(), Arc::new(factory.clone()));
        pipeline.start(&VideoFormat::decoder(640, 480)).unwrap();
        let codec = factory.last().unwrap();
        const N: u64 = 20;
        let mut stream = Vec::new();
        for i in 0..N {
            stream.extend(encode_message(&RemoteMessage::DisplayFrame(frame(2, i))).unwrap());
            // Frames for another display must be ignored.
            stream.extend(encode_message(&RemoteMessage::DisplayFrame(frame(9, 100 + i))).unwrap());
        }

        // Act
        io.attach_input_stream(Cursor::new(stream), noop_closed()).unwrap();
        for index in 0..N as usize {
            codec.offer_input_buffer(index % 4);
        }

        // Assert
        wait_for(|| codec.queued_inputs().len() == N as usize);
        let applied: Vec<u64> = codec
            .queued_inputs()
            .iter()
            .map(|q| u64::from_be_bytes(q.data.as_slice().try_into().unwrap()))
            .collect();
        assert_eq!(applied, (0..N).collect::<Vec<_>>());
        assert_eq!(pipeline.fault(), None);
    }

    #[test]
    fn test_full_pending_queue_blocks_until_a_frame_is_consumed() {
        // Arrange
        let factory = MockCodecFactory::new();
        let pipeline = Arc::new(VideoManager::decoder(1, RemoteIo::new(), Arc::new(factory.clone())));
        pipeline.start(&VideoFormat::decoder(640, 480)).unwrap();
        let codec = factory.last().unwrap();
        let enqueued = Arc::new(AtomicUsize::new(0));

        // Act
        let producer = {
            let pipeline = Arc::clone(&pipeline);
            let enqueued = Arc::clone(&enqueued);
            thread::spawn(move || {
                for i in 0..=QUEUE_CAPACITY as u64 {
                    pipeline.enqueue_frame(frame(1, i)).unwrap();
                    enqueued.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        // Assert
        wait_for(|| enqueued.load(Ordering::SeqCst) == QUEUE_CAPACITY);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(enqueued.load(Ordering::SeqCst), QUEUE_CAPACITY, "101st frame must block");
        assert!(codec.queued_inputs().is_empty());

        codec.offer_input_buffer(0);
        producer.join().unwrap();
        assert_eq!(enqueued.load(Ordering::SeqCst), QUEUE_CAPACITY + 1);
        wait_for(|| codec.queued_inputs().len() == 1);
        assert_eq!(codec.queued_inputs()[0].data, 0u64.to_be_bytes());
    }

    #[test]
    fn test_stop_unblocks_parked_producer() {
        // Arrange
        let factory = MockCodecFactory::new();
        let pipeline = Arc::new(VideoManager::decoder(1, RemoteIo::new(), Arc::new(factory.clone())));
        pipeline.start(&VideoFormat::decoder(640, 480)).unwrap();
        for i in 0..QUEUE_CAPACITY as u64 {
            pipeline.enqueue_frame(frame(1, i)).unwrap();
        }
        let parked = {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || pipeline.enqueue_frame(frame(1, 100)))
        };
        thread::sleep(Duration::from_millis(50));

        // Act
        pipeline.stop();

        // Assert
        assert_eq!(parked.join().unwrap(), Err(PipelineError::Stopped));
        assert_eq!(factory.last().unwrap().release_count(), 1);
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_discontinuity_is_recorded_but_frame_still_applied() {
        // Arrange
        let factory = MockCodecFactory::new();
        let pipeline = VideoManager::decoder(1, RemoteIo::new(), Arc::new(factory.clone()));
        pipeline.start(&VideoFormat::decoder(640, 480)).unwrap();
        let codec = factory.last().unwrap();
        for index in 0..3 {
            codec.offer_input_buffer(index);
        }

        // Act
        pipeline.enqueue_frame(frame(1, 0)).unwrap();
        pipeline.enqueue_frame(frame(1, 1)).unwrap();
        pipeline.enqueue_frame(frame(1, 5)).unwrap();

        // Assert
        wait_for(|| codec.queued_inputs().len() == 3);
        assert_eq!(
            pipeline.fault(),
            Some(PipelineError::FrameDiscontinuity {
                expected: 2,
                received: 5
            })
        );
    }

    #[test]
    fn test_stop_races_codec_callbacks_without_panicking() {
        // Arrange
        let factory = MockCodecFactory::new();
        let pipeline = VideoManager::encoder(1, RemoteIo::new(), Arc::new(factory.clone()));
        pipeline.start(&VideoFormat::encoder(640, 480, 60)).unwrap();
        let codec = factory.last().unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let hammer = {
            let codec = codec.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut i = 0usize;
                while !done.load(Ordering::SeqCst) {
                    codec.emit_output(i % 8, b"frame", 0, 0);
                    codec.offer_input_buffer(i % 8);
                    i += 1;
                }
            })
        };
        thread::sleep(Duration::from_millis(20));

        // Act
        pipeline.stop();
        pipeline.stop();
        done.store(true, Ordering::SeqCst);

        // Assert
        hammer.join().unwrap();
        assert_eq!(codec.release_count(), 1);
        assert!(codec.end_of_stream_signalled());
    }

    #[test]
    fn test_stop_on_codec_thread_after_failed_frame_send_completes() {
        // Arrange
        let io = RemoteIo::new();
        let pipeline = Arc::new(VideoManager::encoder(
            3,
            io.clone(),
            Arc::new(PassthroughCodecFactory::new()),
        ));
        pipeline.start(&VideoFormat::encoder(640, 480, 60)).unwrap();
        let stopped = Arc::new(AtomicBool::new(false));
        let on_closed = {
            let pipeline = Arc::downgrade(&pipeline);
            let stopped = Arc::clone(&stopped);
            Arc::new(move || {
                if let Some(pipeline) = pipeline.upgrade() {
                    pipeline.stop();
                    stopped.store(true, Ordering::SeqCst);
                }
            })
        };
        io.attach_output_stream(BrokenPipe, on_closed);

        // Act
        pipeline.submit_frame(b"frame", 0, 0).unwrap();

        // Assert
        wait_for(|| stopped.load(Ordering::SeqCst));
        assert!(!pipeline.is_running());
        assert!(!io.is_output_attached());
        assert_eq!(pipeline.submit_frame(b"late", 1, 0), Err(PipelineError::Stopped));
    }

    #[test]
    fn test_reset_recreates_codec_and_discards_pending_frames() {
        // Arrange
        let factory = MockCodecFactory::new();
        let pipeline = VideoManager::decoder(1, RemoteIo::new(), Arc::new(factory.clone()));
        pipeline.start(&VideoFormat::decoder(640, 480)).unwrap();
        pipeline.enqueue_frame(frame(1, 0)).unwrap();
        pipeline.enqueue_frame(frame(1, 1)).unwrap();

        // Act
        pipeline.reset(&VideoFormat::decoder(320, 240)).unwrap();
        let second = factory.last().unwrap();
        second.offer_input_buffer(0);
        pipeline.enqueue_frame(frame(1, 0)).unwrap();

        // Assert
        assert_eq!(factory.created_count(), 2);
        assert_eq!(factory.codecs()[0].release_count(), 1);
        assert!(factory.codecs()[0].queued_inputs().is_empty());
        assert_eq!(second.format().unwrap().width, 320);
        wait_for(|| second.queued_inputs().len() == 1);
    }

    #[test]
    fn test_start_failure_leaves_pipeline_stopped() {
        let factory = MockCodecFactory::new();
        factory.set_fail_create(true);
        let pipeline = VideoManager::encoder(1, RemoteIo::new(), Arc::new(factory));
        assert!(matches!(
            pipeline.start(&VideoFormat::encoder(640, 480, 60)),
            Err(PipelineError::Codec(CodecError::Unsupported(_)))
        ));
        assert!(!pipeline.is_running());
        assert_eq!(pipeline.submit_frame(b"x", 0, 0), Err(PipelineError::Stopped));
    }
}
