//! ClientDisplay: one remote display shown on this device.
//!
//! A client display is identified by a [`DisplayId`] chosen by the client.
//! It owns a decoder [`VideoManager`] that picks the `DisplayFrame`s for that
//! id off the shared [`RemoteIo`], and it is the only place that addresses
//! outgoing input to the display.
//!
//! # Lifecycle
//!
//! ```text
//! open ──▶ streaming ──pause──▶ paused ──resume──▶ streaming
//!              │                   │
//!              └──── close / release ────▶ closed
//! ```
//!
//! - `open` starts the decoder, then announces the viewport with
//!   `DisplayCapabilities` so no early frame is missed.
//! - `pause` stops the decoder and sends `StopStreaming{pause: true}`; the
//!   host keeps the display but stops encoding.  `resume` restarts the
//!   decoder and announces the viewport again, which makes the host reset and
//!   resume its encoder.
//! - `close` is the local user's choice and tells the host
//!   (`StopStreaming{pause: false}`).  `release` is used when the host closed
//!   the display or the connection is gone, and sends nothing.
//!
//! Messages are always sent after the state lock is released: a failed send
//! may tear the session down synchronously, which releases this display.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info, warn};
use vdm_core::protocol::{
    DisplayCapabilitiesMessage, HomeEventMessage, InputDeviceType, InputEventKind, InputEventMessage,
    RemoteMessage, StopStreamingMessage,
};
use vdm_core::{DisplayGeometry, DisplayId};
use vdm_link::infrastructure::codec::{CodecFactory, VideoFormat};
use vdm_link::sync::lock_unpoisoned;
use vdm_link::{PipelineError, RemoteIo, VideoManager};

/// Errors of client display sessions.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("viewport {width}x{height} is too small for a display")]
    InvalidViewport { width: u32, height: u32 },

    #[error("decoder pipeline: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("display {0} is closed")]
    Closed(DisplayId),

    #[error("no display with id {0}")]
    UnknownDisplay(DisplayId),
}

/// The area a remote display is shown in, as announced to the host.
///
/// The host rounds width and height down to its encoder alignment; the
/// decoder is configured with the same rounded size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    pub density_dpi: u32,
}

impl Viewport {
    fn geometry(&self) -> DisplayGeometry {
        DisplayGeometry::from_viewport(self.width, self.height, self.density_dpi)
    }

    fn decoder_format(&self) -> Result<VideoFormat, ClientError> {
        let geometry = self.geometry();
        if geometry.is_empty() {
            return Err(ClientError::InvalidViewport {
                width: self.width,
                height: self.height,
            });
        }
        Ok(VideoFormat::decoder(geometry.width, geometry.height))
    }
}

struct ViewState {
    viewport: Viewport,
    rotation_degrees: i32,
    title: Option<String>,
    focused: bool,
    paused: bool,
    closed: bool,
}

/// One remote display shown on the client.
pub struct ClientDisplay {
    display_id: DisplayId,
    home_enabled: bool,
    remote_io: RemoteIo,
    pipeline: VideoManager,
    state: Mutex<ViewState>,
}

impl ClientDisplay {
    /// Starts decoding frames for `display_id` and announces `viewport` to
    /// the host.
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidViewport`] if the viewport rounds down to an
    /// empty display; [`ClientError::Pipeline`] if the decoder cannot start.
    /// Nothing is sent to the host in either case.
    pub fn open(
        display_id: DisplayId,
        home_enabled: bool,
        viewport: Viewport,
        remote_io: RemoteIo,
        codecs: Arc<dyn CodecFactory>,
    ) -> Result<Self, ClientError> {
        let format = viewport.decoder_format()?;
        let pipeline = VideoManager::decoder(display_id, remote_io.clone(), codecs);
        pipeline.start(&format)?;

        let display = Self {
            display_id,
            home_enabled,
            remote_io,
            pipeline,
            state: Mutex::new(ViewState {
                viewport,
                rotation_degrees: 0,
                title: None,
                focused: false,
                paused: false,
                closed: false,
            }),
        };
        info!(
            "Client display {display_id} opened at {}x{} ({} dpi)",
            viewport.width, viewport.height, viewport.density_dpi
        );
        display.send_capabilities(viewport);
        Ok(display)
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn display_id(&self) -> DisplayId {
        self.display_id
    }

    /// Whether the host said the display can show a home screen.
    pub fn home_enabled(&self) -> bool {
        self.home_enabled
    }

    pub fn viewport(&self) -> Viewport {
        lock_unpoisoned(&self.state).viewport
    }

    /// Degrees the view should be rotated by, as last reported by the host.
    pub fn rotation_degrees(&self) -> i32 {
        lock_unpoisoned(&self.state).rotation_degrees
    }

    pub fn title(&self) -> Option<String> {
        lock_unpoisoned(&self.state).title.clone()
    }

    pub fn is_focused(&self) -> bool {
        lock_unpoisoned(&self.state).focused
    }

    pub fn is_paused(&self) -> bool {
        lock_unpoisoned(&self.state).paused
    }

    pub fn is_closed(&self) -> bool {
        lock_unpoisoned(&self.state).closed
    }

    /// Whether the decoder is running.
    pub fn is_streaming(&self) -> bool {
        self.pipeline.is_running()
    }

    /// Last fault the decoder recorded since it was (re)started, e.g. a
    /// frame discontinuity.  The display keeps streaming after a fault.
    pub fn fault(&self) -> Option<PipelineError> {
        self.pipeline.fault()
    }

    // ── Outgoing events ───────────────────────────────────────────────────────

    /// Sends one input event to the host for this display.
    pub fn send_input(&self, device_type: InputDeviceType, event: InputEventKind) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.remote_io.send(&RemoteMessage::InputEvent(InputEventMessage {
            display_id: self.display_id,
            device_type,
            timestamp_ms: now_ms(),
            event,
        }));
        Ok(())
    }

    pub fn send_home(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.remote_io.send(&RemoteMessage::HomeEvent(HomeEventMessage {
            display_id: self.display_id,
        }));
        Ok(())
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Stops decoding and asks the host to stop encoding.  No-op when already
    /// paused or closed.
    pub fn pause(&self) {
        {
            let mut state = lock_unpoisoned(&self.state);
            if state.closed || state.paused {
                return;
            }
            state.paused = true;
        }
        self.pipeline.stop();
        debug!("Client display {} paused", self.display_id);
        self.remote_io.send(&RemoteMessage::StopStreaming(StopStreamingMessage {
            display_id: self.display_id,
            pause: true,
        }));
    }

    /// Restarts a paused display.
    pub fn resume(&self) -> Result<(), ClientError> {
        let viewport = {
            let state = lock_unpoisoned(&self.state);
            if state.closed {
                return Err(ClientError::Closed(self.display_id));
            }
            if !state.paused {
                return Ok(());
            }
            state.viewport
        };
        self.pipeline.start(&viewport.decoder_format()?)?;
        lock_unpoisoned(&self.state).paused = false;
        debug!("Client display {} resumed", self.display_id);
        self.send_capabilities(viewport);
        Ok(())
    }

    /// Changes the viewport: the decoder restarts with the new size and the
    /// host is asked to resize the display.
    pub fn resize(&self, viewport: Viewport) -> Result<(), ClientError> {
        self.ensure_open()?;
        let format = viewport.decoder_format()?;
        self.pipeline.reset(&format)?;
        {
            let mut state = lock_unpoisoned(&self.state);
            state.viewport = viewport;
            state.paused = false;
        }
        info!(
            "Client display {} resized to {}x{}",
            self.display_id, viewport.width, viewport.height
        );
        self.send_capabilities(viewport);
        Ok(())
    }

    /// Records a rotation reported by the host.
    pub fn apply_rotation(&self, rotation_degrees: i32) {
        lock_unpoisoned(&self.state).rotation_degrees = rotation_degrees;
        debug!("Client display {} rotated by {rotation_degrees}°", self.display_id);
    }

    /// Records what the host says the display shows.
    pub fn apply_display_change(&self, title: &str, focused: bool) {
        let mut state = lock_unpoisoned(&self.state);
        state.title = Some(title.to_string());
        state.focused = focused;
    }

    /// Closes the display and tells the host.  Idempotent.
    pub fn close(&self) {
        if self.release() {
            self.remote_io.send(&RemoteMessage::StopStreaming(StopStreamingMessage {
                display_id: self.display_id,
                pause: false,
            }));
        }
    }

    /// Stops the decoder without telling the host.  Returns `false` if the
    /// display was already closed.
    pub fn release(&self) -> bool {
        {
            let mut state = lock_unpoisoned(&self.state);
            if state.closed {
                return false;
            }
            state.closed = true;
        }
        self.pipeline.stop();
        info!("Client display {} closed", self.display_id);
        true
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed(self.display_id));
        }
        Ok(())
    }

    fn send_capabilities(&self, viewport: Viewport) {
        self.remote_io.send(&RemoteMessage::DisplayCapabilities(DisplayCapabilitiesMessage {
            display_id: self.display_id,
            viewport_width: viewport.width,
            viewport_height: viewport.height,
            density_dpi: viewport.density_dpi,
        }));
    }
}

impl Drop for ClientDisplay {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!("Client display {} dropped while open", self.display_id);
            self.close();
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
