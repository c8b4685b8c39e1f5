//! One host-side display session: a virtual display streamed to the client.
//!
//! A [`RemoteDisplay`] exists for every display id the client announced with
//! `DisplayCapabilities`.  It owns:
//!
//! - the platform virtual display, sized to the client's viewport rounded
//!   down to multiples of ten,
//! - an **encoder** [`VideoManager`] that turns the display's content into
//!   `DisplayFrame` messages,
//! - the virtual input devices that replay the client's input on that display.
//!
//! # Input devices (for beginners)
//!
//! The dpad exists from the start because the client's navigation keys are
//! always routed there.  Keyboard, mouse, touchscreen and navigation touchpad
//! are created the first time an event for them arrives; a client that never
//! touches the screen never gets a touchscreen.  `close()` releases exactly
//! the devices that were created, each once.
//!
//! # Rotation
//!
//! When the platform reports a display change, the current rotation is
//! compared with the last rotation sent to the client.  Only a difference
//! produces a `DisplayRotation` message, carrying the degrees the client must
//! rotate its view by.
//!
//! # Empty displays
//!
//! When the platform reports that nothing is left on the display, the
//! session hands its remote id to the installed [`EmptyHandler`] so the owner
//! can forget and close it.  A session without a handler closes itself.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};
use vdm_core::protocol::{
    actions, DisplayChangeMessage, DisplayRotationMessage, InputDeviceType, InputEventKind,
    InputEventMessage, RemoteMessage, StopStreamingMessage, TouchEvent,
};
use vdm_core::{DisplayGeometry, DisplayId, DisplayType, Rotation, RotationTracker};
use vdm_link::infrastructure::codec::{CodecFactory, VideoFormat};
use vdm_link::infrastructure::remote_io::ConsumerId;
use vdm_link::sync::lock_unpoisoned;
use vdm_link::{PipelineError, RemoteIo, StreamRecorder, VideoManager};

use crate::infrastructure::virtual_device::{
    DeviceError, DisplayListener, InputSink, ToolType, TouchAction, TouchSample, VirtualDevice,
    VirtualDisplay,
};

/// Any large enough surface works for a navigation touchpad; it is not tied
/// to the display size.
const NAVIGATION_TOUCHPAD_SIZE: u32 = 5000;

/// Errors raised while creating or resetting a display session.
#[derive(Debug, Error)]
pub enum DisplayError {
    /// The viewport rounds down to an empty display.
    #[error("viewport {width}x{height} is too small for a virtual display")]
    InvalidGeometry { width: u32, height: u32 },

    #[error("virtual device error: {0}")]
    Device(#[from] DeviceError),

    #[error("streaming pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// No session exists for this remote display id.
    #[error("no display session for remote display {0}")]
    UnknownDisplay(DisplayId),

    /// The session was already closed.
    #[error("display session closed")]
    Closed,
}

/// Called with the remote id of a display that ran out of content.
pub type EmptyHandler = Arc<dyn Fn(DisplayId) + Send + Sync>;

/// Per-display settings taken from the host configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplaySettings {
    pub frame_rate: u32,
    /// Report rotation changes to the client.
    pub rotation_enabled: bool,
    /// Directory the encoded stream of every display is recorded to.
    pub record_dir: Option<PathBuf>,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            frame_rate: 60,
            rotation_enabled: true,
            record_dir: None,
        }
    }
}

struct DisplayState {
    display: Box<dyn VirtualDisplay>,
    geometry: DisplayGeometry,
    sinks: HashMap<InputDeviceType, Box<dyn InputSink>>,
}

/// Host-side session of one remote display.
pub struct RemoteDisplay {
    remote_id: DisplayId,
    host_display_id: DisplayId,
    display_type: DisplayType,
    settings: DisplaySettings,
    device: Arc<dyn VirtualDevice>,
    remote_io: RemoteIo,
    pipeline: VideoManager,
    state: Mutex<DisplayState>,
    rotation: Mutex<RotationTracker>,
    consumer: Mutex<Option<ConsumerId>>,
    empty_handler: Mutex<Option<EmptyHandler>>,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl RemoteDisplay {
    /// Creates the virtual display, its dpad and a running encoder, then
    /// starts listening for input addressed to `remote_id`.
    ///
    /// # Errors
    ///
    /// - [`DisplayError::InvalidGeometry`] if the rounded viewport is empty.
    /// - [`DisplayError::Device`] if the display or the dpad cannot be created.
    /// - [`DisplayError::Pipeline`] if the encoder does not start.
    ///
    /// Whatever was created before the failure is released again.
    pub fn create(
        remote_id: DisplayId,
        geometry: DisplayGeometry,
        display_type: DisplayType,
        device: Arc<dyn VirtualDevice>,
        codecs: Arc<dyn CodecFactory>,
        remote_io: RemoteIo,
        settings: DisplaySettings,
    ) -> Result<Arc<Self>, DisplayError> {
        if geometry.is_empty() {
            return Err(DisplayError::InvalidGeometry {
                width: geometry.width,
                height: geometry.height,
            });
        }

        let mut display =
            device.create_virtual_display(&format!("vdm-display-{remote_id}"), geometry, display_type)?;
        let host_display_id = display.display_id();

        let dpad = match device.create_input_sink(
            InputDeviceType::Dpad,
            host_display_id,
            &sink_name(InputDeviceType::Dpad, remote_id),
            geometry,
        ) {
            Ok(dpad) => dpad,
            Err(e) => {
                display.release();
                return Err(e.into());
            }
        };

        let mut pipeline = VideoManager::encoder(remote_id, remote_io.clone(), codecs);
        if let Some(dir) = &settings.record_dir {
            let path = dir.join(format!("vdm_encoder_output_{remote_id}.h264"));
            match StreamRecorder::create(&path) {
                Ok(recorder) => pipeline = pipeline.with_recorder(recorder),
                Err(e) => warn!("Remote display {remote_id}: cannot record to {}: {e}", path.display()),
            }
        }
        if let Err(e) = pipeline.start(&encoder_format(geometry, &settings)) {
            let mut dpad = dpad;
            dpad.close();
            display.release();
            return Err(e.into());
        }

        let initial_rotation = display.rotation();
        let session = Arc::new(Self {
            remote_id,
            host_display_id,
            display_type,
            settings,
            device,
            remote_io: remote_io.clone(),
            pipeline,
            state: Mutex::new(DisplayState {
                display,
                geometry,
                sinks: HashMap::from([(InputDeviceType::Dpad, dpad)]),
            }),
            rotation: Mutex::new(RotationTracker::with_initial(Rotation::Rotation0)),
            consumer: Mutex::new(None),
            empty_handler: Mutex::new(None),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let listener: Arc<dyn DisplayListener> = Arc::new(DisplayEvents {
            session: Arc::downgrade(&session),
        });
        lock_unpoisoned(&session.state).display.set_listener(Some(listener));

        let weak = Arc::downgrade(&session);
        let consumer = remote_io.add_message_consumer(move |msg| route_message(&weak, remote_id, msg));
        *lock_unpoisoned(&session.consumer) = Some(consumer);

        info!(
            "Remote display {remote_id} -> host display {host_display_id}: {}x{} @{}dpi ({display_type:?})",
            geometry.width, geometry.height, geometry.density_dpi
        );
        if initial_rotation != Rotation::Rotation0 {
            session.report_rotation();
        }
        Ok(session)
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn remote_id(&self) -> DisplayId {
        self.remote_id
    }

    /// Id of the virtual display on the host.
    pub fn host_display_id(&self) -> DisplayId {
        self.host_display_id
    }

    pub fn display_type(&self) -> DisplayType {
        self.display_type
    }

    pub fn geometry(&self) -> DisplayGeometry {
        lock_unpoisoned(&self.state).geometry
    }

    pub fn is_streaming(&self) -> bool {
        self.pipeline.is_running()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Input device kinds created so far, including the dpad.
    pub fn input_devices(&self) -> Vec<InputDeviceType> {
        lock_unpoisoned(&self.state).sinks.keys().copied().collect()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Applies new client capabilities: resizes the display, drops the
    /// touchscreen (it is recreated at the new size on the next touch) and
    /// restarts the encoder.  Also resumes a paused session.
    pub fn reset(&self, geometry: DisplayGeometry) -> Result<(), DisplayError> {
        if self.is_closed() {
            return Err(DisplayError::Closed);
        }
        if geometry.is_empty() {
            return Err(DisplayError::InvalidGeometry {
                width: geometry.width,
                height: geometry.height,
            });
        }
        {
            let mut state = lock_unpoisoned(&self.state);
            state.display.resize(geometry)?;
            state.geometry = geometry;
            if let Some(mut touchscreen) = state.sinks.remove(&InputDeviceType::Touchscreen) {
                touchscreen.close();
            }
        }
        self.pipeline.reset(&encoder_format(geometry, &self.settings))?;
        self.paused.store(false, Ordering::SeqCst);
        info!(
            "Remote display {} reset to {}x{} @{}dpi",
            self.remote_id, geometry.width, geometry.height, geometry.density_dpi
        );
        Ok(())
    }

    /// Stops streaming but keeps the display and its input devices.
    pub fn pause(&self) {
        if self.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Remote display {} paused", self.remote_id);
        self.pipeline.stop();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Tells the client what the display currently shows.
    pub fn send_display_change(&self, title: &str, focused: bool) {
        if self.is_closed() {
            return;
        }
        self.remote_io.send(&RemoteMessage::DisplayChange(DisplayChangeMessage {
            display_id: self.remote_id,
            title: title.to_string(),
            focused,
        }));
    }

    /// Installs what happens when the display reports it is empty.
    pub fn set_empty_handler(&self, handler: EmptyHandler) {
        *lock_unpoisoned(&self.empty_handler) = Some(handler);
    }

    /// Tears the session down and tells the client the display is gone.
    ///
    /// Idempotent: the second and later calls do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.remote_io.send(&RemoteMessage::StopStreaming(StopStreamingMessage {
            display_id: self.remote_id,
            pause: false,
        }));
        if let Some(consumer) = lock_unpoisoned(&self.consumer).take() {
            self.remote_io.remove_message_consumer(consumer);
        }
        lock_unpoisoned(&self.empty_handler).take();
        self.pipeline.stop();

        let mut state = lock_unpoisoned(&self.state);
        for (kind, mut sink) in state.sinks.drain() {
            trace!("Remote display {}: closing {kind:?}", self.remote_id);
            sink.close();
        }
        state.display.set_listener(None);
        state.display.release();
        info!("Remote display {} closed", self.remote_id);
    }

    // ── Display events ────────────────────────────────────────────────────────

    fn forward_frame(&self, data: &[u8], presentation_time_us: i64) {
        if self.is_closed() || self.is_paused() {
            trace!("Remote display {}: not streaming, frame skipped", self.remote_id);
            return;
        }
        match self.pipeline.submit_frame(data, presentation_time_us, 0) {
            Ok(()) => {}
            Err(PipelineError::Stopped) => trace!("Remote display {}: encoder stopped", self.remote_id),
            Err(e) => error!("Remote display {}: cannot encode frame: {e}", self.remote_id),
        }
    }

    fn report_rotation(&self) {
        if !self.settings.rotation_enabled || self.is_closed() {
            return;
        }
        let current = lock_unpoisoned(&self.state).display.rotation();
        let Some(rotation_degrees) = lock_unpoisoned(&self.rotation).update(current) else {
            return;
        };
        debug!("Remote display {}: rotation now {rotation_degrees} degrees", self.remote_id);
        self.remote_io.send(&RemoteMessage::DisplayRotation(DisplayRotationMessage {
            display_id: self.remote_id,
            rotation_degrees,
        }));
    }

    fn handle_empty(&self) {
        if self.is_closed() {
            return;
        }
        info!("Remote display {} is empty, removing", self.remote_id);
        let handler = lock_unpoisoned(&self.empty_handler).clone();
        match handler {
            Some(handler) => handler(self.remote_id),
            None => self.close(),
        }
    }

    // ── Remote input ──────────────────────────────────────────────────────────

    fn handle_home(&self) {
        let target = match self.display_type {
            DisplayType::Mirror => self.device.default_display_id(),
            DisplayType::App | DisplayType::Home => self.host_display_id,
        };
        if let Err(e) = self.device.launch_home(target) {
            warn!("Remote display {}: home not launched on {target}: {e}", self.remote_id);
        }
    }

    fn handle_input(&self, event: &InputEventMessage) {
        if self.is_closed() {
            return;
        }
        let mut state = lock_unpoisoned(&self.state);
        let result = self
            .sink(&mut state, event.device_type)
            .and_then(|sink| inject(sink, &event.event));
        if let Err(e) = result {
            warn!(
                "Remote display {}: {:?} event dropped: {e}",
                self.remote_id, event.device_type
            );
        }
    }

    /// Returns the sink for `kind`, creating it on first use.
    fn sink<'a>(
        &self,
        state: &'a mut DisplayState,
        kind: InputDeviceType,
    ) -> Result<&'a mut Box<dyn InputSink>, DeviceError> {
        let geometry = match kind {
            InputDeviceType::NavigationTouchpad => DisplayGeometry {
                width: NAVIGATION_TOUCHPAD_SIZE,
                height: NAVIGATION_TOUCHPAD_SIZE,
                density_dpi: state.geometry.density_dpi,
            },
            _ => state.geometry,
        };
        match state.sinks.entry(kind) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let sink = self.device.create_input_sink(
                    kind,
                    self.host_display_id,
                    &sink_name(kind, self.remote_id),
                    geometry,
                )?;
                debug!("Remote display {}: created {kind:?}", self.remote_id);
                Ok(entry.insert(sink))
            }
        }
    }
}

impl Drop for RemoteDisplay {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Message routing ───────────────────────────────────────────────────────────

fn route_message(session: &Weak<RemoteDisplay>, remote_id: DisplayId, msg: &RemoteMessage) {
    if msg.display_id() != Some(remote_id) {
        return;
    }
    let Some(session) = session.upgrade() else {
        return;
    };
    match msg {
        RemoteMessage::InputEvent(event) => session.handle_input(event),
        RemoteMessage::HomeEvent(_) => session.handle_home(),
        _ => {}
    }
}

/// Bridges platform display callbacks to the session without keeping it alive.
struct DisplayEvents {
    session: Weak<RemoteDisplay>,
}

impl DisplayListener for DisplayEvents {
    fn on_frame(&self, data: &[u8], presentation_time_us: i64) {
        if let Some(session) = self.session.upgrade() {
            session.forward_frame(data, presentation_time_us);
        }
    }

    fn on_display_changed(&self) {
        if let Some(session) = self.session.upgrade() {
            session.report_rotation();
        }
    }

    fn on_display_empty(&self) {
        if let Some(session) = self.session.upgrade() {
            session.handle_empty();
        }
    }
}

// ── Event translation ─────────────────────────────────────────────────────────

fn inject(sink: &mut Box<dyn InputSink>, event: &InputEventKind) -> Result<(), DeviceError> {
    match event {
        InputEventKind::Key(key) => sink.send_key(key.key_code, key.action),
        InputEventKind::Touch(touch) => match touch_sample(touch) {
            Some(sample) => sink.send_touch(&sample),
            None => Err(DeviceError::Injection(format!("unknown touch action {}", touch.action))),
        },
        InputEventKind::MouseButton(button) => {
            let pressed = matches!(button.action, actions::BUTTON_PRESS | actions::DOWN);
            sink.send_button(button.button_code, pressed)
        }
        InputEventKind::MouseScroll(scroll) => sink.send_scroll(scroll.x, scroll.y),
        InputEventKind::MouseRelative(position) => {
            // The client sends where the pointer should be; the device moves by deltas.
            let (dx, dy) = match sink.cursor_position() {
                Some((x, y)) => (position.x - x, position.y - y),
                None => (position.x, position.y),
            };
            sink.send_relative(dx, dy)
        }
    }
}

/// Converts a client touch event into a touchscreen sample.
///
/// Secondary pointers going down or up become plain down/up, a cancelled
/// gesture is marked as a palm, and pressure is scaled from `0..1` to `0..255`.
/// Returns `None` for actions a touchscreen does not understand.
pub(crate) fn touch_sample(event: &TouchEvent) -> Option<TouchSample> {
    let action = match event.action {
        actions::DOWN | actions::POINTER_DOWN => TouchAction::Down,
        actions::UP | actions::POINTER_UP => TouchAction::Up,
        actions::MOVE => TouchAction::Move,
        actions::CANCEL => TouchAction::Cancel,
        _ => return None,
    };
    let tool = if action == TouchAction::Cancel {
        ToolType::Palm
    } else {
        ToolType::Finger
    };
    Some(TouchSample {
        pointer_id: event.pointer_id,
        action,
        x: event.x,
        y: event.y,
        pressure: (event.pressure * 255.0).clamp(0.0, 255.0),
        tool,
    })
}

fn encoder_format(geometry: DisplayGeometry, settings: &DisplaySettings) -> VideoFormat {
    VideoFormat::encoder(geometry.width, geometry.height, settings.frame_rate)
}

fn sink_name(kind: InputDeviceType, remote_id: DisplayId) -> String {
    let kind = match kind {
        InputDeviceType::Keyboard => "keyboard",
        InputDeviceType::Mouse => "mouse",
        InputDeviceType::Touchscreen => "touchscreen",
        InputDeviceType::Dpad => "dpad",
        InputDeviceType::NavigationTouchpad => "navtouchpad",
    };
    format!("vdm-{kind}-{remote_id}")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::virtual_device::mock::{MockVirtualDevice, SinkEvent};
    use crate::infrastructure::virtual_device::MockInputSink;
    use std::io::Write;
    use vdm_core::protocol::{
        decode_message, HomeEventMessage, KeyEvent, MouseButtonEvent, MouseRelativeEvent,
        MouseScrollEvent,
    };
    use vdm_link::infrastructure::codec::mock::MockCodecFactory;

    // ── Helpers ───────────────────────────────────────────────────────────────

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
            let mut out = Vec::new();
            let mut offset = 0;
            while offset < bytes.len() {
                let (msg, used) = decode_message(&bytes[offset..]).expect("decode");
                out.push(msg);
                offset += used;
            }
            out
        }
    }

    struct Fixture {
        device: MockVirtualDevice,
        codecs: MockCodecFactory,
        io: RemoteIo,
        wire: SharedBuffer,
    }

    impl Fixture {
        fn new() -> Self {
            let io = RemoteIo::new();
            let wire = SharedBuffer::default();
            io.attach_output_stream(wire.clone(), Arc::new(|| {}));
            Self {
                device: MockVirtualDevice::new(),
                codecs: MockCodecFactory::new(),
                io,
                wire,
            }
        }

        fn create(&self, remote_id: DisplayId, display_type: DisplayType) -> Arc<RemoteDisplay> {
            RemoteDisplay::create(
                remote_id,
                DisplayGeometry::from_viewport(640, 480, 160),
                display_type,
                Arc::new(self.device.clone()),
                Arc::new(self.codecs.clone()),
                self.io.clone(),
                DisplaySettings::default(),
            )
            .expect("create display")
        }
    }

    fn input(display_id: DisplayId, device_type: InputDeviceType, event: InputEventKind) -> InputEventMessage {
        InputEventMessage {
            display_id,
            device_type,
            timestamp_ms: 0,
            event,
        }
    }

    fn touch(action: i32, pressure: f32) -> TouchEvent {
        TouchEvent {
            pointer_id: 1,
            action,
            x: 10.0,
            y: 20.0,
            pressure,
        }
    }

    // ── Creation ──────────────────────────────────────────────────────────────

    #[test]
    fn test_create_builds_display_dpad_and_running_encoder() {
        // Arrange
        let fx = Fixture::new();

        // Act
        let session = fx.create(3, DisplayType::App);

        // Assert
        let record = fx.device.display(session.host_display_id()).unwrap();
        assert_eq!((record.geometry.width, record.geometry.height), (640, 480));
        assert_eq!(session.input_devices(), vec![InputDeviceType::Dpad]);
        assert!(session.is_streaming());
        let codec = fx.codecs.last().unwrap();
        assert!(codec.is_started());
        assert_eq!(codec.format().unwrap().width, 640);
    }

    #[test]
    fn test_create_rejects_viewport_that_rounds_to_zero() {
        let fx = Fixture::new();

        let result = RemoteDisplay::create(
            1,
            DisplayGeometry::from_viewport(9, 480, 160),
            DisplayType::App,
            Arc::new(fx.device.clone()),
            Arc::new(fx.codecs.clone()),
            fx.io.clone(),
            DisplaySettings::default(),
        );

        assert!(matches!(result, Err(DisplayError::InvalidGeometry { width: 0, .. })));
        assert!(fx.device.displays().is_empty());
    }

    #[test]
    fn test_encoder_failure_releases_display_and_dpad() {
        // Arrange
        let fx = Fixture::new();
        fx.codecs.set_fail_create(true);

        // Act
        let result = RemoteDisplay::create(
            1,
            DisplayGeometry::from_viewport(640, 480, 160),
            DisplayType::App,
            Arc::new(fx.device.clone()),
            Arc::new(fx.codecs.clone()),
            fx.io.clone(),
            DisplaySettings::default(),
        );

        // Assert
        assert!(matches!(result, Err(DisplayError::Pipeline(_))));
        assert_eq!(fx.device.displays()[0].release_count, 1);
        assert_eq!(fx.device.sinks()[0].close_count, 1);
    }

    // ── Input routing ─────────────────────────────────────────────────────────

    #[test]
    fn test_input_creates_sinks_lazily_once() {
        // Arrange
        let fx = Fixture::new();
        let session = fx.create(3, DisplayType::App);
        let key = InputEventKind::Key(KeyEvent { key_code: 30, action: actions::DOWN });

        // Act
        session.handle_input(&input(3, InputDeviceType::Keyboard, key));
        session.handle_input(&input(3, InputDeviceType::Keyboard, key));

        // Assert
        let keyboards = fx.device.sinks_of(session.host_display_id(), InputDeviceType::Keyboard);
        assert_eq!(keyboards.len(), 1);
        assert_eq!(keyboards[0].events.len(), 2);
        assert!(fx
            .device
            .sinks_of(session.host_display_id(), InputDeviceType::Mouse)
            .is_empty());
    }

    #[test]
    fn test_messages_for_other_displays_are_ignored() {
        // Arrange
        let fx = Fixture::new();
        let session = fx.create(3, DisplayType::App);
        let key = InputEventKind::Key(KeyEvent { key_code: 30, action: actions::DOWN });

        // Act
        route_message(
            &Arc::downgrade(&session),
            3,
            &RemoteMessage::InputEvent(input(4, InputDeviceType::Keyboard, key)),
        );

        // Assert
        assert_eq!(session.input_devices(), vec![InputDeviceType::Dpad]);
    }

    #[test]
    fn test_relative_mouse_moves_by_delta_from_cursor() {
        // Arrange
        let fx = Fixture::new();
        let session = fx.create(3, DisplayType::App);
        let to = |x, y| InputEventKind::MouseRelative(MouseRelativeEvent { x, y });

        // Act
        session.handle_input(&input(3, InputDeviceType::Mouse, to(100.0, 50.0)));
        session.handle_input(&input(3, InputDeviceType::Mouse, to(110.0, 40.0)));

        // Assert
        let mouse = &fx.device.sinks_of(session.host_display_id(), InputDeviceType::Mouse)[0];
        assert_eq!(
            mouse.events,
            vec![
                SinkEvent::Relative { dx: 100.0, dy: 50.0 },
                SinkEvent::Relative { dx: 10.0, dy: -10.0 },
            ]
        );
    }

    #[test]
    fn test_mouse_button_and_scroll_reach_the_mouse() {
        let fx = Fixture::new();
        let session = fx.create(3, DisplayType::App);

        session.handle_input(&input(
            3,
            InputDeviceType::Mouse,
            InputEventKind::MouseButton(MouseButtonEvent {
                button_code: 1,
                action: actions::BUTTON_PRESS,
            }),
        ));
        session.handle_input(&input(
            3,
            InputDeviceType::Mouse,
            InputEventKind::MouseScroll(MouseScrollEvent { x: 0.0, y: -1.0 }),
        ));

        let mouse = &fx.device.sinks_of(session.host_display_id(), InputDeviceType::Mouse)[0];
        assert_eq!(
            mouse.events,
            vec![
                SinkEvent::Button { button_code: 1, pressed: true },
                SinkEvent::Scroll { x: 0.0, y: -1.0 },
            ]
        );
    }

    #[test]
    fn test_inject_releases_button_for_release_action() {
        // Arrange
        let mut mock = MockInputSink::new();
        mock.expect_send_button()
            .withf(|code, pressed| *code == 2 && !*pressed)
            .times(1)
            .returning(|_, _| Ok(()));
        let mut sink: Box<dyn InputSink> = Box::new(mock);

        // Act
        let result = inject(
            &mut sink,
            &InputEventKind::MouseButton(MouseButtonEvent {
                button_code: 2,
                action: actions::BUTTON_RELEASE,
            }),
        );

        // Assert
        assert!(result.is_ok());
    }

    #[test]
    fn test_relative_without_cursor_passes_position_through() {
        let mut mock = MockInputSink::new();
        mock.expect_cursor_position().returning(|| None);
        mock.expect_send_relative()
            .withf(|dx, dy| *dx == 4.0 && *dy == 5.0)
            .times(1)
            .returning(|_, _| Ok(()));
        let mut sink: Box<dyn InputSink> = Box::new(mock);

        let result = inject(
            &mut sink,
            &InputEventKind::MouseRelative(MouseRelativeEvent { x: 4.0, y: 5.0 }),
        );

        assert!(result.is_ok());
    }

    #[test]
    fn test_sink_failure_is_reported_not_panicked() {
        let mut mock = MockInputSink::new();
        mock.expect_send_key()
            .returning(|_, _| Err(DeviceError::Injection("device gone".into())));
        let mut sink: Box<dyn InputSink> = Box::new(mock);

        let result = inject(&mut sink, &InputEventKind::Key(KeyEvent { key_code: 4, action: 0 }));

        assert_eq!(result, Err(DeviceError::Injection("device gone".into())));
    }

    // ── Touch translation ─────────────────────────────────────────────────────

    #[test]
    fn test_pointer_down_and_up_map_to_plain_down_and_up() {
        assert_eq!(touch_sample(&touch(actions::POINTER_DOWN, 0.5)).unwrap().action, TouchAction::Down);
        assert_eq!(touch_sample(&touch(actions::POINTER_UP, 0.5)).unwrap().action, TouchAction::Up);
        assert_eq!(touch_sample(&touch(actions::MOVE, 0.5)).unwrap().action, TouchAction::Move);
    }

    #[test]
    fn test_cancel_is_reported_with_palm_tool() {
        let sample = touch_sample(&touch(actions::CANCEL, 0.5)).unwrap();
        assert_eq!(sample.action, TouchAction::Cancel);
        assert_eq!(sample.tool, ToolType::Palm);
        assert_eq!(touch_sample(&touch(actions::DOWN, 0.5)).unwrap().tool, ToolType::Finger);
    }

    #[test]
    fn test_pressure_is_scaled_and_clamped() {
        assert_eq!(touch_sample(&touch(actions::DOWN, 1.0)).unwrap().pressure, 255.0);
        assert_eq!(touch_sample(&touch(actions::DOWN, 2.0)).unwrap().pressure, 255.0);
        assert_eq!(touch_sample(&touch(actions::DOWN, 0.0)).unwrap().pressure, 0.0);
    }

    #[test]
    fn test_unknown_touch_action_is_dropped() {
        assert_eq!(touch_sample(&touch(42, 0.5)), None);
    }

    // ── Home ──────────────────────────────────────────────────────────────────

    #[test]
    fn test_home_targets_own_display_or_default_for_mirror() {
        // Arrange
        let fx = Fixture::new();
        let home = fx.create(1, DisplayType::Home);
        let mirror = fx.create(2, DisplayType::Mirror);

        // Act
        route_message(&Arc::downgrade(&home), 1, &RemoteMessage::HomeEvent(HomeEventMessage { display_id: 1 }));
        route_message(&Arc::downgrade(&mirror), 2, &RemoteMessage::HomeEvent(HomeEventMessage { display_id: 2 }));

        // Assert
        assert_eq!(fx.device.home_launches(), vec![home.host_display_id(), 0]);
    }

    // ── Rotation ──────────────────────────────────────────────────────────────

    #[test]
    fn test_rotation_is_sent_only_when_it_changes() {
        // Arrange
        let fx = Fixture::new();
        let session = fx.create(5, DisplayType::App);
        let host_id = session.host_display_id();

        // Act
        fx.device.set_rotation(host_id, Rotation::Rotation90);
        fx.device.set_rotation(host_id, Rotation::Rotation90);
        fx.device.set_rotation(host_id, Rotation::Rotation180);

        // Assert
        let rotations: Vec<_> = fx
            .wire
            .messages()
            .into_iter()
            .filter_map(|m| match m {
                RemoteMessage::DisplayRotation(r) => Some((r.display_id, r.rotation_degrees)),
                _ => None,
            })
            .collect();
        assert_eq!(rotations, vec![(5, -90), (5, 180)]);
    }

    #[test]
    fn test_rotation_not_reported_when_disabled() {
        let fx = Fixture::new();
        let session = RemoteDisplay::create(
            5,
            DisplayGeometry::from_viewport(640, 480, 160),
            DisplayType::App,
            Arc::new(fx.device.clone()),
            Arc::new(fx.codecs.clone()),
            fx.io.clone(),
            DisplaySettings {
                rotation_enabled: false,
                ..DisplaySettings::default()
            },
        )
        .unwrap();

        fx.device.set_rotation(session.host_display_id(), Rotation::Rotation270);

        assert!(!fx
            .wire
            .messages()
            .iter()
            .any(|m| matches!(m, RemoteMessage::DisplayRotation(_))));
    }

    #[test]
    fn test_record_dir_captures_encoded_frames_per_display() {
        // Arrange
        let fx = Fixture::new();
        let dir = std::env::temp_dir().join(format!("vdm-host-record-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let session = RemoteDisplay::create(
            6,
            DisplayGeometry::from_viewport(640, 480, 160),
            DisplayType::App,
            Arc::new(fx.device.clone()),
            Arc::new(fx.codecs.clone()),
            fx.io.clone(),
            DisplaySettings {
                record_dir: Some(dir.clone()),
                ..DisplaySettings::default()
            },
        )
        .unwrap();

        // Act
        fx.codecs.last().unwrap().emit_output(0, b"encoded", 0, 0);
        session.close();

        // Assert
        let recorded = std::fs::read(dir.join("vdm_encoder_output_6.h264")).unwrap();
        assert_eq!(recorded, b"encoded");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    // ── Reset, pause, close ───────────────────────────────────────────────────

    #[test]
    fn test_reset_resizes_recreates_encoder_and_drops_touchscreen() {
        // Arrange
        let fx = Fixture::new();
        let session = fx.create(3, DisplayType::App);
        session.handle_input(&input(
            3,
            InputDeviceType::Touchscreen,
            InputEventKind::Touch(touch(actions::DOWN, 0.5)),
        ));

        // Act
        session
            .reset(DisplayGeometry::from_viewport(805, 605, 200))
            .expect("reset");

        // Assert
        let record = fx.device.display(session.host_display_id()).unwrap();
        assert_eq!((record.geometry.width, record.geometry.height), (800, 600));
        assert_eq!(record.resize_count, 1);
        assert_eq!(fx.codecs.created_count(), 2);
        assert_eq!(fx.codecs.codecs()[0].release_count(), 1);
        assert!(!session.input_devices().contains(&InputDeviceType::Touchscreen));
        let touchscreens = fx.device.sinks_of(session.host_display_id(), InputDeviceType::Touchscreen);
        assert_eq!(touchscreens[0].close_count, 1);
    }

    #[test]
    fn test_pause_stops_encoder_and_reset_resumes() {
        // Arrange
        let fx = Fixture::new();
        let session = fx.create(3, DisplayType::App);

        // Act
        session.pause();
        let paused_streaming = session.is_streaming();
        session.reset(session.geometry()).expect("reset");

        // Assert
        assert!(!paused_streaming);
        assert!(session.is_streaming());
        assert!(!session.is_paused());
        assert_eq!(fx.device.display(session.host_display_id()).unwrap().release_count, 0);
    }

    #[test]
    fn test_close_is_idempotent_and_releases_everything_once() {
        // Arrange
        let fx = Fixture::new();
        let session = fx.create(3, DisplayType::App);
        let key = InputEventKind::Key(KeyEvent { key_code: 30, action: actions::DOWN });
        session.handle_input(&input(3, InputDeviceType::Keyboard, key));
        let consumers_before = fx.io.consumer_count();

        // Act
        session.close();
        session.close();
        drop(session);

        // Assert
        assert!(fx.device.sinks().iter().all(|s| s.close_count == 1));
        assert_eq!(fx.device.sinks().len(), 2);
        assert_eq!(fx.device.displays()[0].release_count, 1);
        assert_eq!(fx.codecs.last().unwrap().release_count(), 1);
        assert_eq!(fx.io.consumer_count(), consumers_before - 1);
        let stops: Vec<_> = fx
            .wire
            .messages()
            .into_iter()
            .filter(|m| matches!(m, RemoteMessage::StopStreaming(_)))
            .collect();
        assert_eq!(
            stops,
            vec![RemoteMessage::StopStreaming(StopStreamingMessage { display_id: 3, pause: false })]
        );
    }

    #[test]
    fn test_empty_display_without_handler_closes_itself() {
        // Arrange
        let fx = Fixture::new();
        let session = fx.create(5, DisplayType::App);

        // Act
        assert!(fx.device.report_display_empty(session.host_display_id()));

        // Assert
        assert!(session.is_closed());
        assert_eq!(fx.device.displays()[0].release_count, 1);
        assert!(fx.wire.messages().contains(&RemoteMessage::StopStreaming(StopStreamingMessage {
            display_id: 5,
            pause: false,
        })));
    }

    #[test]
    fn test_empty_display_is_handed_to_handler() {
        // Arrange
        let fx = Fixture::new();
        let session = fx.create(5, DisplayType::App);
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        session.set_empty_handler(Arc::new(move |remote_id| sink.lock().unwrap().push(remote_id)));

        // Act
        fx.device.report_display_empty(session.host_display_id());

        // Assert
        assert_eq!(*reported.lock().unwrap(), vec![5]);
        assert!(!session.is_closed(), "the handler decides what happens");
    }

    #[test]
    fn test_reset_after_close_fails() {
        let fx = Fixture::new();
        let session = fx.create(3, DisplayType::App);
        session.close();

        let result = session.reset(DisplayGeometry::from_viewport(640, 480, 160));

        assert!(matches!(result, Err(DisplayError::Closed)));
    }

    #[test]
    fn test_display_change_is_sent_with_remote_id() {
        let fx = Fixture::new();
        let session = fx.create(8, DisplayType::App);

        session.send_display_change("Settings", true);

        assert!(fx.wire.messages().contains(&RemoteMessage::DisplayChange(DisplayChangeMessage {
            display_id: 8,
            title: "Settings".into(),
            focused: true,
        })));
    }
}
