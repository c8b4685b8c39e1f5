//! Logging and recording virtual device.
//!
//! `MockVirtualDevice` stands in for the platform's display and input APIs.
//! Every display, sink and event is kept in one shared state so
//! tests can assert on exactly what the session layer did, and every call is
//! logged at `debug` so the binary shows what a real device would receive.
//!
//! # Driving a display
//!
//! A real display produces content on its own.  Here the owner pushes it:
//!
//! ```rust
//! use vdm_core::{DisplayGeometry, DisplayType, Rotation};
//! use vdm_host::infrastructure::virtual_device::mock::MockVirtualDevice;
//! use vdm_host::infrastructure::virtual_device::{VirtualDevice, VirtualDisplay};
//!
//! let device = MockVirtualDevice::new();
//! let display = device
//!     .create_virtual_display("demo", DisplayGeometry::from_viewport(640, 480, 160), DisplayType::App)
//!     .unwrap();
//!
//! // No listener installed yet, so nothing receives the frame.
//! assert!(!device.render_frame(display.display_id(), &[1, 2, 3], 0));
//! device.set_rotation(display.display_id(), Rotation::Rotation90);
//! assert_eq!(display.rotation(), Rotation::Rotation90);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;
use vdm_core::protocol::{InputDeviceType, SensorCapabilities};
use vdm_core::{DisplayGeometry, DisplayId, DisplayType, Rotation};
use vdm_link::sync::lock_unpoisoned;

use super::{DeviceError, DisplayListener, InputSink, TouchSample, VirtualDevice, VirtualDisplay};

/// Host-local ids handed out to virtual displays start here; 0 is the
/// default display.
pub const FIRST_VIRTUAL_DISPLAY_ID: DisplayId = 10;

/// One event received by a recorded sink.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Key { key_code: i32, action: i32 },
    Touch(TouchSample),
    Button { button_code: i32, pressed: bool },
    Scroll { x: f32, y: f32 },
    Relative { dx: f32, dy: f32 },
}

/// What the device knows about one created display.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayRecord {
    pub display_id: DisplayId,
    pub name: String,
    pub display_type: DisplayType,
    pub geometry: DisplayGeometry,
    pub rotation: Rotation,
    pub resize_count: usize,
    /// Every `release()` call is counted, so a double release shows up.
    pub release_count: usize,
}

/// What the device knows about one created input sink.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkRecord {
    pub kind: InputDeviceType,
    pub display_id: DisplayId,
    pub name: String,
    pub geometry: DisplayGeometry,
    pub events: Vec<SinkEvent>,
    pub close_count: usize,
    /// Mouse sinks track a cursor that starts at the origin.
    pub cursor: Option<(f32, f32)>,
}

#[derive(Default)]
struct DeviceState {
    next_display_id: DisplayId,
    displays: Vec<DisplayRecord>,
    listeners: HashMap<DisplayId, Arc<dyn DisplayListener>>,
    sinks: Vec<SinkRecord>,
    home_launches: Vec<DisplayId>,
    sensor_events: Vec<(i32, Vec<f32>)>,
    remote_sensors: Option<(String, Vec<SensorCapabilities>)>,
    fail_create: bool,
}

type SharedState = Arc<Mutex<DeviceState>>;

/// Recording [`VirtualDevice`]; clones share the same state.
#[derive(Clone)]
pub struct MockVirtualDevice {
    state: SharedState,
}

impl Default for MockVirtualDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVirtualDevice {
    pub fn new() -> Self {
        let state = DeviceState {
            next_display_id: FIRST_VIRTUAL_DISPLAY_ID,
            ..DeviceState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Makes every subsequent `create_*` call fail with `Unavailable`.
    pub fn set_fail_create(&self, fail: bool) {
        lock_unpoisoned(&self.state).fail_create = fail;
    }

    // ── Driving ───────────────────────────────────────────────────────────────

    /// Rotates display `display_id` and notifies its listener.
    pub fn set_rotation(&self, display_id: DisplayId, rotation: Rotation) {
        let listener = {
            let mut state = lock_unpoisoned(&self.state);
            if let Some(record) = state.displays.iter_mut().find(|d| d.display_id == display_id) {
                record.rotation = rotation;
            }
            state.listeners.get(&display_id).cloned()
        };
        // Called without the lock: the listener may query the display.
        if let Some(listener) = listener {
            listener.on_display_changed();
        }
    }

    /// Reports that nothing is running on `display_id` any more.
    ///
    /// Returns `false` when no listener is installed.
    pub fn report_display_empty(&self, display_id: DisplayId) -> bool {
        let listener = lock_unpoisoned(&self.state).listeners.get(&display_id).cloned();
        match listener {
            Some(listener) => {
                debug!("Mock device: display {display_id} is empty");
                listener.on_display_empty();
                true
            }
            None => false,
        }
    }

    /// Delivers rendered content to the listener of `display_id`.
    ///
    /// Returns `false` when no listener is installed.
    pub fn render_frame(&self, display_id: DisplayId, data: &[u8], presentation_time_us: i64) -> bool {
        let listener = lock_unpoisoned(&self.state).listeners.get(&display_id).cloned();
        match listener {
            Some(listener) => {
                listener.on_frame(data, presentation_time_us);
                true
            }
            None => false,
        }
    }

    /// Renders the same content on every display with a listener; returns how
    /// many received it.
    pub fn render_all(&self, data: &[u8], presentation_time_us: i64) -> usize {
        let listeners: Vec<_> = lock_unpoisoned(&self.state).listeners.values().cloned().collect();
        for listener in &listeners {
            listener.on_frame(data, presentation_time_us);
        }
        listeners.len()
    }

    // ── Inspection ────────────────────────────────────────────────────────────

    pub fn displays(&self) -> Vec<DisplayRecord> {
        lock_unpoisoned(&self.state).displays.clone()
    }

    pub fn display(&self, display_id: DisplayId) -> Option<DisplayRecord> {
        lock_unpoisoned(&self.state)
            .displays
            .iter()
            .find(|d| d.display_id == display_id)
            .cloned()
    }

    pub fn sinks(&self) -> Vec<SinkRecord> {
        lock_unpoisoned(&self.state).sinks.clone()
    }

    /// Sinks of one kind bound to `display_id`, in creation order.
    pub fn sinks_of(&self, display_id: DisplayId, kind: InputDeviceType) -> Vec<SinkRecord> {
        lock_unpoisoned(&self.state)
            .sinks
            .iter()
            .filter(|s| s.display_id == display_id && s.kind == kind)
            .cloned()
            .collect()
    }

    pub fn has_listener(&self, display_id: DisplayId) -> bool {
        lock_unpoisoned(&self.state).listeners.contains_key(&display_id)
    }

    pub fn home_launches(&self) -> Vec<DisplayId> {
        lock_unpoisoned(&self.state).home_launches.clone()
    }

    pub fn sensor_events(&self) -> Vec<(i32, Vec<f32>)> {
        lock_unpoisoned(&self.state).sensor_events.clone()
    }

    pub fn remote_sensors(&self) -> Option<(String, Vec<SensorCapabilities>)> {
        lock_unpoisoned(&self.state).remote_sensors.clone()
    }
}

impl VirtualDevice for MockVirtualDevice {
    fn create_virtual_display(
        &self,
        name: &str,
        geometry: DisplayGeometry,
        display_type: DisplayType,
    ) -> Result<Box<dyn VirtualDisplay>, DeviceError> {
        let mut state = lock_unpoisoned(&self.state);
        if state.fail_create {
            return Err(DeviceError::Unavailable(format!("cannot create display {name}")));
        }
        let display_id = state.next_display_id;
        state.next_display_id += 1;
        state.displays.push(DisplayRecord {
            display_id,
            name: name.to_string(),
            display_type,
            geometry,
            rotation: Rotation::Rotation0,
            resize_count: 0,
            release_count: 0,
        });
        debug!(
            "Mock device: created display {display_id} '{name}' {}x{} @{}dpi ({display_type:?})",
            geometry.width, geometry.height, geometry.density_dpi
        );
        Ok(Box::new(MockDisplay {
            display_id,
            state: Arc::clone(&self.state),
        }))
    }

    fn create_input_sink(
        &self,
        kind: InputDeviceType,
        display_id: DisplayId,
        name: &str,
        geometry: DisplayGeometry,
    ) -> Result<Box<dyn InputSink>, DeviceError> {
        let mut state = lock_unpoisoned(&self.state);
        if state.fail_create {
            return Err(DeviceError::Unavailable(format!("cannot create {kind:?} sink")));
        }
        let index = state.sinks.len();
        state.sinks.push(SinkRecord {
            kind,
            display_id,
            name: name.to_string(),
            geometry,
            events: Vec::new(),
            close_count: 0,
            cursor: (kind == InputDeviceType::Mouse).then_some((0.0, 0.0)),
        });
        debug!("Mock device: created {kind:?} sink '{name}' on display {display_id}");
        Ok(Box::new(MockSink {
            index,
            closed: false,
            state: Arc::clone(&self.state),
        }))
    }

    fn launch_home(&self, display_id: DisplayId) -> Result<(), DeviceError> {
        debug!("Mock device: launching home on display {display_id}");
        lock_unpoisoned(&self.state).home_launches.push(display_id);
        Ok(())
    }

    fn register_remote_sensors(&self, device_name: &str, sensors: &[SensorCapabilities]) {
        debug!("Mock device: {} remote sensors from '{device_name}'", sensors.len());
        lock_unpoisoned(&self.state).remote_sensors = Some((device_name.to_string(), sensors.to_vec()));
    }

    fn clear_remote_sensors(&self) {
        lock_unpoisoned(&self.state).remote_sensors = None;
    }

    fn send_sensor_event(&self, sensor_type: i32, values: &[f32]) -> Result<(), DeviceError> {
        let mut state = lock_unpoisoned(&self.state);
        if state.remote_sensors.is_none() {
            return Err(DeviceError::Injection(format!(
                "sensor {sensor_type} reported before capabilities"
            )));
        }
        state.sensor_events.push((sensor_type, values.to_vec()));
        Ok(())
    }
}

// ── Display ───────────────────────────────────────────────────────────────────

struct MockDisplay {
    display_id: DisplayId,
    state: SharedState,
}

impl MockDisplay {
    fn with_record<T>(&self, f: impl FnOnce(&mut DisplayRecord) -> T) -> Option<T> {
        let mut state = lock_unpoisoned(&self.state);
        state
            .displays
            .iter_mut()
            .find(|d| d.display_id == self.display_id)
            .map(f)
    }
}

impl VirtualDisplay for MockDisplay {
    fn display_id(&self) -> DisplayId {
        self.display_id
    }

    fn rotation(&self) -> Rotation {
        self.with_record(|r| r.rotation).unwrap_or_default()
    }

    fn resize(&mut self, geometry: DisplayGeometry) -> Result<(), DeviceError> {
        let released = self.with_record(|r| r.release_count > 0).unwrap_or(true);
        if released {
            return Err(DeviceError::Closed);
        }
        self.with_record(|r| {
            r.geometry = geometry;
            r.resize_count += 1;
        });
        debug!(
            "Mock device: display {} resized to {}x{}",
            self.display_id, geometry.width, geometry.height
        );
        Ok(())
    }

    fn set_listener(&mut self, listener: Option<Arc<dyn DisplayListener>>) {
        let mut state = lock_unpoisoned(&self.state);
        match listener {
            Some(listener) => {
                state.listeners.insert(self.display_id, listener);
            }
            None => {
                state.listeners.remove(&self.display_id);
            }
        }
    }

    fn release(&mut self) {
        let mut state = lock_unpoisoned(&self.state);
        state.listeners.remove(&self.display_id);
        if let Some(record) = state.displays.iter_mut().find(|d| d.display_id == self.display_id) {
            record.release_count += 1;
        }
        debug!("Mock device: display {} released", self.display_id);
    }
}

// ── Input sink ────────────────────────────────────────────────────────────────

struct MockSink {
    index: usize,
    closed: bool,
    state: SharedState,
}

impl MockSink {
    fn record(&self, event: SinkEvent) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed);
        }
        let mut state = lock_unpoisoned(&self.state);
        let sink = state.sinks.get_mut(self.index).ok_or(DeviceError::Closed)?;
        debug!("Mock device: {:?} sink on display {} <- {event:?}", sink.kind, sink.display_id);
        if let (SinkEvent::Relative { dx, dy }, Some((x, y))) = (&event, sink.cursor) {
            sink.cursor = Some((x + dx, y + dy));
        }
        sink.events.push(event);
        Ok(())
    }
}

impl InputSink for MockSink {
    fn send_key(&mut self, key_code: i32, action: i32) -> Result<(), DeviceError> {
        self.record(SinkEvent::Key { key_code, action })
    }

    fn send_touch(&mut self, sample: &TouchSample) -> Result<(), DeviceError> {
        self.record(SinkEvent::Touch(*sample))
    }

    fn send_button(&mut self, button_code: i32, pressed: bool) -> Result<(), DeviceError> {
        self.record(SinkEvent::Button { button_code, pressed })
    }

    fn send_scroll(&mut self, x: f32, y: f32) -> Result<(), DeviceError> {
        self.record(SinkEvent::Scroll { x, y })
    }

    fn send_relative(&mut self, dx: f32, dy: f32) -> Result<(), DeviceError> {
        self.record(SinkEvent::Relative { dx, dy })
    }

    fn cursor_position(&self) -> Option<(f32, f32)> {
        lock_unpoisoned(&self.state).sinks.get(self.index).and_then(|s| s.cursor)
    }

    fn close(&mut self) {
        self.closed = true;
        if let Some(sink) = lock_unpoisoned(&self.state).sinks.get_mut(self.index) {
            sink.close_count += 1;
        }
    }
}
