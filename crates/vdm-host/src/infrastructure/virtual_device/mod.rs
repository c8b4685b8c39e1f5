//! Virtual display and input injection capability traits.
//!
//! The host never talks to the platform directly.  It asks a
//! [`VirtualDevice`] for virtual displays and for input sinks bound to them,
//! and the device reports rendered content and configuration changes back
//! through a [`DisplayListener`].
//!
//! # Why traits? (for beginners)
//!
//! Creating a virtual display or a virtual touchscreen needs privileged
//! platform APIs that do not exist on a build machine.  Putting them behind
//! traits lets the application layer (and its tests) run against
//! [`mock::MockVirtualDevice`], which records everything and logs it, while a
//! platform adapter can be dropped in without touching the session code.

use std::sync::Arc;

use thiserror::Error;
use vdm_core::protocol::{InputDeviceType, SensorCapabilities};
use vdm_core::{DisplayGeometry, DisplayId, DisplayType, Rotation};

pub mod mock;

/// Errors raised by virtual device adapters.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeviceError {
    /// The platform refused to create the display or sink.
    #[error("virtual device unavailable: {0}")]
    Unavailable(String),

    /// Injecting an event failed.
    #[error("input injection failed: {0}")]
    Injection(String),

    /// The display or sink was already released.
    #[error("virtual device resource already closed")]
    Closed,
}

/// Normalised touch action delivered to a touchscreen sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchAction {
    Down,
    Up,
    Move,
    Cancel,
}

/// What touched the screen.  A cancelled gesture is reported as a palm so the
/// platform discards it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolType {
    Finger,
    Palm,
}

/// One pointer sample as injected into a touchscreen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TouchSample {
    pub pointer_id: i32,
    pub action: TouchAction,
    pub x: f32,
    pub y: f32,
    /// Pressure in `0.0..=255.0`.
    pub pressure: f32,
    pub tool: ToolType,
}

/// Receives what happens on a virtual display.
pub trait DisplayListener: Send + Sync {
    /// The display rendered new content.
    fn on_frame(&self, data: &[u8], presentation_time_us: i64);

    /// Size, rotation or another display property changed.
    fn on_display_changed(&self);

    /// The last activity on the display finished; nothing is left to show.
    fn on_display_empty(&self);
}

/// One platform virtual display.
pub trait VirtualDisplay: Send {
    /// Host-local id of the display.
    fn display_id(&self) -> DisplayId;

    fn rotation(&self) -> Rotation;

    fn resize(&mut self, geometry: DisplayGeometry) -> Result<(), DeviceError>;

    /// Installs (or with `None` removes) the listener for rendered content.
    fn set_listener(&mut self, listener: Option<Arc<dyn DisplayListener>>);

    /// Destroys the display.  Further calls are no-ops.
    fn release(&mut self);
}

/// A virtual input device bound to one display.
#[cfg_attr(test, mockall::automock)]
pub trait InputSink: Send {
    fn send_key(&mut self, key_code: i32, action: i32) -> Result<(), DeviceError>;

    fn send_touch(&mut self, sample: &TouchSample) -> Result<(), DeviceError>;

    fn send_button(&mut self, button_code: i32, pressed: bool) -> Result<(), DeviceError>;

    fn send_scroll(&mut self, x: f32, y: f32) -> Result<(), DeviceError>;

    fn send_relative(&mut self, dx: f32, dy: f32) -> Result<(), DeviceError>;

    /// Current cursor position, for devices that track one.
    fn cursor_position(&self) -> Option<(f32, f32)>;

    /// Removes the device from the platform.
    fn close(&mut self);
}

/// Factory for virtual displays and input sinks, plus device-wide actions.
pub trait VirtualDevice: Send + Sync {
    fn create_virtual_display(
        &self,
        name: &str,
        geometry: DisplayGeometry,
        display_type: DisplayType,
    ) -> Result<Box<dyn VirtualDisplay>, DeviceError>;

    /// Creates an input sink of `kind` targeting host display `display_id`.
    fn create_input_sink(
        &self,
        kind: InputDeviceType,
        display_id: DisplayId,
        name: &str,
        geometry: DisplayGeometry,
    ) -> Result<Box<dyn InputSink>, DeviceError>;

    /// Shows the home screen on host display `display_id`.
    fn launch_home(&self, display_id: DisplayId) -> Result<(), DeviceError>;

    /// Id of the host's own (physical) display.
    fn default_display_id(&self) -> DisplayId {
        0
    }

    /// Makes the client's sensors available on the host.
    fn register_remote_sensors(&self, device_name: &str, sensors: &[SensorCapabilities]);

    fn clear_remote_sensors(&self);

    fn send_sensor_event(&self, sensor_type: i32, values: &[f32]) -> Result<(), DeviceError>;
}
