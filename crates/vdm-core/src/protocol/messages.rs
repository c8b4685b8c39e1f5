//! All remote-session protocol message types.
//!
//! Every message travels over the single byte stream that Discovery hands to
//! the transport.  Messages that concern one virtual display carry its
//! [`DisplayId`] so that each display session can pick out its own traffic;
//! session-wide messages (device capabilities, start streaming, sensors) do
//! not.

use serde::{Deserialize, Serialize};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Current protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Total size of the common message header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest payload a peer may announce in a header.
///
/// A header declaring more than this is treated as a framing error: the
/// stream can no longer be trusted and the connection is dropped.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Identifier of one remote display, chosen by the client.
pub type DisplayId = i32;

/// Android-compatible action codes carried in key, touch and button events.
pub mod actions {
    pub const DOWN: i32 = 0;
    pub const UP: i32 = 1;
    pub const MOVE: i32 = 2;
    pub const CANCEL: i32 = 3;
    pub const POINTER_DOWN: i32 = 5;
    pub const POINTER_UP: i32 = 6;
    pub const BUTTON_PRESS: i32 = 11;
    pub const BUTTON_RELEASE: i32 = 12;
}

/// Flag bits carried by [`DisplayFrameMessage::flags`].
pub mod frame_flags {
    pub const KEY_FRAME: u32 = 1;
    pub const CODEC_CONFIG: u32 = 2;
    pub const END_OF_STREAM: u32 = 4;
}

// ── Message type codes ────────────────────────────────────────────────────────

/// All message type codes understood on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    // Session control (0x01–0x0F)
    DeviceCapabilities = 0x01,
    DisplayCapabilities = 0x02,
    StartStreaming = 0x03,
    StopStreaming = 0x04,
    // Display output (0x10–0x1F)
    DisplayFrame = 0x10,
    DisplayRotation = 0x11,
    DisplayChange = 0x12,
    // Input (0x20–0x2F)
    InputEvent = 0x20,
    HomeEvent = 0x21,
    // Sensors (0x30–0x3F)
    SensorEvent = 0x30,
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(MessageType::DeviceCapabilities),
            0x02 => Ok(MessageType::DisplayCapabilities),
            0x03 => Ok(MessageType::StartStreaming),
            0x04 => Ok(MessageType::StopStreaming),
            0x10 => Ok(MessageType::DisplayFrame),
            0x11 => Ok(MessageType::DisplayRotation),
            0x12 => Ok(MessageType::DisplayChange),
            0x20 => Ok(MessageType::InputEvent),
            0x21 => Ok(MessageType::HomeEvent),
            0x30 => Ok(MessageType::SensorEvent),
            _ => Err(()),
        }
    }
}

// ── Common message header ─────────────────────────────────────────────────────

/// 8-byte header prepended to every message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Protocol version; always [`PROTOCOL_VERSION`] once validated.
    pub version: u8,
    /// Raw type byte.  Kept raw so an unknown type can still be skipped.
    pub message_type: u8,
    /// Length of the payload in bytes (not including this header).
    pub payload_length: u32,
}

// ── Session control payloads ──────────────────────────────────────────────────

/// One sensor the client device can stream to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorCapabilities {
    pub sensor_type: i32,
    pub name: String,
    pub max_range: f32,
    pub resolution: f32,
    pub power: f32,
    pub min_delay_us: i32,
    pub max_delay_us: i32,
}

/// DEVICE_CAPABILITIES (0x01): client describes itself right after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilitiesMessage {
    pub device_name: String,
    pub sensors: Vec<SensorCapabilities>,
}

/// DISPLAY_CAPABILITIES (0x02): client announces (or resizes) a remote display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayCapabilitiesMessage {
    pub display_id: DisplayId,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub density_dpi: u32,
}

/// START_STREAMING (0x03): host asks the client to create a new remote display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartStreamingMessage {
    /// Whether the display the host will create supports a home activity.
    pub home_enabled: bool,
}

/// STOP_STREAMING (0x04): either side stops one display.
///
/// With `pause == false` the display is torn down entirely; with
/// `pause == true` only its streaming pipeline stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopStreamingMessage {
    pub display_id: DisplayId,
    pub pause: bool,
}

// ── Display output payloads ───────────────────────────────────────────────────

/// DISPLAY_FRAME (0x10): one encoded video access unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayFrameMessage {
    pub display_id: DisplayId,
    /// Emission order assigned by the encoder pipeline, starting at 0.
    pub frame_index: u64,
    pub presentation_time_us: i64,
    /// Bitmask of [`frame_flags`].
    pub flags: u32,
    pub data: Vec<u8>,
}

/// DISPLAY_ROTATION (0x11): host display rotated; degrees the client should
/// rotate its view by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayRotationMessage {
    pub display_id: DisplayId,
    pub rotation_degrees: i32,
}

/// DISPLAY_CHANGE (0x12): host reports what is shown on a display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayChangeMessage {
    pub display_id: DisplayId,
    pub title: String,
    pub focused: bool,
}

// ── Input payloads ────────────────────────────────────────────────────────────

/// Which virtual input device on the host should receive an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum InputDeviceType {
    Keyboard = 0x01,
    Mouse = 0x02,
    Touchscreen = 0x03,
    Dpad = 0x04,
    NavigationTouchpad = 0x05,
}

impl TryFrom<u8> for InputDeviceType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(InputDeviceType::Keyboard),
            0x02 => Ok(InputDeviceType::Mouse),
            0x03 => Ok(InputDeviceType::Touchscreen),
            0x04 => Ok(InputDeviceType::Dpad),
            0x05 => Ok(InputDeviceType::NavigationTouchpad),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub key_code: i32,
    /// One of [`actions::DOWN`] / [`actions::UP`].
    pub action: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TouchEvent {
    pub pointer_id: i32,
    pub action: i32,
    pub x: f32,
    pub y: f32,
    /// Normalised pressure in `0.0..=1.0`.
    pub pressure: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseButtonEvent {
    pub button_code: i32,
    pub action: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MouseScrollEvent {
    pub x: f32,
    pub y: f32,
}

/// Pointer position sent by the client; the host turns it into relative motion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MouseRelativeEvent {
    pub x: f32,
    pub y: f32,
}

/// The concrete event inside an [`InputEventMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum InputEventKind {
    Key(KeyEvent),
    Touch(TouchEvent),
    MouseButton(MouseButtonEvent),
    MouseScroll(MouseScrollEvent),
    MouseRelative(MouseRelativeEvent),
}

/// INPUT_EVENT (0x20): input captured on the client for one display.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputEventMessage {
    pub display_id: DisplayId,
    pub device_type: InputDeviceType,
    pub timestamp_ms: u64,
    pub event: InputEventKind,
}

/// HOME_EVENT (0x21): client pressed "home" while viewing a display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeEventMessage {
    pub display_id: DisplayId,
}

/// SENSOR_EVENT (0x30): one reading of a client sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEventMessage {
    pub sensor_type: i32,
    pub values: Vec<f32>,
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// A fully decoded protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteMessage {
    DeviceCapabilities(DeviceCapabilitiesMessage),
    DisplayCapabilities(DisplayCapabilitiesMessage),
    StartStreaming(StartStreamingMessage),
    StopStreaming(StopStreamingMessage),
    DisplayFrame(DisplayFrameMessage),
    DisplayRotation(DisplayRotationMessage),
    DisplayChange(DisplayChangeMessage),
    InputEvent(InputEventMessage),
    HomeEvent(HomeEventMessage),
    SensorEvent(SensorEventMessage),
}

impl RemoteMessage {
    /// Returns the [`MessageType`] discriminant for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            RemoteMessage::DeviceCapabilities(_) => MessageType::DeviceCapabilities,
            RemoteMessage::DisplayCapabilities(_) => MessageType::DisplayCapabilities,
            RemoteMessage::StartStreaming(_) => MessageType::StartStreaming,
            RemoteMessage::StopStreaming(_) => MessageType::StopStreaming,
            RemoteMessage::DisplayFrame(_) => MessageType::DisplayFrame,
            RemoteMessage::DisplayRotation(_) => MessageType::DisplayRotation,
            RemoteMessage::DisplayChange(_) => MessageType::DisplayChange,
            RemoteMessage::InputEvent(_) => MessageType::InputEvent,
            RemoteMessage::HomeEvent(_) => MessageType::HomeEvent,
            RemoteMessage::SensorEvent(_) => MessageType::SensorEvent,
        }
    }

    /// Returns the display this message is routed to, if it is display-scoped.
    pub fn display_id(&self) -> Option<DisplayId> {
        match self {
            RemoteMessage::DisplayCapabilities(m) => Some(m.display_id),
            RemoteMessage::StopStreaming(m) => Some(m.display_id),
            RemoteMessage::DisplayFrame(m) => Some(m.display_id),
            RemoteMessage::DisplayRotation(m) => Some(m.display_id),
            RemoteMessage::DisplayChange(m) => Some(m.display_id),
            RemoteMessage::InputEvent(m) => Some(m.display_id),
            RemoteMessage::HomeEvent(m) => Some(m.display_id),
            RemoteMessage::DeviceCapabilities(_)
            | RemoteMessage::StartStreaming(_)
            | RemoteMessage::SensorEvent(_) => None,
        }
    }
}
