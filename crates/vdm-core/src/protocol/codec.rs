//! Binary codec for encoding and decoding remote-session protocol messages.
//!
//! Wire format:
//! ```text
//! [version:1][msg_type:1][reserved:2][payload_len:4][payload:N]
//! ```
//! Total header size: 8 bytes. All multi-byte integers are big-endian, floats
//! are IEEE-754 bit patterns in big-endian order, strings carry a `u16` length
//! prefix and byte blobs a `u32` length prefix.
//!
//! # Framing errors vs. payload errors
//!
//! A stream reader first decodes the header ([`decode_header`]), then reads
//! exactly `payload_len` bytes and decodes them ([`decode_payload`]).  If the
//! header itself is bad (wrong version, absurd length) the reader no longer
//! knows where the next message starts, so the stream is unusable.  If only
//! the payload is bad (unknown type, truncated field) the reader has already
//! consumed the right number of bytes and can carry on with the next message.
//! [`ProtocolError::is_framing_error`] tells the two apart.

use crate::protocol::messages::{
    DeviceCapabilitiesMessage, DisplayCapabilitiesMessage, DisplayChangeMessage,
    DisplayFrameMessage, DisplayRotationMessage, HomeEventMessage, InputDeviceType,
    InputEventKind, InputEventMessage, KeyEvent, MessageHeader, MessageType, MouseButtonEvent,
    MouseRelativeEvent, MouseScrollEvent, RemoteMessage, SensorCapabilities, SensorEventMessage,
    StartStreamingMessage, StopStreamingMessage, TouchEvent, HEADER_SIZE, MAX_PAYLOAD_SIZE,
    PROTOCOL_VERSION,
};
use thiserror::Error;

/// Errors that can occur during message encoding or decoding.
///
/// Any of these surfaces to the session as a *malformed message*.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The message type byte in the header is not a recognized value.
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// The protocol version in the header is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The header announces a payload larger than [`MAX_PAYLOAD_SIZE`].
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_SIZE} byte limit")]
    PayloadTooLarge(usize),

    /// The payload could not be parsed (field value out of range, UTF-8 error, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The encoded payload length field does not match the actual data available.
    #[error("payload length mismatch: header says {declared}, available is {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },
}

impl ProtocolError {
    /// Returns `true` when the error leaves the byte stream unsynchronised.
    pub fn is_framing_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnsupportedVersion(_) | ProtocolError::PayloadTooLarge(_)
        )
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`RemoteMessage`] into a byte vector including the 8-byte header.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if the payload would not fit
/// the framing limit (e.g. an oversized video frame).
///
/// # Examples
///
/// ```rust
/// use vdm_core::protocol::{decode_message, encode_message};
/// use vdm_core::protocol::messages::{RemoteMessage, StartStreamingMessage};
///
/// let msg = RemoteMessage::StartStreaming(StartStreamingMessage { home_enabled: true });
/// let bytes = encode_message(&msg).unwrap();
/// let (decoded, consumed) = decode_message(&bytes).unwrap();
/// assert_eq!(decoded, msg);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_message(msg: &RemoteMessage) -> Result<Vec<u8>, ProtocolError> {
    let payload = encode_payload(msg);
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.push(PROTOCOL_VERSION);
    buf.push(msg.message_type() as u8);
    buf.push(0x00); // reserved
    buf.push(0x00); // reserved
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decodes and validates the fixed-size header at the start of `bytes`.
///
/// The message type is returned raw and is not checked here, so a reader can
/// still skip the payload of a type it does not know.
///
/// # Errors
///
/// - [`ProtocolError::InsufficientData`] if fewer than [`HEADER_SIZE`] bytes.
/// - [`ProtocolError::UnsupportedVersion`] / [`ProtocolError::PayloadTooLarge`]
///   (framing errors).
pub fn decode_header(bytes: &[u8]) -> Result<MessageHeader, ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let version = bytes[0];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    // bytes[2..4] are reserved – ignored on decode
    let payload_length = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if payload_length as usize > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload_length as usize));
    }

    Ok(MessageHeader {
        version,
        message_type: bytes[1],
        payload_length,
    })
}

/// Decodes the payload of a message whose header carried `message_type`.
///
/// # Errors
///
/// - [`ProtocolError::UnknownMessageType`] for an unrecognised type byte.
/// - [`ProtocolError::MalformedPayload`] if a field is truncated or invalid.
pub fn decode_payload(message_type: u8, payload: &[u8]) -> Result<RemoteMessage, ProtocolError> {
    let msg_type = MessageType::try_from(message_type)
        .map_err(|_| ProtocolError::UnknownMessageType(message_type))?;
    let mut r = PayloadReader::new(payload);

    let msg = match msg_type {
        MessageType::DeviceCapabilities => {
            RemoteMessage::DeviceCapabilities(decode_device_capabilities(&mut r)?)
        }
        MessageType::DisplayCapabilities => {
            RemoteMessage::DisplayCapabilities(DisplayCapabilitiesMessage {
                display_id: r.i32("DisplayCapabilities.display_id")?,
                viewport_width: r.u32("DisplayCapabilities.viewport_width")?,
                viewport_height: r.u32("DisplayCapabilities.viewport_height")?,
                density_dpi: r.u32("DisplayCapabilities.density_dpi")?,
            })
        }
        MessageType::StartStreaming => RemoteMessage::StartStreaming(StartStreamingMessage {
            home_enabled: r.bool("StartStreaming.home_enabled")?,
        }),
        MessageType::StopStreaming => RemoteMessage::StopStreaming(StopStreamingMessage {
            display_id: r.i32("StopStreaming.display_id")?,
            pause: r.bool("StopStreaming.pause")?,
        }),
        MessageType::DisplayFrame => RemoteMessage::DisplayFrame(DisplayFrameMessage {
            display_id: r.i32("DisplayFrame.display_id")?,
            frame_index: r.u64("DisplayFrame.frame_index")?,
            presentation_time_us: r.i64("DisplayFrame.presentation_time_us")?,
            flags: r.u32("DisplayFrame.flags")?,
            data: r.blob("DisplayFrame.data")?,
        }),
        MessageType::DisplayRotation => RemoteMessage::DisplayRotation(DisplayRotationMessage {
            display_id: r.i32("DisplayRotation.display_id")?,
            rotation_degrees: r.i32("DisplayRotation.rotation_degrees")?,
        }),
        MessageType::DisplayChange => RemoteMessage::DisplayChange(DisplayChangeMessage {
            display_id: r.i32("DisplayChange.display_id")?,
            title: r.string("DisplayChange.title")?,
            focused: r.bool("DisplayChange.focused")?,
        }),
        MessageType::InputEvent => RemoteMessage::InputEvent(decode_input_event(&mut r)?),
        MessageType::HomeEvent => RemoteMessage::HomeEvent(HomeEventMessage {
            display_id: r.i32("HomeEvent.display_id")?,
        }),
        MessageType::SensorEvent => {
            let sensor_type = r.i32("SensorEvent.sensor_type")?;
            let count = r.u16("SensorEvent.value_count")? as usize;
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(r.f32("SensorEvent.value")?);
            }
            RemoteMessage::SensorEvent(SensorEventMessage {
                sensor_type,
                values,
            })
        }
    };
    Ok(msg)
}

/// Decodes one [`RemoteMessage`] from the beginning of `bytes`.
///
/// Returns the decoded message and the total number of bytes consumed
/// (header + payload), so the caller can advance their read cursor.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are truncated or malformed.
pub fn decode_message(bytes: &[u8]) -> Result<(RemoteMessage, usize), ProtocolError> {
    let header = decode_header(bytes)?;
    let payload_len = header.payload_length as usize;
    let total_needed = HEADER_SIZE + payload_len;
    if bytes.len() < total_needed {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared: payload_len,
            available: bytes.len() - HEADER_SIZE,
        });
    }

    let msg = decode_payload(header.message_type, &bytes[HEADER_SIZE..total_needed])?;
    Ok((msg, total_needed))
}

// ── Payload encoding ──────────────────────────────────────────────────────────

fn encode_payload(msg: &RemoteMessage) -> Vec<u8> {
    let mut buf = Vec::new();
    match msg {
        RemoteMessage::DeviceCapabilities(m) => encode_device_capabilities(&mut buf, m),
        RemoteMessage::DisplayCapabilities(m) => {
            buf.extend_from_slice(&m.display_id.to_be_bytes());
            buf.extend_from_slice(&m.viewport_width.to_be_bytes());
            buf.extend_from_slice(&m.viewport_height.to_be_bytes());
            buf.extend_from_slice(&m.density_dpi.to_be_bytes());
        }
        RemoteMessage::StartStreaming(m) => write_bool(&mut buf, m.home_enabled),
        RemoteMessage::StopStreaming(m) => {
            buf.extend_from_slice(&m.display_id.to_be_bytes());
            write_bool(&mut buf, m.pause);
        }
        RemoteMessage::DisplayFrame(m) => {
            buf.reserve(24 + m.data.len());
            buf.extend_from_slice(&m.display_id.to_be_bytes());
            buf.extend_from_slice(&m.frame_index.to_be_bytes());
            buf.extend_from_slice(&m.presentation_time_us.to_be_bytes());
            buf.extend_from_slice(&m.flags.to_be_bytes());
            buf.extend_from_slice(&(m.data.len() as u32).to_be_bytes());
            buf.extend_from_slice(&m.data);
        }
        RemoteMessage::DisplayRotation(m) => {
            buf.extend_from_slice(&m.display_id.to_be_bytes());
            buf.extend_from_slice(&m.rotation_degrees.to_be_bytes());
        }
        RemoteMessage::DisplayChange(m) => {
            buf.extend_from_slice(&m.display_id.to_be_bytes());
            write_length_prefixed_string(&mut buf, &m.title);
            write_bool(&mut buf, m.focused);
        }
        RemoteMessage::InputEvent(m) => encode_input_event(&mut buf, m),
        RemoteMessage::HomeEvent(m) => buf.extend_from_slice(&m.display_id.to_be_bytes()),
        RemoteMessage::SensorEvent(m) => {
            buf.extend_from_slice(&m.sensor_type.to_be_bytes());
            let count = m.values.len().min(u16::MAX as usize);
            buf.extend_from_slice(&(count as u16).to_be_bytes());
            for value in &m.values[..count] {
                buf.extend_from_slice(&value.to_bits().to_be_bytes());
            }
        }
    }
    buf
}

fn encode_device_capabilities(buf: &mut Vec<u8>, m: &DeviceCapabilitiesMessage) {
    write_length_prefixed_string(buf, &m.device_name);
    let count = m.sensors.len().min(u16::MAX as usize);
    buf.extend_from_slice(&(count as u16).to_be_bytes());
    for sensor in &m.sensors[..count] {
        buf.extend_from_slice(&sensor.sensor_type.to_be_bytes());
        write_length_prefixed_string(buf, &sensor.name);
        buf.extend_from_slice(&sensor.max_range.to_bits().to_be_bytes());
        buf.extend_from_slice(&sensor.resolution.to_bits().to_be_bytes());
        buf.extend_from_slice(&sensor.power.to_bits().to_be_bytes());
        buf.extend_from_slice(&sensor.min_delay_us.to_be_bytes());
        buf.extend_from_slice(&sensor.max_delay_us.to_be_bytes());
    }
}

// Discriminants for the event body inside INPUT_EVENT.
const INPUT_KIND_KEY: u8 = 0x01;
const INPUT_KIND_TOUCH: u8 = 0x02;
const INPUT_KIND_MOUSE_BUTTON: u8 = 0x03;
const INPUT_KIND_MOUSE_SCROLL: u8 = 0x04;
const INPUT_KIND_MOUSE_RELATIVE: u8 = 0x05;

fn encode_input_event(buf: &mut Vec<u8>, m: &InputEventMessage) {
    buf.extend_from_slice(&m.display_id.to_be_bytes());
    buf.push(m.device_type as u8);
    buf.extend_from_slice(&m.timestamp_ms.to_be_bytes());
    match m.event {
        InputEventKind::Key(e) => {
            buf.push(INPUT_KIND_KEY);
            buf.extend_from_slice(&e.key_code.to_be_bytes());
            buf.extend_from_slice(&e.action.to_be_bytes());
        }
        InputEventKind::Touch(e) => {
            buf.push(INPUT_KIND_TOUCH);
            buf.extend_from_slice(&e.pointer_id.to_be_bytes());
            buf.extend_from_slice(&e.action.to_be_bytes());
            buf.extend_from_slice(&e.x.to_bits().to_be_bytes());
            buf.extend_from_slice(&e.y.to_bits().to_be_bytes());
            buf.extend_from_slice(&e.pressure.to_bits().to_be_bytes());
        }
        InputEventKind::MouseButton(e) => {
            buf.push(INPUT_KIND_MOUSE_BUTTON);
            buf.extend_from_slice(&e.button_code.to_be_bytes());
            buf.extend_from_slice(&e.action.to_be_bytes());
        }
        InputEventKind::MouseScroll(e) => {
            buf.push(INPUT_KIND_MOUSE_SCROLL);
            buf.extend_from_slice(&e.x.to_bits().to_be_bytes());
            buf.extend_from_slice(&e.y.to_bits().to_be_bytes());
        }
        InputEventKind::MouseRelative(e) => {
            buf.push(INPUT_KIND_MOUSE_RELATIVE);
            buf.extend_from_slice(&e.x.to_bits().to_be_bytes());
            buf.extend_from_slice(&e.y.to_bits().to_be_bytes());
        }
    }
}

// ── Payload decoding ──────────────────────────────────────────────────────────

fn decode_device_capabilities(
    r: &mut PayloadReader<'_>,
) -> Result<DeviceCapabilitiesMessage, ProtocolError> {
    let device_name = r.string("DeviceCapabilities.device_name")?;
    let count = r.u16("DeviceCapabilities.sensor_count")? as usize;
    let mut sensors = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        sensors.push(SensorCapabilities {
            sensor_type: r.i32("SensorCapabilities.sensor_type")?,
            name: r.string("SensorCapabilities.name")?,
            max_range: r.f32("SensorCapabilities.max_range")?,
            resolution: r.f32("SensorCapabilities.resolution")?,
            power: r.f32("SensorCapabilities.power")?,
            min_delay_us: r.i32("SensorCapabilities.min_delay_us")?,
            max_delay_us: r.i32("SensorCapabilities.max_delay_us")?,
        });
    }
    Ok(DeviceCapabilitiesMessage {
        device_name,
        sensors,
    })
}

fn decode_input_event(r: &mut PayloadReader<'_>) -> Result<InputEventMessage, ProtocolError> {
    let display_id = r.i32("InputEvent.display_id")?;
    let device_byte = r.u8("InputEvent.device_type")?;
    let device_type = InputDeviceType::try_from(device_byte).map_err(|_| {
        ProtocolError::MalformedPayload(format!("unknown input device type: {device_byte}"))
    })?;
    let timestamp_ms = r.u64("InputEvent.timestamp_ms")?;

    let event = match r.u8("InputEvent.kind")? {
        INPUT_KIND_KEY => InputEventKind::Key(KeyEvent {
            key_code: r.i32("KeyEvent.key_code")?,
            action: r.i32("KeyEvent.action")?,
        }),
        INPUT_KIND_TOUCH => InputEventKind::Touch(TouchEvent {
            pointer_id: r.i32("TouchEvent.pointer_id")?,
            action: r.i32("TouchEvent.action")?,
            x: r.f32("TouchEvent.x")?,
            y: r.f32("TouchEvent.y")?,
            pressure: r.f32("TouchEvent.pressure")?,
        }),
        INPUT_KIND_MOUSE_BUTTON => InputEventKind::MouseButton(MouseButtonEvent {
            button_code: r.i32("MouseButtonEvent.button_code")?,
            action: r.i32("MouseButtonEvent.action")?,
        }),
        INPUT_KIND_MOUSE_SCROLL => InputEventKind::MouseScroll(MouseScrollEvent {
            x: r.f32("MouseScrollEvent.x")?,
            y: r.f32("MouseScrollEvent.y")?,
        }),
        INPUT_KIND_MOUSE_RELATIVE => InputEventKind::MouseRelative(MouseRelativeEvent {
            x: r.f32("MouseRelativeEvent.x")?,
            y: r.f32("MouseRelativeEvent.y")?,
        }),
        other => {
            return Err(ProtocolError::MalformedPayload(format!(
                "unknown input event kind: 0x{other:02X}"
            )))
        }
    };

    Ok(InputEventMessage {
        display_id,
        device_type,
        timestamp_ms,
        event,
    })
}

// ── Utility helpers ───────────────────────────────────────────────────────────

/// Forward-only cursor over a payload; every read names the field it was
/// after so truncation errors point at the culprit.
struct PayloadReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn take(&mut self, len: usize, context: &str) -> Result<&'a [u8], ProtocolError> {
        let end = self.offset.checked_add(len).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.offset..end];
                self.offset = end;
                Ok(slice)
            }
            None => Err(ProtocolError::MalformedPayload(format!(
                "{context}: need {len} bytes at offset {}, got {}",
                self.offset,
                self.buf.len().saturating_sub(self.offset)
            ))),
        }
    }

    fn array<const N: usize>(&mut self, context: &str) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, context)?);
        Ok(out)
    }

    fn u8(&mut self, context: &str) -> Result<u8, ProtocolError> {
        Ok(self.take(1, context)?[0])
    }

    fn bool(&mut self, context: &str) -> Result<bool, ProtocolError> {
        Ok(self.u8(context)? != 0)
    }

    fn u16(&mut self, context: &str) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.array(context)?))
    }

    fn u32(&mut self, context: &str) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.array(context)?))
    }

    fn i32(&mut self, context: &str) -> Result<i32, ProtocolError> {
        Ok(i32::from_be_bytes(self.array(context)?))
    }

    fn u64(&mut self, context: &str) -> Result<u64, ProtocolError> {
        Ok(u64::from_be_bytes(self.array(context)?))
    }

    fn i64(&mut self, context: &str) -> Result<i64, ProtocolError> {
        Ok(i64::from_be_bytes(self.array(context)?))
    }

    fn f32(&mut self, context: &str) -> Result<f32, ProtocolError> {
        Ok(f32::from_bits(self.u32(context)?))
    }

    fn string(&mut self, context: &str) -> Result<String, ProtocolError> {
        let len = self.u16(context)? as usize;
        let bytes = self.take(len, context)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| ProtocolError::MalformedPayload(format!("{context}: invalid UTF-8: {e}")))
    }

    fn blob(&mut self, context: &str) -> Result<Vec<u8>, ProtocolError> {
        let len = self.u32(context)? as usize;
        Ok(self.take(len, context)?.to_vec())
    }
}

fn write_bool(buf: &mut Vec<u8>, value: bool) {
    buf.push(if value { 0x01 } else { 0x00 });
}

/// Writes a 2-byte length prefix followed by the UTF-8 string bytes.
///
/// Strings longer than `u16::MAX` bytes are truncated at the last character
/// boundary that fits.
fn write_length_prefixed_string(buf: &mut Vec<u8>, s: &str) {
    let mut len = s.len().min(u16::MAX as usize);
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(&s.as_bytes()[..len]);
}

// ── Tests ─────────────────────────────────────────────────────────────────────
