//! Integration tests for the host display lifecycle driven through RemoteIo.
//!
//! # Purpose
//!
//! These tests feed encoded protocol bytes into a `RemoteIo` input stream, the
//! same way a connected socket would, and capture everything the host writes
//! back.  `HostService` runs against the recording `MockVirtualDevice` and
//! the identity `PassthroughCodec`, so a rendered frame really travels
//! display → encoder → `DisplayFrame` on the wire.

use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use vdm_core::protocol::{
    decode_message, encode_message, DisplayCapabilitiesMessage, InputDeviceType, InputEventKind,
    InputEventMessage, KeyEvent, RemoteMessage, StartStreamingMessage, StopStreamingMessage,
};
use vdm_core::DisplayType;
use vdm_host::infrastructure::virtual_device::mock::MockVirtualDevice;
use vdm_host::{DisplaySettings, HostService};
use vdm_link::infrastructure::codec::passthrough::PassthroughCodecFactory;
use vdm_link::RemoteIo;

// ── Helpers ───────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct Wire(Arc<Mutex<Vec<u8>>>);

impl Write for Wire {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Wire {
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

fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not met in time");
}

fn feed(io: &RemoteIo, messages: &[RemoteMessage]) {
    let bytes: Vec<u8> = messages
        .iter()
        .flat_map(|m| encode_message(m).expect("encode"))
        .collect();
    io.attach_input_stream(Cursor::new(bytes), Arc::new(|| {}))
        .expect("attach input");
}

fn capabilities(display_id: i32, width: u32, height: u32, density_dpi: u32) -> RemoteMessage {
    RemoteMessage::DisplayCapabilities(DisplayCapabilitiesMessage {
        display_id,
        viewport_width: width,
        viewport_height: height,
        density_dpi,
    })
}

struct Host {
    io: RemoteIo,
    wire: Wire,
    device: MockVirtualDevice,
    service: Arc<HostService>,
}

fn host() -> Host {
    let io = RemoteIo::new();
    let wire = Wire::default();
    io.attach_output_stream(wire.clone(), Arc::new(|| {}));
    let device = MockVirtualDevice::new();
    let service = HostService::new(
        io.clone(),
        Arc::new(device.clone()),
        Arc::new(PassthroughCodecFactory::new()),
        DisplaySettings::default(),
    );
    Host {
        io,
        wire,
        device,
        service,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[test]
fn test_start_streaming_then_capabilities_creates_exactly_one_display() {
    // Arrange
    let host = host();

    // Act
    host.service.start_streaming(DisplayType::Home);
    feed(&host.io, &[capabilities(7, 640, 480, 160)]);
    wait_until(|| !host.service.display_ids().is_empty());

    // Assert
    assert_eq!(host.service.display_ids(), vec![7]);
    let displays = host.device.displays();
    assert_eq!(displays.len(), 1);
    assert_eq!((displays[0].geometry.width, displays[0].geometry.height), (640, 480));
    assert_eq!(displays[0].geometry.density_dpi, 160);
    assert_eq!(displays[0].display_type, DisplayType::Home);
    assert_eq!(
        host.wire.messages()[0],
        RemoteMessage::StartStreaming(StartStreamingMessage { home_enabled: true })
    );
}

#[test]
fn test_rendered_frames_are_streamed_only_for_the_announced_display() {
    // Arrange
    let host = host();
    feed(&host.io, &[capabilities(7, 640, 480, 160)]);
    wait_until(|| !host.service.display_ids().is_empty());
    let host_display_id = host.service.display(7).unwrap().host_display_id();

    // Act
    for i in 0..3u8 {
        assert!(host.device.render_frame(host_display_id, &[i; 16], i64::from(i) * 1000));
    }
    wait_until(|| {
        host.wire
            .messages()
            .iter()
            .filter(|m| matches!(m, RemoteMessage::DisplayFrame(_)))
            .count()
            == 3
    });

    // Assert
    let frames: Vec<_> = host
        .wire
        .messages()
        .into_iter()
        .filter_map(|m| match m {
            RemoteMessage::DisplayFrame(frame) => Some(frame),
            _ => None,
        })
        .collect();
    assert!(frames.iter().all(|f| f.display_id == 7));
    assert_eq!(frames.iter().map(|f| f.frame_index).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(frames[2].data, vec![2u8; 16]);
}

#[test]
fn test_client_input_and_stop_reach_the_display() {
    // Arrange
    let host = host();
    let key = RemoteMessage::InputEvent(InputEventMessage {
        display_id: 7,
        device_type: InputDeviceType::Keyboard,
        timestamp_ms: 5,
        event: InputEventKind::Key(KeyEvent {
            key_code: 30,
            action: 0,
        }),
    });

    // Act
    feed(
        &host.io,
        &[
            capabilities(7, 640, 480, 160),
            key,
            RemoteMessage::StopStreaming(StopStreamingMessage {
                display_id: 7,
                pause: false,
            }),
        ],
    );
    wait_until(|| host.device.displays().first().map(|d| d.release_count) == Some(1));

    // Assert
    assert!(host.service.display_ids().is_empty());
    let sinks = host.device.sinks();
    assert_eq!(sinks.len(), 2, "dpad plus the lazily created keyboard");
    assert!(sinks.iter().any(|s| s.kind == InputDeviceType::Keyboard && s.events.len() == 1));
    assert!(sinks.iter().all(|s| s.close_count == 1));
}

#[test]
fn test_empty_display_is_removed_and_client_told_to_stop() {
    // Arrange
    let host = host();
    feed(&host.io, &[capabilities(7, 640, 480, 160), capabilities(8, 640, 480, 160)]);
    wait_until(|| host.service.display_ids().len() == 2);
    let host_display_id = host.service.display(7).unwrap().host_display_id();

    // Act
    assert!(host.device.report_display_empty(host_display_id));

    // Assert
    assert_eq!(host.service.display_ids(), vec![8]);
    assert_eq!(host.device.display(host_display_id).unwrap().release_count, 1);
    assert!(!host.device.has_listener(host_display_id));
    let stops: Vec<_> = host
        .wire
        .messages()
        .into_iter()
        .filter(|m| matches!(m, RemoteMessage::StopStreaming(_)))
        .collect();
    assert_eq!(
        stops,
        vec![RemoteMessage::StopStreaming(StopStreamingMessage {
            display_id: 7,
            pause: false
        })]
    );
    assert!(!host.device.render_frame(host_display_id, &[1; 8], 0));
}
