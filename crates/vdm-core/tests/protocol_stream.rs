//! Integration tests for the vdm-core protocol codec.
//!
//! These tests drive the public API the way a stream reader does: several
//! messages concatenated into one buffer, decoded header-first, with frame
//! indices coming from a [`FrameCounter`].

use vdm_core::protocol::{
    decode_header, decode_message, decode_payload, encode_message,
    messages::{
        DisplayCapabilitiesMessage, DisplayFrameMessage, MessageType, StartStreamingMessage,
        StopStreamingMessage, HEADER_SIZE, PROTOCOL_VERSION,
    },
    ContinuityTracker, FrameContinuity, FrameCounter,
};
use vdm_core::{DisplayGeometry, ProtocolError, RemoteMessage};

fn frame(counter: &FrameCounter, display_id: i32, data: &[u8]) -> RemoteMessage {
    let index = counter.next();
    RemoteMessage::DisplayFrame(DisplayFrameMessage {
        display_id,
        frame_index: index,
        presentation_time_us: index as i64 * 16_666,
        flags: 0,
        data: data.to_vec(),
    })
}

#[test]
fn test_concatenated_messages_decode_in_order() {
    // Arrange
    let counter = FrameCounter::new();
    let messages = vec![
        RemoteMessage::StartStreaming(StartStreamingMessage { home_enabled: false }),
        RemoteMessage::DisplayCapabilities(DisplayCapabilitiesMessage {
            display_id: 1,
            viewport_width: 645,
            viewport_height: 483,
            density_dpi: 160,
        }),
        frame(&counter, 1, b"first"),
        frame(&counter, 1, b"second"),
        RemoteMessage::StopStreaming(StopStreamingMessage { display_id: 1, pause: false }),
    ];
    let mut stream = Vec::new();
    for msg in &messages {
        stream.extend(encode_message(msg).expect("encode must succeed"));
    }

    // Act
    let mut decoded = Vec::new();
    let mut cursor = 0;
    while cursor < stream.len() {
        let (msg, consumed) = decode_message(&stream[cursor..]).expect("decode must succeed");
        decoded.push(msg);
        cursor += consumed;
    }

    // Assert
    assert_eq!(decoded, messages);
    let RemoteMessage::DisplayCapabilities(caps) = &decoded[1] else {
        panic!("expected DisplayCapabilities");
    };
    let geometry = DisplayGeometry::from_capabilities(caps);
    assert_eq!((geometry.width, geometry.height), (640, 480));
}

#[test]
fn test_reader_can_skip_unknown_message_and_continue() {
    // Arrange – an unknown type with a 3-byte payload, then a valid message
    let mut stream = vec![PROTOCOL_VERSION, 0x7E, 0, 0];
    stream.extend_from_slice(&3u32.to_be_bytes());
    stream.extend_from_slice(&[1, 2, 3]);
    let valid = RemoteMessage::StartStreaming(StartStreamingMessage { home_enabled: true });
    stream.extend(encode_message(&valid).unwrap());

    // Act – header first, then payload, the way the transport reads
    let header = decode_header(&stream).expect("header is valid");
    let end = HEADER_SIZE + header.payload_length as usize;
    let first = decode_payload(header.message_type, &stream[HEADER_SIZE..end]);
    let (second, _) = decode_message(&stream[end..]).expect("second message decodes");

    // Assert
    assert_eq!(first, Err(ProtocolError::UnknownMessageType(0x7E)));
    assert_eq!(second, valid);
}

#[test]
fn test_frames_from_one_counter_are_continuous_for_receiver() {
    // Arrange
    let counter = FrameCounter::new();
    let mut tracker = ContinuityTracker::new();

    // Act
    let outcomes: Vec<FrameContinuity> = (0..10)
        .map(|_| match frame(&counter, 3, &[0u8; 4]) {
            RemoteMessage::DisplayFrame(f) => tracker.observe(f.frame_index),
            _ => unreachable!(),
        })
        .collect();

    // Assert
    assert!(outcomes.iter().all(|o| *o == FrameContinuity::InOrder));
}

#[test]
fn test_start_streaming_type_byte_matches_table() {
    let bytes = encode_message(&RemoteMessage::StartStreaming(StartStreamingMessage {
        home_enabled: false,
    }))
    .unwrap();
    assert_eq!(bytes[1], MessageType::StartStreaming as u8);
}
