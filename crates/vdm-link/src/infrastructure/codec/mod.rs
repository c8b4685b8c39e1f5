//! Video codec capability traits.
//!
//! The streaming pipeline drives a codec through [`VideoCodec`], a buffer-
//! index based interface modelled on hardware media codecs:
//!
//! - The codec owns a set of input and output buffers identified by index.
//! - It announces a free input buffer with
//!   [`CodecCallback::on_input_buffer_available`]; the caller fills it and
//!   hands it back with [`VideoCodec::queue_input_buffer`].
//! - It announces a ready output buffer with
//!   [`CodecCallback::on_output_buffer_available`]; the caller reads it and
//!   returns it with [`VideoCodec::release_output_buffer`].
//!
//! # Callback threading contract
//!
//! Implementations must deliver callbacks from a thread they own, never from
//! inside a method call on the codec.  The pipeline calls codec methods while
//! holding its codec lock, and its callbacks take that same lock.
//!
//! Two adapters exist: [`passthrough::PassthroughCodec`] (an identity codec
//! usable end-to-end without platform media APIs) and [`mock::MockCodec`]
//! (scripted by tests).

use std::sync::Arc;

use thiserror::Error;

pub mod mock;
pub mod passthrough;

/// MIME type of the video stream exchanged by host and client.
pub const MIME_TYPE_AVC: &str = "video/avc";

/// Whether a codec compresses display content or decompresses frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecRole {
    Encoder,
    Decoder,
}

/// Parameters a codec is configured with.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFormat {
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bit_rate: Option<u32>,
    pub i_frame_interval_secs: Option<u32>,
    pub max_b_frames: Option<u32>,
    pub low_latency: bool,
}

impl VideoFormat {
    /// Encoder settings for streaming one display: 500 kbit/s, one key frame
    /// per second, no B-frames.
    pub fn encoder(width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            mime_type: MIME_TYPE_AVC.to_string(),
            width,
            height,
            frame_rate,
            bit_rate: Some(500_000),
            i_frame_interval_secs: Some(1),
            max_b_frames: Some(0),
            low_latency: false,
        }
    }

    /// Decoder settings: low-latency mode, frame rate hint of 100.
    pub fn decoder(width: u32, height: u32) -> Self {
        Self {
            mime_type: MIME_TYPE_AVC.to_string(),
            width,
            height,
            frame_rate: 100,
            bit_rate: None,
            i_frame_interval_secs: None,
            max_b_frames: None,
            low_latency: true,
        }
    }
}

/// Metadata of a ready output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub offset: usize,
    pub size: usize,
    pub presentation_time_us: i64,
    pub flags: u32,
}

/// Errors raised by codec implementations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CodecError {
    /// No codec for this role / MIME type.
    #[error("unsupported codec: {0}")]
    Unsupported(String),

    /// The call is not valid in the codec's current state.
    #[error("codec in wrong state: {0}")]
    InvalidState(String),

    /// The buffer index is unknown or not owned by the caller.
    #[error("invalid buffer index {0}")]
    InvalidBuffer(usize),

    /// Failure reported by the codec backend.
    #[error("codec failure: {0}")]
    Backend(String),
}

/// Receiver of codec events.
pub trait CodecCallback: Send + Sync {
    fn on_input_buffer_available(&self, index: usize);
    fn on_output_buffer_available(&self, index: usize, info: BufferInfo);
    fn on_error(&self, error: CodecError);
}

/// A video encoder or decoder.
pub trait VideoCodec: Send {
    /// Configures the codec and installs the callback receiver.
    fn configure(&mut self, format: &VideoFormat, callback: Arc<dyn CodecCallback>) -> Result<(), CodecError>;

    fn start(&mut self) -> Result<(), CodecError>;

    /// Input buffer `index`, if the caller currently owns it.
    fn input_buffer(&mut self, index: usize) -> Option<&mut Vec<u8>>;

    /// Returns input buffer `index` holding `size` bytes to the codec.
    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        presentation_time_us: i64,
        flags: u32,
    ) -> Result<(), CodecError>;

    /// Output buffer `index`, if it is ready and not yet released.
    fn output_buffer(&mut self, index: usize) -> Option<&[u8]>;

    /// Returns output buffer `index`; `render` shows it on the decoder surface.
    fn release_output_buffer(&mut self, index: usize, render: bool) -> Result<(), CodecError>;

    fn signal_end_of_input_stream(&mut self) -> Result<(), CodecError>;

    fn flush(&mut self) -> Result<(), CodecError>;

    fn stop(&mut self) -> Result<(), CodecError>;

    /// Frees all codec resources.  The codec is unusable afterwards.
    fn release(&mut self);
}

/// Creates codecs on demand; one codec per pipeline (re)start.
pub trait CodecFactory: Send + Sync {
    fn create(&self, role: CodecRole, mime_type: &str) -> Result<Box<dyn VideoCodec>, CodecError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_format_matches_streaming_profile() {
        let format = VideoFormat::encoder(640, 480, 60);
        assert_eq!(format.bit_rate, Some(500_000));
        assert_eq!(format.i_frame_interval_secs, Some(1));
        assert_eq!(format.max_b_frames, Some(0));
        assert_eq!(format.frame_rate, 60);
        assert!(!format.low_latency);
    }

    #[test]
    fn test_decoder_format_requests_low_latency() {
        let format = VideoFormat::decoder(1080, 1920);
        assert!(format.low_latency);
        assert_eq!(format.frame_rate, 100);
        assert_eq!(format.mime_type, MIME_TYPE_AVC);
    }
}
