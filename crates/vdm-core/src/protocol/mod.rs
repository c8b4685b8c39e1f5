//! Protocol module containing message types, the binary codec and frame counters.

pub mod codec;
pub mod messages;
pub mod sequence;

pub use codec::{decode_header, decode_message, decode_payload, encode_message, ProtocolError};
pub use messages::*;
pub use sequence::{ContinuityTracker, FrameContinuity, FrameCounter};
