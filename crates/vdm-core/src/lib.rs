//! # vdm-core
//!
//! Shared library for the virtual display remote session containing the wire
//! protocol codec, frame index counters, and the display geometry rules.
//!
//! This crate is used by the link layer, the host and the client.
//! It has zero dependencies on OS APIs, codecs, or network sockets.
//!
//! # Architecture overview (for beginners)
//!
//! A *host* device creates virtual displays and streams their contents, as
//! encoded video, to a companion *client* device.  The client shows the video
//! and sends touch, key and mouse input (plus sensor readings) back.  Both
//! sides talk over one byte stream using the message set defined here.
//!
//! - **`protocol`** – How bytes travel over the stream.  Messages are encoded
//!   into a compact binary format (8-byte header + payload) and decoded back
//!   into typed Rust structs on the other end.
//!
//! - **`domain`** – Pure display rules with no OS dependencies: geometry
//!   rounding, display types, and the host-to-client rotation mapping.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `vdm_core::RemoteMessage` instead of `vdm_core::protocol::messages::RemoteMessage`.
pub use domain::display::{DisplayGeometry, DisplayType, Rotation, RotationTracker};
pub use protocol::codec::{decode_message, encode_message, ProtocolError};
pub use protocol::messages::{DisplayId, RemoteMessage};
