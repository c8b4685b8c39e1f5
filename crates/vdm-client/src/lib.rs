//! vdm-client library entry point.
//!
//! Re-exports the module tree shared by `main.rs` and the integration tests
//! in `tests/`.
//!
//! # What does the client do? (for beginners)
//!
//! The *client* is the companion device that looks at the host's virtual
//! displays.  After the session is connected it:
//!
//! 1. Describes itself (`DeviceCapabilities`: name and sensors).
//! 2. Whenever the host asks for a display (`StartStreaming`), allocates a
//!    local display id, starts a decoder for it and announces its viewport
//!    (`DisplayCapabilities`).
//! 3. Decodes the `DisplayFrame`s the host streams for that id.
//! 4. Sends keys, touches, mouse input and home presses back for the display
//!    they happened on, plus readings of its own sensors.
//!
//! Discovery, the handshake and the message transport live in `vdm-link`.

/// Application layer: client display sessions and their owner.
pub mod application;

/// Infrastructure layer: configuration storage.
pub mod infrastructure;

pub use application::client_display::{ClientDisplay, ClientError, Viewport};
pub use application::client_service::{ClientService, ClientSettings};
