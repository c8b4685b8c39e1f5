//! vdm-host library entry point.
//!
//! Re-exports the module tree shared by `main.rs` and the integration tests
//! in `tests/`.
//!
//! # What does the host do? (for beginners)
//!
//! The *host* is the machine whose apps are shown remotely.  For every
//! display the companion client asks for, the host:
//!
//! 1. Creates a virtual display sized to the client's viewport.
//! 2. Encodes what is rendered on it and streams the frames to the client.
//! 3. Replays the client's touches, keys and mouse input on that display
//!    through virtual input devices.
//! 4. Tells the client when the display rotates or changes title.
//!
//! Discovery, the handshake and the message transport live in `vdm-link`;
//! this crate only adds what is specific to the host side.

/// Application layer: display sessions and their owner.
pub mod application;

/// Infrastructure layer: virtual device adapters and configuration storage.
pub mod infrastructure;

pub use application::host_service::HostService;
pub use application::remote_display::{DisplayError, DisplaySettings, RemoteDisplay};
