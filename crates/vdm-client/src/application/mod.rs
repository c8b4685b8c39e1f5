//! Application layer of the client.
//!
//! - **`client_display`** – one display shown on this device: its decoder, its
//!   outgoing input and what the host last reported about it (rotation,
//!   title).
//! - **`client_service`** – the owner of all client displays.  It answers the
//!   host's `StartStreaming` requests and tears everything down when the
//!   connection drops.

pub mod client_display;
pub mod client_service;
