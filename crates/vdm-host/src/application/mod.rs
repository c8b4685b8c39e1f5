//! Application layer of the host.
//!
//! - **`remote_display`** – one streamed virtual display: its encoder, its
//!   input devices, rotation reporting and teardown.
//! - **`host_service`** – the owner of all display sessions.  It reacts to the
//!   client's capability and stop messages and closes everything when the
//!   connection drops.
//!
//! Both depend only on the capability traits in
//! `infrastructure::virtual_device` and the codec traits of `vdm-link`, so the
//! tests run them against recording fakes.

pub mod host_service;
pub mod remote_display;
