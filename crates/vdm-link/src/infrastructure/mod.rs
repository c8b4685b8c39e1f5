//! Infrastructure layer of the link.
//!
//! - **`remote_io`** – Byte streams to typed messages and back.
//! - **`discovery`** – Capability traits for finding a peer, with a UDP
//!   broadcast adapter and an in-process fake.
//! - **`codec`** – Capability traits for video codecs, with an identity codec
//!   and a scriptable fake.

pub mod codec;
pub mod discovery;
pub mod remote_io;
