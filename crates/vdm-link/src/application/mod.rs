//! Application layer of the link: the session coordinator and the streaming
//! pipeline.
//!
//! - **`connection`** – Drives discovery to a connected socket and owns the
//!   connection lifecycle and its callbacks.
//! - **`video`** – One encoder or decoder pipeline per display, with bounded
//!   queues between the codec and the transport.
//!
//! Neither module opens sockets or codecs directly; both go through the
//! traits in [`crate::infrastructure`].

pub mod connection;
pub mod video;
