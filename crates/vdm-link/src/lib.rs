//! # vdm-link
//!
//! Everything between the wire codec and a display: the message transport,
//! peer discovery, the session coordinator and the per-display streaming
//! pipelines.  Both `vdm-host` and `vdm-client` build on this crate.
//!
//! # How the pieces fit (for beginners)
//!
//! ```text
//! DiscoveryTransport ──▶ ConnectionManager ──socket──▶ RemoteIo ──▶ consumers
//!   (lan / mock)          (lifecycle, callbacks)        (bus)        ├─ host/client service
//!                                                                    └─ VideoManager (per display)
//!                                                                         └─ VideoCodec
//! ```
//!
//! - **`application`** – The coordinator and the pipeline.  They talk to the
//!   outside world only through the capability traits of `infrastructure`.
//! - **`infrastructure`** – The transport plus the discovery and codec traits
//!   with their adapters (a real one and a test fake for each).
//! - **`config`** – Link settings and TOML helpers used by both binaries.

pub mod application;
pub mod config;
pub mod infrastructure;
pub mod sync;

pub use application::connection::{ConnectionCallback, ConnectionManager, ConnectionStatus};
pub use application::video::{PipelineError, StreamRecorder, VideoManager};
pub use infrastructure::remote_io::RemoteIo;
