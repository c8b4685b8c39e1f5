//! Infrastructure layer of the client.
//!
//! - `storage`: loading and saving `config.toml`.

pub mod storage;
