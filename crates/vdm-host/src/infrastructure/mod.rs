//! Infrastructure layer of the host: adapters behind the application traits.
//!
//! - `virtual_device`: creating virtual displays and injecting input.
//! - `storage`: loading and saving `config.toml`.

pub mod storage;
pub mod virtual_device;
