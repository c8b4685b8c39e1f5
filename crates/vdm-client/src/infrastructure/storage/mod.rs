//! Storage infrastructure: the client's configuration file.

pub mod config;
