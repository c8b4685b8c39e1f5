//! Storage infrastructure: the host's configuration file.

pub mod config;
