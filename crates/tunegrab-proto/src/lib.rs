//! Shared types for tunegrab: configuration, platform paths and the wire
//! format spoken by the download backend.

pub mod config;
pub mod platform;
pub mod protocol;
