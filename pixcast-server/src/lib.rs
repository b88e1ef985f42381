//! # pixcast-server
//!
//! Standalone host for the pixcast streaming pipeline. Loads a TOML
//! config, starts a test-pattern renderer on its own thread and serves
//! its frames to browsers over WebSocket.

pub mod config;
pub mod renderer;
