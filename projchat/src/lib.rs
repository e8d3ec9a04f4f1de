//! `ProjChat`: real-time project chat core.
//!
//! Live message log, typing presence and `@mentions` for one project
//! channel, on top of a reconnecting WebSocket connection.

pub mod api;
pub mod chat;
pub mod config;
pub mod connection;
pub mod transport;
