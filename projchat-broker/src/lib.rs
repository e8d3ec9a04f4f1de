//! `ProjChat` broker library.
//!
//! An in-memory channel broker speaking the `ProjChat` channel protocol over
//! WebSocket, with the REST routes the client fetches history and the
//! roster from. Exposed as a library so integration tests can run it
//! in-process.

pub mod broker;
pub mod channels;
pub mod config;
pub mod rest;
