//! Shared protocol definitions for the `ProjChat` channel protocol.

pub mod codec;
pub mod event;
pub mod member;
pub mod message;
pub mod typing;
