//! Gridmon - network management agent/server core
//!
//! One framed binary protocol over TCP carries everything: typed field
//! messages, request/response correlation, server push, opportunistic
//! in-session encryption and raw file-chunk streaming. This crate is the
//! transport and session pipeline; command semantics live in the modules
//! that register handlers on top of it.

pub mod cli;
pub mod client;
pub mod config;
pub mod crypto;
pub mod filexfer;
pub mod framing;
pub mod message;
pub mod notify;
pub mod protocol;
pub mod server;
pub mod session;
pub mod textenc;
pub mod waitqueue;
