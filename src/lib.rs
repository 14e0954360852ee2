//! Dev Hub terminal relay library
//!
//! Interactive terminal sessions over WebSocket: the frame protocol, the
//! relay that keeps one process per project, and the client that attaches
//! to it.

pub mod client;
pub mod config;
pub mod protocol;
pub mod pty;
pub mod relay;
pub mod server;

#[cfg(test)]
mod testing;
