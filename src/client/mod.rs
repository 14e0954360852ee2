//! Terminal client
//!
//! Connects to the relay, keeps a terminal emulator in sync with the remote
//! process and turns local activity into frames.

pub mod attach;
mod clipboard;
mod connection;
mod session;
mod terminal;

pub use clipboard::*;
pub use connection::*;
pub use session::*;
pub use terminal::*;
