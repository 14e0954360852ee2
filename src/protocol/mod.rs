//! Terminal session wire protocol
//!
//! Frame definitions shared by the relay and the terminal client, plus the
//! streaming UTF-8 decoder used to turn raw terminal bytes into frame text.

mod frame;
mod utf8;

pub use frame::*;
pub use utf8::Utf8StreamDecoder;
