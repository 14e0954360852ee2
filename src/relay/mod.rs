//! Terminal relay
//!
//! Keeps one interactive process per project and bridges it to the socket
//! currently attached.

mod registry;
mod session;

pub use registry::Relay;
pub use session::{AttachHandle, RelayError, RelayResult, RelaySession};
