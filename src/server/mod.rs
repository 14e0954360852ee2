//! WebSocket server module
//!
//! Accepts terminal clients, admits them during the upgrade and bridges each
//! socket to its project's relay session.

mod auth;
mod handler;
mod websocket;

pub use auth::*;
pub use handler::ConnectionHandler;
pub use websocket::WebSocketServer;
