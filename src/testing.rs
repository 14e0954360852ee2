//! Shared test fixtures

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use crate::client::{Clipboard, ClipboardError, ClipboardResult};
use crate::config::{ProjectEntry, RelayConfig, SessionSettings};
use crate::server::WebSocketServer;

/// Start an in-process relay serving project `p` from `dir`
///
/// Returns the server and its socket endpoint.
pub(crate) async fn start_relay(dir: &Path, tokens: &[&str]) -> (Arc<WebSocketServer>, String) {
    let mut config = RelayConfig::default();
    config.server.port = 0;
    config.auth.tokens = tokens.iter().map(|t| t.to_string()).collect();
    config.projects = vec![ProjectEntry {
        id: "p".to_string(),
        name: Some("P".to_string()),
        path: dir.to_path_buf(),
    }];
    config.session = SessionSettings::with_command("sh");
    config.session.idle_timeout_ms = 500;
    config.session.kill_grace_ms = 500;

    let server = Arc::new(WebSocketServer::from_config(&config));
    let listener = server.bind().await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.serve(listener).await });
    (server, format!("ws://{}/ws", addr))
}

/// In-memory clipboard that can be told to refuse access
#[derive(Debug, Default)]
pub(crate) struct MemoryClipboard {
    pub text: Option<String>,
    pub denied: bool,
}

impl Clipboard for MemoryClipboard {
    fn get_text(&mut self) -> ClipboardResult<String> {
        if self.denied {
            return Err(ClipboardError::Access("permission denied".to_string()));
        }
        self.text.clone().ok_or(ClipboardError::Empty)
    }

    fn set_text(&mut self, text: &str) -> ClipboardResult<()> {
        if self.denied {
            return Err(ClipboardError::Access("permission denied".to_string()));
        }
        self.text = Some(text.to_string());
        Ok(())
    }
}
