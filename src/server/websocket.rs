//! WebSocket server implementation
//!
//! Accepts sockets on `/ws`, admits them during the upgrade and hands each
//! one to a connection handler bound to the shared relay.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tracing::{error, info, warn};

use super::{admit, Admission, Authorizer, ConnectionHandler, TokenAuthorizer, SOCKET_PATH};
use crate::config::{ProjectCatalog, RelayConfig};
use crate::relay::Relay;

/// WebSocket server for terminal clients
pub struct WebSocketServer {
    addr: String,
    relay: Arc<Relay>,
    authorizer: Arc<dyn Authorizer>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(addr: impl Into<String>, relay: Arc<Relay>, authorizer: Arc<dyn Authorizer>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            addr: addr.into(),
            relay,
            authorizer,
            shutdown_tx,
        }
    }

    /// Build the server, its project catalog and token set from configuration
    pub fn from_config(config: &RelayConfig) -> Self {
        let catalog = ProjectCatalog::new(config.projects.clone(), config.projects_root.clone());
        info!(
            "{} configured project(s), projects root: {}",
            catalog.len(),
            config
                .projects_root
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string())
        );

        let authorizer = TokenAuthorizer::new(config.auth.tokens.iter().cloned());
        if authorizer.is_open() {
            warn!("No tokens configured; every connection is accepted");
        } else {
            info!("Token authentication enabled");
        }

        let relay = Relay::new(Arc::new(catalog), config.session.clone());
        Self::new(config.socket_addr(), Arc::new(relay), Arc::new(authorizer))
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Get a shutdown signal receiver
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.addr).await
    }

    /// Run the WebSocket server on the configured address
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections until shutdown, then terminate every session
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let local = listener.local_addr()?;
        info!("WebSocket server listening on ws://{}{}", local, SOCKET_PATH);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let relay = Arc::clone(&self.relay);
                            let authorizer = Arc::clone(&self.authorizer);
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, relay, authorizer, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let session_count = self.relay.session_count().await;
        if session_count > 0 {
            info!("Terminating {} active session(s)...", session_count);
        }
        self.relay.shutdown_all().await;

        Ok(())
    }
}

/// Upgrade a TCP stream and serve it
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    relay: Arc<Relay>,
    authorizer: Arc<dyn Authorizer>,
    shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let mut admission: Option<Admission> = None;

    let ws_stream = accept_hdr_async(stream, |request: &Request, response: Response| {
        match admit(request, authorizer.as_ref()) {
            Ok(admitted) => {
                admission = Some(admitted);
                Ok(response)
            }
            Err(rejection) => {
                warn!("Rejected upgrade from {}: {}", peer_addr, rejection);
                Err(rejection.into_response())
            }
        }
    })
    .await?;

    let Some(admission) = admission else {
        anyhow::bail!("upgrade from {} completed without admission", peer_addr);
    };

    ConnectionHandler::new(peer_addr, relay, admission)
        .run(ws_stream, shutdown_rx)
        .await
}

#[cfg(test)]
mod tests {
    use crate::protocol::Frame;
    use crate::testing::start_relay;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::{http::StatusCode, Error as WsError, Message};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn next_frame(client: &mut Client) -> Frame {
        loop {
            let message = timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .expect("socket error");
            if let Message::Text(text) = message {
                return Frame::decode(&text).unwrap();
            }
        }
    }

    async fn output_until(client: &mut Client, needle: &str) -> String {
        let mut output = String::new();
        while !output.contains(needle) {
            if let Frame::Output { data } = next_frame(client).await {
                output.push_str(&data);
            }
        }
        output
    }

    async fn send(client: &mut Client, frame: Frame) {
        client
            .send(Message::Text(frame.encode().unwrap()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejects_bad_token() {
        let dir = tempdir().unwrap();
        let (server, endpoint) = start_relay(dir.path(), &["secret"]).await;

        let result = connect_async(format!("{}?projectId=p&token=wrong", endpoint)).await;
        match result {
            Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::UNAUTHORIZED),
            other => panic!("expected 401, got {:?}", other.map(|_| ())),
        }
        assert_eq!(server.relay().session_count().await, 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_rejects_missing_project() {
        let dir = tempdir().unwrap();
        let (server, endpoint) = start_relay(dir.path(), &[]).await;

        let result = connect_async(endpoint.as_str()).await;
        match result {
            Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::BAD_REQUEST),
            other => panic!("expected 400, got {:?}", other.map(|_| ())),
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_project_gets_error_frame() {
        let dir = tempdir().unwrap();
        let (server, endpoint) = start_relay(dir.path(), &["secret"]).await;

        let (mut client, _) = connect_async(format!("{}?projectId=ghost&token=secret", endpoint))
            .await
            .unwrap();

        match next_frame(&mut client).await {
            Frame::Error { message } => assert!(message.contains("ghost")),
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(server.relay().session_count().await, 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_frame_is_discarded() {
        let dir = tempdir().unwrap();
        let (server, endpoint) = start_relay(dir.path(), &["secret"]).await;

        let (mut client, _) = connect_async(format!("{}?projectId=p&token=secret", endpoint))
            .await
            .unwrap();
        assert!(matches!(next_frame(&mut client).await, Frame::Connected { .. }));

        client
            .send(Message::Text(r#"{"type":"resize","cols":"abc"}"#.to_string()))
            .await
            .unwrap();
        client.send(Message::Text("not json".to_string())).await.unwrap();
        client
            .send(Message::Binary(vec![1, 2, 3]))
            .await
            .unwrap();
        send(&mut client, Frame::input("echo still-alive\n")).await;

        output_until(&mut client, "still-alive").await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_reconnect_reattaches() {
        let dir = tempdir().unwrap();
        let (server, endpoint) = start_relay(dir.path(), &["secret"]).await;
        let url = format!("{}?projectId=p&token=secret", endpoint);

        let (mut first, _) = connect_async(url.as_str()).await.unwrap();
        let pid = match next_frame(&mut first).await {
            Frame::Connected { pid, reattached, .. } => {
                assert!(!reattached);
                pid
            }
            other => panic!("expected connected, got {:?}", other),
        };
        first.close(None).await.unwrap();

        let (mut second, _) = connect_async(url.as_str()).await.unwrap();
        match next_frame(&mut second).await {
            Frame::Connected {
                pid: again,
                reattached,
                ..
            } => {
                assert!(reattached);
                assert_eq!(again, pid);
            }
            other => panic!("expected connected, got {:?}", other),
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_terminates_sessions() {
        let dir = tempdir().unwrap();
        let (server, endpoint) = start_relay(dir.path(), &[]).await;

        let (mut client, _) = connect_async(format!("{}?projectId=p", endpoint))
            .await
            .unwrap();
        assert!(matches!(next_frame(&mut client).await, Frame::Connected { .. }));
        let process = server
            .relay()
            .session("p")
            .await
            .unwrap()
            .current_process()
            .await
            .unwrap();

        server.shutdown();

        timeout(Duration::from_secs(5), async {
            while !process.has_exited() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(server.relay().session_count().await, 0);
    }
}
