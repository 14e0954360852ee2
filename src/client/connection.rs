//! Connection manager
//!
//! Owns the client end of one relay socket. Status is published on a watch
//! channel and only socket lifecycle events change it; there is no automatic
//! retry. Inbound frames go to a single registered consumer in receipt order.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::protocol::{Frame, ProtocolError};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frames queued for the socket writer
const OUTBOUND_QUEUE: usize = 256;

/// Lifecycle of the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionStatus {
    pub fn label(&self) -> &str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error(_) => "error",
        }
    }
}

/// Errors that can occur during connection operations
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection is already open")]
    AlreadyOpen,

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("Failed to connect: {0}")]
    Connect(#[source] tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Result type for connection operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Client side of a relay socket
pub struct Connection {
    status_tx: watch::Sender<ConnectionStatus>,
    consumer: watch::Sender<Option<mpsc::Sender<Frame>>>,
    outbound: Option<mpsc::Sender<Frame>>,
    cancel: Option<CancellationToken>,
    writer: Option<JoinHandle<()>>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (consumer, _) = watch::channel(None);
        Self {
            status_tx,
            consumer,
            outbound: None,
            cancel: None,
            writer: None,
        }
    }

    /// Get current connection status
    pub fn status(&self) -> ConnectionStatus {
        self.status_tx.borrow().clone()
    }

    /// Watch status changes
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Register the consumer of inbound frames, replacing any previous one
    ///
    /// Frames that arrive before a consumer is registered wait for it, and so
    /// does everything the socket receives after them.
    pub fn on_frame(&self, sink: mpsc::Sender<Frame>) {
        self.consumer.send_replace(Some(sink));
    }

    /// Open the socket to `endpoint` for `project_id`
    pub async fn open(
        &mut self,
        endpoint: &str,
        token: Option<&str>,
        project_id: &str,
    ) -> ConnectionResult<()> {
        if self.cancel.is_some() {
            return Err(ConnectionError::AlreadyOpen);
        }

        let mut params = vec![("projectId", project_id)];
        if let Some(token) = token {
            params.push(("token", token));
        }
        let url = Url::parse_with_params(endpoint, &params)?;

        self.status_tx.send_replace(ConnectionStatus::Connecting);
        debug!("Connecting to {} for project {}", endpoint, project_id);

        let socket = match connect_async(url.as_str()).await {
            Ok((socket, _)) => socket,
            Err(e) => {
                let message = format!("Failed to connect to {}: {}", endpoint, e);
                error!("{}", message);
                self.status_tx.send_replace(ConnectionStatus::Error(message));
                return Err(ConnectionError::Connect(e));
            }
        };

        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (sink, stream) = socket.split();

        self.writer = Some(tokio::spawn(write_loop(
            sink,
            outbound_rx,
            cancel.clone(),
            self.status_tx.clone(),
        )));
        tokio::spawn(read_loop(
            stream,
            self.consumer.subscribe(),
            cancel.clone(),
            self.status_tx.clone(),
        ));

        self.outbound = Some(outbound_tx);
        self.cancel = Some(cancel);
        self.status_tx.send_replace(ConnectionStatus::Connected);
        info!("Connected to {} for project {}", endpoint, project_id);
        Ok(())
    }

    /// Queue a frame for the relay
    pub async fn send(&self, frame: Frame) -> ConnectionResult<()> {
        if *self.status_tx.borrow() != ConnectionStatus::Connected {
            return Err(ConnectionError::NotConnected);
        }
        frame.validate()?;

        let outbound = self.outbound.as_ref().ok_or(ConnectionError::NotConnected)?;
        outbound
            .send(frame)
            .await
            .map_err(|_| ConnectionError::NotConnected)
    }

    /// Close the socket
    pub async fn close(&mut self) {
        let Some(cancel) = self.cancel.take() else {
            return;
        };
        cancel.cancel();
        self.outbound = None;

        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }

        self.status_tx.send_if_modified(|status| {
            if matches!(status, ConnectionStatus::Error(_) | ConnectionStatus::Disconnected) {
                false
            } else {
                *status = ConnectionStatus::Disconnected;
                true
            }
        });
        debug!("Connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<Socket, Message>,
    mut outbound: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    status: watch::Sender<ConnectionStatus>,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping {} frame: {}", frame.type_name(), e);
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            error!("WebSocket write failed: {}", e);
            status.send_replace(ConnectionStatus::Error(e.to_string()));
            cancel.cancel();
            return;
        }
    }

    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<Socket>,
    mut consumer: watch::Receiver<Option<mpsc::Sender<Frame>>>,
    cancel: CancellationToken,
    status: watch::Sender<ConnectionStatus>,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                let frame = match Frame::decode(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Dropping malformed frame from relay: {}", e);
                        continue;
                    }
                };

                let registered = tokio::select! {
                    _ = cancel.cancelled() => return,
                    target = consumer.wait_for(Option::is_some) => target.is_ok(),
                };
                if !registered {
                    return;
                }
                let Some(target) = consumer.borrow().clone() else {
                    continue;
                };
                if target.send(frame).await.is_err() {
                    debug!("Frame consumer is gone, dropping frame");
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                info!("Relay closed the connection");
                status.send_replace(ConnectionStatus::Disconnected);
                cancel.cancel();
                return;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("WebSocket error: {}", e);
                status.send_replace(ConnectionStatus::Error(e.to_string()));
                cancel.cancel();
                return;
            }
        }
    }
}
