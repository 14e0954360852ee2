//! WebSocket connection handler
//!
//! Bridges one admitted socket to its project's relay session: a reader loop
//! feeds client frames to the session, a writer task drains the session's
//! frames into the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::Admission;
use crate::protocol::{Direction, Frame, SPAWN_FAILED_EXIT_CODE};
use crate::relay::{AttachHandle, Relay, RelayError};

type Sink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// How long the writer gets to flush after the reader stops
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Why the reader loop stopped
enum Outcome {
    /// Socket closed or failed; the session waits for a reattach
    Disconnected,
    /// The session stopped sending to this socket (takeover or teardown)
    Released,
    /// Input could not be written; the session is torn down
    Failed,
    /// Relay shutting down
    Shutdown,
}

/// Handles a single admitted WebSocket connection
pub struct ConnectionHandler {
    peer_addr: SocketAddr,
    relay: Arc<Relay>,
    admission: Admission,
}

impl ConnectionHandler {
    pub fn new(peer_addr: SocketAddr, relay: Arc<Relay>, admission: Admission) -> Self {
        Self {
            peer_addr,
            relay,
            admission,
        }
    }

    /// Serve the socket until it closes
    pub async fn run(
        self,
        ws: WebSocketStream<TcpStream>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let peer = self.peer_addr;
        let project_id = self.admission.project_id.as_str();
        let (mut ws_sender, mut ws_receiver) = ws.split();

        info!(
            "{} attaching to project {} as {}",
            peer, project_id, self.admission.principal
        );

        let AttachHandle {
            session,
            id,
            frames,
        } = match self.relay.attach(project_id).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("{} could not attach to project {}: {}", peer, project_id, e);
                send_frame(&mut ws_sender, &Frame::error(e.to_string())).await?;
                if matches!(e, RelayError::Spawn(_)) {
                    send_frame(&mut ws_sender, &Frame::exit(SPAWN_FAILED_EXIT_CODE)).await?;
                }
                let _ = ws_sender.close().await;
                return Ok(());
            }
        };

        let (control_tx, control_rx) = mpsc::channel::<Message>(16);
        let mut writer = tokio::spawn(write_loop(ws_sender, frames, control_rx, peer));
        let mut writer_done = false;

        let outcome = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let frame = match Frame::decode(&text) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    warn!("Discarding frame from {}: {}", peer, e);
                                    continue;
                                }
                            };
                            if frame.direction() != Direction::ClientToRelay {
                                warn!("Discarding {} frame from {}: wrong direction", frame.type_name(), peer);
                                continue;
                            }
                            debug!("{} frame from {}", frame.type_name(), peer);

                            match session.handle_frame(id, frame).await {
                                Ok(()) => {}
                                Err(RelayError::Detached(_)) => break Outcome::Released,
                                Err(e @ RelayError::InputFailed { .. }) => {
                                    error!("Project {}: {}", project_id, e);
                                    if let Ok(text) = Frame::error(e.to_string()).encode() {
                                        let _ = control_tx.send(Message::Text(text)).await;
                                    }
                                    break Outcome::Failed;
                                }
                                Err(e) => warn!("Discarding frame from {}: {}", peer, e),
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            warn!("Received binary message from {} ({} bytes), ignoring", peer, data.len());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = control_tx.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) => {
                            info!("Client {} requested close", peer);
                            break Outcome::Disconnected;
                        }
                        Some(Err(e)) => {
                            error!("WebSocket error from {}: {}", peer, e);
                            break Outcome::Disconnected;
                        }
                        None => {
                            info!("Connection closed by {}", peer);
                            break Outcome::Disconnected;
                        }
                    }
                }
                _ = &mut writer => {
                    writer_done = true;
                    break Outcome::Released;
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing connection to {}", peer);
                    break Outcome::Shutdown;
                }
            }
        };

        match outcome {
            Outcome::Failed => self.relay.teardown(&session).await,
            Outcome::Shutdown => {}
            Outcome::Disconnected | Outcome::Released => self.relay.detach(&session, id).await,
        }

        drop(control_tx);
        if !writer_done && tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer).await.is_err() {
            writer.abort();
        }

        info!("Connection from {} closed", peer);
        Ok(())
    }
}

async fn send_frame(sink: &mut Sink, frame: &Frame) -> anyhow::Result<()> {
    sink.send(Message::Text(frame.encode()?)).await?;
    Ok(())
}

/// Drain session frames and control messages into the socket
///
/// Control messages (pongs, the final error notice) go first. Ends when either
/// source closes, then closes the socket.
async fn write_loop(
    mut sink: Sink,
    mut frames: mpsc::Receiver<Frame>,
    mut control: mpsc::Receiver<Message>,
    peer: SocketAddr,
) {
    loop {
        let message = tokio::select! {
            biased;
            control = control.recv() => match control {
                Some(message) => message,
                None => break,
            },
            frame = frames.recv() => match frame {
                Some(frame) => match frame.encode() {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        warn!("Dropping unencodable {} frame for {}: {}", frame.type_name(), peer, e);
                        continue;
                    }
                },
                None => {
                    debug!("Session stopped sending to {}", peer);
                    break;
                }
            },
        };

        if let Err(e) = sink.send(message).await {
            debug!("Write to {} failed: {}", peer, e);
            return;
        }
    }

    let _ = sink.close().await;
}
