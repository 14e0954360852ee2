//! Session client
//!
//! Drives one attachment to a relay session:
//!
//! ```text
//! Idle -> Connecting -> Attached -> Ended | Errored
//! ```
//!
//! Relay frames, connection status changes and local events all go through
//! one loop ([`SessionClient::step`]). The terminal view is owned here and
//! nowhere else.

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{
    Clipboard, Connection, ConnectionError, ConnectionResult, ConnectionStatus, TerminalView,
};
use crate::protocol::Frame;

/// Lines copied when nothing is selected
const COPY_FALLBACK_LINES: usize = 10;

/// Inbound frames buffered between the socket reader and the session loop
const INBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Attached,
    Ended,
    Errored,
}

/// Something the local user did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    /// Keystrokes or pasted text
    Input(String),
    /// The local terminal changed size
    Resize { cols: u16, rows: u16 },
    Restart,
    Copy,
    Paste,
    Detach,
}

/// Where and as whom to attach
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub endpoint: String,
    pub project_id: String,
    pub token: Option<String>,
}

/// Client side of one terminal session
pub struct SessionClient<V: TerminalView, C: Clipboard> {
    options: SessionOptions,
    connection: Connection,
    view: V,
    clipboard: C,
    state: SessionState,
    frames: mpsc::Receiver<Frame>,
    status: watch::Receiver<ConnectionStatus>,
    project_name: Option<String>,
    exit_code: Option<i32>,
    error: Option<String>,
}

impl<V: TerminalView, C: Clipboard> SessionClient<V, C> {
    pub fn new(options: SessionOptions, view: V, clipboard: C) -> Self {
        let connection = Connection::new();
        let (frames_tx, frames) = mpsc::channel(INBOUND_QUEUE);
        connection.on_frame(frames_tx);
        let status = connection.subscribe_status();

        Self {
            options,
            connection,
            view,
            clipboard,
            state: SessionState::Idle,
            frames,
            status,
            project_name: None,
            exit_code: None,
            error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut V {
        &mut self.view
    }

    pub fn clipboard(&self) -> &C {
        &self.clipboard
    }

    /// Exit code of the last process, once it has exited
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// One-line description for a status bar
    pub fn status_line(&self) -> String {
        match self.state {
            SessionState::Idle => "idle".to_string(),
            SessionState::Connecting => format!("connecting to {}", self.options.project_id),
            SessionState::Attached => format!(
                "connected: {}",
                self.project_name.as_deref().unwrap_or(&self.options.project_id)
            ),
            SessionState::Ended => match self.exit_code {
                Some(code) => format!("disconnected (exit {})", code),
                None => "disconnected".to_string(),
            },
            SessionState::Errored => {
                format!("error: {}", self.error.as_deref().unwrap_or("unknown"))
            }
        }
    }

    /// Open the connection
    pub async fn start(&mut self) -> ConnectionResult<()> {
        if self.state != SessionState::Idle {
            return Err(ConnectionError::AlreadyOpen);
        }
        self.state = SessionState::Connecting;

        let result = self
            .connection
            .open(
                &self.options.endpoint,
                self.options.token.as_deref(),
                &self.options.project_id,
            )
            .await;

        if let Err(e) = &result {
            self.fail(format!("Connection failed: {}", e));
        }
        result
    }

    fn fail(&mut self, message: String) {
        warn!("{}", message);
        self.view.notice(&message);
        self.error = Some(message);
        self.state = SessionState::Errored;
    }

    async fn send(&mut self, frame: Frame) {
        let frame_type = frame.type_name();
        if let Err(e) = self.connection.send(frame).await {
            warn!("Dropping {} frame: {}", frame_type, e);
        }
    }

    async fn send_size(&mut self) {
        let (cols, rows) = self.view.size();
        self.send(Frame::resize(cols, rows)).await;
    }

    /// Apply a frame from the relay
    pub async fn handle_frame(&mut self, frame: Frame) {
        if self.state == SessionState::Errored {
            debug!("Ignoring {} frame after error", frame.type_name());
            return;
        }

        match frame {
            Frame::Connected {
                project_name,
                project_path,
                reattached,
                pid,
            } => {
                info!(
                    "Attached to {} at {} (pid {:?}, reattached: {})",
                    project_name, project_path, pid, reattached
                );
                self.view.annotate(&project_name, &project_path, reattached);
                self.project_name = Some(project_name);
                self.exit_code = None;
                self.state = SessionState::Attached;
                self.send_size().await;
            }
            Frame::Output { data } => {
                if self.state == SessionState::Attached {
                    self.view.write(&data);
                } else {
                    debug!("Dropping output while {:?}", self.state);
                }
            }
            Frame::Exit { exit_code } => {
                info!("Process exited with code {}", exit_code);
                self.exit_code = Some(exit_code);
                self.state = SessionState::Ended;
                self.view
                    .notice(&format!("Process exited with code {}", exit_code));
            }
            Frame::Error { message } => {
                self.fail(format!("Error: {}", message));
            }
            other => {
                warn!("Discarding {} frame from relay: wrong direction", other.type_name());
            }
        }
    }

    /// React to a connection status change
    pub fn handle_status(&mut self, status: ConnectionStatus) {
        debug!("Connection status: {}", status.label());
        match status {
            ConnectionStatus::Error(message) if self.state != SessionState::Errored => {
                self.fail(format!("Connection error: {}", message));
            }
            ConnectionStatus::Disconnected
                if matches!(self.state, SessionState::Attached | SessionState::Connecting) =>
            {
                self.state = SessionState::Ended;
                self.view.notice("Disconnected from relay");
            }
            _ => {}
        }
    }

    /// Apply a local event; returns false once the session should stop
    pub async fn handle_local(&mut self, event: LocalEvent) -> bool {
        match event {
            LocalEvent::Input(data) => {
                if self.state == SessionState::Attached {
                    self.send(Frame::input(data)).await;
                } else {
                    warn!("Dropping {} bytes of input while {:?}", data.len(), self.state);
                }
            }
            LocalEvent::Resize { cols, rows } => {
                self.view.resize(cols, rows);
                if self.state == SessionState::Attached {
                    self.send_size().await;
                }
            }
            LocalEvent::Restart => {
                if matches!(self.state, SessionState::Attached | SessionState::Ended) {
                    self.view.notice("Restarting...");
                    self.send(Frame::Restart).await;
                }
            }
            LocalEvent::Copy => self.copy(),
            LocalEvent::Paste => self.paste().await,
            LocalEvent::Detach => {
                self.connection.close().await;
                return false;
            }
        }
        true
    }

    fn copy(&mut self) {
        let text = self
            .view
            .selection()
            .unwrap_or_else(|| self.view.last_lines(COPY_FALLBACK_LINES).join("\n"));

        match self.clipboard.set_text(&text) {
            Ok(()) => self.view.notice(&format!("Copied {} characters", text.chars().count())),
            Err(e) => self.view.notice(&format!("Copy failed: {}", e)),
        }
    }

    async fn paste(&mut self) {
        match self.clipboard.get_text() {
            Ok(text) if self.state == SessionState::Attached => {
                if let Err(e) = self.connection.send(Frame::input(text)).await {
                    self.view.notice(&format!("Paste failed: {}", e));
                }
            }
            Ok(_) => warn!("Dropping paste while {:?}", self.state),
            Err(e) => self.view.notice(&format!("Paste failed: {}", e)),
        }
    }

    /// Handle the next event from any source
    ///
    /// Queued relay frames are handled before status changes, so the frames
    /// that preceded a close are never lost to it. Returns false once the
    /// session is over.
    pub async fn step(&mut self, local: &mut mpsc::Receiver<LocalEvent>) -> bool {
        tokio::select! {
            biased;
            Some(frame) = self.frames.recv() => {
                self.handle_frame(frame).await;
            }
            changed = self.status.changed() => {
                if changed.is_err() {
                    return false;
                }
                let status = self.status.borrow_and_update().clone();
                self.handle_status(status);
            }
            event = local.recv() => {
                let Some(event) = event else {
                    self.connection.close().await;
                    return false;
                };
                if !self.handle_local(event).await {
                    return false;
                }
            }
        }
        self.state != SessionState::Errored
    }

    /// Run until detached, the local side goes away, or the session errors
    pub async fn run(&mut self, local: &mut mpsc::Receiver<LocalEvent>) -> SessionState {
        while self.step(local).await {}
        self.state
    }
}
