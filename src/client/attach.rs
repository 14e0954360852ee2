//! Interactive `attach` front end
//!
//! Puts the local terminal in raw mode and turns stdin and window size
//! changes into [`LocalEvent`]s for a [`SessionClient`]. Local commands are
//! typed after the escape key `Ctrl-]`:
//!
//! | keys         | action               |
//! |--------------|----------------------|
//! | `Ctrl-] c`   | copy                 |
//! | `Ctrl-] v`   | paste                |
//! | `Ctrl-] r`   | restart the process  |
//! | `Ctrl-] q`   | detach               |
//! | `Ctrl-] Ctrl-]` | send `Ctrl-]`     |

use std::io::{IsTerminal, Read};
use std::time::Duration;

use crossterm::terminal;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{EmulatorView, LocalEvent, SessionClient, SessionOptions, SessionState, SystemClipboard};
use crate::protocol::{Utf8StreamDecoder, DEFAULT_TERMINAL_COLS, DEFAULT_TERMINAL_ROWS};

/// `Ctrl-]`
pub const ESCAPE_BYTE: u8 = 0x1d;

/// Window size changes closer together than this are sent once
const RESIZE_DEBOUNCE: Duration = Duration::from_millis(100);

/// Turns raw stdin bytes into local events
#[derive(Debug, Default)]
pub struct KeyDecoder {
    escaped: bool,
    utf8: Utf8StreamDecoder,
}

impl KeyDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one chunk read from stdin
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<LocalEvent> {
        let mut events = Vec::new();
        let mut plain = Vec::with_capacity(bytes.len());

        for &byte in bytes {
            if !self.escaped {
                if byte == ESCAPE_BYTE {
                    self.escaped = true;
                } else {
                    plain.push(byte);
                }
                continue;
            }

            self.escaped = false;
            let command = match byte {
                b'c' => LocalEvent::Copy,
                b'v' => LocalEvent::Paste,
                b'r' => LocalEvent::Restart,
                b'q' => LocalEvent::Detach,
                ESCAPE_BYTE => {
                    plain.push(ESCAPE_BYTE);
                    continue;
                }
                other => {
                    plain.extend_from_slice(&[ESCAPE_BYTE, other]);
                    continue;
                }
            };
            self.flush(&mut plain, &mut events);
            events.push(command);
        }

        self.flush(&mut plain, &mut events);
        events
    }

    fn flush(&mut self, plain: &mut Vec<u8>, events: &mut Vec<LocalEvent>) {
        if plain.is_empty() {
            return;
        }
        let text = self.utf8.push(plain);
        plain.clear();
        if !text.is_empty() {
            events.push(LocalEvent::Input(text));
        }
    }
}

/// Raw mode for as long as the guard lives
struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    fn enable() -> anyhow::Result<Self> {
        if !std::io::stdin().is_terminal() {
            return Ok(Self { enabled: false });
        }
        terminal::enable_raw_mode()?;
        Ok(Self { enabled: true })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.enabled {
            let _ = terminal::disable_raw_mode();
        }
    }
}

/// Read stdin on a blocking thread until EOF or the session goes away
fn spawn_stdin_reader(tx: mpsc::Sender<LocalEvent>) {
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut decoder = KeyDecoder::new();
        let mut buf = [0u8; 4096];

        loop {
            let n = match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("stdin read failed: {}", e);
                    break;
                }
            };
            for event in decoder.feed(&buf[..n]) {
                if tx.blocking_send(event).is_err() {
                    return;
                }
            }
        }
        let _ = tx.blocking_send(LocalEvent::Detach);
    });
}

/// Forward window size changes, debounced
#[cfg(unix)]
async fn watch_resize(tx: mpsc::Sender<LocalEvent>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut winch = match signal(SignalKind::window_change()) {
        Ok(winch) => winch,
        Err(e) => {
            warn!("Cannot watch window size: {}", e);
            return;
        }
    };

    while winch.recv().await.is_some() {
        while let Ok(Some(())) = tokio::time::timeout(RESIZE_DEBOUNCE, winch.recv()).await {}

        match terminal::size() {
            Ok((cols, rows)) => {
                debug!("Local terminal resized to {}x{}", cols, rows);
                if tx.send(LocalEvent::Resize { cols, rows }).await.is_err() {
                    return;
                }
            }
            Err(e) => warn!("Cannot read window size: {}", e),
        }
    }
}

/// Attach the local terminal to a relay session until detached
pub async fn run(options: SessionOptions) -> anyhow::Result<SessionState> {
    let (cols, rows) = terminal::size().unwrap_or((DEFAULT_TERMINAL_COLS, DEFAULT_TERMINAL_ROWS));
    let view = EmulatorView::new(cols, rows).with_mirror(Box::new(std::io::stdout()));
    let mut client = SessionClient::new(options, view, SystemClipboard::new());

    client.start().await?;

    let raw_mode = RawModeGuard::enable()?;
    let (local_tx, mut local_rx) = mpsc::channel(64);
    spawn_stdin_reader(local_tx.clone());
    #[cfg(unix)]
    let resize_task = tokio::spawn(watch_resize(local_tx));
    #[cfg(not(unix))]
    drop(local_tx);

    let state = client.run(&mut local_rx).await;

    #[cfg(unix)]
    resize_task.abort();
    drop(raw_mode);

    eprintln!("\r\n{}", client.status_line());
    Ok(state)
}
