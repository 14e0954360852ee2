//! PTY process management
//!
//! Handles spawning processes with PTY terminal emulation, including:
//! - Configurable terminal size
//! - Bounded output streaming (the reader stops when the queue is full)
//! - Terminal resize support
//! - Two-step termination: hangup, then kill after a grace period

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::protocol::{DEFAULT_TERMINAL_COLS, DEFAULT_TERMINAL_ROWS};

/// Size of a single PTY read
const READ_CHUNK_SIZE: usize = 4096;

/// Exit code recorded when the wait itself fails
const UNKNOWN_EXIT_CODE: i32 = -1;

/// Errors that can occur during PTY operations
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY: {0}")]
    OpenFailed(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to write to PTY: {0}")]
    WriteFailed(String),

    #[error("Failed to resize PTY: {0}")]
    ResizeFailed(String),

    #[error("Failed to kill process: {0}")]
    KillFailed(String),

    #[error("Process already exited")]
    ProcessExited,

    #[error("PTY system error: {0}")]
    SystemError(String),
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

/// Terminal size configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            cols: DEFAULT_TERMINAL_COLS,
            rows: DEFAULT_TERMINAL_ROWS,
        }
    }
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Convert to portable-pty PtySize
    fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// What to run inside the PTY
#[derive(Debug, Clone)]
pub struct SpawnSpec<'a> {
    pub command: &'a str,
    pub args: &'a [String],
    pub working_dir: &'a Path,
    pub env: &'a HashMap<String, String>,
    pub size: TerminalSize,
    /// Capacity of the output queue, in read chunks
    pub output_queue: usize,
}

/// Handle to a running PTY process
///
/// Dropping the handle force-kills the child, so a handle that goes out of
/// scope on any path never leaves the process behind.
pub struct PtyProcess {
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    size: Mutex<TerminalSize>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    output_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl PtyProcess {
    /// Spawn a new process attached to a fresh PTY
    pub fn spawn(spec: SpawnSpec<'_>) -> PtyResult<Self> {
        if !spec.working_dir.is_dir() {
            return Err(PtyError::SpawnFailed(format!(
                "working directory does not exist: {}",
                spec.working_dir.display()
            )));
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(spec.size.to_pty_size())
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(spec.command);
        cmd.args(spec.args);
        cmd.cwd(spec.working_dir);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in spec.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("{}: {}", spec.command, e)))?;

        // Only the child keeps the slave side open, so the reader sees EOF when it exits
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = match pair.master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                let _ = child.kill();
                return Err(PtyError::SystemError(e.to_string()));
            }
        };
        let writer = match pair.master.take_writer() {
            Ok(writer) => writer,
            Err(e) => {
                let _ = child.kill();
                return Err(PtyError::SystemError(e.to_string()));
            }
        };

        let (output_tx, output_rx) = mpsc::channel(spec.output_queue.max(1));
        let (exit_tx, exit_rx) = watch::channel(None);

        std::thread::spawn(move || Self::reader_loop(reader, output_tx));

        std::thread::spawn(move || {
            let code = match child.wait() {
                Ok(status) => i32::try_from(status.exit_code()).unwrap_or(UNKNOWN_EXIT_CODE),
                Err(e) => {
                    warn!("Failed to wait for process: {}", e);
                    UNKNOWN_EXIT_CODE
                }
            };
            let _ = exit_tx.send(Some(code));
        });

        debug!(
            "Spawned {} (pid {:?}) in {}",
            spec.command,
            pid,
            spec.working_dir.display()
        );

        Ok(Self {
            pid,
            master: Mutex::new(pair.master),
            size: Mutex::new(spec.size),
            writer: Arc::new(Mutex::new(writer)),
            killer: Mutex::new(killer),
            output_rx: Mutex::new(Some(output_rx)),
            exit_rx,
        })
    }

    /// Reader loop that runs in a separate thread
    ///
    /// `blocking_send` parks the thread while the queue is full, which stops
    /// draining the PTY and eventually blocks the process's own writes.
    fn reader_loop(mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<Vec<u8>>) {
        let mut buffer = [0u8; READ_CHUNK_SIZE];

        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                // EIO once the slave side is closed
                Err(_) => break,
            }
        }
    }

    /// OS process id, when the platform reports one
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Get the current terminal size
    pub fn size(&self) -> TerminalSize {
        self.size.lock().map(|s| *s).unwrap_or_default()
    }

    /// Exit code, once the process has exited
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Check if the process has exited
    pub fn has_exited(&self) -> bool {
        self.exit_code().is_some()
    }

    /// Take the output stream; only one consumer ever gets it
    pub fn take_output(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.output_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Wait for the process to exit and return its exit code
    pub async fn wait(&self) -> i32 {
        let mut rx = self.exit_rx.clone();
        let code = match rx.wait_for(|code| code.is_some()).await {
            Ok(code) => (*code).unwrap_or(UNKNOWN_EXIT_CODE),
            Err(_) => UNKNOWN_EXIT_CODE,
        };
        code
    }

    /// Write input to the PTY (stdin)
    ///
    /// The write runs on the blocking pool because a process that stops
    /// reading its terminal makes the write block.
    pub async fn write(&self, data: &[u8]) -> PtyResult<()> {
        if self.has_exited() {
            return Err(PtyError::ProcessExited);
        }

        let writer = Arc::clone(&self.writer);
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut writer = writer
                .lock()
                .map_err(|_| PtyError::WriteFailed("writer lock poisoned".to_string()))?;
            writer
                .write_all(&data)
                .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
            writer
                .flush()
                .map_err(|e| PtyError::WriteFailed(e.to_string()))
        })
        .await
        .map_err(|e| PtyError::WriteFailed(e.to_string()))?
    }

    /// Write a string to the PTY
    pub async fn write_str(&self, s: &str) -> PtyResult<()> {
        self.write(s.as_bytes()).await
    }

    /// Resize the terminal
    pub fn resize(&self, size: TerminalSize) -> PtyResult<()> {
        if self.has_exited() {
            return Err(PtyError::ProcessExited);
        }

        let master = self
            .master
            .lock()
            .map_err(|_| PtyError::ResizeFailed("master lock poisoned".to_string()))?;
        master
            .resize(size.to_pty_size())
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;

        if let Ok(mut current) = self.size.lock() {
            *current = size;
        }
        Ok(())
    }

    /// Terminate the process: hang up, then kill once `grace` has passed
    ///
    /// Returns the exit code the process finished with.
    pub async fn terminate(&self, grace: Duration) -> PtyResult<i32> {
        if let Some(code) = self.exit_code() {
            return Ok(code);
        }

        self.hangup();
        if let Ok(code) = tokio::time::timeout(grace, self.wait()).await {
            return Ok(code);
        }

        debug!("Process {:?} ignored hangup, killing", self.pid);
        self.kill()?;
        tokio::time::timeout(grace, self.wait())
            .await
            .map_err(|_| PtyError::KillFailed(format!("process {:?} did not exit", self.pid)))
    }

    /// Send SIGHUP, the signal a closing terminal delivers
    fn hangup(&self) {
        #[cfg(unix)]
        self.signal(nix::sys::signal::Signal::SIGHUP);
    }

    /// Forcefully kill the process
    pub fn kill(&self) -> PtyResult<()> {
        if self.has_exited() {
            return Ok(());
        }

        #[cfg(unix)]
        if self.signal(nix::sys::signal::Signal::SIGKILL) {
            return Ok(());
        }

        // portable-pty's killer only hangs up on unix, so it is the fallback there
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| PtyError::KillFailed("killer lock poisoned".to_string()))?;
        killer
            .kill()
            .map_err(|e| PtyError::KillFailed(e.to_string()))
    }

    /// Deliver a signal to the child; false when there is no pid to signal
    #[cfg(unix)]
    fn signal(&self, signal: nix::sys::signal::Signal) -> bool {
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return false;
        };
        if let Err(e) = nix::sys::signal::kill(Pid::from_raw(pid), signal) {
            debug!("{:?} to {} failed: {}", signal, pid, e);
        }
        true
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if !self.has_exited() {
            let _ = self.kill();
        }
    }
}
