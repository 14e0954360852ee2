//! Relay session
//!
//! One interactive process for one project, and the socket currently
//! attached to it. The process outlives its socket: a client that goes away
//! leaves the process running until the registry's idle timer expires.
//!
//! Per process generation there is an output pump (PTY → socket) and a
//! supervisor (waits for exit); both share a cancellation token so a
//! restart or teardown stops them together.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Project, ProjectError, SessionSettings};
use crate::protocol::{Frame, Utf8StreamDecoder, SPAWN_FAILED_EXIT_CODE};
use crate::pty::{PtyError, PtyProcess, SpawnSpec, TerminalSize};

/// Attempts at writing one input frame before the session is torn down
const INPUT_WRITE_ATTEMPTS: u32 = 3;

/// Base delay between input write attempts
const INPUT_RETRY_DELAY: Duration = Duration::from_millis(20);

/// How long buffered output may take to reach the socket after the process exits
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can occur during relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Project(#[from] ProjectError),

    #[error("Failed to start terminal: {0}")]
    Spawn(#[source] PtyError),

    #[error("Attachment {0} is no longer attached to the session")]
    Detached(Uuid),

    #[error("Failed to write input after {attempts} attempts: {source}")]
    InputFailed {
        attempts: u32,
        #[source]
        source: PtyError,
    },

    #[error("Unexpected {0} frame from client")]
    WrongDirection(&'static str),
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// The socket currently receiving this session's frames
#[derive(Debug, Clone)]
struct Attachment {
    id: Uuid,
    tx: mpsc::Sender<Frame>,
}

/// What a connection gets back when it attaches
pub struct AttachHandle {
    pub session: Arc<RelaySession>,
    pub id: Uuid,
    /// Frames for this socket, in send order
    pub frames: mpsc::Receiver<Frame>,
}

/// One spawned process and the tasks serving it
struct LiveProcess {
    process: Arc<PtyProcess>,
    cancel: CancellationToken,
    generation: u64,
    /// Whether some client has already been told this process is running
    announced: bool,
}

struct SessionInner {
    process: Option<LiveProcess>,
    last_exit: Option<i32>,
    attached: Option<Uuid>,
    /// Bumped on every attach and release so stale idle timers can tell they lost
    epoch: u64,
    idle_timer: Option<JoinHandle<()>>,
    size: TerminalSize,
    generation: u64,
    /// Set once the registry has let go of this session; nothing attaches after that
    closed: bool,
}

/// A process taken out of a closed session, still to be stopped
///
/// Produced under the registry lock, terminated after it is released.
#[must_use]
pub(crate) struct Retired {
    project_id: String,
    process: Option<Arc<PtyProcess>>,
    grace: Duration,
}

impl Retired {
    /// Stop the process: SIGHUP, the grace period, then SIGKILL
    pub(crate) async fn terminate(self) {
        let Some(process) = self.process else {
            return;
        };
        match process.terminate(self.grace).await {
            Ok(code) => debug!("Project {}: process exited with {}", self.project_id, code),
            Err(e) => warn!("Project {}: {}", self.project_id, e),
        }
    }
}

/// A project's interactive process and its (at most one) attached socket
pub struct RelaySession {
    project: Project,
    settings: Arc<SessionSettings>,
    inner: Mutex<SessionInner>,
    attachment: watch::Sender<Option<Attachment>>,
}

impl RelaySession {
    /// Create a session with no process yet
    pub(crate) fn new(project: Project, settings: Arc<SessionSettings>) -> Arc<Self> {
        let (attachment, _) = watch::channel(None);
        Arc::new(Self {
            project,
            settings,
            inner: Mutex::new(SessionInner {
                process: None,
                last_exit: None,
                attached: None,
                epoch: 0,
                idle_timer: None,
                size: TerminalSize::default(),
                generation: 0,
                closed: false,
            }),
            attachment,
        })
    }

    /// The project this session runs in
    pub fn project(&self) -> &Project {
        &self.project
    }

    /// How many processes this session has spawned
    pub async fn spawn_count(&self) -> u64 {
        self.inner.lock().await.generation
    }

    /// Pid of the live process, if any
    pub async fn current_pid(&self) -> Option<u32> {
        let inner = self.inner.lock().await;
        inner.process.as_ref().and_then(|live| live.process.pid())
    }

    /// The live process handle, if any
    pub async fn current_process(&self) -> Option<Arc<PtyProcess>> {
        let inner = self.inner.lock().await;
        inner.process.as_ref().map(|live| Arc::clone(&live.process))
    }

    /// Exit code of the last process, when it exited and was not replaced
    pub async fn last_exit(&self) -> Option<i32> {
        self.inner.lock().await.last_exit
    }

    /// Whether a socket is attached
    pub async fn is_attached(&self) -> bool {
        self.inner.lock().await.attached.is_some()
    }

    fn new_attachment(&self) -> (Attachment, mpsc::Receiver<Frame>) {
        let (tx, frames) = mpsc::channel(self.settings.attach_queue.max(2));
        (
            Attachment {
                id: Uuid::new_v4(),
                tx,
            },
            frames,
        )
    }

    fn connected_frame(&self, process: &PtyProcess, reattached: bool) -> Frame {
        Frame::Connected {
            project_name: self.project.display_name.clone(),
            project_path: self.project.working_directory.display().to_string(),
            reattached,
            pid: process.pid(),
        }
    }

    /// Spawn the first process with a socket already attached
    ///
    /// Nothing is published if the spawn fails, so the caller can drop the
    /// session without any cleanup.
    pub(crate) async fn start(self: &Arc<Self>) -> RelayResult<AttachHandle> {
        let mut inner = self.inner.lock().await;
        let (attachment, frames) = self.new_attachment();

        self.spawn_process(&mut inner, Some(&attachment)).await?;

        let id = attachment.id;
        inner.epoch += 1;
        inner.attached = Some(id);
        self.attachment.send_replace(Some(attachment));

        Ok(AttachHandle {
            session: Arc::clone(self),
            id,
            frames,
        })
    }

    /// Attach a new socket to the existing session
    ///
    /// A socket that was already attached is told it has been replaced and
    /// its frame stream ends. Returns `None` once the session is closed.
    pub(crate) async fn attach(self: &Arc<Self>) -> Option<AttachHandle> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return None;
        }
        if let Some(timer) = inner.idle_timer.take() {
            timer.abort();
        }
        inner.epoch += 1;

        if let Some(previous) = self.attachment.send_replace(None) {
            info!(
                "Project {}: attachment {} replaced by a new client",
                self.project.id, previous.id
            );
            let _ = previous
                .tx
                .try_send(Frame::error("Session was attached from another client"));
        }

        let (attachment, frames) = self.new_attachment();

        if let Some(live) = inner.process.as_mut() {
            let frame = self.connected_frame(&live.process, live.announced);
            live.announced = true;
            let _ = attachment.tx.try_send(frame);
        } else if let Some(code) = inner.last_exit {
            let _ = attachment.tx.try_send(Frame::exit(code));
        }

        let id = attachment.id;
        inner.attached = Some(id);
        self.attachment.send_replace(Some(attachment));

        Some(AttachHandle {
            session: Arc::clone(self),
            id,
            frames,
        })
    }

    /// Detach a socket; returns the idle epoch when it was the attached one
    pub(crate) async fn release(&self, id: Uuid) -> Option<u64> {
        let mut inner = self.inner.lock().await;
        if inner.attached != Some(id) {
            return None;
        }
        inner.attached = None;
        inner.epoch += 1;
        self.attachment.send_if_modified(|current| match current {
            Some(a) if a.id == id => {
                *current = None;
                true
            }
            _ => false,
        });
        Some(inner.epoch)
    }

    /// Install the idle timer for `epoch`, unless a client came back meanwhile
    pub(crate) async fn set_idle_timer(&self, epoch: u64, timer: JoinHandle<()>) {
        let mut inner = self.inner.lock().await;
        if inner.epoch == epoch && inner.attached.is_none() {
            if let Some(old) = inner.idle_timer.replace(timer) {
                old.abort();
            }
        } else {
            timer.abort();
        }
    }

    /// Close the session and take its process out for termination
    ///
    /// With `idle_since`, only closes when nothing attached since that epoch
    /// began. Returns `None` when the session stays open or was already closed.
    /// Stops the process's tasks and ends the attached socket's frame stream,
    /// but leaves the process itself to [`Retired::terminate`].
    pub(crate) async fn close(&self, idle_since: Option<u64>) -> Option<Retired> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return None;
        }
        if let Some(epoch) = idle_since {
            if inner.attached.is_some() || inner.epoch != epoch {
                return None;
            }
        }

        inner.closed = true;
        // May be the very task running this close; detach rather than abort
        inner.idle_timer.take();
        inner.attached = None;
        inner.epoch += 1;
        self.attachment.send_replace(None);

        let process = inner.process.take().map(|live| {
            live.cancel.cancel();
            live.process
        });
        Some(Retired {
            project_id: self.project.id.clone(),
            process,
            grace: self.settings.kill_grace(),
        })
    }

    /// Handle a frame received from the attached socket
    pub async fn handle_frame(self: &Arc<Self>, id: Uuid, frame: Frame) -> RelayResult<()> {
        match frame {
            Frame::Input { data } => self.write_input(id, data.as_bytes()).await,
            Frame::Resize { cols, rows } => self.resize(id, TerminalSize::new(cols, rows)).await,
            Frame::Restart => self.restart(id).await,
            other => Err(RelayError::WrongDirection(other.type_name())),
        }
    }

    async fn live_process(&self, id: Uuid) -> RelayResult<Option<Arc<PtyProcess>>> {
        let inner = self.inner.lock().await;
        if inner.attached != Some(id) {
            return Err(RelayError::Detached(id));
        }
        Ok(inner.process.as_ref().map(|live| Arc::clone(&live.process)))
    }

    async fn write_input(&self, id: Uuid, data: &[u8]) -> RelayResult<()> {
        let Some(process) = self.live_process(id).await? else {
            debug!(
                "Project {}: dropping {} input bytes, no running process",
                self.project.id,
                data.len()
            );
            return Ok(());
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match process.write(data).await {
                Ok(()) => return Ok(()),
                // The supervisor reports the exit
                Err(PtyError::ProcessExited) => return Ok(()),
                Err(e) if attempt < INPUT_WRITE_ATTEMPTS => {
                    warn!(
                        "Project {}: input write attempt {} failed: {}",
                        self.project.id, attempt, e
                    );
                    tokio::time::sleep(INPUT_RETRY_DELAY * attempt).await;
                }
                Err(source) => {
                    return Err(RelayError::InputFailed {
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    async fn resize(&self, id: Uuid, size: TerminalSize) -> RelayResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.attached != Some(id) {
            return Err(RelayError::Detached(id));
        }
        inner.size = size;

        if let Some(live) = &inner.process {
            match live.process.resize(size) {
                Ok(()) => debug!(
                    "Project {}: resized to {}x{}",
                    self.project.id, size.cols, size.rows
                ),
                Err(PtyError::ProcessExited) => {}
                Err(e) => warn!("Project {}: {}", self.project.id, e),
            }
        }
        Ok(())
    }

    /// Replace the process with a fresh one in the same directory
    ///
    /// The old process is terminated without holding the session lock; the
    /// replacement is announced to whichever socket is attached by then.
    async fn restart(self: &Arc<Self>, id: Uuid) -> RelayResult<()> {
        let old = {
            let mut inner = self.inner.lock().await;
            if inner.attached != Some(id) {
                return Err(RelayError::Detached(id));
            }
            inner.process.take()
        };

        if let Some(old) = old {
            old.cancel.cancel();
            match old.process.terminate(self.settings.kill_grace()).await {
                Ok(code) => info!(
                    "Project {}: restarting, old process exited with {}",
                    self.project.id, code
                ),
                Err(e) => warn!("Project {}: restarting: {}", self.project.id, e),
            }
        }

        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        if inner.process.is_some() {
            debug!("Project {}: already restarted by another client", self.project.id);
            return Ok(());
        }

        let attachment = self.attachment.borrow().clone();
        if let Err(e) = self.spawn_process(&mut inner, attachment.as_ref()).await {
            warn!("Project {}: restart failed: {}", self.project.id, e);
            inner.last_exit = Some(SPAWN_FAILED_EXIT_CODE);
            if let Some(attachment) = attachment {
                let _ = attachment.tx.send(Frame::error(e.to_string())).await;
                let _ = attachment.tx.send(Frame::exit(SPAWN_FAILED_EXIT_CODE)).await;
            }
        }
        Ok(())
    }

    /// Spawn a process and the tasks that serve it
    ///
    /// `announce_to` gets its `connected` frame before the output pump
    /// starts, so it always precedes the new process's output.
    async fn spawn_process(
        self: &Arc<Self>,
        inner: &mut SessionInner,
        announce_to: Option<&Attachment>,
    ) -> RelayResult<()> {
        let process = PtyProcess::spawn(SpawnSpec {
            command: &self.settings.command,
            args: &self.settings.args,
            working_dir: &self.project.working_directory,
            env: &self.settings.env,
            size: inner.size,
            output_queue: self.settings.output_queue,
        })
        .map_err(RelayError::Spawn)?;
        let process = Arc::new(process);

        let Some(output) = process.take_output() else {
            return Err(RelayError::Spawn(PtyError::SystemError(
                "output stream already taken".to_string(),
            )));
        };

        inner.generation += 1;
        let generation = inner.generation;

        let mut announced = false;
        if let Some(attachment) = announce_to {
            let frame = self.connected_frame(&process, false);
            announced = attachment.tx.send(frame).await.is_ok();
        }

        info!(
            "Project {}: started {} (pid {:?}, generation {})",
            self.project.id,
            self.settings.command,
            process.pid(),
            generation
        );

        let cancel = CancellationToken::new();
        inner.process = Some(LiveProcess {
            process: Arc::clone(&process),
            cancel: cancel.clone(),
            generation,
            announced,
        });
        inner.last_exit = None;

        let pump = tokio::spawn(Arc::clone(self).output_pump(output, cancel.clone()));
        tokio::spawn(Arc::clone(self).supervise(process, pump, cancel, generation));

        Ok(())
    }

    /// Forward process output to whichever socket is attached
    async fn output_pump(self: Arc<Self>, mut output: mpsc::Receiver<Vec<u8>>, cancel: CancellationToken) {
        let mut decoder = Utf8StreamDecoder::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return,
                chunk = output.recv() => chunk,
            };
            let Some(bytes) = chunk else { break };

            let text = decoder.push(&bytes);
            if text.is_empty() {
                continue;
            }
            if !self.deliver(Frame::output(text), &cancel).await {
                return;
            }
        }

        let tail = decoder.finish();
        if !tail.is_empty() {
            self.deliver(Frame::output(tail), &cancel).await;
        }
    }

    /// Hand a frame to the attached socket, waiting for one if none is attached
    ///
    /// Returns false when cancelled. A frame is never dropped because a socket
    /// vanished; it goes to the next one.
    async fn deliver(&self, mut frame: Frame, cancel: &CancellationToken) -> bool {
        let mut attachment_rx = self.attachment.subscribe();

        loop {
            let attached = tokio::select! {
                _ = cancel.cancelled() => return false,
                current = attachment_rx.wait_for(Option::is_some) => current.is_ok(),
            };
            if !attached {
                return false;
            }
            let Some(attachment) = attachment_rx.borrow().clone() else {
                continue;
            };

            let sent = tokio::select! {
                _ = cancel.cancelled() => return false,
                sent = attachment.tx.send(frame) => sent,
            };
            match sent {
                Ok(()) => return true,
                Err(mpsc::error::SendError(returned)) => {
                    frame = returned;
                    // The socket is gone but not yet released; stop waiting on it
                    self.attachment.send_if_modified(|current| match current {
                        Some(a) if a.id == attachment.id => {
                            *current = None;
                            true
                        }
                        _ => false,
                    });
                }
            }
        }
    }

    /// Wait for the process to exit, then report it
    async fn supervise(
        self: Arc<Self>,
        process: Arc<PtyProcess>,
        pump: JoinHandle<()>,
        cancel: CancellationToken,
        generation: u64,
    ) {
        let code = tokio::select! {
            _ = cancel.cancelled() => return,
            code = process.wait() => code,
        };
        debug!(
            "Project {}: process generation {} exited with {}",
            self.project.id, generation, code
        );

        let drained = tokio::select! {
            _ = cancel.cancelled() => return,
            drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, pump) => drained.is_ok(),
        };
        if !drained {
            debug!(
                "Project {}: output did not drain after exit, discarding the rest",
                self.project.id
            );
        }

        self.record_exit(generation, code).await;
    }

    /// Retire the process and tell the attached socket, if any
    async fn record_exit(&self, generation: u64, code: i32) {
        let mut inner = self.inner.lock().await;
        match &inner.process {
            Some(live) if live.generation == generation => {}
            _ => return,
        }
        if let Some(live) = inner.process.take() {
            live.cancel.cancel();
        }
        inner.last_exit = Some(code);
        info!("Project {}: process exited with code {}", self.project.id, code);

        let attachment = self.attachment.borrow().clone();
        if let Some(attachment) = attachment {
            let _ = attachment.tx.send(Frame::exit(code)).await;
        }
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        // Tasks hold their own Arc, so this only runs once they are gone
        if let Ok(inner) = self.inner.try_lock() {
            if let Some(live) = &inner.process {
                live.cancel.cancel();
            }
        }
    }
}
