//! Process registry
//!
//! Keeps at most one relay session per project. A reconnecting client is
//! handed the running session; a session left detached past the idle window
//! is terminated and forgotten.
//!
//! The registry lock is only held to look up, insert or retire entries.
//! Terminating a process happens after it is released, so one project
//! shutting down never stalls another project's clients.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::session::Retired;
use super::{AttachHandle, RelayResult, RelaySession};
use crate::config::{ProjectStore, SessionSettings};

/// A registry entry
#[derive(Clone)]
enum Slot {
    Live(Arc<RelaySession>),
    /// Closed and still terminating; `done` fires once the process is gone
    Retiring {
        session: Arc<RelaySession>,
        done: CancellationToken,
    },
}

/// Registry of relay sessions, keyed by project id
///
/// Lock order is registry first, then a session's own state.
pub struct Relay {
    sessions: Mutex<HashMap<String, Slot>>,
    projects: Arc<dyn ProjectStore>,
    settings: Arc<SessionSettings>,
}

impl Relay {
    pub fn new(projects: Arc<dyn ProjectStore>, settings: SessionSettings) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            projects,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Get the number of sessions, counting ones still terminating
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Look up the live session for a project
    pub async fn session(&self, project_id: &str) -> Option<Arc<RelaySession>> {
        match self.sessions.lock().await.get(project_id) {
            Some(Slot::Live(session)) => Some(Arc::clone(session)),
            _ => None,
        }
    }

    /// Attach to a project's session, spawning its process if none is running
    ///
    /// Nothing is registered when the project is unknown or the spawn fails.
    /// A project whose previous session is still terminating gets a fresh
    /// process once the old one is gone.
    pub async fn attach(&self, project_id: &str) -> RelayResult<AttachHandle> {
        loop {
            let mut sessions = self.sessions.lock().await;

            match sessions.get(project_id).cloned() {
                Some(Slot::Live(session)) => {
                    drop(sessions);
                    debug!("Reattaching to running session for project {}", project_id);
                    if let Some(handle) = session.attach().await {
                        return Ok(handle);
                    }
                    // Closed after the lookup; its entry is retiring or gone by now
                }
                Some(Slot::Retiring { done, .. }) => {
                    drop(sessions);
                    debug!("Waiting for project {} to finish terminating", project_id);
                    done.cancelled().await;
                }
                None => {
                    let project = self.projects.resolve(project_id)?;
                    let session = RelaySession::new(project, Arc::clone(&self.settings));
                    let handle = session.start().await?;

                    sessions.insert(project_id.to_string(), Slot::Live(session));
                    info!("Session created for project {}", project_id);
                    return Ok(handle);
                }
            }
        }
    }

    /// Detach a socket and start the idle window
    ///
    /// A no-op when `attach_id` was already replaced by another client.
    pub async fn detach(self: &Arc<Self>, session: &Arc<RelaySession>, attach_id: Uuid) {
        let Some(epoch) = session.release(attach_id).await else {
            return;
        };

        let idle = self.settings.idle_timeout();
        info!(
            "Client left project {}; keeping process for {:?}",
            session.project().id,
            idle
        );

        let relay = Arc::clone(self);
        let expiring = Arc::clone(session);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            relay.expire(&expiring, epoch).await;
        });
        session.set_idle_timer(epoch, timer).await;
    }

    /// Terminate a session that stayed detached for a whole idle window
    async fn expire(&self, session: &Arc<RelaySession>, epoch: u64) {
        if let Some((retired, done)) = self.retire(session, Some(epoch)).await {
            info!(
                "Idle window elapsed for project {}; terminating",
                session.project().id
            );
            self.finish(session, retired, done).await;
        }
    }

    /// Terminate a session immediately
    pub async fn teardown(&self, session: &Arc<RelaySession>) {
        if let Some((retired, done)) = self.retire(session, None).await {
            info!("Tearing down session for project {}", session.project().id);
            self.finish(session, retired, done).await;
        }
    }

    /// Close a registered session and leave a retiring entry in its place
    async fn retire(
        &self,
        session: &Arc<RelaySession>,
        idle_since: Option<u64>,
    ) -> Option<(Retired, CancellationToken)> {
        let mut sessions = self.sessions.lock().await;
        let key = session.project().id.as_str();

        match sessions.get(key) {
            Some(Slot::Live(current)) if Arc::ptr_eq(current, session) => {}
            _ => return None,
        }
        let retired = session.close(idle_since).await?;

        let done = CancellationToken::new();
        sessions.insert(
            key.to_string(),
            Slot::Retiring {
                session: Arc::clone(session),
                done: done.clone(),
            },
        );
        Some((retired, done))
    }

    /// Stop a retired process outside the registry lock, then drop its entry
    async fn finish(&self, session: &Arc<RelaySession>, retired: Retired, done: CancellationToken) {
        retired.terminate().await;

        let mut sessions = self.sessions.lock().await;
        let key = session.project().id.as_str();
        if matches!(sessions.get(key), Some(Slot::Retiring { session: current, .. }) if Arc::ptr_eq(current, session))
        {
            sessions.remove(key);
        }
        drop(sessions);
        done.cancel();
    }

    /// Terminate every session
    pub async fn shutdown_all(&self) {
        let mut retired = Vec::new();
        {
            let mut sessions = self.sessions.lock().await;
            let drained: Vec<_> = sessions.drain().collect();
            info!("Shutting down {} session(s)", drained.len());

            for (_, slot) in drained {
                if let Slot::Live(session) = slot {
                    retired.extend(session.close(None).await);
                }
            }
        }

        futures_util::future::join_all(retired.into_iter().map(Retired::terminate)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProjectCatalog, ProjectEntry, ProjectError};
    use crate::protocol::Frame;
    use crate::relay::RelayError;
    use std::path::Path;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;
    use tokio::time::timeout;

    // ========================================================================
    // Helpers
    // ========================================================================

    fn relay_for(dir: &Path, settings: SessionSettings) -> Arc<Relay> {
        let catalog = ProjectCatalog::new(
            vec![ProjectEntry {
                id: "p".to_string(),
                name: Some("P".to_string()),
                path: dir.to_path_buf(),
            }],
            None,
        );
        Arc::new(Relay::new(Arc::new(catalog), settings))
    }

    fn shell_settings() -> SessionSettings {
        let mut settings = SessionSettings::with_command("sh");
        settings.idle_timeout_ms = 300;
        settings.kill_grace_ms = 500;
        settings
    }

    fn script_settings(script: &str) -> SessionSettings {
        let mut settings = shell_settings();
        settings.args = vec!["-c".to_string(), script.to_string()];
        settings
    }

    async fn next_frame(handle: &mut AttachHandle) -> Frame {
        timeout(Duration::from_secs(5), handle.frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("frame stream closed")
    }

    /// Collect output until it contains `needle`
    async fn output_until(handle: &mut AttachHandle, needle: &str) -> String {
        let mut output = String::new();
        while !output.contains(needle) {
            match next_frame(handle).await {
                Frame::Output { data } => output.push_str(&data),
                other => panic!("unexpected frame {:?} while waiting for {:?}", other, needle),
            }
        }
        output
    }

    /// Collect output until the exit frame, returning both
    async fn output_until_exit(handle: &mut AttachHandle) -> (String, i32) {
        let mut output = String::new();
        loop {
            match next_frame(handle).await {
                Frame::Output { data } => output.push_str(&data),
                Frame::Exit { exit_code } => return (output, exit_code),
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }

    fn connected_pid(frame: Frame, expect_reattached: bool) -> u32 {
        match frame {
            Frame::Connected {
                reattached, pid, ..
            } => {
                assert_eq!(reattached, expect_reattached);
                pid.expect("connected frame without pid")
            }
            other => panic!("expected connected, got {:?}", other),
        }
    }

    // ========================================================================
    // Attach
    // ========================================================================

    #[tokio::test]
    async fn test_attach_announces_project() {
        let dir = tempdir().unwrap();
        let relay = relay_for(dir.path(), shell_settings());

        let mut handle = relay.attach("p").await.unwrap();
        match next_frame(&mut handle).await {
            Frame::Connected {
                project_name,
                project_path,
                reattached,
                pid,
            } => {
                assert_eq!(project_name, "P");
                assert_eq!(project_path, dir.path().display().to_string());
                assert!(!reattached);
                assert!(pid.is_some());
            }
            other => panic!("expected connected, got {:?}", other),
        }
        assert_eq!(relay.session_count().await, 1);

        relay.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_unknown_project_registers_nothing() {
        let dir = tempdir().unwrap();
        let relay = relay_for(dir.path(), shell_settings());

        let result = relay.attach("ghost").await;
        assert!(matches!(
            result,
            Err(RelayError::Project(ProjectError::NotFound(ref id))) if id == "ghost"
        ));
        assert_eq!(relay.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_registers_nothing() {
        let dir = tempdir().unwrap();
        let relay = relay_for(
            dir.path(),
            SessionSettings::with_command("/nonexistent/definitely-not-a-shell"),
        );

        let result = relay.attach("p").await;
        assert!(matches!(result, Err(RelayError::Spawn(_))));
        assert_eq!(relay.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_attaches_share_one_process() {
        let dir = tempdir().unwrap();
        let relay = relay_for(dir.path(), shell_settings());

        let (a, b) = tokio::join!(relay.attach("p"), relay.attach("p"));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a.session, &b.session));
        assert_eq!(a.session.spawn_count().await, 1);
        assert_eq!(relay.session_count().await, 1);

        relay.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_second_client_takes_over() {
        let dir = tempdir().unwrap();
        let relay = relay_for(dir.path(), shell_settings());

        let mut first = relay.attach("p").await.unwrap();
        connected_pid(next_frame(&mut first).await, false);

        let mut second = relay.attach("p").await.unwrap();
        connected_pid(next_frame(&mut second).await, true);

        // Prompt output may already be queued ahead of the notice
        loop {
            match next_frame(&mut first).await {
                Frame::Output { .. } => continue,
                Frame::Error { .. } => break,
                other => panic!("expected takeover notice, got {:?}", other),
            }
        }
        timeout(Duration::from_secs(5), async {
            while let Some(frame) = first.frames.recv().await {
                assert!(matches!(frame, Frame::Output { .. }));
            }
        })
        .await
        .unwrap();

        let stale = first
            .session
            .handle_frame(first.id, Frame::input("ls\n"))
            .await;
        assert!(matches!(stale, Err(RelayError::Detached(_))));

        relay.shutdown_all().await;
    }

    // ========================================================================
    // Input, output and resize
    // ========================================================================

    #[tokio::test]
    async fn test_input_reaches_process_byte_for_byte() {
        let dir = tempdir().unwrap();
        let relay = relay_for(
            dir.path(),
            script_settings("stty raw -echo; echo ready; head -c 15 > received.bin"),
        );

        let mut handle = relay.attach("p").await.unwrap();
        connected_pid(next_frame(&mut handle).await, false);
        output_until(&mut handle, "ready").await;

        for chunk in ["abc", "\u{1b}[A", "héllo", "\t\u{3}", "z"] {
            handle
                .session
                .handle_frame(handle.id, Frame::input(chunk))
                .await
                .unwrap();
        }

        let (_, code) = output_until_exit(&mut handle).await;
        assert_eq!(code, 0);

        let received = std::fs::read(dir.path().join("received.bin")).unwrap();
        assert_eq!(received, "abc\u{1b}[Ahéllo\t\u{3}z".as_bytes());
    }

    #[tokio::test]
    async fn test_output_arrives_in_order() {
        let dir = tempdir().unwrap();
        let relay = relay_for(
            dir.path(),
            script_settings("i=1; while [ $i -le 300 ]; do echo line-$i; i=$((i+1)); done"),
        );

        let mut handle = relay.attach("p").await.unwrap();
        connected_pid(next_frame(&mut handle).await, false);

        let (output, code) = output_until_exit(&mut handle).await;
        assert_eq!(code, 0);

        let lines: Vec<&str> = output
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with("line-"))
            .collect();
        let expected: Vec<String> = (1..=300).map(|i| format!("line-{}", i)).collect();
        assert_eq!(lines, expected);
    }

    #[tokio::test]
    async fn test_resize_applies_to_process() {
        let dir = tempdir().unwrap();
        let relay = relay_for(dir.path(), shell_settings());

        let mut handle = relay.attach("p").await.unwrap();
        connected_pid(next_frame(&mut handle).await, false);

        let session = Arc::clone(&handle.session);
        session
            .handle_frame(handle.id, Frame::resize(120, 40))
            .await
            .unwrap();
        session
            .handle_frame(handle.id, Frame::input("stty size\n"))
            .await
            .unwrap();

        output_until(&mut handle, "40 120").await;
        relay.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_relay_bound_frames_are_rejected() {
        let dir = tempdir().unwrap();
        let relay = relay_for(dir.path(), shell_settings());

        let handle = relay.attach("p").await.unwrap();
        let result = handle
            .session
            .handle_frame(handle.id, Frame::output("spoofed"))
            .await;
        assert!(matches!(result, Err(RelayError::WrongDirection("output"))));

        relay.shutdown_all().await;
    }

    // ========================================================================
    // Exit
    // ========================================================================

    #[tokio::test]
    async fn test_exit_follows_final_output() {
        let dir = tempdir().unwrap();
        let relay = relay_for(dir.path(), script_settings("echo bye; exit 5"));

        let mut handle = relay.attach("p").await.unwrap();
        connected_pid(next_frame(&mut handle).await, false);

        let (output, code) = output_until_exit(&mut handle).await;
        assert!(output.contains("bye"));
        assert_eq!(code, 5);
        assert_eq!(handle.session.last_exit().await, Some(5));
    }

    #[tokio::test]
    async fn test_exit_while_detached_is_reported_on_reattach() {
        let dir = tempdir().unwrap();
        let mut settings = script_settings("sleep 0.3; exit 7");
        settings.idle_timeout_ms = 10_000;
        let relay = relay_for(dir.path(), settings);

        let handle = relay.attach("p").await.unwrap();
        let session = Arc::clone(&handle.session);
        relay.detach(&session, handle.id).await;
        drop(handle);

        timeout(Duration::from_secs(5), async {
            while session.last_exit().await.is_none() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let mut again = relay.attach("p").await.unwrap();
        assert_eq!(next_frame(&mut again).await, Frame::exit(7));

        relay.shutdown_all().await;
    }

    // ========================================================================
    // Reattach and idle expiry
    // ========================================================================

    #[tokio::test]
    async fn test_reattach_within_idle_window() {
        let dir = tempdir().unwrap();
        let mut settings = shell_settings();
        settings.idle_timeout_ms = 5_000;
        let relay = relay_for(dir.path(), settings);

        let mut first = relay.attach("p").await.unwrap();
        let pid = connected_pid(next_frame(&mut first).await, false);
        relay.detach(&first.session, first.id).await;
        assert!(!first.session.is_attached().await);

        let mut second = relay.attach("p").await.unwrap();
        assert_eq!(connected_pid(next_frame(&mut second).await, true), pid);
        assert_eq!(second.session.spawn_count().await, 1);
        assert_eq!(relay.session_count().await, 1);

        // The cancelled idle timer must not fire later
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(second.session.current_pid().await, Some(pid));

        relay.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_idle_window_expiry_terminates_process() {
        let dir = tempdir().unwrap();
        let relay = relay_for(dir.path(), shell_settings());

        let mut handle = relay.attach("p").await.unwrap();
        let old_pid = connected_pid(next_frame(&mut handle).await, false);
        let process = handle.session.current_process().await.unwrap();
        relay.detach(&handle.session, handle.id).await;

        timeout(Duration::from_secs(5), async {
            while relay.session_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert!(process.has_exited());

        let mut fresh = relay.attach("p").await.unwrap();
        let new_pid = connected_pid(next_frame(&mut fresh).await, false);
        assert_ne!(new_pid, old_pid);

        relay.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_detach_with_stale_id_is_ignored() {
        let dir = tempdir().unwrap();
        let relay = relay_for(dir.path(), shell_settings());

        let first = relay.attach("p").await.unwrap();
        let second = relay.attach("p").await.unwrap();

        relay.detach(&first.session, first.id).await;
        assert!(second.session.is_attached().await);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(relay.session_count().await, 1);

        relay.shutdown_all().await;
    }

    // ========================================================================
    // Restart and teardown
    // ========================================================================

    #[tokio::test]
    async fn test_restart_replaces_process() {
        let dir = tempdir().unwrap();
        let relay = relay_for(dir.path(), shell_settings());

        let mut handle = relay.attach("p").await.unwrap();
        let old_pid = connected_pid(next_frame(&mut handle).await, false);
        let old_process = handle.session.current_process().await.unwrap();

        handle
            .session
            .handle_frame(handle.id, Frame::Restart)
            .await
            .unwrap();

        let new_pid = loop {
            match next_frame(&mut handle).await {
                Frame::Output { .. } => continue,
                frame => break connected_pid(frame, false),
            }
        };
        assert_ne!(new_pid, old_pid);
        assert!(old_process.has_exited());
        assert_eq!(handle.session.spawn_count().await, 2);

        handle
            .session
            .handle_frame(handle.id, Frame::input("echo after-restart\n"))
            .await
            .unwrap();
        output_until(&mut handle, "after-restart").await;

        relay.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_teardown_removes_session() {
        let dir = tempdir().unwrap();
        let relay = relay_for(dir.path(), shell_settings());

        let handle = relay.attach("p").await.unwrap();
        let process = handle.session.current_process().await.unwrap();

        relay.teardown(&handle.session).await;
        assert_eq!(relay.session_count().await, 0);
        assert!(process.has_exited());
    }

    #[tokio::test]
    async fn test_expiring_session_does_not_stall_other_projects() {
        let dir = tempdir().unwrap();
        let mut settings = script_settings("trap '' HUP; echo ready; while :; do sleep 1; done");
        settings.idle_timeout_ms = 100;
        settings.kill_grace_ms = 2_000;
        let entry = |id: &str| ProjectEntry {
            id: id.to_string(),
            name: None,
            path: dir.path().to_path_buf(),
        };
        let catalog = ProjectCatalog::new(vec![entry("p"), entry("q")], None);
        let relay = Arc::new(Relay::new(Arc::new(catalog), settings));

        let mut p = relay.attach("p").await.unwrap();
        connected_pid(next_frame(&mut p).await, false);
        output_until(&mut p, "ready").await;
        let p_process = p.session.current_process().await.unwrap();
        relay.detach(&p.session, p.id).await;

        // The idle timer has fired; p ignores SIGHUP and sits out its grace period
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!p_process.has_exited());

        let started = Instant::now();
        let mut q = relay.attach("q").await.unwrap();
        connected_pid(next_frame(&mut q).await, false);
        let waited = started.elapsed();
        assert!(waited < Duration::from_millis(500), "attach to q took {:?}", waited);

        // p itself waits for the old process, then starts over
        let mut p_again = relay.attach("p").await.unwrap();
        assert!(p_process.has_exited());
        connected_pid(next_frame(&mut p_again).await, false);
        assert_eq!(p_again.session.spawn_count().await, 1);

        relay.shutdown_all().await;
    }

    // ========================================================================
    // Backpressure
    // ========================================================================

    #[tokio::test]
    async fn test_detached_output_blocks_process_and_reaches_next_client() {
        const BURST: usize = 1_000_000;

        let dir = tempdir().unwrap();
        let mut settings = script_settings(&format!(
            "sleep 1; head -c {} /dev/zero | tr '\\0' x; touch done.txt; echo marker; sleep 5",
            BURST
        ));
        settings.idle_timeout_ms = 10_000;
        settings.output_queue = 2;
        settings.attach_queue = 2;
        let relay = relay_for(dir.path(), settings);

        let mut first = relay.attach("p").await.unwrap();
        connected_pid(next_frame(&mut first).await, false);
        let process = first.session.current_process().await.unwrap();
        relay.detach(&first.session, first.id).await;

        // Nobody drains the output, so the process stalls mid-burst
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!dir.path().join("done.txt").exists());
        assert!(!process.has_exited());

        let mut second = relay.attach("p").await.unwrap();
        connected_pid(next_frame(&mut second).await, true);

        let mut received = 0;
        let mut tail = String::new();
        loop {
            match next_frame(&mut second).await {
                Frame::Output { data } => {
                    received += data.bytes().filter(|b| *b == b'x').count();
                    tail.push_str(&data);
                    if tail.contains("marker") {
                        break;
                    }
                    if tail.len() > 64 {
                        tail = tail.split_off(tail.len() - 64);
                    }
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(received, BURST);
        assert!(dir.path().join("done.txt").exists());

        relay.shutdown_all().await;
    }
}
