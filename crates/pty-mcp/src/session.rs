//! Terminal sessions and the registry that owns them.
//!
//! A [`Session`] is a cheap-to-clone record: the metadata the caller sees plus
//! a shared slot for the OS handle. The slot sits behind an async mutex so a
//! handle is only ever drained or written by one operation at a time, and it
//! is emptied exactly once when the session is closed.

use crate::drain::{drain, DrainOptions, Drained};
use chrono::{DateTime, Local};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use ttymux_common::{Result, TtymuxError};

/// Derived process state of a session; computed on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(Option<u32>),
    /// Not tracked by this process (Terminal.app windows).
    Unknown,
    /// Handle already released or never acquired.
    Detached,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Running => f.write_str("running"),
            ProcessStatus::Exited(Some(code)) => write!(f, "exited ({code})"),
            ProcessStatus::Exited(None) => f.write_str("exited"),
            ProcessStatus::Unknown => f.write_str("unknown"),
            ProcessStatus::Detached => f.write_str("stopped"),
        }
    }
}

/// Bytes of recent PTY output kept for non-consuming reads.
pub const RECENT_OUTPUT_LIMIT: usize = 64 * 1024;

/// Bounded copy of the most recent bytes a PTY produced.
///
/// Filled by the reader thread alongside the drain channel, so inspecting it
/// never takes output away from a later drain.
#[derive(Debug, Clone)]
pub struct OutputTail {
    bytes: Arc<std::sync::Mutex<VecDeque<u8>>>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(capacity.min(4096)))),
            capacity,
        }
    }

    pub fn push(&self, chunk: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let chunk = &chunk[chunk.len().saturating_sub(self.capacity)..];
        let overflow = (bytes.len() + chunk.len()).saturating_sub(self.capacity);
        bytes.drain(..overflow);
        bytes.extend(chunk);
    }

    /// Lossy UTF-8 view of the retained bytes.
    pub fn snapshot(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (front, back) = bytes.as_slices();
        let mut joined = Vec::with_capacity(front.len() + back.len());
        joined.extend_from_slice(front);
        joined.extend_from_slice(back);
        String::from_utf8_lossy(&joined).into_owned()
    }
}

/// A shell running on a pseudo-terminal owned by this process.
pub struct PtyHandle {
    _master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    output: mpsc::UnboundedReceiver<Vec<u8>>,
    recent: OutputTail,
}

impl PtyHandle {
    /// Spawn `shell` on a fresh PTY in `cwd`.
    ///
    /// A reader thread forwards output in chunks of at most `chunk_size` bytes
    /// and drops its sender at EOF, which closes the drain source.
    pub fn spawn(session_id: &str, shell: &str, cwd: &Path, chunk_size: usize) -> Result<Self> {
        info!(session_id = %session_id, shell = %shell, cwd = %cwd.display(), "Spawning PTY shell");

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TtymuxError::Pty(format!("Failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.cwd(cwd);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TtymuxError::Pty(format!("Failed to spawn '{shell}': {e}")))?;
        // The child holds its own copy of the slave side; keeping ours open
        // would stop the reader from ever seeing EOF.
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TtymuxError::Pty(format!("Failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TtymuxError::Pty(format!("Failed to take PTY writer: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let recent = OutputTail::new(RECENT_OUTPUT_LIMIT);
        let thread_recent = recent.clone();
        let thread_session = session_id.to_string();
        std::thread::Builder::new()
            .name(format!("pty-reader-{session_id}"))
            .spawn(move || {
                let mut buf = vec![0u8; chunk_size.max(1)];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            thread_recent.push(&buf[..n]);
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            // Linux reports EIO once the child side is gone.
                            debug!(session_id = %thread_session, error = %e, "PTY reader stopped");
                            break;
                        }
                    }
                }
                debug!(session_id = %thread_session, "PTY reader finished");
            })?;

        Ok(Self {
            _master: pair.master,
            writer,
            child,
            output: rx,
            recent,
        })
    }

    pub async fn drain(&mut self, options: DrainOptions) -> Drained {
        drain(&mut self.output, options).await
    }

    /// Most recent output, whether or not it has been drained yet.
    pub fn recent_output(&self) -> String {
        self.recent.snapshot()
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn status(&mut self) -> ProcessStatus {
        match self.child.try_wait() {
            Ok(None) => ProcessStatus::Running,
            Ok(Some(status)) => ProcessStatus::Exited(Some(status.exit_code())),
            Err(e) => {
                warn!(error = %e, "Failed to query PTY child status");
                ProcessStatus::Exited(None)
            }
        }
    }

    /// Kill the shell and wait up to `timeout` for it to be reaped.
    pub async fn terminate(mut self, timeout: Duration) -> ProcessStatus {
        if let ProcessStatus::Exited(code) = self.status() {
            return ProcessStatus::Exited(code);
        }

        if let Err(e) = self.child.kill() {
            warn!(error = %e, "Failed to kill PTY child");
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.status() {
                ProcessStatus::Running if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                status => return status,
            }
        }
    }
}

/// The OS endpoint a session owns.
pub enum TerminalHandle {
    Pty(PtyHandle),
    Window { window_id: String },
}

impl TerminalHandle {
    pub fn kind(&self) -> &'static str {
        match self {
            TerminalHandle::Pty(_) => "pty",
            TerminalHandle::Window { .. } => "terminal-app",
        }
    }
}

/// Shared slot holding a session's handle; `None` once released.
pub type HandleSlot = Arc<Mutex<Option<TerminalHandle>>>;

/// One logical terminal the caller can address by id.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub cwd: PathBuf,
    pub created_at: DateTime<Local>,
    pub window_id: Option<String>,
    pub multiplexer_session: Option<String>,
    handle: HandleSlot,
}

impl Session {
    pub fn handle(&self) -> &HandleSlot {
        &self.handle
    }

    /// Derived status; never cached.
    pub async fn status(&self) -> ProcessStatus {
        match self.handle.lock().await.as_mut() {
            Some(TerminalHandle::Pty(pty)) => pty.status(),
            Some(TerminalHandle::Window { .. }) => ProcessStatus::Unknown,
            None => ProcessStatus::Detached,
        }
    }

    /// Take the handle out of its slot so it can be released.
    pub async fn release(&self) -> Option<TerminalHandle> {
        self.handle.lock().await.take()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("cwd", &self.cwd)
            .field("created_at", &self.created_at)
            .field("window_id", &self.window_id)
            .field("multiplexer_session", &self.multiplexer_session)
            .finish_non_exhaustive()
    }
}

/// Field-level patch for [`SessionRegistry::update`]. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub window_id: Option<String>,
    /// Only applied while the session has no attachment yet.
    pub multiplexer_session: Option<String>,
}

struct Entry {
    seq: u64,
    session: Session,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: HashMap<String, Entry>,
}

/// In-memory map of live sessions.
///
/// Ids are `term-1`, `term-2`, … and are never reused by the same registry.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session with an empty handle slot.
    ///
    /// `cwd` defaults to the current process working directory.
    pub async fn create(&self, cwd: Option<PathBuf>) -> Session {
        let cwd = cwd.unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let seq = inner.next_id;
        let session = Session {
            id: format!("term-{seq}"),
            cwd,
            created_at: Local::now(),
            window_id: None,
            multiplexer_session: None,
            handle: Arc::new(Mutex::new(None)),
        };
        inner.entries.insert(
            session.id.clone(),
            Entry {
                seq,
                session: session.clone(),
            },
        );

        debug!(session_id = %session.id, "Registered session");
        session
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.inner
            .read()
            .await
            .entries
            .get(id)
            .map(|entry| entry.session.clone())
    }

    /// Apply `patch` to session `id`; a no-op if it does not exist.
    pub async fn update(&self, id: &str, patch: SessionPatch) {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.entries.get_mut(id) else {
            return;
        };

        if let Some(window_id) = patch.window_id {
            entry.session.window_id = Some(window_id);
        }
        if let Some(name) = patch.multiplexer_session {
            if entry.session.multiplexer_session.is_none() {
                entry.session.multiplexer_session = Some(name);
            } else {
                warn!(session_id = %id, "Ignoring second multiplexer attachment");
            }
        }
    }

    /// Remove session `id`, returning it so its handle can be released.
    /// Removing an unknown id is not an error.
    pub async fn remove(&self, id: &str) -> Option<Session> {
        self.inner
            .write()
            .await
            .entries
            .remove(id)
            .map(|entry| entry.session)
    }

    /// Snapshot of all sessions in creation order.
    pub async fn list(&self) -> Vec<Session> {
        let inner = self.inner.read().await;
        let mut entries: Vec<&Entry> = inner.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.session.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Release a removed session's handle.
///
/// PTY shells are killed and reaped within `timeout`; windows are returned to
/// the caller, which closes them through terminal automation.
pub async fn release_pty(session: &Session, timeout: Duration) -> Option<TerminalHandle> {
    match session.release().await {
        Some(TerminalHandle::Pty(pty)) => {
            let status = pty.terminate(timeout).await;
            if status == ProcessStatus::Running {
                error!(session_id = %session.id, "PTY shell still running after kill");
            } else {
                info!(session_id = %session.id, status = %status, "PTY shell terminated");
            }
            None
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_ids_are_sequential_and_unique() {
        let registry = SessionRegistry::new();
        let mut seen = HashSet::new();
        for expected in 1..=20 {
            let session = registry.create(None).await;
            assert_eq!(session.id, format!("term-{expected}"));
            assert!(seen.insert(session.id.clone()));
            if expected % 3 == 0 {
                registry.remove(&session.id).await;
            }
        }
    }

    #[tokio::test]
    async fn test_removed_ids_are_not_reused_or_returned() {
        let registry = SessionRegistry::new();
        let first = registry.create(None).await;
        registry.remove(&first.id).await;

        assert!(registry.get(&first.id).await.is_none());
        let second = registry.create(None).await;
        assert_eq!(second.id, "term-2");
        assert!(registry.get(&first.id).await.is_none());
    }

    #[tokio::test]
    async fn test_create_defaults_cwd_to_process_cwd() {
        let registry = SessionRegistry::new();
        let session = registry.create(None).await;
        assert_eq!(session.cwd, std::env::current_dir().unwrap());

        let explicit = registry.create(Some(PathBuf::from("/tmp"))).await;
        assert_eq!(explicit.cwd, PathBuf::from("/tmp"));
    }

    #[tokio::test]
    async fn test_update_unknown_id_is_noop() {
        let registry = SessionRegistry::new();
        let session = registry.create(Some(PathBuf::from("/tmp"))).await;
        let before: Vec<_> = registry.list().await.iter().map(|s| format!("{s:?}")).collect();

        registry
            .update(
                "term-404",
                SessionPatch {
                    window_id: Some("1".into()),
                    multiplexer_session: Some("dev".into()),
                },
            )
            .await;

        let after: Vec<_> = registry.list().await.iter().map(|s| format!("{s:?}")).collect();
        assert_eq!(before, after);
        assert!(registry.get(&session.id).await.unwrap().window_id.is_none());
    }

    #[tokio::test]
    async fn test_multiplexer_attachment_is_set_once() {
        let registry = SessionRegistry::new();
        let session = registry.create(None).await;

        registry
            .update(
                &session.id,
                SessionPatch {
                    multiplexer_session: Some("first".into()),
                    ..Default::default()
                },
            )
            .await;
        registry
            .update(
                &session.id,
                SessionPatch {
                    multiplexer_session: Some("second".into()),
                    window_id: Some("9".into()),
                },
            )
            .await;

        let stored = registry.get(&session.id).await.unwrap();
        assert_eq!(stored.multiplexer_session.as_deref(), Some("first"));
        assert_eq!(stored.window_id.as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let session = registry.create(None).await;
        assert!(registry.remove(&session.id).await.is_some());
        assert!(registry.remove(&session.id).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_list_is_ordered_snapshot() {
        let registry = SessionRegistry::new();
        for _ in 0..12 {
            registry.create(None).await;
        }
        registry.remove("term-4").await;

        let snapshot = registry.list().await;
        registry.create(None).await;

        let ids: Vec<&str> = snapshot.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids.len(), 11);
        assert_eq!(ids.first(), Some(&"term-1"));
        assert_eq!(ids.last(), Some(&"term-12"));
        assert!(!ids.contains(&"term-4"));
        assert!(ids.windows(2).all(|w| {
            let n = |id: &str| id.trim_start_matches("term-").parse::<u32>().unwrap();
            n(w[0]) < n(w[1])
        }));
        assert_eq!(registry.len().await, 12);
    }

    #[tokio::test]
    async fn test_status_without_handle_is_detached() {
        let registry = SessionRegistry::new();
        let session = registry.create(None).await;
        assert_eq!(session.status().await, ProcessStatus::Detached);

        *session.handle().lock().await = Some(TerminalHandle::Window {
            window_id: "12".into(),
        });
        assert_eq!(session.status().await, ProcessStatus::Unknown);
        assert!(matches!(
            session.release().await,
            Some(TerminalHandle::Window { .. })
        ));
        assert!(session.release().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pty_shell_roundtrip() {
        let mut pty = PtyHandle::spawn("term-test", "/bin/sh", Path::new("/tmp"), 4096).unwrap();
        pty.drain(DrainOptions::new(Duration::from_millis(500))).await;

        pty.write_all(b"echo ttymux-$((40 + 2))\n").unwrap();
        let out = pty.drain(DrainOptions::new(Duration::from_secs(5))).await;
        assert!(out.text.contains("ttymux-42"), "unexpected output: {:?}", out.text);
        assert_eq!(pty.status(), ProcessStatus::Running);

        let status = pty.terminate(Duration::from_secs(2)).await;
        assert!(matches!(status, ProcessStatus::Exited(_)));
    }

    #[test]
    fn test_output_tail_keeps_newest_bytes() {
        let tail = OutputTail::new(8);
        tail.push(b"abcdef");
        tail.push(b"ghij");
        assert_eq!(tail.snapshot(), "cdefghij");

        tail.push(b"0123456789");
        assert_eq!(tail.snapshot(), "23456789");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_recent_output_survives_drain() {
        let mut pty = PtyHandle::spawn("term-test", "/bin/sh", Path::new("/tmp"), 4096).unwrap();
        pty.write_all(b"echo tail-$((40 + 2))\n").unwrap();

        let out = pty.drain(DrainOptions::new(Duration::from_secs(5))).await;
        assert!(out.text.contains("tail-42"), "unexpected output: {:?}", out.text);
        assert!(pty.recent_output().contains("tail-42"));

        pty.terminate(Duration::from_secs(2)).await;
    }
}
