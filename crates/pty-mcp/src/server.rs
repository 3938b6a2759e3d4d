//! Tool dispatcher.
//!
//! [`TerminalServer`] owns the session registry and the external
//! collaborators, and turns every tool call into a `{text, is_error}` reply.
//! Nothing here returns a JSON-RPC error; that is the transport's business.

use crate::config::{Backend, ServerConfig};
use crate::drain::DrainOptions;
use crate::runner::{CommandRunner, SystemCommandRunner};
use crate::session::{release_pty, PtyHandle, Session, SessionPatch, SessionRegistry, TerminalHandle};
use crate::terminal_app::TerminalApp;
use crate::text::{tail_chars, truncate_chars};
use crate::tools::{
    catalogue, OpenTerminalInput, ReadOutputInput, SendCommandInput, SessionInput,
    StartZellijSessionInput, ToolCall, ToolDefinition, ToolError, ZellijActionInput,
};
use crate::zellij::{validate_session_name, LayoutSummary, Zellij, ZellijAction};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use ttymux_common::validate_working_dir;

const NO_OUTPUT: &str = "(no output)";
const RAW_LAYOUT_LIMIT: usize = 2000;
const TERMINAL_CONTENT_LIMIT: usize = 1000;
const LAYOUT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Reply to a single tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

/// The terminal MCP server.
///
/// Exposes terminal session management and Zellij control as MCP tools.
pub struct TerminalServer {
    config: Arc<ServerConfig>,
    sessions: SessionRegistry,
    zellij: Zellij,
    terminal_app: TerminalApp,
}

impl TerminalServer {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_runner(config, Arc::new(SystemCommandRunner))
    }

    /// Build a server whose `osascript` and `zellij` calls go through `runner`.
    pub fn with_runner(config: ServerConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let timeout = config.external_timeout();
        Self {
            zellij: Zellij::new(runner.clone(), config.multiplexer.binary.clone(), timeout),
            terminal_app: TerminalApp::new(runner, timeout),
            sessions: SessionRegistry::new(),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Tools advertised in `tools/list`.
    pub fn tools(&self) -> Vec<ToolDefinition> {
        catalogue(self.config.multiplexer.enabled)
    }

    /// Validate, execute and render one tool call.
    pub async fn call_tool(&self, name: &str, arguments: Option<serde_json::Value>) -> ToolOutput {
        let call = match ToolCall::parse(name, arguments) {
            Ok(call) => call,
            Err(e) => {
                warn!(tool = %name, error = %e, "Rejected tool call");
                return ToolOutput::error(e.to_string());
            }
        };

        debug!(tool = call.name(), "Handling tool call");
        match self.dispatch(call).await {
            Ok(text) => ToolOutput::ok(text),
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool call failed");
                ToolOutput::error(e.to_string())
            }
        }
    }

    async fn dispatch(&self, call: ToolCall) -> Result<String, ToolError> {
        if call.requires_multiplexer() && !self.config.multiplexer.enabled {
            return Err(ToolError::MultiplexerDisabled);
        }

        match call {
            ToolCall::OpenTerminal(input) => self.handle_open(input).await,
            ToolCall::SendCommand(input) => self.handle_send(input).await,
            ToolCall::ReadOutput(input) => self.handle_read(input).await,
            ToolCall::CloseTerminal(input) => self.handle_close(input).await,
            ToolCall::ListTerminals(_) => Ok(self.handle_list().await),
            ToolCall::StartZellijSession(input) => self.handle_start_zellij(input).await,
            ToolCall::ZellijAction(input) => self.handle_zellij_action(input).await,
            ToolCall::CaptureState(input) => self.handle_capture_state(input).await,
        }
    }

    fn drain_options(&self, timeout: Duration) -> DrainOptions {
        DrainOptions::new(timeout)
            .with_poll_interval(self.config.drain.poll_interval())
            .with_quiet_period(self.config.drain.quiet_period())
    }

    async fn session(&self, session_id: &str) -> Result<Session, ToolError> {
        self.sessions
            .get(session_id)
            .await
            .ok_or_else(|| ToolError::SessionNotFound(session_id.to_string()))
    }

    /// Handle open_terminal tool call.
    async fn handle_open(&self, input: OpenTerminalInput) -> Result<String, ToolError> {
        let cwd = validate_working_dir(input.cwd.as_deref(), &self.config.path_security())?;
        let session = self.sessions.create(Some(cwd.clone())).await;

        info!(
            session_id = %session.id,
            backend = %self.config.backend,
            cwd = %cwd.display(),
            "Handling open_terminal"
        );

        match self.config.backend {
            Backend::Pty => {
                let shell = self.config.shell_program();
                let mut pty = match PtyHandle::spawn(&session.id, &shell, &cwd, self.config.drain.chunk_size) {
                    Ok(pty) => pty,
                    Err(e) => {
                        self.sessions.remove(&session.id).await;
                        return Err(e.into());
                    }
                };

                let banner = pty
                    .drain(self.drain_options(self.config.drain.open_timeout()))
                    .await;
                *session.handle().lock().await = Some(TerminalHandle::Pty(pty));

                let mut text = format!(
                    "Terminal opened successfully\nTerminal ID: {}\nBackend: pty\nShell: {}\nCWD: {}",
                    session.id,
                    shell,
                    cwd.display()
                );
                if !banner.is_empty() {
                    text.push_str("\n\nInitial output:\n");
                    text.push_str(&banner.text);
                }
                Ok(text)
            }
            Backend::TerminalApp => {
                let window_id = match self.terminal_app.open_window(&cwd).await {
                    Ok(window_id) => window_id,
                    Err(e) => {
                        self.sessions.remove(&session.id).await;
                        return Err(e.into());
                    }
                };

                *session.handle().lock().await = Some(TerminalHandle::Window {
                    window_id: window_id.clone(),
                });
                self.sessions
                    .update(
                        &session.id,
                        SessionPatch {
                            window_id: Some(window_id.clone()),
                            ..Default::default()
                        },
                    )
                    .await;

                Ok(format!(
                    "Terminal opened successfully\nTerminal ID: {}\nWindow ID: {}\nCWD: {}",
                    session.id,
                    window_id,
                    cwd.display()
                ))
            }
        }
    }

    /// Handle send_command tool call.
    async fn handle_send(&self, input: SendCommandInput) -> Result<String, ToolError> {
        let session = self.session(&input.session_id).await?;
        info!(session_id = %session.id, command = %input.command, "Handling send_command");

        let mut slot = session.handle().lock().await;
        match slot.as_mut() {
            Some(TerminalHandle::Pty(pty)) => {
                let timeout = self.config.drain.command_timeout(input.timeout);

                let stale = pty
                    .drain(self.drain_options(self.config.drain.stale_timeout()))
                    .await;
                if !stale.is_empty() {
                    debug!(session_id = %session.id, bytes = stale.text.len(), "Discarded stale output");
                }

                pty.write_all(format!("{}\n", input.command).as_bytes())?;
                tokio::time::sleep(self.config.drain.command_start_delay()).await;
                let output = pty.drain(self.drain_options(timeout)).await;

                Ok(format!(
                    "Command sent to terminal {}\nCommand: {}\nOutput:\n{}",
                    session.id,
                    input.command,
                    non_empty(&output.text)
                ))
            }
            Some(TerminalHandle::Window { window_id }) => {
                let output = self.terminal_app.send_text(window_id, &input.command).await?;
                Ok(format!(
                    "Command sent to terminal {}\nCommand: {}\nOutput: {}",
                    session.id,
                    input.command,
                    output.trim()
                ))
            }
            None => Err(ToolError::SessionNotFound(session.id.clone())),
        }
    }

    /// Handle read_output tool call.
    async fn handle_read(&self, input: ReadOutputInput) -> Result<String, ToolError> {
        let session = self.session(&input.session_id).await?;
        debug!(session_id = %session.id, "Handling read_output");

        let mut slot = session.handle().lock().await;
        match slot.as_mut() {
            Some(TerminalHandle::Pty(pty)) => {
                let timeout = self.config.drain.command_timeout(input.timeout);
                let output = pty.drain(self.drain_options(timeout)).await;
                Ok(non_empty(&output.text).to_string())
            }
            Some(TerminalHandle::Window { window_id }) => {
                let contents = self.terminal_app.window_contents(window_id).await?;
                Ok(non_empty(&contents).to_string())
            }
            None => Err(ToolError::SessionNotFound(session.id.clone())),
        }
    }

    /// Handle close_terminal tool call.
    async fn handle_close(&self, input: SessionInput) -> Result<String, ToolError> {
        let session = self
            .sessions
            .remove(&input.session_id)
            .await
            .ok_or_else(|| ToolError::SessionNotFound(input.session_id.clone()))?;
        info!(session_id = %session.id, "Handling close_terminal");

        if let Some(TerminalHandle::Window { window_id }) =
            release_pty(&session, self.config.close_timeout()).await
        {
            if let Err(e) = self.terminal_app.close_window(&window_id).await {
                warn!(session_id = %session.id, window_id = %window_id, error = %e, "Failed to close window");
                return Ok(format!(
                    "Terminal {} closed\nWindow {} could not be closed: {}",
                    session.id, window_id, e
                ));
            }
        }

        Ok(format!("Terminal {} closed", session.id))
    }

    /// Handle list_terminals tool call.
    async fn handle_list(&self) -> String {
        let sessions = self.sessions.list().await;
        if sessions.is_empty() {
            return "No active terminal sessions".to_string();
        }

        let mut lines = vec!["=== Active Terminal Sessions ===".to_string()];
        for session in sessions {
            let backend = match session.handle().lock().await.as_ref() {
                Some(handle) => handle.kind(),
                None => "none",
            };
            lines.push(String::new());
            lines.push(format!("Terminal ID: {}", session.id));
            lines.push(format!("  Status: {}", session.status().await));
            lines.push(format!("  Backend: {backend}"));
            lines.push(format!(
                "  Window ID: {}",
                session.window_id.as_deref().unwrap_or("N/A")
            ));
            lines.push(format!(
                "  Zellij Session: {}",
                session.multiplexer_session.as_deref().unwrap_or("N/A")
            ));
            lines.push(format!("  CWD: {}", session.cwd.display()));
            lines.push(format!(
                "  Created: {}",
                session.created_at.format("%Y-%m-%d %H:%M:%S")
            ));
        }
        lines.join("\n")
    }

    /// Handle start_zellij_session tool call.
    async fn handle_start_zellij(&self, input: StartZellijSessionInput) -> Result<String, ToolError> {
        let session = self.session(&input.session_id).await?;
        if let Some(existing) = &session.multiplexer_session {
            return Err(ToolError::AlreadyAttached {
                session_id: session.id.clone(),
                existing: existing.clone(),
            });
        }

        let session_name = match input.session_name.filter(|name| !name.trim().is_empty()) {
            Some(name) => name,
            None => default_session_name(),
        };
        validate_session_name(&session_name).map_err(|message| ToolError::InvalidArguments {
            tool: "start_zellij_session".into(),
            message,
        })?;

        let layout_path = input
            .layout_path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let command = self.zellij.attach_command(&session_name, layout_path.as_deref());

        info!(
            session_id = %session.id,
            zellij_session = %session_name,
            "Handling start_zellij_session"
        );

        self.type_into(&session, &command).await?;
        self.sessions
            .update(
                &session.id,
                SessionPatch {
                    multiplexer_session: Some(session_name.clone()),
                    ..Default::default()
                },
            )
            .await;

        Ok(format!(
            "Zellij session started\nTerminal ID: {}\nSession Name: {}\nLayout: {}",
            session.id,
            session_name,
            input.layout_path.as_deref().unwrap_or("default")
        ))
    }

    /// Type a command line into the session's terminal without waiting for output.
    async fn type_into(&self, session: &Session, command: &str) -> Result<(), ToolError> {
        let mut slot = session.handle().lock().await;
        match slot.as_mut() {
            Some(TerminalHandle::Pty(pty)) => {
                pty.write_all(format!("{command}\n").as_bytes())?;
                Ok(())
            }
            Some(TerminalHandle::Window { window_id }) => {
                self.terminal_app.send_text(window_id, command).await?;
                Ok(())
            }
            None => Err(ToolError::SessionNotFound(session.id.clone())),
        }
    }

    /// Handle zellij_action tool call.
    async fn handle_zellij_action(&self, input: ZellijActionInput) -> Result<String, ToolError> {
        let session = self.session(&input.session_id).await?;
        let zellij_session = session
            .multiplexer_session
            .clone()
            .ok_or_else(|| ToolError::NoMultiplexer(session.id.clone()))?;
        let action = input.to_action()?;

        info!(
            session_id = %session.id,
            zellij_session = %zellij_session,
            action = action.name(),
            "Handling zellij_action"
        );

        let outcome = self.zellij.run_action(&zellij_session, &action).await;
        Ok(format!(
            "Zellij action executed\nAction: {}\nSuccess: {}\nOutput:\n{}",
            action.name(),
            outcome.success,
            outcome.output
        ))
    }

    /// Handle capture_state tool call.
    ///
    /// Best-effort: the layout and terminal parts each report their own
    /// failure without failing the call.
    async fn handle_capture_state(&self, input: SessionInput) -> Result<String, ToolError> {
        let session = self.session(&input.session_id).await?;
        info!(session_id = %session.id, "Handling capture_state");

        let mut sections = Vec::new();

        if let Some(zellij_session) = session.multiplexer_session.as_deref() {
            if self.config.multiplexer.enabled {
                sections.push(self.capture_layout(zellij_session).await);
            }
        }

        sections.push(self.capture_terminal_content(&session).await);
        Ok(sections.join("\n"))
    }

    async fn capture_layout(&self, zellij_session: &str) -> String {
        let path = std::env::temp_dir().join(format!("zellij_layout_{}.kdl", uuid::Uuid::new_v4()));
        let action = ZellijAction::WriteChars {
            text: self.zellij.dump_layout_command(&path),
            pane_id: None,
        };

        let outcome = self.zellij.run_action(zellij_session, &action).await;
        if !outcome.success {
            return format!("Failed to inject dump command: {}", outcome.output);
        }

        // The dump is written by the shell inside zellij, asynchronously to us.
        self.wait_for_layout(&path).await;

        let result = match tokio::fs::read_to_string(&path).await {
            Ok(kdl) if kdl.trim().is_empty() => "Failed to capture layout: Empty output".to_string(),
            Ok(kdl) => render_layout(zellij_session, &kdl),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => format!(
                "Failed to capture layout: Temp file not created at {}",
                path.display()
            ),
            Err(e) => format!("Failed to read layout: {e}"),
        };

        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove layout dump");
            }
        }
        result
    }

    async fn wait_for_layout(&self, path: &Path) {
        let settle = self.config.multiplexer.layout_settle();
        if !self.config.multiplexer.layout_poll {
            tokio::time::sleep(settle).await;
            return;
        }

        let deadline = tokio::time::Instant::now() + settle;
        while tokio::time::Instant::now() < deadline {
            if let Ok(meta) = tokio::fs::metadata(path).await {
                if meta.len() > 0 {
                    // One more tick so a dump still being written can finish.
                    tokio::time::sleep(LAYOUT_POLL_INTERVAL).await;
                    return;
                }
            }
            tokio::time::sleep(LAYOUT_POLL_INTERVAL).await;
        }
    }

    async fn capture_terminal_content(&self, session: &Session) -> String {
        let slot = session.handle().lock().await;
        let content = match slot.as_ref() {
            // Read from the retained tail so a later read_output still sees it.
            Some(TerminalHandle::Pty(pty)) => {
                let recent = strip_ansi_escapes::strip_str(pty.recent_output());
                Ok(tail_chars(&recent, TERMINAL_CONTENT_LIMIT).to_string())
            }
            Some(TerminalHandle::Window { window_id }) => self.terminal_app.window_contents(window_id).await,
            None => {
                return "\nFailed to get terminal content: terminal handle already released".to_string();
            }
        };

        match content {
            Ok(content) => format!(
                "\n=== Terminal Content ===\n{}",
                truncate_chars(&content, TERMINAL_CONTENT_LIMIT)
            ),
            Err(e) => format!("\nFailed to get terminal content: {e}"),
        }
    }

    /// Release every session. Used when the transport shuts down.
    pub async fn shutdown(&self) {
        for session in self.sessions.list().await {
            if let Some(session) = self.sessions.remove(&session.id).await {
                if let Some(TerminalHandle::Window { window_id }) =
                    release_pty(&session, self.config.close_timeout()).await
                {
                    debug!(session_id = %session.id, window_id = %window_id, "Leaving Terminal.app window open");
                }
            }
        }
    }
}

fn render_layout(zellij_session: &str, kdl: &str) -> String {
    let summary = LayoutSummary::parse(kdl);
    let or = |items: &[String], fallback: &str| {
        if items.is_empty() {
            fallback.to_string()
        } else {
            items.join(", ")
        }
    };

    format!(
        "=== Zellij Layout State ===\nSession: {}\nTabs: {}\nPanes: {}\nTotal Pane Count: {}\n\nRaw Layout:\n{}",
        zellij_session,
        or(&summary.tabs, "default"),
        or(&summary.panes, "unnamed"),
        summary.pane_count,
        truncate_chars(kdl, RAW_LAYOUT_LIMIT)
    )
}

fn non_empty(text: &str) -> &str {
    if text.is_empty() {
        NO_OUTPUT
    } else {
        text
    }
}

fn default_session_name() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("zellij-{secs}")
}
