//! Zellij multiplexer control and layout parsing.
//!
//! Every action is a one-shot `zellij` CLI invocation with its own timeout.
//! Layout dumps are KDL; only coarse structure (tab names, pane names, pane
//! count) is pulled out, with regexes rather than a full KDL parser since
//! dumps from different zellij versions vary in shape.

use crate::runner::CommandRunner;
use crate::text::shell_quote;
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, warn};

static TAB_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^\s*tab\b[^\n]*?\bname="([^"]+)""#).unwrap());

static PANE_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^\s*pane\b[^\n]*?\bname="([^"]+)""#).unwrap());

static PANE_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*pane\b").unwrap());

static SESSION_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").unwrap());

const DUMP_LAYOUT_FALLBACK: &str = "dump-layout requires being inside the Zellij session. \
Use send_command to inject 'zellij action dump-layout > /tmp/layout.kdl' then read the file, \
or use capture_state.";

/// Coarse structure of a dumped layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutSummary {
    pub tabs: Vec<String>,
    pub panes: Vec<String>,
    pub pane_count: usize,
}

impl LayoutSummary {
    pub fn parse(kdl: &str) -> Self {
        let captures = |pattern: &Regex| -> Vec<String> {
            pattern
                .captures_iter(kdl)
                .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
                .collect()
        };

        Self {
            tabs: captures(&TAB_NAME_PATTERN),
            panes: captures(&PANE_NAME_PATTERN),
            pane_count: PANE_PATTERN.find_iter(kdl).count(),
        }
    }
}

/// A pass-through multiplexer action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZellijAction {
    DumpLayout,
    WriteChars {
        text: String,
        pane_id: Option<String>,
    },
    NewPane {
        direction: Option<String>,
        cwd: Option<String>,
    },
    ListSessions,
}

impl ZellijAction {
    pub fn name(&self) -> &'static str {
        match self {
            ZellijAction::DumpLayout => "dump-layout",
            ZellijAction::WriteChars { .. } => "write-chars",
            ZellijAction::NewPane { .. } => "new-pane",
            ZellijAction::ListSessions => "list-sessions",
        }
    }
}

/// How an action went; failures carry the explanation in `output`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub success: bool,
    pub output: String,
}

impl ActionOutcome {
    fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Check a caller-supplied zellij session name.
pub fn validate_session_name(name: &str) -> Result<(), String> {
    if SESSION_NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(format!(
            "Invalid Zellij session name '{name}': use 1-64 letters, digits, '.', '_' or '-'"
        ))
    }
}

/// Thin wrapper around the `zellij` CLI.
#[derive(Clone)]
pub struct Zellij {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    timeout: Duration,
}

impl Zellij {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            binary: binary.into(),
            timeout,
        }
    }

    /// Shell command that creates (or attaches to) `session_name`.
    ///
    /// It is typed into the terminal rather than run here: zellij needs the
    /// terminal as its controlling tty.
    pub fn attach_command(&self, session_name: &str, layout_path: Option<&Path>) -> String {
        let mut parts = vec![shell_quote(&self.binary)];
        if let Some(layout) = layout_path {
            parts.push("--layout".into());
            parts.push(shell_quote(&layout.display().to_string()));
        }
        parts.push("attach".into());
        parts.push("-c".into());
        parts.push(session_name.to_string());
        parts.join(" ")
    }

    /// Shell command that dumps the focused session's layout into `path`.
    pub fn dump_layout_command(&self, path: &Path) -> String {
        format!(
            "{} action dump-layout > {}\n",
            shell_quote(&self.binary),
            shell_quote(&path.display().to_string())
        )
    }

    pub async fn run_action(&self, session_name: &str, action: &ZellijAction) -> ActionOutcome {
        let session_args = || vec!["--session".to_string(), session_name.to_string(), "action".to_string()];

        let args: Vec<String> = match action {
            ZellijAction::DumpLayout => {
                let mut args = session_args();
                args.push("dump-layout".into());
                args
            }
            ZellijAction::WriteChars { text, pane_id } => {
                let mut args = session_args();
                args.push("write-chars".into());
                args.push(text.clone());
                if let Some(pane) = pane_id {
                    args.push("--pane-id".into());
                    args.push(pane.clone());
                }
                args
            }
            ZellijAction::NewPane { direction, cwd } => {
                let mut args = session_args();
                args.push("new-pane".into());
                if let Some(direction) = direction {
                    args.push("--direction".into());
                    args.push(direction.clone());
                }
                if let Some(cwd) = cwd {
                    args.push("--cwd".into());
                    args.push(cwd.clone());
                }
                args
            }
            ZellijAction::ListSessions => vec!["list-sessions".to_string()],
        };

        debug!(session = %session_name, action = action.name(), "Running zellij action");

        let output = match self.runner.run(&self.binary, &args, self.timeout).await {
            Ok(output) => output,
            Err(e) => {
                warn!(session = %session_name, action = action.name(), error = %e, "zellij invocation failed");
                return ActionOutcome::failed(e.to_string());
            }
        };

        match action {
            // dump-layout only works from inside the session on most zellij versions.
            ZellijAction::DumpLayout if !output.success || output.stdout.trim().is_empty() => {
                ActionOutcome::failed(DUMP_LAYOUT_FALLBACK)
            }
            _ => ActionOutcome {
                success: output.success,
                output: output.message().to_string(),
            },
        }
    }
}
