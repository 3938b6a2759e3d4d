//! macOS Terminal.app automation through `osascript`.
//!
//! Windows are addressed by the numeric id Terminal.app reports when the
//! window is created.

use crate::runner::CommandRunner;
use crate::text::shell_quote;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use ttymux_common::{Result, TtymuxError};

/// Drives Terminal.app windows.
#[derive(Clone)]
pub struct TerminalApp {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl TerminalApp {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Open a new window in `cwd` and return its window id.
    pub async fn open_window(&self, cwd: &Path) -> Result<String> {
        let cd = format!("cd {}", shell_quote(&cwd.display().to_string()));
        let script = format!(
            "tell application \"Terminal\"\n\
             \tactivate\n\
             \tdo script \"{}\"\n\
             \treturn id of window 1\n\
             end tell",
            applescript_escape(&cd)
        );

        let window_id = self.osascript(&script).await?.trim().to_string();
        if window_id.is_empty() {
            return Err(TtymuxError::Terminal(
                "Terminal.app did not report a window id".into(),
            ));
        }
        info!(window_id = %window_id, cwd = %cwd.display(), "Opened Terminal.app window");
        Ok(window_id)
    }

    /// Type `text` into the window and run it.
    pub async fn send_text(&self, window_id: &str, text: &str) -> Result<String> {
        debug!(window_id = %window_id, "Sending text to Terminal.app window");
        let script = format!(
            "tell application \"Terminal\"\n\
             \tdo script \"{}\" in window id {}\n\
             end tell",
            applescript_escape(text),
            window_id_literal(window_id)?
        );
        self.osascript(&script).await
    }

    /// Visible contents of the window.
    pub async fn window_contents(&self, window_id: &str) -> Result<String> {
        let script = format!(
            "tell application \"Terminal\"\n\
             \tget contents of window id {}\n\
             end tell",
            window_id_literal(window_id)?
        );
        self.osascript(&script).await
    }

    pub async fn close_window(&self, window_id: &str) -> Result<()> {
        let script = format!(
            "tell application \"Terminal\"\n\
             \tclose window id {}\n\
             end tell",
            window_id_literal(window_id)?
        );
        self.osascript(&script).await.map(|_| ())
    }

    async fn osascript(&self, script: &str) -> Result<String> {
        let args = vec!["-e".to_string(), script.to_string()];
        let output = self.runner.run("osascript", &args, self.timeout).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(TtymuxError::Terminal(output.stderr.trim().to_string()))
        }
    }
}

/// Escape text for embedding in an AppleScript string literal.
fn applescript_escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Window ids are spliced into the script unquoted, so they must be numeric.
fn window_id_literal(window_id: &str) -> Result<&str> {
    let trimmed = window_id.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        Ok(trimmed)
    } else {
        Err(TtymuxError::Terminal(format!(
            "Invalid Terminal.app window id '{window_id}'"
        )))
    }
}
