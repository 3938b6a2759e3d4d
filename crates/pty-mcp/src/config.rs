//! Server configuration.
//!
//! Loaded from a TOML file (`--config` or `TTYMUX_CONFIG`); every field has a
//! default so an empty file, or no file at all, is a valid configuration.
//!
//! ```toml
//! backend = "pty"
//! shell = "/bin/zsh"
//!
//! [drain]
//! command_timeout_ms = 5000
//!
//! [multiplexer]
//! enabled = true
//! layout_poll = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use ttymux_common::{PathSecurityConfig, Result, TtymuxError};

/// Where terminals opened by `open_terminal` live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// A pseudo-terminal pair with a child shell owned by this process.
    #[default]
    Pty,
    /// A macOS Terminal.app window driven through `osascript`.
    TerminalApp,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Pty => f.write_str("pty"),
            Backend::TerminalApp => f.write_str("terminal-app"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pty" => Ok(Backend::Pty),
            "terminal-app" | "terminal" => Ok(Backend::TerminalApp),
            other => Err(format!(
                "unknown backend '{other}' (expected 'pty' or 'terminal-app')"
            )),
        }
    }
}

/// Main server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub backend: Backend,

    /// Shell started in PTY sessions. Falls back to `$SHELL`, then `/bin/sh`.
    #[serde(default)]
    pub shell: Option<String>,

    /// Working directory used when `open_terminal` gets no `cwd`.
    #[serde(default)]
    pub default_working_dir: Option<PathBuf>,

    /// Allowed base directories for `cwd` validation. Empty = allow all.
    #[serde(default)]
    pub allowed_base_dirs: Vec<PathBuf>,

    /// Timeout for one-shot external commands (osascript, zellij).
    #[serde(default = "default_external_timeout")]
    pub external_timeout_ms: u64,

    /// How long `close_terminal` waits for a killed shell to be reaped.
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,

    #[serde(default)]
    pub drain: DrainConfig,

    #[serde(default)]
    pub multiplexer: MultiplexerConfig,
}

/// Output draining knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainConfig {
    /// Longest single wait for the next chunk.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Grace wait once output has been seen; silence this long ends a burst.
    #[serde(default = "default_quiet_period")]
    pub quiet_period_ms: u64,

    /// Read buffer size of the PTY reader thread.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Drain budget for the shell banner right after `open_terminal`.
    #[serde(default = "default_open_timeout")]
    pub open_timeout_ms: u64,

    /// Drain budget for discarding stale output before a command is sent.
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_ms: u64,

    /// Default drain budget for `send_command` and `read_output`.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// Upper bound for caller-supplied timeouts.
    #[serde(default = "default_max_timeout")]
    pub max_timeout_ms: u64,

    /// Pause between writing a command and starting to drain its output.
    #[serde(default = "default_command_start_delay")]
    pub command_start_delay_ms: u64,
}

/// Zellij support.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiplexerConfig {
    /// When false the zellij tools are not advertised and calls are rejected.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Name or path of the zellij executable.
    #[serde(default = "default_zellij_binary")]
    pub binary: String,

    /// Settle period before the dumped layout file is read by `capture_state`.
    #[serde(default = "default_layout_settle")]
    pub layout_settle_ms: u64,

    /// Poll for the layout file instead of sleeping the full settle period.
    #[serde(default)]
    pub layout_poll: bool,
}

fn default_external_timeout() -> u64 {
    10_000
}

fn default_close_timeout() -> u64 {
    2_000
}

fn default_poll_interval() -> u64 {
    100
}

fn default_quiet_period() -> u64 {
    100
}

fn default_chunk_size() -> usize {
    4096
}

fn default_open_timeout() -> u64 {
    500
}

fn default_stale_timeout() -> u64 {
    100
}

fn default_command_timeout() -> u64 {
    2_000
}

fn default_max_timeout() -> u64 {
    300_000
}

fn default_command_start_delay() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_zellij_binary() -> String {
    "zellij".into()
}

fn default_layout_settle() -> u64 {
    800
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            quiet_period_ms: default_quiet_period(),
            chunk_size: default_chunk_size(),
            open_timeout_ms: default_open_timeout(),
            stale_timeout_ms: default_stale_timeout(),
            command_timeout_ms: default_command_timeout(),
            max_timeout_ms: default_max_timeout(),
            command_start_delay_ms: default_command_start_delay(),
        }
    }
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: default_zellij_binary(),
            layout_settle_ms: default_layout_settle(),
            layout_poll: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            shell: None,
            default_working_dir: None,
            allowed_base_dirs: Vec::new(),
            external_timeout_ms: default_external_timeout(),
            close_timeout_ms: default_close_timeout(),
            drain: DrainConfig::default(),
            multiplexer: MultiplexerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    ///
    /// On Unix the file must be a regular file that is not world-writable.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        #[cfg(unix)]
        validate_config_file_permissions(path)?;

        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content).map_err(|e| match e {
            TtymuxError::Config(msg) => {
                TtymuxError::Config(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| TtymuxError::Config(e.to_string()))
    }

    /// Shell for PTY sessions.
    pub fn shell_program(&self) -> String {
        self.shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "/bin/sh".into())
    }

    pub fn path_security(&self) -> PathSecurityConfig {
        let mut security = PathSecurityConfig {
            allowed_base_dirs: self.allowed_base_dirs.clone(),
            ..Default::default()
        };
        if let Some(dir) = &self.default_working_dir {
            security.default_working_dir = dir.clone();
        }
        security
    }

    pub fn external_timeout(&self) -> Duration {
        Duration::from_millis(self.external_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl DrainConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }

    pub fn command_start_delay(&self) -> Duration {
        Duration::from_millis(self.command_start_delay_ms)
    }

    /// Resolve a caller-supplied timeout in seconds, clamped to the maximum.
    ///
    /// Missing, negative or non-finite values fall back to the default.
    pub fn command_timeout(&self, requested_secs: Option<f64>) -> Duration {
        let max = Duration::from_millis(self.max_timeout_ms);
        match requested_secs {
            Some(secs) if secs.is_finite() && secs >= 0.0 => {
                Duration::from_secs_f64(secs.min(max.as_secs_f64()))
            }
            _ => Duration::from_millis(self.command_timeout_ms).min(max),
        }
    }
}

impl MultiplexerConfig {
    pub fn layout_settle(&self) -> Duration {
        Duration::from_millis(self.layout_settle_ms)
    }
}

/// Validate config file permissions on Unix systems.
#[cfg(unix)]
fn validate_config_file_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).map_err(|e| {
        TtymuxError::Config(format!("Failed to read config file '{}': {e}", path.display()))
    })?;

    if !metadata.is_file() {
        return Err(TtymuxError::Config(format!(
            "Config path '{}' is not a regular file",
            path.display()
        )));
    }

    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o002 != 0 {
        return Err(TtymuxError::Config(format!(
            "Config file '{}' is world-writable (mode {mode:04o}). Fix with: chmod o-w {}",
            path.display(),
            path.display()
        )));
    }

    Ok(())
}
