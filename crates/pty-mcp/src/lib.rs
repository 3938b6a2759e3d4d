//! ttymux-mcp: Model Context Protocol server for terminal sessions.
//!
//! This crate provides a stdio MCP server that lets a client open terminals,
//! type commands into them, read what they print, and drive a Zellij
//! multiplexer running inside them.
//!
//! # MCP Tools Exposed
//!
//! - `open_terminal` - Open a terminal (PTY shell or Terminal.app window)
//! - `send_command` - Type a command and collect its output
//! - `read_output` - Read pending output
//! - `close_terminal` - Kill the shell / close the window
//! - `list_terminals` - List all sessions
//! - `start_zellij_session` - Start or attach Zellij inside a terminal
//! - `zellij_action` - Run a Zellij CLI action against the attached session
//! - `capture_state` - Layout summary plus terminal content
//!
//! # Architecture
//!
//! ```text
//! MCP Client
//!        │
//!        │ line-delimited JSON-RPC (stdin/stdout)
//!        ▼
//! ┌──────────────────────────┐
//! │  StdioTransport          │
//! │        │                 │
//! │  ┌─────▼──────────┐      │
//! │  │ TerminalServer │      │ ◄── tool dispatch, {text, isError}
//! │  └──┬─────────┬───┘      │
//! │     │         │          │
//! │  ┌──▼──────┐ ┌▼────────┐ │
//! │  │ Session │ │ Zellij /│ │ ◄── CommandRunner (zellij, osascript)
//! │  │ Registry│ │ Term.app│ │
//! │  └──┬──────┘ └─────────┘ │
//! │     │                    │
//! │  ┌──▼───────┐            │
//! │  │ PTY +    │            │ ◄── portable-pty, reader thread → drain
//! │  │ drainer  │            │
//! │  └──────────┘            │
//! └──────────────────────────┘
//! ```

pub mod config;
pub mod drain;
pub mod protocol;
pub mod runner;
pub mod server;
pub mod session;
pub mod terminal_app;
pub mod text;
pub mod tools;
pub mod transport;
pub mod zellij;

pub use config::{Backend, ServerConfig};
pub use runner::{CommandOutput, CommandRunner, SystemCommandRunner};
pub use server::{TerminalServer, ToolOutput};
pub use session::{ProcessStatus, Session, SessionPatch, SessionRegistry};
pub use transport::{serve_stdio, StdioTransport};
