//! MCP tool definitions for terminal and multiplexer operations.
//!
//! Arguments are parsed once into a [`ToolCall`]; the dispatcher only ever
//! sees typed inputs.

use crate::zellij::ZellijAction;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use ttymux_common::TtymuxError;

/// Input for open_terminal tool.
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct OpenTerminalInput {
    /// Working directory (defaults to the server's working directory)
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Input for send_command tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SendCommandInput {
    /// Terminal ID from open_terminal
    #[serde(alias = "terminal_id")]
    pub session_id: String,

    /// Command to execute (a newline is appended)
    pub command: String,

    /// Seconds to wait for output
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// Input for read_output tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ReadOutputInput {
    /// Terminal ID from open_terminal
    #[serde(alias = "terminal_id")]
    pub session_id: String,

    /// Seconds to wait for output
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// Input for tools that only address a session (close_terminal, capture_state).
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SessionInput {
    /// Terminal ID from open_terminal
    #[serde(alias = "terminal_id")]
    pub session_id: String,
}

/// Input for list_terminals tool (empty - lists all sessions).
#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct ListTerminalsInput {}

/// Input for start_zellij_session tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct StartZellijSessionInput {
    /// Terminal ID to start Zellij in
    #[serde(alias = "terminal_id")]
    pub session_id: String,

    /// Zellij session name (auto-generated if not provided)
    #[serde(default)]
    pub session_name: Option<String>,

    /// Path to Zellij layout file
    #[serde(default)]
    pub layout_path: Option<String>,
}

/// Action-specific arguments for zellij_action.
#[derive(Debug, Default, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ActionArgs {
    /// Characters to write (write-chars)
    #[serde(default)]
    pub text: Option<String>,

    /// Target pane (write-chars)
    #[serde(default, deserialize_with = "string_or_number")]
    #[schemars(with = "Option<String>")]
    pub pane_id: Option<String>,

    /// Split direction, e.g. "right" or "down" (new-pane)
    #[serde(default)]
    pub direction: Option<String>,

    /// Working directory of the new pane (new-pane)
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Input for zellij_action tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ZellijActionInput {
    /// Terminal ID with an active Zellij session
    #[serde(alias = "terminal_id")]
    pub session_id: String,

    /// One of: dump-layout, write-chars, new-pane, list-sessions
    pub action: String,

    /// Action-specific arguments (text, pane_id, direction, cwd)
    #[serde(default)]
    pub action_args: ActionArgs,
}

impl ZellijActionInput {
    /// Resolve the requested action name and its arguments.
    pub fn to_action(&self) -> Result<ZellijAction, ToolError> {
        let args = self.action_args.clone();
        match self.action.as_str() {
            "dump-layout" => Ok(ZellijAction::DumpLayout),
            "write-chars" => {
                let text = args.text.ok_or_else(|| ToolError::InvalidArguments {
                    tool: "zellij_action".into(),
                    message: "write-chars requires action_args.text".into(),
                })?;
                Ok(ZellijAction::WriteChars {
                    text,
                    pane_id: args.pane_id,
                })
            }
            "new-pane" => Ok(ZellijAction::NewPane {
                direction: args.direction,
                cwd: args.cwd,
            }),
            "list-sessions" => Ok(ZellijAction::ListSessions),
            other => Err(ToolError::UnknownAction(other.to_string())),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// Tool-level failures. These are reported to the caller as error-shaped
/// tool results, never as JSON-RPC errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Terminal session '{0}' not found")]
    SessionNotFound(String),

    #[error("No Zellij session for terminal '{0}'. Call start_zellij_session first.")]
    NoMultiplexer(String),

    #[error("Terminal '{session_id}' is already attached to Zellij session '{existing}'")]
    AlreadyAttached { session_id: String, existing: String },

    #[error("Unknown action '{0}'. Expected one of: dump-layout, write-chars, new-pane, list-sessions")]
    UnknownAction(String),

    #[error("Zellij support is disabled in this server's configuration")]
    MultiplexerDisabled,

    #[error("{0}")]
    Backend(#[from] TtymuxError),
}

/// A fully parsed tool invocation.
#[derive(Debug)]
pub enum ToolCall {
    OpenTerminal(OpenTerminalInput),
    SendCommand(SendCommandInput),
    ReadOutput(ReadOutputInput),
    CloseTerminal(SessionInput),
    ListTerminals(ListTerminalsInput),
    StartZellijSession(StartZellijSessionInput),
    ZellijAction(ZellijActionInput),
    CaptureState(SessionInput),
}

impl ToolCall {
    /// Parse `arguments` for tool `name`. Missing arguments are treated as `{}`.
    pub fn parse(name: &str, arguments: Option<Value>) -> Result<Self, ToolError> {
        let arguments = match arguments {
            None | Some(Value::Null) => json!({}),
            Some(value) => value,
        };

        fn typed<T: serde::de::DeserializeOwned>(tool: &str, value: Value) -> Result<T, ToolError> {
            serde_json::from_value(value).map_err(|e| ToolError::InvalidArguments {
                tool: tool.to_string(),
                message: e.to_string(),
            })
        }

        Ok(match name {
            names::OPEN_TERMINAL => ToolCall::OpenTerminal(typed(name, arguments)?),
            names::SEND_COMMAND => ToolCall::SendCommand(typed(name, arguments)?),
            names::READ_OUTPUT => ToolCall::ReadOutput(typed(name, arguments)?),
            names::CLOSE_TERMINAL => ToolCall::CloseTerminal(typed(name, arguments)?),
            names::LIST_TERMINALS => ToolCall::ListTerminals(typed(name, arguments)?),
            names::START_ZELLIJ_SESSION => ToolCall::StartZellijSession(typed(name, arguments)?),
            names::ZELLIJ_ACTION => ToolCall::ZellijAction(typed(name, arguments)?),
            names::CAPTURE_STATE => ToolCall::CaptureState(typed(name, arguments)?),
            other => return Err(ToolError::UnknownTool(other.to_string())),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::OpenTerminal(_) => names::OPEN_TERMINAL,
            ToolCall::SendCommand(_) => names::SEND_COMMAND,
            ToolCall::ReadOutput(_) => names::READ_OUTPUT,
            ToolCall::CloseTerminal(_) => names::CLOSE_TERMINAL,
            ToolCall::ListTerminals(_) => names::LIST_TERMINALS,
            ToolCall::StartZellijSession(_) => names::START_ZELLIJ_SESSION,
            ToolCall::ZellijAction(_) => names::ZELLIJ_ACTION,
            ToolCall::CaptureState(_) => names::CAPTURE_STATE,
        }
    }

    /// Whether this tool needs zellij support enabled.
    pub fn requires_multiplexer(&self) -> bool {
        matches!(
            self,
            ToolCall::StartZellijSession(_) | ToolCall::ZellijAction(_)
        )
    }
}

/// Tool names as advertised in `tools/list`.
pub mod names {
    pub const OPEN_TERMINAL: &str = "open_terminal";
    pub const SEND_COMMAND: &str = "send_command";
    pub const READ_OUTPUT: &str = "read_output";
    pub const CLOSE_TERMINAL: &str = "close_terminal";
    pub const LIST_TERMINALS: &str = "list_terminals";
    pub const START_ZELLIJ_SESSION: &str = "start_zellij_session";
    pub const ZELLIJ_ACTION: &str = "zellij_action";
    pub const CAPTURE_STATE: &str = "capture_state";
}

/// One `tools/list` entry.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

fn schema<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| json!({ "type": "object" }))
}

/// The static tool catalogue. Zellij tools are left out when multiplexer
/// support is disabled.
pub fn catalogue(multiplexer: bool) -> Vec<ToolDefinition> {
    let mut tools = vec![
        ToolDefinition {
            name: names::OPEN_TERMINAL,
            description: descriptions::OPEN_TERMINAL,
            input_schema: schema::<OpenTerminalInput>(),
        },
        ToolDefinition {
            name: names::SEND_COMMAND,
            description: descriptions::SEND_COMMAND,
            input_schema: schema::<SendCommandInput>(),
        },
        ToolDefinition {
            name: names::READ_OUTPUT,
            description: descriptions::READ_OUTPUT,
            input_schema: schema::<ReadOutputInput>(),
        },
        ToolDefinition {
            name: names::CLOSE_TERMINAL,
            description: descriptions::CLOSE_TERMINAL,
            input_schema: schema::<SessionInput>(),
        },
        ToolDefinition {
            name: names::LIST_TERMINALS,
            description: descriptions::LIST_TERMINALS,
            input_schema: schema::<ListTerminalsInput>(),
        },
    ];

    if multiplexer {
        tools.push(ToolDefinition {
            name: names::START_ZELLIJ_SESSION,
            description: descriptions::START_ZELLIJ_SESSION,
            input_schema: schema::<StartZellijSessionInput>(),
        });
        tools.push(ToolDefinition {
            name: names::ZELLIJ_ACTION,
            description: descriptions::ZELLIJ_ACTION,
            input_schema: schema::<ZellijActionInput>(),
        });
    }

    tools.push(ToolDefinition {
        name: names::CAPTURE_STATE,
        description: descriptions::CAPTURE_STATE,
        input_schema: schema::<SessionInput>(),
    });

    tools
}

/// MCP tool descriptions for registration.
pub mod descriptions {
    pub const OPEN_TERMINAL: &str = r#"
Open a new terminal and return a persistent handle.

Starts a shell in the given working directory. The returned Terminal ID
addresses the terminal in every other tool until close_terminal.

Example:
{
    "cwd": "/home/user/project"
}
"#;

    pub const SEND_COMMAND: &str = r#"
Send a command to a specific terminal by ID.

A newline is appended. Output produced within the timeout (seconds,
default 2) is returned.

Example:
{
    "session_id": "term-1",
    "command": "cargo test",
    "timeout": 30
}
"#;

    pub const READ_OUTPUT: &str = r#"
Read pending output from a terminal.

Waits up to the timeout (seconds, default 2) for new output.

Example:
{
    "session_id": "term-1"
}
"#;

    pub const CLOSE_TERMINAL: &str = r#"
Close a terminal.

Kills the shell (or closes the window) and forgets the Terminal ID.

Example:
{
    "session_id": "term-1"
}
"#;

    pub const LIST_TERMINALS: &str = r#"
List all managed terminal sessions.
"#;

    pub const START_ZELLIJ_SESSION: &str = r#"
Start a Zellij session in a terminal with optional layout.

Example:
{
    "session_id": "term-1",
    "session_name": "dev",
    "layout_path": "/home/user/.config/zellij/layouts/dev.kdl"
}
"#;

    pub const ZELLIJ_ACTION: &str = r#"
Execute Zellij actions (dump-layout, write-chars, new-pane, list-sessions).

Example:
{
    "session_id": "term-1",
    "action": "new-pane",
    "action_args": { "direction": "right" }
}
"#;

    pub const CAPTURE_STATE: &str = r#"
Capture and parse Zellij layout state and terminal content for verification.

Example:
{
    "session_id": "term-1"
}
"#;
}
