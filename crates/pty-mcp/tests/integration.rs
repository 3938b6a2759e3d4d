//! End-to-end tool flows through `TerminalServer` and the stdio transport.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ttymux_common::Result;
use ttymux_mcp::{Backend, CommandOutput, CommandRunner, ServerConfig, StdioTransport, TerminalServer};

const LAYOUT: &str = r#"layout {
    tab name="main" focus=true {
        pane name="editor"
        pane name="tests"
    }
    tab name="logs" {
        pane
    }
}
"#;

/// Plays `osascript` and `zellij`. A dump-layout typed through write-chars
/// is honoured by writing [`LAYOUT`] to the redirect target.
#[derive(Default)]
struct ScriptedRunner {
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl ScriptedRunner {
    fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == program)
            .map(|(_, args)| args.clone())
            .collect()
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        exit_code: Some(0),
        success: true,
        ..Default::default()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String], _timeout: Duration) -> Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));

        let script = args.join(" ");
        let output = match program {
            "osascript" if script.contains("return id of window 1") => ok("101\n"),
            "osascript" if script.contains("get contents") => ok("$ ls\nCargo.toml\n"),
            "osascript" => ok(""),
            "zellij" if args.iter().any(|a| a == "write-chars") => {
                if let Some(target) = script.split("dump-layout > '").nth(1) {
                    let path = target.split('\'').next().unwrap_or_default();
                    std::fs::write(path, LAYOUT)?;
                }
                ok("")
            }
            "zellij" if args.iter().any(|a| a == "dump-layout") => ok(LAYOUT),
            "zellij" if args.iter().any(|a| a == "list-sessions") => ok("dev [Created 1m ago]\n"),
            _ => CommandOutput {
                stderr: format!("unexpected program {program}"),
                exit_code: Some(1),
                ..Default::default()
            },
        };
        Ok(output)
    }
}

fn pty_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.shell = Some("/bin/sh".into());
    config.drain.command_timeout_ms = 3_000;
    config
}

fn window_server() -> (TerminalServer, Arc<ScriptedRunner>) {
    let mut config = ServerConfig::default();
    config.backend = Backend::TerminalApp;
    config.multiplexer.layout_settle_ms = 20;
    let runner = Arc::new(ScriptedRunner::default());
    (TerminalServer::with_runner(config, runner.clone()), runner)
}

#[cfg(unix)]
#[tokio::test]
async fn test_pty_open_send_close() {
    let server = TerminalServer::new(pty_config());

    let opened = server
        .call_tool("open_terminal", Some(json!({ "cwd": "/tmp" })))
        .await;
    assert!(!opened.is_error, "{}", opened.text);
    assert!(opened.text.contains("Terminal ID: term-1"));

    let listed = server.call_tool("list_terminals", None).await;
    assert!(listed.text.contains("Terminal ID: term-1"));
    assert!(listed.text.contains("Status: running"));
    assert!(listed.text.contains("Backend: pty"));

    let sent = server
        .call_tool(
            "send_command",
            Some(json!({ "session_id": "term-1", "command": "echo $((20+22))" })),
        )
        .await;
    assert!(!sent.is_error, "{}", sent.text);
    let (_, output) = sent.text.split_once("Output:\n").unwrap();
    assert!(output.contains("42"), "{}", sent.text);

    let closed = server
        .call_tool("close_terminal", Some(json!({ "session_id": "term-1" })))
        .await;
    assert!(!closed.is_error);

    let listed = server.call_tool("list_terminals", None).await;
    assert_eq!(listed.text, "No active terminal sessions");

    let again = server
        .call_tool("close_terminal", Some(json!({ "session_id": "term-1" })))
        .await;
    assert!(again.is_error);
    assert!(again.text.contains("not found"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_pty_read_output_and_terminal_id_alias() {
    let server = TerminalServer::new(pty_config());
    server.call_tool("open_terminal", Some(json!({ "cwd": "/tmp" }))).await;

    let idle = server
        .call_tool("read_output", Some(json!({ "terminal_id": "term-1", "timeout": 0.3 })))
        .await;
    assert!(!idle.is_error, "{}", idle.text);

    let sent = server
        .call_tool(
            "send_command",
            Some(json!({ "terminal_id": "term-1", "command": "pwd" })),
        )
        .await;
    assert!(sent.text.contains("/tmp") || sent.text.contains("/private/tmp"));

    server.shutdown().await;
    assert!(server.sessions().is_empty().await);
}

#[cfg(unix)]
#[tokio::test]
async fn test_pty_capture_state_leaves_output_for_read() {
    let server = TerminalServer::new(pty_config());
    server.call_tool("open_terminal", Some(json!({ "cwd": "/tmp" }))).await;

    let sent = server
        .call_tool(
            "send_command",
            Some(json!({ "session_id": "term-1", "command": "sleep 0.6; echo MARK$((6*7))", "timeout": 0.2 })),
        )
        .await;
    assert!(!sent.is_error, "{}", sent.text);
    tokio::time::sleep(Duration::from_millis(1_200)).await;

    let captured = server
        .call_tool("capture_state", Some(json!({ "session_id": "term-1" })))
        .await;
    assert!(!captured.is_error, "{}", captured.text);
    assert!(captured.text.contains("=== Terminal Content ==="));
    assert!(captured.text.contains("MARK42"), "{}", captured.text);

    let read = server
        .call_tool("read_output", Some(json!({ "session_id": "term-1", "timeout": 0.5 })))
        .await;
    assert!(read.text.contains("MARK42"), "{}", read.text);

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_session_has_no_side_effects() {
    let (server, runner) = window_server();
    let out = server
        .call_tool(
            "send_command",
            Some(json!({ "session_id": "term-99", "command": "ls" })),
        )
        .await;

    assert!(out.is_error);
    assert!(out.text.contains("not found"));
    assert!(server.sessions().is_empty().await);
    assert!(runner.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_window_backend_flow() {
    let (server, runner) = window_server();

    let opened = server.call_tool("open_terminal", None).await;
    assert!(!opened.is_error, "{}", opened.text);
    assert!(opened.text.starts_with("Terminal opened successfully\nTerminal ID: term-1\nWindow ID: 101"));

    let sent = server
        .call_tool(
            "send_command",
            Some(json!({ "session_id": "term-1", "command": "ls" })),
        )
        .await;
    assert!(!sent.is_error);

    let read = server
        .call_tool("read_output", Some(json!({ "session_id": "term-1" })))
        .await;
    assert_eq!(read.text, "$ ls\nCargo.toml\n");

    let listed = server.call_tool("list_terminals", None).await;
    assert!(listed.text.contains("Window ID: 101"));
    assert!(listed.text.contains("Zellij Session: N/A"));

    server
        .call_tool("close_terminal", Some(json!({ "session_id": "term-1" })))
        .await;
    let scripts = runner.calls_to("osascript");
    assert!(scripts.last().unwrap()[1].contains("close window id 101"));
}

#[tokio::test]
async fn test_zellij_session_and_action() {
    let (server, runner) = window_server();
    server.call_tool("open_terminal", None).await;

    let before = server
        .call_tool(
            "zellij_action",
            Some(json!({ "session_id": "term-1", "action": "dump-layout" })),
        )
        .await;
    assert!(before.is_error);
    assert!(before.text.contains("No Zellij session"));

    let started = server
        .call_tool(
            "start_zellij_session",
            Some(json!({ "session_id": "term-1", "session_name": "dev" })),
        )
        .await;
    assert_eq!(
        started.text,
        "Zellij session started\nTerminal ID: term-1\nSession Name: dev\nLayout: default"
    );
    let typed = runner.calls_to("osascript");
    assert!(typed.last().unwrap()[1].contains("attach -c dev"));

    let second = server
        .call_tool(
            "start_zellij_session",
            Some(json!({ "session_id": "term-1", "session_name": "other" })),
        )
        .await;
    assert!(second.is_error);
    assert!(second.text.contains("'dev'"));

    let dumped = server
        .call_tool(
            "zellij_action",
            Some(json!({ "session_id": "term-1", "action": "dump-layout" })),
        )
        .await;
    assert!(!dumped.is_error);
    assert!(dumped.text.starts_with("Zellij action executed\nAction: dump-layout\nSuccess: true\nOutput:\n"));
    assert!(dumped.text.contains(r#"tab name="main""#));

    let zellij_calls = runner.calls_to("zellij");
    assert_eq!(
        zellij_calls.last().unwrap(),
        &vec!["--session", "dev", "action", "dump-layout"]
    );

    let unknown = server
        .call_tool(
            "zellij_action",
            Some(json!({ "session_id": "term-1", "action": "detonate" })),
        )
        .await;
    assert!(unknown.is_error);
    assert!(unknown.text.contains("Unknown action 'detonate'"));

    let listed = server.call_tool("list_terminals", None).await;
    assert!(listed.text.contains("Zellij Session: dev"));
}

#[tokio::test]
async fn test_capture_state() {
    let layout_dumps = || {
        std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("zellij_layout_"))
            .count()
    };
    let dumps_before = layout_dumps();
    let (server, _runner) = window_server();
    server.call_tool("open_terminal", None).await;

    let plain = server
        .call_tool("capture_state", Some(json!({ "session_id": "term-1" })))
        .await;
    assert!(!plain.is_error);
    assert!(!plain.text.contains("Zellij Layout State"));
    assert!(plain.text.contains("=== Terminal Content ===\n$ ls"));

    server
        .call_tool(
            "start_zellij_session",
            Some(json!({ "session_id": "term-1", "session_name": "dev" })),
        )
        .await;

    let captured = server
        .call_tool("capture_state", Some(json!({ "session_id": "term-1" })))
        .await;
    assert!(!captured.is_error, "{}", captured.text);
    assert!(captured.text.contains("=== Zellij Layout State ===\nSession: dev"));
    assert!(captured.text.contains("Tabs: main, logs"));
    assert!(captured.text.contains("Panes: editor, tests"));
    assert!(captured.text.contains("Total Pane Count: 3"));
    assert!(captured.text.contains("=== Terminal Content ==="));
    assert_eq!(layout_dumps(), dumps_before);
}

#[tokio::test]
async fn test_transport_survives_bad_tool_call() {
    let (server, _runner) = window_server();
    let input = [
        r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
        r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"no_such_tool","arguments":{}}}"#,
        r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"open_terminal"}}"#,
    ]
    .join("\n");

    let mut output = Vec::new();
    StdioTransport::new(&server)
        .run(input.as_bytes(), &mut output)
        .await
        .unwrap();

    let responses: Vec<Value> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    assert_eq!(responses.len(), 3);
    assert_eq!(responses[1]["id"], json!(2));
    assert_eq!(responses[1]["result"]["isError"], json!(true));
    assert_eq!(
        responses[1]["result"]["content"][0]["text"],
        json!("Unknown tool: no_such_tool")
    );
    assert_eq!(responses[2]["result"]["isError"], json!(false));
    assert!(responses[2]["result"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("Terminal ID: term-1"));
}
