//! Line-delimited JSON-RPC transport.
//!
//! One request at a time: read a line, handle it to completion, write the
//! response, repeat. Only EOF or an I/O error on the streams ends the loop.

use crate::protocol::{
    error_codes, parse_incoming, IncomingMessage, InitializeResult, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ToolCallParams,
};
use crate::server::TerminalServer;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};
use ttymux_common::Result;

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingInitialize,
    Ready,
}

/// Serves one client over a reader/writer pair.
pub struct StdioTransport<'a> {
    server: &'a TerminalServer,
    phase: Phase,
}

impl<'a> StdioTransport<'a> {
    pub fn new(server: &'a TerminalServer) -> Self {
        Self {
            server,
            phase: Phase::AwaitingInitialize,
        }
    }

    /// Run until `reader` reaches EOF.
    pub async fn run<R, W>(&mut self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::new();

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                info!("Client disconnected (EOF)");
                break;
            }

            // A line that is not UTF-8 is a parse error, not a broken stream.
            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Received non-UTF-8 line");
                    let response = JsonRpcResponse::error(
                        Value::Null,
                        error_codes::PARSE_ERROR,
                        format!("Parse error: invalid UTF-8: {e}"),
                    );
                    write_response(&mut writer, &response).await?;
                    continue;
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let response = match parse_incoming(trimmed) {
                Ok(IncomingMessage::Request(req)) => Some(self.handle_request(req).await),
                Ok(IncomingMessage::Notification(notif)) => {
                    self.handle_notification(&notif);
                    None
                }
                Err(e) => {
                    warn!(error = %e, "Failed to parse message");
                    Some(e.into_response())
                }
            };

            if let Some(response) = response {
                write_response(&mut writer, &response).await?;
            }
        }

        Ok(())
    }

    async fn handle_request(&mut self, req: JsonRpcRequest) -> JsonRpcResponse {
        debug!(method = %req.method, id = %req.id, "Handling request");

        let method = req.method.clone();
        match (method.as_str(), self.phase) {
            ("initialize", _) => self.handle_initialize(req),
            ("ping", _) => JsonRpcResponse::success(req.id, json!({})),
            ("tools/list" | "tools/call", Phase::AwaitingInitialize) => JsonRpcResponse::error(
                req.id,
                error_codes::INVALID_REQUEST,
                "Server not initialized: send 'initialize' first",
            ),
            ("tools/list", Phase::Ready) => self.handle_tools_list(req),
            ("tools/call", Phase::Ready) => self.handle_tools_call(req).await,
            (method, _) => JsonRpcResponse::error(
                req.id,
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {method}"),
            ),
        }
    }

    fn handle_initialize(&mut self, req: JsonRpcRequest) -> JsonRpcResponse {
        if let Some(client) = req.params.as_ref().and_then(|p| p.get("clientInfo")) {
            info!(client = %client, "Client initializing");
        }
        self.phase = Phase::Ready;

        match serde_json::to_value(InitializeResult::for_this_server()) {
            Ok(result) => JsonRpcResponse::success(req.id, result),
            Err(e) => JsonRpcResponse::error(req.id, error_codes::INTERNAL_ERROR, e.to_string()),
        }
    }

    fn handle_tools_list(&self, req: JsonRpcRequest) -> JsonRpcResponse {
        match serde_json::to_value(self.server.tools()) {
            Ok(tools) => JsonRpcResponse::success(req.id, json!({ "tools": tools })),
            Err(e) => JsonRpcResponse::error(req.id, error_codes::INTERNAL_ERROR, e.to_string()),
        }
    }

    async fn handle_tools_call(&self, req: JsonRpcRequest) -> JsonRpcResponse {
        let params: ToolCallParams = match req.params.map(serde_json::from_value) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                return JsonRpcResponse::error(
                    req.id,
                    error_codes::INVALID_PARAMS,
                    format!("Invalid params: {e}"),
                )
            }
            None => return JsonRpcResponse::error(req.id, error_codes::INVALID_PARAMS, "Missing params"),
        };

        let output = self.server.call_tool(&params.name, params.arguments).await;
        JsonRpcResponse::tool_result(req.id, &output.text, output.is_error)
    }

    fn handle_notification(&self, notif: &JsonRpcNotification) {
        match notif.method.as_str() {
            "notifications/initialized" => info!("Client completed initialization"),
            "notifications/cancelled" => {
                let request_id = notif
                    .params
                    .as_ref()
                    .and_then(|p| p.get("requestId"))
                    .cloned()
                    .unwrap_or(Value::Null);
                debug!(request_id = %request_id, "Client cancelled a request");
            }
            other => debug!(method = %other, "Unhandled notification"),
        }
    }
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &JsonRpcResponse) -> Result<()> {
    let json = match serde_json::to_string(response) {
        Ok(json) => json,
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            return Ok(());
        }
    };
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Serve `server` over stdin/stdout until the client closes stdin.
pub async fn serve_stdio(server: &TerminalServer) -> Result<()> {
    let reader = tokio::io::BufReader::new(tokio::io::stdin());
    let writer = tokio::io::stdout();
    StdioTransport::new(server).run(reader, writer).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    async fn exchange(lines: &[&str]) -> Vec<Value> {
        let server = TerminalServer::new(ServerConfig::default());
        let input = lines.join("\n") + "\n";
        let mut output = Vec::new();
        StdioTransport::new(&server)
            .run(input.as_bytes(), &mut output)
            .await
            .unwrap();

        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    const INIT: &str = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"test","version":"0"}}}"#;
    const INITIALIZED: &str = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;

    #[tokio::test]
    async fn test_initialize_handshake() {
        let responses = exchange(&[INIT, INITIALIZED]).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], json!(1));
        assert_eq!(responses[0]["result"]["protocolVersion"], json!("2024-11-05"));
        assert!(responses[0]["result"]["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn test_tools_before_initialize_rejected() {
        let responses = exchange(&[r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#]).await;
        assert_eq!(responses[0]["error"]["code"], json!(error_codes::INVALID_REQUEST));
    }

    #[tokio::test]
    async fn test_tools_list() {
        let responses = exchange(&[
            INIT,
            INITIALIZED,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
        ])
        .await;
        let tools = responses[1]["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 8);
        assert!(tools.iter().all(|t| t["inputSchema"].is_object()));
    }

    #[tokio::test]
    async fn test_ping_and_unknown_method() {
        let responses = exchange(&[
            r#"{"jsonrpc":"2.0","id":"p","method":"ping"}"#,
            r#"{"jsonrpc":"2.0","id":3,"method":"resources/list"}"#,
        ])
        .await;
        assert_eq!(responses[0]["result"], json!({}));
        assert_eq!(responses[1]["error"]["code"], json!(error_codes::METHOD_NOT_FOUND));
        assert_eq!(responses[1]["id"], json!(3));
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_stop_loop() {
        let responses = exchange(&[
            "this is not json",
            INIT,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"list_terminals"}}"#,
        ])
        .await;
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0]["error"]["code"], json!(error_codes::PARSE_ERROR));
        assert_eq!(responses[0]["id"], Value::Null);
        assert_eq!(
            responses[2]["result"]["content"][0]["text"],
            json!("No active terminal sessions")
        );
        assert_eq!(responses[2]["result"]["isError"], json!(false));
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_parse_error() {
        let server = TerminalServer::new(ServerConfig::default());
        let mut input = br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_vec();
        input.push(b'\n');
        input.extend_from_slice(&[0xff, 0xfe, b'{', b'\n']);
        input.extend_from_slice(br#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#);
        input.push(b'\n');

        let mut output = Vec::new();
        StdioTransport::new(&server)
            .run(input.as_slice(), &mut output)
            .await
            .unwrap();

        let responses: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[1]["error"]["code"], json!(error_codes::PARSE_ERROR));
        assert_eq!(responses[1]["id"], Value::Null);
        assert_eq!(responses[2]["id"], json!(2));
        assert_eq!(responses[2]["result"], json!({}));
    }

    #[tokio::test]
    async fn test_tools_call_missing_params() {
        let responses = exchange(&[INIT, r#"{"jsonrpc":"2.0","id":2,"method":"tools/call"}"#]).await;
        assert_eq!(responses[1]["error"]["code"], json!(error_codes::INVALID_PARAMS));
    }

    #[tokio::test]
    async fn test_eof_without_trailing_newline() {
        let server = TerminalServer::new(ServerConfig::default());
        let mut output = Vec::new();
        StdioTransport::new(&server)
            .run(r#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#.as_bytes(), &mut output)
            .await
            .unwrap();
        assert!(String::from_utf8(output).unwrap().contains(r#""id":9"#));
    }
}
