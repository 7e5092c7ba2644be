// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! A configurable mock LSP server for testing.
//!
//! Speaks the LSP protocol over stdin/stdout using Content-Length framed
//! JSON-RPC. CLI flags control timing, failure modes and the unsolicited
//! traffic it sends back. Single-threaded and blocking; no tokio.

use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use serde_json::{Value, json};

const INTERNAL_ERROR: i64 = -32603;
const METHOD_NOT_FOUND: i64 = -32601;
const REQUEST_CANCELLED: i64 = -32800;

/// Mock LSP server for integration testing.
#[derive(Parser, Debug)]
#[command(name = "mockls")]
struct Args {
    /// Name reported in `serverInfo` and in answers.
    #[arg(long, default_value = "mockls")]
    name: String,

    /// Sleep before every response (milliseconds).
    #[arg(long, default_value_t = 0)]
    response_delay: u64,

    /// Exit without a word after n responses (simulate crash).
    #[arg(long)]
    drop_after: Option<u64>,

    /// Never respond to this method (repeatable). Cancelling such a request
    /// gets a `RequestCancelled` error back.
    #[arg(long)]
    hang_on: Vec<String>,

    /// Return `InternalError` for this method (repeatable).
    #[arg(long)]
    fail_on: Vec<String>,

    /// Symbol name returned by `workspace/symbol`.
    #[arg(long, default_value = "mock_symbol")]
    symbol: String,

    /// Send workspace/configuration request after initialize.
    #[arg(long)]
    send_configuration_request: bool,

    /// Send this text as `window/logMessage` once initialized.
    #[arg(long)]
    log_message: Option<String>,
}

/// A JSON-RPC message from the client.
#[derive(Debug, Deserialize)]
struct Incoming {
    id: Option<Value>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

/// How the main loop should continue after a message.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit(i32),
}

/// Reads one framed message body. `Ok(None)` means the input ended cleanly.
fn read_frame(reader: &mut impl BufRead) -> io::Result<Option<Vec<u8>>> {
    let mut length = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && name.eq_ignore_ascii_case("content-length")
        {
            length = value.trim().parse::<usize>().ok();
        }
    }

    let length =
        length.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no Content-Length"))?;
    let mut body = vec![0; length];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}

/// Writes one framed message and flushes.
fn write_frame(out: &mut impl Write, message: &Value) -> io::Result<()> {
    let body = message.to_string();
    write!(out, "Content-Length: {}\r\n\r\n{body}", body.len())?;
    out.flush()
}

/// Mock server state over any output sink.
struct MockServer<W: Write> {
    args: Args,
    out: W,
    responses_sent: u64,
    hung: HashSet<String>,
    shutdown_received: bool,
    next_request_id: u64,
}

impl<W: Write> MockServer<W> {
    fn new(args: Args, out: W) -> Self {
        Self {
            args,
            out,
            responses_sent: 0,
            hung: HashSet::new(),
            shutdown_received: false,
            next_request_id: 1,
        }
    }

    /// Serves `input` until `exit`, a simulated crash or end of input.
    /// Returns the process exit code.
    fn run(&mut self, input: &mut impl BufRead) -> i32 {
        loop {
            let body = match read_frame(input) {
                Ok(Some(body)) => body,
                Ok(None) => return 0,
                Err(_) => return 1,
            };
            let Ok(message) = serde_json::from_slice::<Incoming>(&body) else {
                continue;
            };
            match self.dispatch(message) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit(code)) => return code,
                // The client hung up on us.
                Err(_) => return 1,
            }
        }
    }

    fn dispatch(&mut self, message: Incoming) -> io::Result<Flow> {
        match (message.method, message.id) {
            (Some(method), Some(id)) => self.on_request(&method, id, &message.params),
            (Some(method), None) => self.on_notification(&method, &message.params),
            // Replies to our own requests need no action.
            (None, _) => Ok(Flow::Continue),
        }
    }

    fn on_request(&mut self, method: &str, id: Value, params: &Value) -> io::Result<Flow> {
        if self.args.hang_on.iter().any(|m| m == method) {
            self.hung.insert(id.to_string());
            return Ok(Flow::Continue);
        }

        if self.args.response_delay > 0 {
            std::thread::sleep(Duration::from_millis(self.args.response_delay));
        }

        if self.args.fail_on.iter().any(|m| m == method) {
            let message = format!("mockls: configured to fail on {method}");
            return self.reply(id, Err((INTERNAL_ERROR, message)));
        }

        let result = match method {
            "initialize" => Ok(self.initialize_result(params)),
            "shutdown" => {
                self.shutdown_received = true;
                Ok(Value::Null)
            }
            "textDocument/hover" => Ok(json!({
                "contents": { "kind": "plaintext", "value": format!("hover from {}", self.args.name) }
            })),
            "workspace/symbol" => Ok(self.symbols()),
            _ => Err((METHOD_NOT_FOUND, format!("mockls: method not found: {method}"))),
        };

        let flow = self.reply(id, result)?;
        if method == "initialize" && self.args.send_configuration_request && flow == Flow::Continue
        {
            self.request(
                "workspace/configuration",
                json!({ "items": [{ "section": "mockls" }] }),
            )?;
        }
        Ok(flow)
    }

    fn on_notification(&mut self, method: &str, params: &Value) -> io::Result<Flow> {
        match method {
            "initialized" => {
                if let Some(text) = self.args.log_message.clone() {
                    write_frame(
                        &mut self.out,
                        &json!({
                            "jsonrpc": "2.0",
                            "method": "window/logMessage",
                            "params": { "type": 3, "message": text }
                        }),
                    )?;
                }
                Ok(Flow::Continue)
            }
            "$/cancelRequest" => match params.get("id") {
                Some(id) if self.hung.remove(&id.to_string()) => self.reply(
                    id.clone(),
                    Err((REQUEST_CANCELLED, "mockls: request cancelled".to_string())),
                ),
                _ => Ok(Flow::Continue),
            },
            "exit" => Ok(Flow::Exit(i32::from(!self.shutdown_received))),
            _ => Ok(Flow::Continue),
        }
    }

    fn initialize_result(&self, params: &Value) -> Value {
        let offers_utf8 = params
            .pointer("/capabilities/general/positionEncodings")
            .and_then(Value::as_array)
            .is_some_and(|encodings| encodings.iter().any(|e| e == "utf-8"));

        let mut capabilities = json!({
            "hoverProvider": true,
            "workspaceSymbolProvider": true,
        });
        if offers_utf8 {
            capabilities["positionEncoding"] = json!("utf-8");
        }

        json!({
            "capabilities": capabilities,
            "serverInfo": { "name": self.args.name, "version": "0.1.0" }
        })
    }

    fn symbols(&self) -> Value {
        let symbol = &self.args.symbol;
        json!([{
            "name": symbol,
            "kind": 12,
            "location": {
                "uri": format!("file:///{}/lib.rs", self.args.name),
                "range": {
                    "start": { "line": 0, "character": 0 },
                    "end": { "line": 0, "character": symbol.len() }
                }
            }
        }])
    }

    fn request(&mut self, method: &str, params: Value) -> io::Result<()> {
        let id = format!("mockls-{}", self.next_request_id);
        self.next_request_id += 1;
        write_frame(
            &mut self.out,
            &json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }),
        )
    }

    /// Sends a response and counts it against `--drop-after`.
    fn reply(&mut self, id: Value, result: Result<Value, (i64, String)>) -> io::Result<Flow> {
        let message = match result {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err((code, message)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": message }
            }),
        };
        write_frame(&mut self.out, &message)?;

        self.responses_sent += 1;
        Ok(match self.args.drop_after {
            Some(max) if self.responses_sent >= max => Flow::Exit(1),
            _ => Flow::Continue,
        })
    }
}

fn main() {
    let args = Args::parse();
    let mut server = MockServer::new(args, io::stdout().lock());
    let code = server.run(&mut io::stdin().lock());
    std::process::exit(code);
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Tests use expect/unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn args(extra: &[&str]) -> Args {
        Args::parse_from(std::iter::once("mockls").chain(extra.iter().copied()))
    }

    fn framed(messages: &[Value]) -> Vec<u8> {
        let mut out = Vec::new();
        for message in messages {
            write_frame(&mut out, message).unwrap();
        }
        out
    }

    fn request(id: Value, method: &str, params: Value) -> Value {
        json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
    }

    fn notification(method: &str, params: Value) -> Value {
        json!({ "jsonrpc": "2.0", "method": method, "params": params })
    }

    fn initialize(id: i64) -> Value {
        request(
            json!(id),
            "initialize",
            json!({ "processId": null, "capabilities": { "general": { "positionEncodings": ["utf-8", "utf-16"] } } }),
        )
    }

    /// Runs a server over `input` and returns its exit code and output.
    fn serve(args: Args, input: &[Value]) -> (i32, Vec<Value>) {
        let mut server = MockServer::new(args, Vec::new());
        let code = server.run(&mut Cursor::new(framed(input)));

        let mut output = Cursor::new(server.out);
        let mut messages = Vec::new();
        while let Some(body) = read_frame(&mut output).unwrap() {
            messages.push(serde_json::from_slice(&body).unwrap());
        }
        (code, messages)
    }

    fn response<'a>(messages: &'a [Value], id: &Value) -> &'a Value {
        messages
            .iter()
            .find(|m| m.get("id") == Some(id) && m.get("method").is_none())
            .expect("response with id")
    }

    #[test]
    fn test_read_frame_is_case_insensitive() {
        let mut input = Cursor::new(b"content-length: 2\r\nContent-Type: x\r\n\r\n{}".to_vec());
        assert_eq!(read_frame(&mut input).unwrap(), Some(b"{}".to_vec()));
        assert_eq!(read_frame(&mut input).unwrap(), None);
    }

    #[test]
    fn test_initialize_advertises_utf8() {
        let (_, messages) = serve(args(&["--name", "alpha"]), &[initialize(1)]);

        let result = &response(&messages, &json!(1))["result"];
        assert_eq!(result["capabilities"]["hoverProvider"], true);
        assert_eq!(result["capabilities"]["positionEncoding"], "utf-8");
        assert_eq!(result["serverInfo"]["name"], "alpha");
    }

    #[test]
    fn test_clean_exit_after_shutdown() {
        let input = [
            initialize(1),
            request(json!(2), "shutdown", Value::Null),
            notification("exit", Value::Null),
        ];

        let (code, messages) = serve(args(&[]), &input);
        assert_eq!(code, 0);
        assert!(response(&messages, &json!(2))["result"].is_null());
    }

    #[test]
    fn test_exit_without_shutdown_is_an_error() {
        let (code, _) = serve(args(&[]), &[initialize(1), notification("exit", Value::Null)]);
        assert_eq!(code, 1);
    }

    #[test]
    fn test_fail_on_and_unknown_methods() {
        let input = [
            initialize(1),
            request(json!(2), "textDocument/hover", json!({})),
            request(json!(3), "textDocument/rename", json!({})),
        ];

        let (_, messages) = serve(args(&["--fail-on", "textDocument/hover"]), &input);
        assert_eq!(response(&messages, &json!(2))["error"]["code"], INTERNAL_ERROR);
        assert_eq!(response(&messages, &json!(3))["error"]["code"], METHOD_NOT_FOUND);
    }

    #[test]
    fn test_cancel_releases_hung_request() {
        let input = [
            initialize(1),
            request(json!("exclusive-1"), "workspace/symbol", json!({})),
            notification("$/cancelRequest", json!({ "id": "exclusive-1" })),
        ];

        let (_, messages) = serve(args(&["--hang-on", "workspace/symbol"]), &input);
        let cancelled = response(&messages, &json!("exclusive-1"));
        assert_eq!(cancelled["error"]["code"], REQUEST_CANCELLED);
    }

    #[test]
    fn test_workspace_symbol_answer() {
        let input = [
            initialize(1),
            request(json!(2), "workspace/symbol", json!({ "query": "" })),
        ];

        let (_, messages) = serve(args(&["--name", "beta", "--symbol", "frobnicate"]), &input);
        let symbols = &response(&messages, &json!(2))["result"];
        assert_eq!(symbols[0]["name"], "frobnicate");
        assert_eq!(symbols[0]["location"]["uri"], "file:///beta/lib.rs");
    }

    #[test]
    fn test_drop_after_stops_reading() {
        let input = [
            initialize(1),
            request(json!(2), "textDocument/hover", json!({})),
            request(json!(3), "textDocument/hover", json!({})),
        ];

        let (code, messages) = serve(args(&["--drop-after", "2"]), &input);
        assert_eq!(code, 1);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_unsolicited_traffic() {
        let input = [initialize(1), notification("initialized", json!({}))];

        let (_, messages) = serve(
            args(&["--send-configuration-request", "--log-message", "hello"]),
            &input,
        );
        let methods: Vec<&str> = messages
            .iter()
            .filter_map(|m| m.get("method").and_then(Value::as_str))
            .collect();
        assert_eq!(methods, vec!["workspace/configuration", "window/logMessage"]);
    }
}
