use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::*;

struct Client {
    input: DuplexStream,
    output: Lines<BufReader<DuplexStream>>,
    events: Vec<Value>,
    server: JoinHandle<Result<()>>,
}

impl Client {
    fn start() -> Self {
        let service = Arc::new(InteropService::start(Config::default()).unwrap());
        let (input, server_input) = tokio::io::duplex(64 * 1024);
        let (server_output, output) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve_io(service, server_input, server_output));
        Self {
            input,
            output: BufReader::new(output).lines(),
            events: Vec::new(),
            server,
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.input.write_all(line.as_bytes()).await.unwrap();
        self.input.write_all(b"\n").await.unwrap();
    }

    async fn read(&mut self) -> Value {
        let line = timeout(Duration::from_secs(10), self.output.next_line())
            .await
            .expect("timed out waiting for output")
            .unwrap()
            .expect("server output closed");
        serde_json::from_str(&line).unwrap()
    }

    /// Read until the response for `id`, collecting events on the way
    async fn response(&mut self, id: &Value) -> Value {
        loop {
            let message = self.read().await;
            if let Some(event) = message.get("event") {
                self.events.push(event.clone());
            } else if message.get("id") == Some(id) {
                return message;
            }
        }
    }

    async fn call(&mut self, id: u64, method: &str, params: Value) -> Value {
        let request = json!({ "id": id, "method": method, "params": params });
        self.send_raw(&request.to_string()).await;
        self.response(&json!(id)).await
    }

    /// Read until an event of `kind` arrives
    async fn event(&mut self, kind: &str) -> Value {
        if let Some(position) = self.events.iter().position(|e| e["type"] == kind) {
            return self.events.remove(position);
        }
        loop {
            let message = self.read().await;
            if let Some(event) = message.get("event") {
                if event["type"] == kind {
                    return event.clone();
                }
                self.events.push(event.clone());
            }
        }
    }

    async fn shutdown(mut self) -> Vec<Value> {
        let response = self.call(999, "shutdown", Value::Null).await;
        assert_eq!(response["result"], Value::Null);
        assert!(response.get("error").is_none());
        self.server.await.unwrap().unwrap();
        self.events
    }
}

fn global(name: &str) -> Value {
    json!({ "kind": "member", "scope": { "kind": "global_scope" }, "name": name })
}

// ============================================================================
// Requests
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_evaluate_expression_reference() {
    let mut client = Client::start();

    let response = client
        .call(
            1,
            "evaluate_as_text",
            json!({ "reference": {
                "kind": "expression",
                "scope": { "kind": "global_scope" },
                "code": "1 + 2"
            }}),
        )
        .await;

    assert_eq!(response, json!({ "id": 1, "result": "[1] 3" }));
    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_variable_view_requests() {
    let mut client = Client::start();
    client
        .call(1, "execute_code", json!({ "code": "xs <- list(a = 1, b = \"t\")" }))
        .await;

    let response = client
        .call(2, "load_variables", json!({ "reference": global("xs"), "start": 1 }))
        .await;
    assert_eq!(response["result"]["total_count"], json!(2));
    assert_eq!(response["result"]["vars"][0]["name"], json!("b"));
    assert_eq!(response["result"]["vars"][0]["value"]["preview"], json!("[1] \"t\""));
    assert_eq!(
        response["result"]["vars"][0]["reference"],
        json!({ "kind": "list_element", "list": global("xs"), "index": 1 })
    );

    let response = client
        .call(3, "load_parent_envs", json!({ "reference": { "kind": "global_scope" } }))
        .await;
    assert_eq!(response["result"][0]["name"], json!("base"));

    let first = client
        .call(4, "equality_object", json!({ "reference": global("xs") }))
        .await;
    let second = client
        .call(5, "equality_object", json!({ "reference": global("xs") }))
        .await;
    assert_eq!(first["result"], second["result"]);

    let response = client
        .call(6, "distinct_strings", json!({ "reference": global("xs") }))
        .await;
    assert_eq!(response["result"], json!([]));
    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_protocol_errors() {
    let mut client = Client::start();

    let response = client.call(1, "no_such_method", Value::Null).await;
    assert_eq!(response["error"]["code"], json!(METHOD_NOT_FOUND));

    let response = client.call(2, "evaluate_as_text", json!({ "wrong": 1 })).await;
    assert_eq!(response["error"]["code"], json!(INVALID_PARAMS));

    client.send_raw("{not json").await;
    let response = client.response(&Value::Null).await;
    assert_eq!(response["error"]["code"], json!(PARSE_ERROR));

    let response = client
        .call(3, "value_info", json!({ "reference": {
            "kind": "expression",
            "scope": { "kind": "global_scope" },
            "code": "missing_thing"
        }}))
        .await;
    assert_eq!(
        response["error"],
        json!({ "code": EVAL_ERROR, "message": "object 'missing_thing' not found" })
    );

    let response = client.call(4, "cancel", json!({ "id": 12345 })).await;
    assert_eq!(response["result"], json!(false));
    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_console_round_trip() {
    let mut client = Client::start();
    client.event("prompt").await;

    let response = client.call(1, "send_line", json!({ "line": "x <- 5; x" })).await;
    assert_eq!(response["result"], Value::Null);

    let text = client.event("text").await;
    assert_eq!(
        text,
        json!({ "type": "text", "stream": "stdout", "text": "[1] 5\n" })
    );
    client.event("prompt").await;

    let handle = client
        .call(2, "register_handle", json!({ "reference": global("x") }))
        .await;
    let handle = handle["result"].clone();
    let alive = client.call(3, "has_handle", json!({ "handle": handle })).await;
    assert_eq!(alive["result"], json!(true));

    let events = client.shutdown().await;
    assert!(events.iter().any(|e| e["type"] == "termination"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_breakpoint_over_the_wire() {
    let mut client = Client::start();
    client.event("prompt").await;

    client
        .call(
            1,
            "add_or_modify_breakpoint",
            json!({ "position": { "file": "main.R", "line": 2 } }),
        )
        .await;
    client
        .call(
            2,
            "repl_execute",
            json!({ "code": "a <- 1\nb <- 2", "source": "main.R" }),
        )
        .await;

    let stop = client.event("debug_prompt").await;
    assert_eq!(stop["changed"], json!(true));
    assert_eq!(stop["stack"][0]["position"], json!({ "file": "main.R", "line": 2 }));

    let state = client.call(3, "state", Value::Null).await;
    assert_eq!(state["result"], json!("debug_prompting"));

    client
        .call(4, "debug_command", json!({ "command": "continue" }))
        .await;
    client.event("prompt").await;

    let value = client
        .call(5, "evaluate_as_text", json!({ "reference": global("b") }))
        .await;
    assert_eq!(value["result"], json!("[1] 2"));
    client.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_queued_request() {
    let mut client = Client::start();
    client.event("prompt").await;
    client
        .call(1, "send_line", json!({ "line": "Sys.sleep(30)" }))
        .await;
    client.event("busy").await;

    client
        .send_raw(
            &json!({ "id": 2, "method": "evaluate_as_text", "params": { "reference": global("x") }})
                .to_string(),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancelled = client.call(3, "cancel", json!({ "id": 2 })).await;
    assert_eq!(cancelled["result"], json!(true));

    let response = client.response(&json!(2)).await;
    assert_eq!(response["error"]["code"], json!(REQUEST_CANCELLED));

    client.call(4, "interrupt", Value::Null).await;
    client.event("prompt").await;
    client.shutdown().await;
}
