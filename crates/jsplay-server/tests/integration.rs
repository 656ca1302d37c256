//! End-to-end tests for the host server.
//!
//! These drive the full pipeline over an in-memory stream:
//! NDJSON request -> PlaygroundServer -> SandboxExecutor -> V8 -> shims -> NDJSON out

use std::collections::BTreeMap;
use std::sync::Arc;

use jsplay_error::BridgeError;
use jsplay_sandbox::{
    HttpBridge, HttpRequest, HttpResponse, ModuleCache, SandboxConfig, SandboxExecutor,
};
use jsplay_server::packages::PackageManager;
use jsplay_server::preferences::PreferencesStore;
use jsplay_server::PlaygroundServer;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// An HTTP bridge that answers every request with the request echoed back.
struct EchoBridge;

#[async_trait::async_trait]
impl HttpBridge for EchoBridge {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, BridgeError> {
        let data = json!({
            "method": request.method,
            "body": request.body,
            "auth": request.headers.get("Authorization"),
        });
        Ok(HttpResponse {
            data: data.to_string(),
            status: 201,
            status_text: "Created".into(),
            headers: BTreeMap::from([("content-type".into(), "application/json".into())]),
            url: request.url,
        })
    }
}

fn server_in(dir: &std::path::Path, config: SandboxConfig) -> PlaygroundServer {
    let packages = PackageManager::new(dir.join("packages"), Arc::new(ModuleCache::new()))
        .with_npm_command("/nonexistent/npm");
    PlaygroundServer::new(
        SandboxExecutor::new(config),
        PreferencesStore::new(dir.join("preferences.json")),
        packages,
    )
}

/// Feed `requests` to the server, close its input, and collect every line
/// it writes until it shuts down.
async fn run_session(server: PlaygroundServer, requests: &[&str]) -> Vec<Value> {
    let mut input = Vec::new();
    for request in requests {
        input.extend_from_slice(request.as_bytes());
        input.push(b'\n');
    }
    run_raw_session(server, &input).await
}

async fn run_raw_session(server: PlaygroundServer, input: &[u8]) -> Vec<Value> {
    let (mut client_in, server_in) = tokio::io::duplex(64 * 1024);
    let (server_out, mut client_out) = tokio::io::duplex(64 * 1024);

    let serve = tokio::spawn(Arc::new(server).serve(server_in, server_out));

    client_in.write_all(input).await.unwrap();
    drop(client_in);

    let mut raw = String::new();
    client_out.read_to_string(&mut raw).await.unwrap();
    serve.await.unwrap().unwrap();

    raw.lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn response_for(lines: &[Value], id: u64) -> &Value {
    lines
        .iter()
        .find(|l| l.get("event").is_none() && l["id"] == id)
        .unwrap_or_else(|| panic!("no response for id {id} in {lines:#?}"))
}

fn position_of_response(lines: &[Value], id: u64) -> usize {
    lines
        .iter()
        .position(|l| l.get("event").is_none() && l["id"] == id)
        .unwrap()
}

fn console_args(lines: &[Value], id: u64) -> Vec<String> {
    lines
        .iter()
        .filter(|l| {
            l["requestId"] == id
                && l["event"]
                    .as_str()
                    .is_some_and(|e| e.starts_with("console-"))
        })
        .flat_map(|l| l["payload"]["args"].as_array().unwrap().clone())
        .map(|a| a.as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn session_answers_every_request() {
    let dir = tempfile::tempdir().unwrap();
    let lines = run_session(
        server_in(dir.path(), SandboxConfig::default()),
        &[
            r#"{"id":1,"method":"execute-code","params":{"source":"console.log('hi', {a: 1}); [1, 'two']"}}"#,
            r#"{"id":2,"method":"get-preferences"}"#,
            r#"{"id":3,"method":"get-packages","params":{}}"#,
            r#"this is not json"#,
            r#"{"id":4,"method":"nope"}"#,
        ],
    )
    .await;

    assert_eq!(
        response_for(&lines, 1)["result"],
        json!({
            "status": "success",
            "value": {"type": "array", "value": [
                {"type": "number", "value": 1},
                {"type": "string", "value": "two"}
            ]}
        })
    );
    assert_eq!(
        response_for(&lines, 2)["result"],
        json!({"fontSize": 16, "autocomplete": true, "theme": "dracula"})
    );
    assert_eq!(response_for(&lines, 3)["result"], json!({}));
    assert_eq!(response_for(&lines, 4)["error"]["code"], "method_not_found");

    let malformed = lines
        .iter()
        .find(|l| l.get("id") == Some(&Value::Null))
        .unwrap();
    assert_eq!(malformed["error"]["code"], "invalid_request");

    assert_eq!(console_args(&lines, 1), vec!["hi", "{\n  \"a\": 1\n}"]);
}

#[tokio::test]
async fn console_events_precede_their_response() {
    let dir = tempfile::tempdir().unwrap();
    let lines = run_session(
        server_in(dir.path(), SandboxConfig::default()),
        &[r#"{"id":1,"method":"execute-code","params":{"source":"setTimeout(() => console.error('late'), 20); console.info('early'); 'done'"}}"#],
    )
    .await;

    let response_at = position_of_response(&lines, 1);
    let channels: Vec<&str> = lines[..response_at]
        .iter()
        .filter_map(|l| l["event"].as_str())
        .collect();
    assert_eq!(channels, vec!["console-info", "console-error"]);
    assert_eq!(console_args(&lines, 1), vec!["early", "late"]);
    assert_eq!(
        response_for(&lines, 1)["result"]["value"],
        json!({"type": "string", "value": "done"})
    );
}

#[tokio::test]
async fn overlapping_executions_keep_their_console_output_apart() {
    let dir = tempfile::tempdir().unwrap();
    let lines = run_session(
        server_in(dir.path(), SandboxConfig::default()),
        &[
            r#"{"id":10,"method":"execute-code","params":{"source":"for (let i = 0; i < 3; i++) setTimeout(() => console.log('a' + i), 10 * i); 1"}}"#,
            r#"{"id":11,"method":"execute-code","params":{"source":"for (let i = 0; i < 3; i++) setTimeout(() => console.log('b' + i), 10 * i); 2"}}"#,
        ],
    )
    .await;

    assert_eq!(console_args(&lines, 10), vec!["a0", "a1", "a2"]);
    assert_eq!(console_args(&lines, 11), vec!["b0", "b1", "b2"]);
    assert_eq!(response_for(&lines, 10)["result"]["status"], "success");
    assert_eq!(response_for(&lines, 11)["result"]["status"], "success");
}

#[tokio::test]
async fn runtime_errors_are_redacted_failures() {
    let dir = tempfile::tempdir().unwrap();
    let lines = run_session(
        server_in(dir.path(), SandboxConfig::default()),
        &[r#"{"id":1,"method":"execute-code","params":{"source":"function f() { throw new TypeError('bad input'); }\nf()"}}"#],
    )
    .await;

    let result = &response_for(&lines, 1)["result"];
    assert_eq!(result["status"], "failure");
    assert_eq!(result["kind"], "runtime");
    assert_eq!(result["message"], "TypeError: bad input");
}

#[tokio::test]
async fn require_resolves_from_the_package_root() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = dir.path().join("packages/node_modules/greeter");
    std::fs::create_dir_all(pkg.join("lib")).unwrap();
    std::fs::write(
        pkg.join("package.json"),
        r#"{"name":"greeter","version":"1.0.0","main":"lib/index.js"}"#,
    )
    .unwrap();
    std::fs::write(
        pkg.join("lib/index.js"),
        "const words = require('./words.json'); module.exports = (n) => words.hello + ', ' + n;",
    )
    .unwrap();
    std::fs::write(pkg.join("lib/words.json"), r#"{"hello": "Hello"}"#).unwrap();

    let lines = run_session(
        server_in(dir.path(), SandboxConfig::default()),
        &[
            r#"{"id":1,"method":"execute-code","params":{"source":"require('greeter')('jsplay')"}}"#,
            r#"{"id":2,"method":"execute-code","params":{"source":"require('greeter/../../secret')"}}"#,
        ],
    )
    .await;

    assert_eq!(
        response_for(&lines, 1)["result"]["value"],
        json!({"type": "string", "value": "Hello, jsplay"})
    );
    let escaped = &response_for(&lines, 2)["result"];
    assert_eq!(escaped["status"], "failure");
    let message = escaped["message"].as_str().unwrap();
    assert!(!message.contains(dir.path().to_str().unwrap()), "{message}");
}

#[tokio::test]
async fn fetch_goes_through_the_host_bridge_when_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SandboxConfig::default();
    config.capabilities.fetch = true;
    let server = server_in(dir.path(), config).with_http(Arc::new(EchoBridge));

    let lines = run_session(
        server,
        &[r#"{"id":1,"method":"execute-code","params":{"source":"fetch('https://api.test/items', {method: 'post', body: 'x', headers: {Authorization: 't'}}).then(async r => ({ ok: r.ok, status: r.status, json: await r.json() }))"}}"#],
    )
    .await;

    let value = &response_for(&lines, 1)["result"]["value"];
    assert_eq!(value["type"], "object");
    assert_eq!(value["value"]["ok"], json!({"type": "boolean", "value": true}));
    assert_eq!(value["value"]["status"], json!({"type": "number", "value": 201}));
    let echoed = &value["value"]["json"]["value"];
    assert_eq!(echoed["method"], json!({"type": "string", "value": "POST"}));
    assert_eq!(echoed["body"], json!({"type": "string", "value": "x"}));
    assert_eq!(echoed["auth"], json!({"type": "string", "value": "t"}));
}

#[tokio::test]
async fn fetch_is_absent_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_in(dir.path(), SandboxConfig::default()).with_http(Arc::new(EchoBridge));
    let lines = run_session(
        server,
        &[r#"{"id":1,"method":"execute-code","params":{"source":"typeof fetch"}}"#],
    )
    .await;
    assert_eq!(
        response_for(&lines, 1)["result"]["value"],
        json!({"type": "string", "value": "undefined"})
    );
}

#[tokio::test]
async fn preferences_changes_are_broadcast_as_events() {
    let dir = tempfile::tempdir().unwrap();
    let lines = run_session(
        server_in(dir.path(), SandboxConfig::default()),
        &[r#"{"id":1,"method":"save-preferences","params":{"preferences":{"fontSize":14,"autocomplete":true,"theme":"neon"}}}"#],
    )
    .await;

    assert_eq!(response_for(&lines, 1)["result"], json!(true));
    let event = lines
        .iter()
        .find(|l| l["event"] == "preferences-changed")
        .unwrap();
    assert_eq!(event["requestId"], 1);
    assert_eq!(event["payload"]["theme"], "dracula");
    assert_eq!(event["payload"]["fontSize"], 14);
}

#[tokio::test]
async fn unreadable_lines_are_answered_and_the_session_continues() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_in(dir.path(), SandboxConfig::default()).with_max_line_bytes(256);

    let mut input = b"\xff\n".to_vec();
    input.extend_from_slice(&[b'x'; 1024]);
    input.push(b'\n');
    input.extend_from_slice(br#"{"id":1,"method":"execute-code","params":{"source":"1 + 1"}}"#);
    input.push(b'\n');

    let lines = run_raw_session(server, &input).await;
    let rejected: Vec<&Value> = lines
        .iter()
        .filter(|l| l.get("event").is_none() && l["id"].is_null())
        .collect();
    assert_eq!(rejected.len(), 2, "{lines:#?}");
    assert!(rejected
        .iter()
        .all(|l| l["error"]["code"] == "invalid_request"));
    assert_eq!(
        response_for(&lines, 1)["result"]["value"],
        json!({"type": "number", "value": 2})
    );
}
