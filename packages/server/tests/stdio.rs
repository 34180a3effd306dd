use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::task::JoinHandle;

use varsync_core::SessionManager;
use varsync_server::{serve, ServerError};

struct Client {
    input: DuplexStream,
    output: Lines<BufReader<DuplexStream>>,
    server: JoinHandle<Result<(), ServerError>>,
}

impl Client {
    fn start(manager: Arc<SessionManager>) -> Self {
        let (input, server_input) = tokio::io::duplex(64 * 1024);
        let (server_output, output) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve(manager, server_input, server_output));
        Self {
            input,
            output: BufReader::new(output).lines(),
            server,
        }
    }

    async fn send(&mut self, request: Value) {
        let mut line = request.to_string();
        line.push('\n');
        self.input.write_all(line.as_bytes()).await.unwrap();
    }

    async fn next(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(2), self.output.next_line())
            .await
            .expect("timed out waiting for output")
            .unwrap()
            .expect("output closed");
        serde_json::from_str(&line).unwrap()
    }

    async fn call(&mut self, request: Value) -> Value {
        self.send(request).await;
        self.next().await
    }

    async fn close(self) {
        drop(self.input);
        self.server.await.unwrap().unwrap();
    }
}

async fn client_with_temperature() -> Client {
    let mut client = Client::start(Arc::new(SessionManager::default()));
    let created = client
        .call(json!({"id": 1, "op": "create_session", "session_id": "s"}))
        .await;
    assert_eq!(created["success"], json!(true));
    let registered = client
        .call(json!({
            "id": 2,
            "op": "register_variable",
            "session_id": "s",
            "name": "temperature",
            "type": "float",
            "initial_value": 0.7,
            "constraints": {"min": 0.0, "max": 2.0}
        }))
        .await;
    assert_eq!(registered["success"], json!(true));
    client
}

#[tokio::test]
async fn test_register_get_set() {
    let mut client = client_with_temperature().await;

    let got = client
        .call(json!({"id": "g", "op": "get_variable", "session_id": "s", "identifier": "temperature", "bypass_cache": true}))
        .await;
    assert_eq!(got["id"], json!("g"));
    assert_eq!(got["data"]["value"], json!(0.7));
    assert_eq!(got["data"]["version"], json!(0));
    assert_eq!(got["data"]["type"], json!("float"));

    let rejected = client
        .call(json!({"id": 3, "op": "set_variable", "session_id": "s", "identifier": "temperature", "value": 3.0}))
        .await;
    assert_eq!(rejected["success"], json!(false));
    assert_eq!(rejected["error"]["kind"], json!("constraint_violation"));

    let set = client
        .call(json!({"id": 4, "op": "set_variable", "session_id": "s", "identifier": "temperature", "value": 0.9, "expected_version": 0}))
        .await;
    assert_eq!(set["data"]["version"], json!(1));

    let stale = client
        .call(json!({"id": 5, "op": "set_variable", "session_id": "s", "identifier": "temperature", "value": 0.9, "expected_version": 0}))
        .await;
    assert_eq!(stale["error"]["kind"], json!("version_conflict"));

    client.close().await;
}

#[tokio::test]
async fn test_watch_streams_events_after_response() {
    let mut client = client_with_temperature().await;

    let watch = client
        .call(json!({
            "id": 3,
            "op": "watch_variables",
            "session_id": "s",
            "identifiers": ["temperature"],
            "include_initial": true
        }))
        .await;
    assert_eq!(watch["success"], json!(true));
    let subscription = watch["data"]["subscription"].clone();

    let initial = client.next().await;
    assert_eq!(initial["watch"], subscription);
    assert_eq!(initial["event"]["type"], json!("initial"));
    assert_eq!(initial["event"]["value"], json!(0.7));

    client
        .send(json!({"id": 4, "op": "set_variable", "session_id": "s", "identifier": "temperature", "value": 1.0}))
        .await;
    // The response and the event may arrive in either order.
    let mut saw_response = false;
    let mut saw_update = false;
    for _ in 0..2 {
        let line = client.next().await;
        if line.get("watch").is_some() {
            assert_eq!(line["event"]["type"], json!("updated"));
            assert_eq!(line["event"]["old_value"], json!(0.7));
            assert_eq!(line["event"]["new_value"], json!(1.0));
            saw_update = true;
        } else {
            assert_eq!(line["id"], json!(4));
            saw_response = true;
        }
    }
    assert!(saw_response && saw_update);

    client
        .send(json!({"id": 5, "op": "unwatch", "session_id": "s", "subscription": subscription}))
        .await;
    let mut saw_closing = false;
    for _ in 0..2 {
        let line = client.next().await;
        if line.get("watch").is_some() {
            assert_eq!(line["closed"], json!(true));
            saw_closing = true;
        } else {
            assert_eq!(line["data"]["removed"], json!(true));
        }
    }
    assert!(saw_closing);

    client.close().await;
}

#[tokio::test]
async fn test_batch_reports_per_key_errors() {
    let mut client = client_with_temperature().await;
    let batch = client
        .call(json!({
            "id": 3,
            "op": "set_variables",
            "session_id": "s",
            "atomic": true,
            "updates": {
                "temperature": {"value": 1.0},
                "missing": {"value": 1}
            }
        }))
        .await;
    assert_eq!(batch["success"], json!(false));
    assert_eq!(batch["error"]["kind"], json!("partial_failure"));
    assert_eq!(batch["data"]["errors"]["missing"]["kind"], json!("not_found"));
    assert_eq!(batch["data"]["applied"], json!({}));

    client.close().await;
}

#[tokio::test]
async fn test_closing_input_releases_locks() {
    let manager = Arc::new(SessionManager::default());
    let mut first = Client::start(Arc::clone(&manager));
    first
        .call(json!({"id": 1, "op": "create_session", "session_id": "s"}))
        .await;
    first
        .call(json!({"id": 2, "op": "register_variable", "session_id": "s", "name": "t", "type": "integer", "initial_value": 1}))
        .await;
    let started = first
        .call(json!({"id": 3, "op": "start_optimization", "session_id": "s", "identifier": "t", "holder_id": "opt1"}))
        .await;
    assert_eq!(started["success"], json!(true));

    let mut second = Client::start(Arc::clone(&manager));
    let blocked = second
        .call(json!({"id": 1, "op": "start_optimization", "session_id": "s", "identifier": "t", "holder_id": "opt2"}))
        .await;
    assert_eq!(blocked["error"]["kind"], json!("already_optimizing"));

    first.close().await;
    let acquired = second
        .call(json!({"id": 2, "op": "start_optimization", "session_id": "s", "identifier": "t", "holder_id": "opt2"}))
        .await;
    assert_eq!(acquired["success"], json!(true));

    second.close().await;
}

#[tokio::test]
async fn test_invalid_lines_get_error_responses() {
    let mut client = Client::start(Arc::new(SessionManager::default()));
    let response = client.call(json!({"id": 9, "op": "no_such_op"})).await;
    assert_eq!(response["id"], json!(9));
    assert_eq!(response["error"]["kind"], json!("invalid_request"));

    let missing = client
        .call(json!({"id": 10, "op": "get_variable", "session_id": "nope", "identifier": "x"}))
        .await;
    assert_eq!(missing["error"]["kind"], json!("not_found"));

    client.close().await;
}
