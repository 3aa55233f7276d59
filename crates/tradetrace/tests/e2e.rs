use std::net::TcpListener;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use serde_json::{Value, json};
use serial_test::serial;
use testkit::{SAMPLE_SPAN_ID, SAMPLE_TRACE_ID, SAMPLE_TRACEPARENT};

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_tradetrace")
}

fn spawn_server(temp: &Path) -> (Child, u16) {
    let port = free_port();
    let child = Command::new(bin())
        .arg("run")
        .arg("--db-path")
        .arg(temp.join("tradetrace.duckdb"))
        .arg("--http-addr")
        .arg(format!("127.0.0.1:{port}"))
        .env("XDG_CONFIG_HOME", temp)
        .env("TRADETRACE_SPAN_RETENTION_TTL", "1h")
        .env_remove("TRADETRACE_CONFIG")
        .env_remove("OTEL_EXPORTER_OTLP_ENDPOINT")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    (child, port)
}

async fn wait_http_ready(port: u16, child: &mut Child) {
    let client = reqwest::Client::new();
    let mut ready = false;
    for _ in 0..100 {
        assert!(child.try_wait().unwrap().is_none(), "tradetrace exited early");
        if client
            .get(format!("http://127.0.0.1:{port}/health"))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
        {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(ready, "http endpoint not ready");
}

async fn get_json(url: String) -> Value {
    reqwest::get(url).await.unwrap().json().await.unwrap()
}

#[tokio::test]
#[serial]
async fn e2e_trade_is_settled_with_link_to_creating_trace() {
    let temp = tempfile::tempdir().unwrap();
    let (mut child, port) = spawn_server(temp.path());
    wait_http_ready(port, &mut child).await;
    let base = format!("http://127.0.0.1:{port}");

    let resp = reqwest::Client::new()
        .post(format!("{base}/api/trades"))
        .header("traceparent", SAMPLE_TRACEPARENT)
        .json(&json!({
            "instrument": "CRUDE-OIL",
            "quantity": 1000,
            "price": 75.50,
            "counterparty": "ACME",
            "tradeDate": "2026-02-01T00:00:00Z"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201);
    let server_traceparent = resp
        .headers()
        .get("traceparent")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let trade: Value = resp.json().await.unwrap();
    let trade_id = trade["tradeId"].as_str().unwrap().to_string();
    assert_eq!(trade["traceParent"], Value::from(server_traceparent.clone()));
    assert!(server_traceparent.starts_with(&format!("00-{SAMPLE_TRACE_ID}-")));

    let mut view = Value::Null;
    for _ in 0..50 {
        view = get_json(format!("{base}/api/settlement/{trade_id}/status")).await;
        if view["isSettled"] == true {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(view["status"], "Settled");
    assert_eq!(view["linkedTraceId"], SAMPLE_TRACE_ID);

    // Spans reach the store through the batching writer.
    let mut trace = Value::Null;
    for _ in 0..50 {
        trace = get_json(format!("{base}/api/traces/{SAMPLE_TRACE_ID}")).await;
        let names: Vec<&str> = trace["spans"]
            .as_array()
            .map(|spans| spans.iter().filter_map(|s| s["name"].as_str()).collect())
            .unwrap_or_default();
        if names.contains(&"settle_trade") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let spans = trace["spans"].as_array().unwrap();
    let server = spans
        .iter()
        .find(|s| s["name"] == "POST /api/trades")
        .expect("server span recorded");
    assert_eq!(server["parent_span_id"], SAMPLE_SPAN_ID);
    let settle = spans
        .iter()
        .find(|s| s["name"] == "settle_trade")
        .expect("settle span recorded");
    assert_eq!(settle["links"][0]["trace_id"], SAMPLE_TRACE_ID);
    assert_eq!(settle["links"][0]["span_id"], server["span_id"]);

    let status = get_json(format!("{base}/api/status")).await;
    assert_eq!(status["trades_count"], 1);
    assert_eq!(status["dead_letters"], 0);

    let _ = child.kill();
    let _ = child.wait();
}

#[tokio::test]
#[serial]
async fn e2e_invalid_and_missing_requests() {
    let temp = tempfile::tempdir().unwrap();
    let (mut child, port) = spawn_server(temp.path());
    wait_http_ready(port, &mut child).await;
    let base = format!("http://127.0.0.1:{port}");
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/api/trades"))
        .json(&json!({
            "instrument": "CRUDE-OIL",
            "quantity": -5,
            "price": 1,
            "counterparty": "ACME"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let resp = client
        .get(format!("{base}/api/trades/does-not-exist"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    let trades = get_json(format!("{base}/api/trades")).await;
    assert_eq!(trades.as_array().map(Vec::len), Some(0));

    let _ = child.kill();
    let _ = child.wait();
}

#[test]
fn decode_prints_context_or_fails() {
    let output = Command::new(bin())
        .arg("decode")
        .arg(SAMPLE_TRACEPARENT)
        .arg("--tracestate")
        .arg("rojo=00f067aa0ba902b7")
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["traceId"], SAMPLE_TRACE_ID);
    assert_eq!(value["spanId"], SAMPLE_SPAN_ID);
    assert_eq!(value["sampled"], true);
    assert_eq!(value["traceState"], "rojo=00f067aa0ba902b7");

    let output = Command::new(bin())
        .arg("decode")
        .arg("ff-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01")
        .output()
        .unwrap();
    assert!(!output.status.success());
}
