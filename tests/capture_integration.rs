use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tempfile::tempdir;

use harlog::capture::CaptureController;
use harlog::config::{CaptureConfig, OverflowPolicy, QueueMode};
use harlog::error::CaptureError;
use harlog::model::{
    FlowRecord, FlowSnapshot, RequestSnapshot, ResponseSnapshot, ServerSnapshot,
};
use harlog::writer::Durability;

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn snapshot(tag: &str) -> FlowSnapshot {
    FlowSnapshot {
        id: format!("flow-{tag}"),
        request: RequestSnapshot {
            method: "GET".into(),
            url: format!("http://example.com/{tag}?x=1"),
            host: "example.com".into(),
            path: format!("/{tag}"),
            http_version: "HTTP/1.1".into(),
            headers: vec![("Accept".into(), "text/html".into())],
            body: None,
            timestamp_start: Some(10.000),
            timestamp_end: Some(10.002),
        },
        response: Some(ResponseSnapshot {
            status: 200,
            reason: "OK".into(),
            http_version: "HTTP/1.1".into(),
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: Some(Bytes::from_static(br#"{"ok":true}"#)),
            timestamp_start: Some(10.030),
            timestamp_end: Some(10.050),
        }),
        server: Some(ServerSnapshot {
            peer_addr: Some("10.1.2.3".parse().unwrap()),
            timestamp_start: Some(9.900),
            timestamp_tcp_setup: Some(9.920),
            timestamp_tls_setup: None,
            timestamp_end: Some(10.060),
        }),
    }
}

fn read_records(path: &Path) -> Vec<FlowRecord> {
    let text = std::fs::read_to_string(path).unwrap();
    text.lines()
        .map(|line| {
            serde_json::from_str(line)
                .unwrap_or_else(|e| panic!("unparseable record line {line:?}: {e}"))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Direct mode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn direct_capture_writes_one_record_per_flow() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("capture.jsonl");

    let controller = CaptureController::new();
    controller.configure(&CaptureConfig::new(&path)).unwrap();

    controller.on_flow_completed(snapshot("a"));
    controller.on_flow_completed(snapshot("b"));
    controller.shutdown().await.unwrap();

    let records = read_records(&path);
    assert_eq!(records.len(), 2);

    let first = &records[0];
    assert_eq!(first.request.method, "GET");
    assert_eq!(first.request.url, "http://example.com/a?x=1");
    assert_eq!(first.request.query_string.len(), 1);
    assert_eq!(first.request.query_string[0].name, "x");
    assert_eq!(first.request.query_string[0].value, "1");
    assert_eq!(first.response.status, 200);
    assert_eq!(first.response.body.as_deref(), Some(r#"{"ok":true}"#));
    assert_eq!(first.response.body_size, 11);
    assert_eq!(first.response.content_type, "application/json");
    assert_eq!(first.server_ip_address, "10.1.2.3");
    assert_eq!(first.timings.connect, 20);
    assert_eq!(first.timings.send, 2);
    assert_eq!(first.timings.wait, 28);
    assert_eq!(first.timings.receive, 20);
    assert_eq!(first.timings.blocked, 0);
    assert_eq!(first.timings.dns, 0);
}

#[tokio::test]
async fn flow_without_response_keeps_schema_shape() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("capture.jsonl");

    let controller = CaptureController::new();
    controller.configure(&CaptureConfig::new(&path)).unwrap();

    let mut aborted = snapshot("aborted");
    aborted.response = None;
    aborted.server = None;
    controller.on_flow_completed(aborted);
    controller.on_flow_completed(snapshot("ok"));
    controller.shutdown().await.unwrap();

    let records = read_records(&path);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].response.status, 0);
    assert_eq!(records[0].response.status_text, "");
    assert_eq!(records[0].response.body, None);
    assert_eq!(records[0].response.body_size, 0);
    assert_eq!(records[0].server_ip_address, "");
    assert_eq!(records[1].response.status, 200);

    // Both lines expose the identical set of keys.
    let text = std::fs::read_to_string(&path).unwrap();
    let values: Vec<serde_json::Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let keys = |v: &serde_json::Value| -> Vec<String> {
        v["response"]
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect()
    };
    assert_eq!(keys(&values[0]), keys(&values[1]));
}

#[tokio::test]
async fn binary_body_round_trips_through_base64() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("capture.jsonl");

    let controller = CaptureController::new();
    controller.configure(&CaptureConfig::new(&path)).unwrap();

    let mut flow = snapshot("jpeg");
    flow.response.as_mut().unwrap().body = Some(Bytes::from_static(&[0xFF, 0xD8, 0xFF]));
    controller.on_flow_completed(flow);
    controller.shutdown().await.unwrap();

    let records = read_records(&path);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].response.body_size, 3);

    use base64::{engine::general_purpose, Engine as _};
    let decoded = general_purpose::STANDARD
        .decode(records[0].response.body.as_deref().unwrap())
        .unwrap();
    assert_eq!(decoded, vec![0xFF, 0xD8, 0xFF]);
}

#[tokio::test]
async fn malformed_flow_does_not_stop_capture() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("capture.jsonl");

    let controller = CaptureController::new();
    controller.configure(&CaptureConfig::new(&path)).unwrap();

    let mut broken = snapshot("broken");
    broken.request.url = "no scheme at all".into();
    controller.on_flow_completed(broken);
    controller.on_flow_completed(snapshot("after"));
    controller.shutdown().await.unwrap();

    let records = read_records(&path);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].request.path, "/after");
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_appends_never_interleave() {
    const WRITERS: usize = 16;
    const FLOWS_PER_WRITER: usize = 100;

    let tmp = tempdir().unwrap();
    let path = tmp.path().join("capture.jsonl");

    let controller = Arc::new(CaptureController::new());
    controller.configure(&CaptureConfig::new(&path)).unwrap();

    let mut handles = Vec::new();
    for writer in 0..WRITERS {
        let controller = controller.clone();
        handles.push(std::thread::spawn(move || {
            for flow in 0..FLOWS_PER_WRITER {
                controller.on_flow_completed(snapshot(&format!("w{writer}-f{flow}")));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    controller.shutdown().await.unwrap();

    // Every line parses independently and nothing was lost or duplicated.
    let records = read_records(&path);
    assert_eq!(records.len(), WRITERS * FLOWS_PER_WRITER);

    let mut ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), WRITERS * FLOWS_PER_WRITER);

    let mut paths: Vec<&str> = records.iter().map(|r| r.request.path.as_str()).collect();
    paths.sort_unstable();
    paths.dedup();
    assert_eq!(paths.len(), WRITERS * FLOWS_PER_WRITER);
}

// ---------------------------------------------------------------------------
// Queued mode
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_block_policy_delivers_everything() {
    const FLOWS: usize = 500;

    let tmp = tempdir().unwrap();
    let path = tmp.path().join("capture.jsonl");

    let mut config = CaptureConfig::new(&path);
    config.queue = QueueMode::Queued {
        capacity: 8,
        policy: OverflowPolicy::Block,
    };
    config.durability = Durability::Batched { max_buffered: 32 };

    let controller = Arc::new(CaptureController::new());
    controller.configure(&config).unwrap();

    let producer = {
        let controller = controller.clone();
        std::thread::spawn(move || {
            for flow in 0..FLOWS {
                controller.on_flow_completed(snapshot(&format!("q{flow}")));
            }
        })
    };
    producer.join().unwrap();
    controller.shutdown().await.unwrap();

    assert_eq!(read_records(&path).len(), FLOWS);
    assert_eq!(controller.dropped_records(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_drop_oldest_bounds_memory_not_correctness() {
    const FLOWS: usize = 300;

    let tmp = tempdir().unwrap();
    let path = tmp.path().join("capture.jsonl");

    let mut config = CaptureConfig::new(&path);
    config.queue = QueueMode::Queued {
        capacity: 4,
        policy: OverflowPolicy::DropOldest,
    };

    let controller = Arc::new(CaptureController::new());
    controller.configure(&config).unwrap();

    for flow in 0..FLOWS {
        controller.on_flow_completed(snapshot(&format!("d{flow}")));
    }
    controller.shutdown().await.unwrap();

    // Drops are allowed, corruption is not: whatever made it to disk is
    // well-formed, and written + dropped accounts for every flow.
    let records = read_records(&path);
    assert!(records.len() <= FLOWS);
    assert!(!records.is_empty());
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_is_idempotent_and_closes_the_log() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("capture.jsonl");

    let controller = CaptureController::new();
    controller.configure(&CaptureConfig::new(&path)).unwrap();
    controller.on_flow_completed(snapshot("a"));

    controller.shutdown().await.unwrap();
    controller.shutdown().await.unwrap();

    assert!(matches!(
        controller.capture(snapshot("late")),
        Err(CaptureError::Closed)
    ));
    assert_eq!(read_records(&path).len(), 1);
}

#[tokio::test]
async fn reconfigure_switches_targets_without_losing_records() {
    let tmp = tempdir().unwrap();
    let first = tmp.path().join("first.jsonl");
    let second = tmp.path().join("second.jsonl");

    let controller = CaptureController::new();
    controller.configure(&CaptureConfig::new(&first)).unwrap();
    controller.on_flow_completed(snapshot("one"));

    controller.configure(&CaptureConfig::new(&second)).unwrap();
    controller.on_flow_completed(snapshot("two"));
    controller.shutdown().await.unwrap();

    let first_records = read_records(&first);
    let second_records = read_records(&second);
    assert_eq!(first_records.len(), 1);
    assert_eq!(first_records[0].request.path, "/one");
    assert_eq!(second_records.len(), 1);
    assert_eq!(second_records[0].request.path, "/two");
}

#[tokio::test]
async fn failed_configure_leaves_previous_target_usable() {
    let tmp = tempdir().unwrap();
    let good = tmp.path().join("good.jsonl");

    let controller = CaptureController::new();
    controller.configure(&CaptureConfig::new(&good)).unwrap();

    // A directory is not an appendable file.
    let bad = CaptureConfig::new(tmp.path());
    assert!(controller.configure(&bad).is_err());

    controller.on_flow_completed(snapshot("still-works"));
    controller.shutdown().await.unwrap();
    assert_eq!(read_records(&good).len(), 1);
}

#[tokio::test]
async fn configure_creates_missing_parent_directories() {
    let tmp = tempdir().unwrap();
    let nested = tmp.path().join("a/b/capture.jsonl");

    let controller = CaptureController::new();
    controller.configure(&CaptureConfig::new(&nested)).unwrap();
    controller.on_flow_completed(snapshot("nested"));
    controller.shutdown().await.unwrap();

    assert_eq!(read_records(&nested).len(), 1);
}

#[tokio::test]
async fn configure_after_shutdown_reopens_capture() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("capture.jsonl");

    let controller = CaptureController::new();
    controller.configure(&CaptureConfig::new(&path)).unwrap();
    controller.on_flow_completed(snapshot("before"));
    controller.shutdown().await.unwrap();

    controller.configure(&CaptureConfig::new(&path)).unwrap();
    controller.on_flow_completed(snapshot("after"));
    controller.shutdown().await.unwrap();

    let records = read_records(&path);
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].request.path, "/after");
}
