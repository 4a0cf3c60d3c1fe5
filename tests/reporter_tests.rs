//! Stat reporter delivery tests.
//!
//! The reporter is exercised directly against a minimal in-process HTTP
//! peer, so the exact wire shape (`{"data_list": [...]}` with the
//! controller's field names) and the shutdown flush can be asserted without
//! running a whole engine.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use udp_traffic::{reporter, StatRecord};

/// Accept controller POSTs, answer with `status_line`, and forward each raw
/// JSON body over a channel.
async fn spawn_peer(status_line: &'static str) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind peer");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut raw = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    if let Some((body, consumed)) = next_request(&raw) {
                        let _ = tx.send(String::from_utf8_lossy(body).into_owned());
                        raw.drain(..consumed);
                        let response =
                            format!("HTTP/1.1 {status_line}\r\ncontent-length: 0\r\n\r\n");
                        if stream.write_all(response.as_bytes()).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => raw.extend_from_slice(&buf[..n]),
                    }
                }
            });
        }
    });

    (format!("http://{addr}/api/v1/UDPTrafficStat/"), rx)
}

fn next_request(raw: &[u8]) -> Option<(&[u8], usize)> {
    let header_end = raw.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let headers = std::str::from_utf8(&raw[..header_end]).ok()?;
    let length: usize = headers
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .unwrap_or(0);
    let body = &raw[header_end..];
    (body.len() >= length).then(|| (&body[..length], header_end + length))
}

fn record(seq_time: &str, sent: u64) -> StatRecord {
    StatRecord {
        app_id: "job-9".into(),
        byte_sent: sent * 3,
        packets_sent: sent,
        packets_receive: sent,
        drop_packets: 0,
        avg_latency: 0.002,
        pkt_time: seq_time.into(),
    }
}

// ---------------------------------------------------------------------------
// Test 1: periodic batch carries the controller's wire shape
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn periodic_batch_is_posted_as_data_list() {
    let (url, mut bodies) = spawn_peer("200 OK").await;
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(reporter::run(url, Duration::from_millis(200), rx));

    tx.send(record("t1", 10)).unwrap();
    tx.send(record("t2", 10)).unwrap();

    let body = tokio::time::timeout(Duration::from_secs(5), bodies.recv())
        .await
        .expect("batch within one interval")
        .expect("peer alive");
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    let list = value["data_list"].as_array().expect("data_list array");
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["app_id"], "job-9");
    assert_eq!(list[0]["packets_sent"], 10);
    assert_eq!(list[0]["drop_packets"], 0);
    assert_eq!(list[0]["pkt_time"], "t1");

    drop(tx);
    task.await.unwrap();
}

// ---------------------------------------------------------------------------
// Test 2: closing the channel flushes the tail before exit
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_flushes_records_queued_after_the_last_tick() {
    let (url, mut bodies) = spawn_peer("200 OK").await;
    let (tx, rx) = mpsc::unbounded_channel();
    // Interval far beyond the test: only the shutdown flush can deliver.
    let task = tokio::spawn(reporter::run(url, Duration::from_secs(600), rx));

    // Let the immediate first tick pass before queueing anything.
    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(record("tail", 3)).unwrap();
    drop(tx);
    task.await.unwrap();

    let body = bodies.recv().await.expect("tail batch delivered");
    assert!(body.contains("\"pkt_time\":\"tail\""));
}

// ---------------------------------------------------------------------------
// Test 3: rejected batches are discarded, not retried
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn rejected_batch_is_dropped_and_reporting_continues() {
    let (url, mut bodies) = spawn_peer("500 Internal Server Error").await;
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(reporter::run(url, Duration::from_millis(200), rx));

    tx.send(record("first", 1)).unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), bodies.recv())
        .await
        .expect("first batch posted")
        .unwrap();
    assert!(first.contains("first"));

    // The failed batch must not come back; the next one is fresh.
    tx.send(record("second", 2)).unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), bodies.recv())
        .await
        .expect("second batch posted")
        .unwrap();
    assert!(second.contains("second"));
    assert!(!second.contains("\"pkt_time\":\"first\""), "no retry of a failed batch");

    drop(tx);
    task.await.unwrap();
}
