use std::sync::atomic::{AtomicU32, Ordering};

use cemond::agent::Agent;
use cemond::config::Config;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

static SOCKET_SEQ: AtomicU32 = AtomicU32::new(0);

fn test_config() -> Config {
    let seq = SOCKET_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut cfg = Config::default();
    cfg.page.memory_ce_action = "account".to_string();
    cfg.page.memory_ce.threshold = Some("100 / 1h".to_string());
    cfg.socket_path = std::env::temp_dir().join(format!(
        "cemond-test-{}-{}.sock",
        std::process::id(),
        seq
    ));
    // No health listener in tests.
    cfg.health.addr = String::new();
    cfg
}

/// `status` with only the ADDRV bit (1 << 58) set.
const ADDRV: u64 = 1 << 58;

fn event_line(addr: u64, time: i64) -> String {
    format!(
        r#"{{"addr": {addr}, "status": {ADDRV}, "time": {time}, "cpu": 1, "socket_id": 0, "channel": 1, "dimm": 0}}"#
    )
}

#[tokio::test]
async fn events_are_accounted_and_dump_reports_them() {
    let cfg = test_config();
    let socket_path = cfg.socket_path.clone();

    let mut agent = Agent::new(cfg).expect("agent");
    agent.start().await.expect("agent start");

    let mut stream = UnixStream::connect(&socket_path).await.expect("connect");
    let mut payload = String::new();
    for t in 0..3 {
        payload.push_str(&event_line(0x10000, t));
        payload.push('\n');
    }
    payload.push_str(&event_line(0x20000, 3));
    payload.push('\n');
    payload.push_str("dump\n");
    stream
        .write_all(payload.as_bytes())
        .await
        .expect("send events");
    stream.shutdown().await.expect("close write half");

    let mut report = String::new();
    stream
        .read_to_string(&mut report)
        .await
        .expect("read dump reply");

    assert!(report.starts_with("Per page corrected memory statistics:"));
    assert!(report.contains("10000: total 3 seen"));
    assert!(report.contains("20000: total 1 seen"));

    agent.stop().await.expect("agent stop");
}

#[tokio::test]
async fn garbage_lines_are_ignored_without_closing_the_connection() {
    let cfg = test_config();
    let socket_path = cfg.socket_path.clone();

    let mut agent = Agent::new(cfg).expect("agent");
    agent.start().await.expect("agent start");

    let mut stream = UnixStream::connect(&socket_path).await.expect("connect");
    let mut payload = String::new();
    payload.push_str("this is not an event\n");
    payload.push_str(&event_line(0x30000, 0));
    payload.push('\n');
    payload.push_str("dump\n");
    stream
        .write_all(payload.as_bytes())
        .await
        .expect("send lines");
    stream.shutdown().await.expect("close write half");

    let mut report = String::new();
    stream
        .read_to_string(&mut report)
        .await
        .expect("read dump reply");

    assert!(report.contains("30000: total 1 seen"));

    agent.stop().await.expect("agent stop");
}

#[tokio::test]
async fn dump_on_empty_table_returns_nothing() {
    let cfg = test_config();
    let socket_path = cfg.socket_path.clone();

    let mut agent = Agent::new(cfg).expect("agent");
    agent.start().await.expect("agent start");

    let mut stream = UnixStream::connect(&socket_path).await.expect("connect");
    stream.write_all(b"dump\n").await.expect("send dump");
    stream.shutdown().await.expect("close write half");

    let mut report = String::new();
    stream
        .read_to_string(&mut report)
        .await
        .expect("read dump reply");
    assert!(report.is_empty());

    agent.stop().await.expect("agent stop");
}
