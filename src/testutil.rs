//! Test support: an in-process collector double plus event fixtures.
//!
//! The mock speaks just enough HTTP/1.1 for reqwest: one request per
//! connection, `content-length` bodies, scripted status codes. Tests assert
//! against the decoded requests it records.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::event::{Event, EventDetails, EventType};

/// Scripted response for one request, in arrival order. Requests past the
/// end of the script get a 200.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MockResponse {
    /// Respond 200 with a tiny body.
    Ok,
    /// Respond with the given status code.
    Status(u16),
    /// Close the connection without responding, so the client observes a
    /// transport error.
    Abort,
}

/// One decoded request observed by the mock.
#[derive(Debug, Clone)]
pub(crate) struct ReceivedRequest {
    pub path: String,
    pub events: Vec<Event>,
    pub body_bytes: usize,
}

#[derive(Debug, Deserialize)]
struct EventsEnvelope {
    events: Vec<Event>,
}

/// Minimal collector double listening on a loopback port.
pub(crate) struct MockCollector {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
    handle: JoinHandle<()>,
}

impl MockCollector {
    pub(crate) async fn start(script: Vec<MockResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock collector");
        let addr = listener.local_addr().expect("mock collector addr");
        let requests: Arc<Mutex<Vec<ReceivedRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(Mutex::new(VecDeque::from(script)));

        let recorded = requests.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let response = script
                    .lock()
                    .map(|mut s| s.pop_front())
                    .unwrap_or(None)
                    .unwrap_or(MockResponse::Ok);
                // Served sequentially so scripted responses match arrival order.
                serve(stream, response, &recorded).await;
            }
        });

        Self {
            addr,
            requests,
            handle,
        }
    }

    /// Base URL suitable for `Config::backend_url`.
    pub(crate) fn backend_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Full ingest endpoint URL.
    pub(crate) fn events_url(&self) -> String {
        format!("http://{}/api/analytics/events", self.addr)
    }

    pub(crate) fn requests(&self) -> Vec<ReceivedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Polls until at least `count` requests have been recorded. Callers
    /// wrap this in a timeout.
    pub(crate) async fn wait_for_requests(&self, count: usize) {
        loop {
            if self.request_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for MockCollector {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    response: MockResponse,
    requests: &Arc<Mutex<Vec<ReceivedRequest>>>,
) {
    let Some((path, body)) = read_request(&mut stream).await else {
        return;
    };

    let events = serde_json::from_slice::<EventsEnvelope>(&body)
        .map(|envelope| envelope.events)
        .unwrap_or_default();
    if let Ok(mut log) = requests.lock() {
        log.push(ReceivedRequest {
            path,
            events,
            body_bytes: body.len(),
        });
    }

    match response {
        // Dropping the stream mid-request is the failure we want.
        MockResponse::Abort => {}
        MockResponse::Ok => write_response(&mut stream, 200, "ok").await,
        MockResponse::Status(code) => write_response(&mut stream, code, "mock").await,
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; 64 * 1024];

    // Headers always fit well inside the first 16 KiB.
    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        let search_window = buf.len().min(16 * 1024);
        if let Some(pos) = find_header_end(&buf[..search_window]) {
            break pos;
        }
        if buf.len() > 16 * 1024 {
            return None;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next()?;
    let path = request_line.split_whitespace().nth(1)?.to_string();

    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buf[header_end + 4..].to_vec();
    body.reserve(content_length.saturating_sub(body.len()));
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Some((path, body))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn write_response(stream: &mut TcpStream, code: u16, body: &str) {
    let reason = match code {
        200 => "OK",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Mock",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        code,
        reason,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Config pointed at a mock collector, with test-friendly timings. The
/// flush interval is long enough that scheduled flushes never fire unless a
/// test shortens it.
pub(crate) fn test_config(backend_url: &str, storage_path: impl Into<PathBuf>) -> Config {
    let backend_url = backend_url.trim_end_matches('/').to_string();
    let mut config = Config::default();
    config.events_url = format!("{}/api/analytics/events", backend_url);
    config.backend_url = backend_url;
    config.storage_path = storage_path.into();
    config.batch_size = 50;
    config.max_local_events = 200;
    config.flush_interval = Duration::from_secs(300);
    config.retry_delay = Duration::from_millis(100);
    config.request_timeout = Duration::from_secs(5);
    config.debug_mode = false;
    config
}

/// Polls until `predicate` holds. Callers wrap this in a timeout.
pub(crate) async fn wait_until(mut predicate: impl FnMut() -> bool) {
    loop {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub(crate) fn sample_event(n: usize) -> Event {
    let mut details = EventDetails::new();
    details.insert("n".to_string(), serde_json::json!(n));
    Event::new(EventType::UiInteraction, "session-test", None, "en", details)
}

pub(crate) fn sample_events(count: usize) -> Vec<Event> {
    (0..count).map(sample_event).collect()
}

/// Event whose serialized form is roughly `payload_bytes` long, for
/// exercising the oversized-payload path.
pub(crate) fn bulky_event(n: usize, payload_bytes: usize) -> Event {
    let mut details = EventDetails::new();
    details.insert("n".to_string(), serde_json::json!(n));
    details.insert(
        "filler".to_string(),
        serde_json::json!("x".repeat(payload_bytes)),
    );
    Event::new(EventType::UiInteraction, "session-test", None, "en", details)
}
