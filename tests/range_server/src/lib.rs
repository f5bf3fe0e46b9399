//! In-process HTTP/1.1 object store that honours `Range` requests.
//!
//! Used to run the transfer engine against real sockets. Faults can be
//! injected per `Range` value to reproduce an expired grant, a peer that
//! closes the connection, a lying `Content-Length`, or a store that goes
//! quiet. `HEAD` is answered with the object's headers and is not recorded.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A deviation from the normal answer, consumed by one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Answer with this status and an empty body.
    Status(u16),
    /// Answer 403 and close the connection.
    ForbiddenClose,
    /// Answer normally, announce `Connection: close`, then close.
    Close,
    /// Send one byte less than requested, then close.
    WrongLength,
    /// Read the request and hang up without answering.
    Hangup,
    /// Announce the full length, send half the body, then hang up.
    Truncate,
    /// Wait this long, then answer normally.
    Delay(Duration),
}

#[derive(Default)]
struct State {
    data: Vec<u8>,
    faults: Mutex<HashMap<String, VecDeque<Fault>>>,
    requests: Mutex<Vec<String>>,
    connections: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A running server. Stops accepting when dropped.
pub struct RangeServer {
    addr: SocketAddr,
    state: Arc<State>,
    cancel: CancellationToken,
}

impl RangeServer {
    /// Binds an ephemeral local port and serves `data`.
    pub async fn start(data: Vec<u8>) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(State {
            data,
            ..State::default()
        });
        let cancel = CancellationToken::new();

        let accept_state = Arc::clone(&state);
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { break };
                        accept_state.connections.fetch_add(1, Ordering::Relaxed);
                        debug!(%peer, "range server accepted connection");
                        let state = Arc::clone(&accept_state);
                        tokio::spawn(async move {
                            if let Err(e) = serve(stream, state).await {
                                debug!("range server connection ended: {e}");
                            }
                        });
                    }
                }
            }
        });

        Ok(Self {
            addr,
            state,
            cancel,
        })
    }

    /// URL for `path_and_query` on this server.
    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.addr, path_and_query)
    }

    pub fn data(&self) -> &[u8] {
        &self.state.data
    }

    /// Queues `fault` for the next request carrying `range`.
    pub fn inject(&self, range: &str, fault: Fault) {
        lock(&self.state.faults)
            .entry(range.to_string())
            .or_default()
            .push_back(fault);
    }

    /// `Range` values received so far, in order.
    pub fn requests(&self) -> Vec<String> {
        lock(&self.state.requests).clone()
    }

    /// TCP connections accepted so far, reachability checks included.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::Relaxed)
    }
}

impl Drop for RangeServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Request {
    method: String,
    target: String,
    range: Option<String>,
}

async fn serve(stream: TcpStream, state: Arc<State>) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    while let Some(request) = read_request(&mut reader).await? {
        if request.method.eq_ignore_ascii_case("HEAD") {
            let headers = [("Accept-Ranges", "bytes".to_string())];
            write_head(&mut write, 200, state.data.len(), &headers).await?;
            write.flush().await?;
            continue;
        }

        let fault = request.range.as_deref().and_then(|range| {
            lock(&state.requests).push(range.to_string());
            lock(&state.faults).get_mut(range)?.pop_front()
        });
        debug!(target = %request.target, range = ?request.range, ?fault, "range server request");

        if respond(&mut write, &state.data, request.range.as_deref(), fault).await? {
            write.shutdown().await?;
            break;
        }
    }
    Ok(())
}

async fn read_request<R>(reader: &mut R) -> std::io::Result<Option<Request>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or("GET").to_string();
    let target = parts.next().unwrap_or("/").to_string();

    let mut range = None;
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':')
            && name.eq_ignore_ascii_case("range")
        {
            range = Some(value.trim().to_string());
        }
    }
    Ok(Some(Request {
        method,
        target,
        range,
    }))
}

/// Writes the answer. Returns `true` if the connection must be closed.
async fn respond<W>(
    write: &mut W,
    data: &[u8],
    range: Option<&str>,
    fault: Option<Fault>,
) -> std::io::Result<bool>
where
    W: AsyncWrite + Unpin,
{
    match fault {
        Some(Fault::Hangup) => return Ok(true),
        Some(Fault::Delay(delay)) => tokio::time::sleep(delay).await,
        Some(Fault::Status(status)) => {
            write_response(write, status, &[], &[]).await?;
            return Ok(false);
        }
        Some(Fault::ForbiddenClose) => {
            write_response(write, 403, &[("Connection", "close".into())], &[]).await?;
            return Ok(true);
        }
        _ => {}
    }

    let Some(range) = range else {
        write_response(write, 200, &[], data).await?;
        return Ok(false);
    };
    let Some((start, end)) = parse_range(range, data.len()) else {
        let headers = [("Content-Range", format!("bytes */{}", data.len()))];
        write_response(write, 416, &headers, &[]).await?;
        return Ok(false);
    };

    let mut body = &data[start..=end];
    let mut headers = vec![(
        "Content-Range",
        format!("bytes {start}-{end}/{}", data.len()),
    )];
    let close = match fault {
        Some(Fault::Close) => true,
        Some(Fault::WrongLength) => {
            body = &body[..body.len() - 1];
            true
        }
        Some(Fault::Truncate) => {
            write_head(write, 206, body.len(), &headers).await?;
            write.write_all(&body[..body.len() / 2]).await?;
            write.flush().await?;
            return Ok(true);
        }
        _ => false,
    };
    if close {
        headers.push(("Connection", "close".into()));
    }
    write_response(write, 206, &headers, body).await?;
    Ok(close)
}

fn parse_range(value: &str, len: usize) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start: usize = start.trim().parse().ok()?;
    let end: usize = end.trim().parse().ok()?;
    if start >= len || end < start {
        return None;
    }
    Some((start, end.min(len - 1)))
}

async fn write_response<W>(
    write: &mut W,
    status: u16,
    headers: &[(&str, String)],
    body: &[u8],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_head(write, status, body.len(), headers).await?;
    write.write_all(body).await?;
    write.flush().await
}

async fn write_head<W>(
    write: &mut W,
    status: u16,
    content_length: usize,
    headers: &[(&str, String)],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reason = match status {
        200 => "OK",
        206 => "Partial Content",
        403 => "Forbidden",
        404 => "Not Found",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        _ => "Unknown",
    };
    let mut head = format!("HTTP/1.1 {status} {reason}\r\nContent-Length: {content_length}\r\n");
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    write.write_all(head.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use otafetch_protocol::TransferState;
    use otafetch_transfer::{
        BlockPool, Dispatch, EngineConfig, EngineError, EngineEvent, EngineHandle, StartError,
    };
    use otafetch_transport::{Credentials, HttpsConnector};
    use tokio::sync::mpsc;

    const B: u32 = 256;

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    fn view(server: &RangeServer, remaining: u32) -> otafetch_protocol::OrchestratorView {
        otafetch_protocol::OrchestratorView {
            total_file_size: server.data().len() as u64,
            remaining_blocks: remaining,
            source_locator: server.url("/images/fw.bin?X-Amz-Signature=abc"),
        }
    }

    fn range(index: u32) -> String {
        let start = index * B;
        format!("bytes={}-{}", start, start + B - 1)
    }

    async fn engine(server: &RangeServer) -> (EngineHandle, mpsc::Receiver<EngineEvent>) {
        let config = EngineConfig {
            block_size: B,
            ..EngineConfig::default()
        };
        let (handle, rx) =
            EngineHandle::spawn(HttpsConnector::default(), config, BlockPool::new(4, B as usize))
                .unwrap();
        let blocks = server.data().len().div_ceil(B as usize) as u32;
        handle
            .start_transfer(view(server, blocks), Credentials::default())
            .await
            .unwrap();
        (handle, rx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<EngineEvent>) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for an engine event")
            .expect("event channel closed")
    }

    async fn fetch(handle: &EngineHandle, rx: &mut mpsc::Receiver<EngineEvent>) -> (u32, Vec<u8>) {
        assert!(matches!(
            handle.request_next_block().await.unwrap(),
            Dispatch::Sent(_)
        ));
        match next_event(rx).await {
            EngineEvent::BlockReceived { index, payload } => (index, payload.to_vec()),
            other => panic!("expected a block, got {other:?}"),
        }
    }

    #[test]
    fn parses_ranges() {
        assert_eq!(parse_range("bytes=0-0", 10), Some((0, 0)));
        assert_eq!(parse_range("bytes=5-100", 10), Some((5, 9)));
        assert_eq!(parse_range("bytes=10-11", 10), None);
        assert_eq!(parse_range("bytes=3-1", 10), None);
        assert_eq!(parse_range("items=0-1", 10), None);
    }

    #[tokio::test]
    async fn fetches_whole_image_over_http() {
        let server = RangeServer::start(image(1_000)).await.unwrap();
        let (handle, mut rx) = engine(&server).await;

        let mut assembled = Vec::new();
        for expected in 0..4 {
            let (index, payload) = fetch(&handle, &mut rx).await;
            assert_eq!(index, expected);
            assembled.extend(payload);
        }
        assert_eq!(handle.request_next_block().await.unwrap(), Dispatch::Complete);
        assert_eq!(assembled, server.data());
        assert_eq!(
            server.requests(),
            vec!["bytes=0-0", "bytes=0-255", "bytes=256-511", "bytes=512-767", "bytes=768-999"]
        );
    }

    #[tokio::test]
    async fn probe_mismatch_stops_before_blocks() {
        let server = RangeServer::start(image(1_000)).await.unwrap();
        let (handle, _rx) = EngineHandle::spawn(
            HttpsConnector::default(),
            EngineConfig {
                block_size: B,
                ..EngineConfig::default()
            },
            BlockPool::new(4, B as usize),
        )
        .unwrap();

        let mut v = view(&server, 4);
        v.total_file_size = 999;
        assert!(matches!(
            handle.start_transfer(v, Credentials::default()).await,
            Err(StartError::SizeMismatch {
                remote: 1000,
                expected: 999
            })
        ));
        assert_eq!(server.requests(), vec!["bytes=0-0"]);
    }

    #[tokio::test]
    async fn expired_grant_with_close_reports_authorization() {
        let server = RangeServer::start(image(1_000)).await.unwrap();
        server.inject(&range(1), Fault::ForbiddenClose);
        let (handle, mut rx) = engine(&server).await;

        fetch(&handle, &mut rx).await;
        handle.request_next_block().await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            EngineEvent::AuthorizationExpired
        ));
        assert_eq!(handle.stats().reconnects, 0);
    }

    #[tokio::test]
    async fn close_header_triggers_reconnect() {
        let server = RangeServer::start(image(8 * B as usize)).await.unwrap();
        server.inject(&range(5), Fault::Close);
        let (handle, mut rx) = engine(&server).await;

        for expected in 0..8 {
            let (index, payload) = fetch(&handle, &mut rx).await;
            assert_eq!(index, expected);
            let start = (index * B) as usize;
            assert_eq!(payload, server.data()[start..start + B as usize]);
        }
        assert_eq!(handle.stats().reconnects, 1);
        // Initial connect and the eager reconnect each check reachability.
        assert!(server.connections() >= 3);
    }

    #[tokio::test]
    async fn short_body_is_fatal() {
        let server = RangeServer::start(image(1_000)).await.unwrap();
        server.inject(&range(0), Fault::WrongLength);
        let (handle, mut rx) = engine(&server).await;

        handle.request_next_block().await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            EngineEvent::Fatal(EngineError::LengthMismatch {
                expected: 256,
                actual: 255
            })
        ));
        assert_eq!(
            handle.snapshot().await.unwrap().state,
            TransferState::Fatal
        );
    }

    #[tokio::test]
    async fn truncated_body_requires_restart() {
        let server = RangeServer::start(image(1_000)).await.unwrap();
        server.inject(&range(1), Fault::Truncate);
        let (handle, mut rx) = engine(&server).await;
        fetch(&handle, &mut rx).await;

        handle.request_next_block().await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            EngineEvent::ReconnectRequired
        ));
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.state, TransferState::NeedsReconnect);
        assert_eq!(snap.next_block, 1);
    }

    #[tokio::test]
    async fn head_is_answered_without_recording() {
        let server = RangeServer::start(image(1_000)).await.unwrap();
        let (handle, _rx) = engine(&server).await;
        drop(handle);
        // Connect's HEAD exchange happened; only the size probe is a range.
        assert_eq!(server.requests(), vec!["bytes=0-0"]);
    }

    #[tokio::test]
    async fn server_error_is_fatal() {
        let server = RangeServer::start(image(1_000)).await.unwrap();
        server.inject(&range(0), Fault::Status(500));
        let (handle, mut rx) = engine(&server).await;

        handle.request_next_block().await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            EngineEvent::Fatal(EngineError::UnexpectedStatus(500))
        ));
    }

    #[tokio::test]
    async fn hangup_reconnects_and_keeps_position() {
        let server = RangeServer::start(image(1_000)).await.unwrap();
        server.inject(&range(1), Fault::Hangup);
        let (handle, mut rx) = engine(&server).await;
        fetch(&handle, &mut rx).await;

        handle.request_next_block().await.unwrap();
        let snap = loop {
            let snap = handle.snapshot().await.unwrap();
            if !snap.in_flight {
                break snap;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(snap.state, TransferState::Ready);
        assert_eq!(snap.next_block, 1);
        assert_eq!(handle.stats().reconnects, 1);

        let (index, _) = fetch(&handle, &mut rx).await;
        assert_eq!(index, 1);
    }
}
