//! Socket proxy: owns real WebSockets on behalf of one guest.
//!
//! The guest only ever sees integer handles. Each connection runs as a tokio
//! task that multiplexes the socket's incoming frames and the guest's
//! outbound commands; everything the socket produces is funnelled, in order,
//! into the isolate's [`HostEvent`] channel and re-enters the guest from the
//! supervisor loop.

use std::collections::HashMap;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use url::{Host, Url};

use crate::HostEvent;

/// Sentinel returned by `socket_open` for a destination outside the allow-list.
pub const SOCKET_DENIED: i32 = -1;

/// Sentinel returned by `socket_open` when the connection cap is reached.
pub const SOCKET_LIMIT: i32 = -2;

/// Close code reported when the host tears a connection down.
const CLOSE_GOING_AWAY: u16 = 1001;

/// Close code reported when the socket ended without a close frame.
const CLOSE_ABNORMAL: u16 = 1006;

/// Lifecycle events produced by a proxied socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// The handshake completed.
    Open,
    /// A frame arrived (binary frames are decoded lossily as UTF-8).
    Message(String),
    /// The socket failed. A [`SocketEvent::Close`] always follows.
    Error(String),
    /// The socket is closed; the connection is gone afterwards.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
}

/// Result of a `socket_open` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOpen {
    /// A connection was allocated under this handle.
    Opened(i32),
    /// The destination is not on the allow-list.
    Denied,
    /// The guest already holds the maximum number of connections.
    AtCapacity,
}

impl SocketOpen {
    /// Encode for the guest: a positive handle or a negative sentinel.
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Opened(handle) => handle,
            Self::Denied => SOCKET_DENIED,
            Self::AtCapacity => SOCKET_LIMIT,
        }
    }
}

/// State of one proxied connection. A closed connection is removed from the
/// table, so `closed` is represented by absence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in flight.
    Connecting,
    /// Frames may be sent.
    Open,
    /// Close requested, waiting for the socket to finish.
    Closing,
}

/// Commands from the guest to a connection task.
#[derive(Debug)]
enum Outbound {
    Text(String),
    Close,
}

struct Connection {
    state: ConnectionState,
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

/// Check a destination against the loopback-only allow-list.
///
/// Only plain `ws://` URLs whose host is `localhost` or a loopback IP are
/// accepted; the bridge exists so a bot can reach the local game server and
/// nothing else.
pub fn is_allowed_destination(raw: &str) -> bool {
    let Ok(url) = Url::parse(raw) else {
        return false;
    };
    if url.scheme() != "ws" {
        return false;
    }
    if !url.username().is_empty() || url.password().is_some() {
        return false;
    }
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

/// Per-isolate socket table.
pub struct SocketProxy {
    connections: HashMap<i32, Connection>,
    next_handle: i32,
    max_connections: usize,
    max_send_size: usize,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl SocketProxy {
    /// Create an empty proxy that reports into `events`.
    pub fn new(
        max_connections: usize,
        max_send_size: usize,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Self {
        Self {
            connections: HashMap::new(),
            next_handle: 1,
            max_connections,
            max_send_size,
            events,
        }
    }

    /// Open a connection to `url` on behalf of the guest.
    ///
    /// Must be called from within a tokio runtime; the socket I/O runs as a
    /// spawned task.
    pub fn open(&mut self, url: &str) -> SocketOpen {
        if !is_allowed_destination(url) {
            tracing::debug!(url = %url, "socket open denied: destination not allowed");
            return SocketOpen::Denied;
        }
        if self.connections.len() >= self.max_connections {
            tracing::debug!(
                max = self.max_connections,
                "socket open denied: connection cap reached"
            );
            return SocketOpen::AtCapacity;
        }

        let handle = self.next_handle;
        self.next_handle += 1;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(
            handle,
            url.to_string(),
            outbound_rx,
            self.events.clone(),
        ));

        self.connections.insert(
            handle,
            Connection {
                state: ConnectionState::Connecting,
                outbound: outbound_tx,
                task,
            },
        );
        tracing::debug!(handle, url = %url, "socket opened");
        SocketOpen::Opened(handle)
    }

    /// Send text if the connection is open. Unknown or not-open handles are
    /// ignored. Text longer than the send cap is truncated.
    pub fn send(&mut self, handle: i32, text: &str) {
        let Some(conn) = self.connections.get(&handle) else {
            return;
        };
        if conn.state != ConnectionState::Open {
            return;
        }
        let text = truncate_to_boundary(text, self.max_send_size);
        if conn.outbound.send(Outbound::Text(text.to_string())).is_err() {
            tracing::trace!(handle, "send after connection task ended");
        }
    }

    /// Begin closing a connection. Unknown handles are ignored.
    pub fn close(&mut self, handle: i32) {
        let Some(conn) = self.connections.get_mut(&handle) else {
            return;
        };
        if conn.state == ConnectionState::Closing {
            return;
        }
        conn.state = ConnectionState::Closing;
        let _ = conn.outbound.send(Outbound::Close);
    }

    /// Record that the handshake finished. Returns `false` for stale handles.
    pub fn mark_open(&mut self, handle: i32) -> bool {
        match self.connections.get_mut(&handle) {
            Some(conn) => {
                if conn.state == ConnectionState::Connecting {
                    conn.state = ConnectionState::Open;
                }
                true
            }
            None => false,
        }
    }

    /// Remove a connection after its close event. Returns `false` if the
    /// handle was already gone.
    pub fn release(&mut self, handle: i32) -> bool {
        self.connections.remove(&handle).is_some()
    }

    /// Whether events for this handle should still reach the guest.
    pub fn contains(&self, handle: i32) -> bool {
        self.connections.contains_key(&handle)
    }

    /// Current state of a connection.
    pub fn state(&self, handle: i32) -> Option<ConnectionState> {
        self.connections.get(&handle).map(|c| c.state)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are live.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close every connection and drop the table. Returns how many were live.
    pub fn shutdown(&mut self) -> usize {
        let count = self.connections.len();
        for (handle, conn) in self.connections.drain() {
            // Dropping the stream inside the aborted task closes the TCP
            // connection; no task may outlive the isolate.
            conn.task.abort();
            tracing::debug!(handle, "socket closed by teardown");
        }
        count
    }
}

impl Drop for SocketProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Connection task: connect, then pump frames both ways until closed.
async fn run_connection(
    handle: i32,
    url: String,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<HostEvent>,
) {
    let emit = |event: SocketEvent| {
        let _ = events.send(HostEvent::Socket { handle, event });
    };

    let stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            emit(SocketEvent::Error(e.to_string()));
            emit(SocketEvent::Close {
                code: CLOSE_ABNORMAL,
                reason: String::new(),
            });
            return;
        }
    };
    emit(SocketEvent::Open);

    let (mut sink, mut stream) = stream.split();
    let mut close_requested = false;

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => emit(SocketEvent::Message(text.as_str().to_owned())),
                Some(Ok(Message::Binary(bytes))) => {
                    emit(SocketEvent::Message(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
                        .unwrap_or((CLOSE_ABNORMAL, String::new()));
                    emit(SocketEvent::Close { code, reason });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    emit(SocketEvent::Error(e.to_string()));
                    emit(SocketEvent::Close { code: CLOSE_ABNORMAL, reason: String::new() });
                    return;
                }
                None => {
                    emit(SocketEvent::Close { code: CLOSE_ABNORMAL, reason: String::new() });
                    return;
                }
            },
            command = outbound.recv(), if !close_requested => match command {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        emit(SocketEvent::Error(e.to_string()));
                        emit(SocketEvent::Close { code: CLOSE_ABNORMAL, reason: String::new() });
                        return;
                    }
                }
                Some(Outbound::Close) | None => {
                    close_requested = true;
                    let frame = CloseFrame {
                        code: CloseCode::from(CLOSE_GOING_AWAY),
                        reason: Utf8Bytes::from_static(""),
                    };
                    if sink.send(Message::Close(Some(frame))).await.is_err() {
                        emit(SocketEvent::Close { code: CLOSE_GOING_AWAY, reason: String::new() });
                        return;
                    }
                }
            },
        }
    }
}

/// Truncate to at most `max` bytes without splitting a UTF-8 character.
pub(crate) fn truncate_to_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(max: usize) -> (SocketProxy, mpsc::UnboundedReceiver<HostEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SocketProxy::new(max, 4096, tx), rx)
    }

    // Nothing listens on the discard port; these connections fail in the
    // background, which is irrelevant to the table bookkeeping under test.
    const LOOPBACK: &str = "ws://127.0.0.1:9/";

    #[test]
    fn allow_list_accepts_loopback_only() {
        assert!(is_allowed_destination("ws://localhost:8080/room"));
        assert!(is_allowed_destination("ws://LOCALHOST/"));
        assert!(is_allowed_destination("ws://127.0.0.1:3000"));
        assert!(is_allowed_destination("ws://127.8.9.10:3000"));
        assert!(is_allowed_destination("ws://[::1]:3000/"));

        assert!(!is_allowed_destination("ws://example.com/"));
        assert!(!is_allowed_destination("ws://10.0.0.5:8080/"));
        assert!(!is_allowed_destination("ws://localhost.evil.com/"));
        assert!(!is_allowed_destination("http://localhost/"));
        assert!(!is_allowed_destination("wss://example.com/"));
        assert!(!is_allowed_destination("ws://user:pw@localhost/"));
        assert!(!is_allowed_destination("not a url"));
    }

    #[tokio::test]
    async fn denied_destination_creates_no_connection() {
        let (mut proxy, _rx) = proxy(3);
        assert_eq!(proxy.open("ws://203.0.113.7:80/"), SocketOpen::Denied);
        assert_eq!(proxy.open("ws://203.0.113.7:80/").as_raw(), SOCKET_DENIED);
        assert!(proxy.is_empty());
    }

    #[tokio::test]
    async fn cap_then_release_issues_fresh_handle() {
        let (mut proxy, _rx) = proxy(3);
        let handles: Vec<i32> = (0..3)
            .map(|_| match proxy.open(LOOPBACK) {
                SocketOpen::Opened(h) => h,
                other => panic!("expected open, got {other:?}"),
            })
            .collect();
        assert_eq!(handles, vec![1, 2, 3]);

        assert_eq!(proxy.open(LOOPBACK), SocketOpen::AtCapacity);
        assert_eq!(proxy.open(LOOPBACK).as_raw(), SOCKET_LIMIT);
        assert_eq!(proxy.len(), 3);

        proxy.close(2);
        assert_eq!(proxy.state(2), Some(ConnectionState::Closing));
        // still counted until its close event is processed
        assert_eq!(proxy.open(LOOPBACK), SocketOpen::AtCapacity);

        assert!(proxy.release(2));
        assert_eq!(proxy.open(LOOPBACK), SocketOpen::Opened(4));
        assert_eq!(proxy.len(), 3);
    }

    #[tokio::test]
    async fn handles_are_never_reused() {
        let (mut proxy, _rx) = proxy(1);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10 {
            let SocketOpen::Opened(h) = proxy.open(LOOPBACK) else {
                panic!("expected open");
            };
            assert!(seen.insert(h), "handle {h} reused");
            proxy.release(h);
        }
    }

    #[tokio::test]
    async fn send_and_close_ignore_unknown_handles() {
        let (mut proxy, _rx) = proxy(3);
        proxy.send(42, "hello");
        proxy.close(42);
        assert!(!proxy.mark_open(42));
        assert!(!proxy.release(42));
    }

    #[tokio::test]
    async fn shutdown_empties_table() {
        let (mut proxy, _rx) = proxy(3);
        proxy.open(LOOPBACK);
        proxy.open(LOOPBACK);
        assert_eq!(proxy.shutdown(), 2);
        assert!(proxy.is_empty());
        assert_eq!(proxy.shutdown(), 0);
    }

    #[tokio::test]
    async fn refused_connection_reports_error_then_close() {
        let (mut proxy, mut rx) = proxy(3);
        let SocketOpen::Opened(handle) = proxy.open(LOOPBACK) else {
            panic!("expected open");
        };
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            HostEvent::Socket { handle: h, event: SocketEvent::Error(_) } if h == handle
        ));
        assert!(matches!(
            second,
            HostEvent::Socket { handle: h, event: SocketEvent::Close { .. } } if h == handle
        ));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_to_boundary("hello", 10), "hello");
        assert_eq!(truncate_to_boundary("hello", 3), "hel");
        // 'é' is two bytes; cutting at 2 would split it
        assert_eq!(truncate_to_boundary("aé", 2), "a");
        assert_eq!(truncate_to_boundary("", 0), "");
    }
}
