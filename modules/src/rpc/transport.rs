//! RPC session transports
//!
//! A session is one management connection: a UNIX socket, an HTTP POST, or a
//! WebSocket. The engine hands every outbound payload to the session, which
//! applies the transport's framing before pushing bytes at the host sink.

use chrono::{DateTime, Utc};
use ferrumd_core::{Error, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::fmt::Write as _;
use std::sync::Arc;
use uuid::Uuid;

/// Idle seconds before an application-level WebSocket PING is sent. A peer
/// that stays silent for another full interval after the PING is dead.
pub const RPC_WEBSOCKET_PING_SECS: i64 = 120;

/// Cap on buffered bytes awaiting a newline on a UNIX socket session
pub const UNIX_READ_BUFFER_MAX: usize = 16 * 1024;

/// Where a session delivers its outbound bytes
pub trait ResponseSink: Send + Sync {
    /// Push framed bytes toward the peer
    fn deliver(&self, bytes: &[u8]);
    /// Tear the connection down
    fn close(&self);
}

/// The framing a session speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    UnixSocket,
    Http,
    WebSocket,
}

/// Mutable per-session state behind one lock
#[derive(Debug, Default)]
struct SessionState {
    /// Unframed inbound bytes (UNIX socket line assembly)
    read_buffer: Vec<u8>,
    /// WebSocket HTTP upgrade completed; frames may now flow
    handshake_completed: bool,
    /// An application PING is outstanding
    ping_sent: bool,
    /// Last inbound traffic
    last_activity: Option<DateTime<Utc>>,
}

/// One live management connection
pub struct RpcSession {
    pub id: Uuid,
    /// Routable identifier: local server id plus a random suffix, so a
    /// remote server can address the response back to this session
    pub uid: String,
    pub name: String,
    pub transport: TransportKind,
    pub remote_addr: String,
    /// Authenticated rpc-user name
    pub principal: String,
    state: Mutex<SessionState>,
    sink: Arc<dyn ResponseSink>,
}

impl RpcSession {
    pub fn new(
        me_id: &str,
        name: &str,
        transport: TransportKind,
        remote_addr: &str,
        principal: &str,
        sink: Arc<dyn ResponseSink>,
    ) -> Self {
        let mut rng = rand::thread_rng();
        let mut uid = String::with_capacity(me_id.len() + 6);
        uid.push_str(me_id);
        for _ in 0..6 {
            let _ = write!(uid, "{:X}", rng.gen_range(0..16u8));
        }
        Self {
            id: Uuid::new_v4(),
            uid,
            name: name.to_string(),
            transport,
            remote_addr: remote_addr.to_string(),
            principal: principal.to_string(),
            state: Mutex::new(SessionState {
                last_activity: Some(Utc::now()),
                ..SessionState::default()
            }),
            sink,
        }
    }

    /// Send one serialized JSON payload, framed for this transport
    pub fn send(&self, payload: &[u8]) {
        match self.transport {
            TransportKind::WebSocket => {
                // Frames must carry valid UTF-8; repair rather than drop
                let text = String::from_utf8_lossy(payload);
                self.sink.deliver(&websocket_text_frame(text.as_bytes()));
            }
            TransportKind::UnixSocket | TransportKind::Http => {
                let mut framed = Vec::with_capacity(payload.len() + 1);
                framed.extend_from_slice(payload);
                framed.push(b'\n');
                self.sink.deliver(&framed);
            }
        }
    }

    /// Close the underlying connection
    pub fn close(&self) {
        self.sink.close();
    }

    /// Note inbound traffic for keepalive accounting
    pub fn touch(&self) {
        let mut state = self.state.lock();
        state.last_activity = Some(Utc::now());
        state.ping_sent = false;
    }

    pub fn mark_handshake_completed(&self) {
        self.state.lock().handshake_completed = true;
    }

    pub fn handshake_completed(&self) -> bool {
        self.state.lock().handshake_completed
    }

    /// Buffer inbound UNIX-socket bytes and pull out completed lines.
    /// An unterminated line past the buffer cap is fatal for the session.
    pub fn buffer_lines(&self, bytes: &[u8]) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        state.read_buffer.extend_from_slice(bytes);
        state.last_activity = Some(Utc::now());

        let mut lines = Vec::new();
        while let Some(pos) = state.read_buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = state.read_buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        if state.read_buffer.len() > UNIX_READ_BUFFER_MAX {
            state.read_buffer.clear();
            return Err(Error::Connection(format!(
                "RPC line exceeds {} bytes without newline",
                UNIX_READ_BUFFER_MAX
            )));
        }
        Ok(lines)
    }

    /// Keepalive decision for a WebSocket session. Sends a PING after the
    /// idle interval; reports the session dead one interval after that.
    pub fn websocket_keepalive(&self, now: DateTime<Utc>) -> KeepaliveAction {
        let mut state = self.state.lock();
        if !state.handshake_completed {
            return KeepaliveAction::None;
        }
        let idle = match state.last_activity {
            Some(last) => (now - last).num_seconds(),
            None => return KeepaliveAction::None,
        };
        if state.ping_sent {
            if idle >= RPC_WEBSOCKET_PING_SECS * 2 {
                KeepaliveAction::Dead
            } else {
                KeepaliveAction::None
            }
        } else if idle >= RPC_WEBSOCKET_PING_SECS {
            state.ping_sent = true;
            self.sink.deliver(&websocket_ping_frame());
            KeepaliveAction::PingSent
        } else {
            KeepaliveAction::None
        }
    }
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .field("transport", &self.transport)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// Result of a keepalive check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    None,
    PingSent,
    /// No traffic since the PING; the host should drop the connection
    Dead,
}

/// Live sessions, keyed by routable uid
pub struct SessionTable {
    sessions: dashmap::DashMap<String, Arc<RpcSession>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: dashmap::DashMap::new(),
        }
    }

    pub fn open(&self, session: Arc<RpcSession>) {
        self.sessions.insert(session.uid.clone(), session);
    }

    pub fn close(&self, uid: &str) -> Option<Arc<RpcSession>> {
        self.sessions.remove(uid).map(|(_, s)| s)
    }

    pub fn get(&self, uid: &str) -> Option<Arc<RpcSession>> {
        self.sessions.get(uid).map(|s| s.clone())
    }

    pub fn all(&self) -> Vec<Arc<RpcSession>> {
        self.sessions.iter().map(|s| s.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode an unmasked WebSocket text frame (server to client)
pub fn websocket_text_frame(payload: &[u8]) -> Vec<u8> {
    websocket_frame(0x81, payload)
}

/// Encode an unmasked WebSocket ping frame
pub fn websocket_ping_frame() -> Vec<u8> {
    websocket_frame(0x89, b"")
}

fn websocket_frame(opcode_fin: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 10);
    frame.push(opcode_fin);
    let len = payload.len();
    if len < 126 {
        frame.push(len as u8);
    } else if len <= u16::MAX as usize {
        frame.push(126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use parking_lot::Mutex as PMutex;

    #[derive(Default)]
    struct CapturingSink {
        delivered: PMutex<Vec<Vec<u8>>>,
        closed: PMutex<bool>,
    }

    impl ResponseSink for CapturingSink {
        fn deliver(&self, bytes: &[u8]) {
            self.delivered.lock().push(bytes.to_vec());
        }
        fn close(&self) {
            *self.closed.lock() = true;
        }
    }

    fn session(transport: TransportKind, sink: Arc<CapturingSink>) -> RpcSession {
        RpcSession::new("001", "test", transport, "127.0.0.1", "admin", sink)
    }

    #[test]
    fn test_uid_carries_server_prefix() {
        let sink = Arc::new(CapturingSink::default());
        let s = session(TransportKind::UnixSocket, sink);
        assert!(s.uid.starts_with("001"));
        assert_eq!(s.uid.len(), 9);
    }

    #[test]
    fn test_unix_send_appends_newline() {
        let sink = Arc::new(CapturingSink::default());
        let s = session(TransportKind::UnixSocket, sink.clone());
        s.send(b"{\"id\":1}");
        let delivered = sink.delivered.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0], b"{\"id\":1}\n");
    }

    #[test]
    fn test_websocket_send_frames_payload() {
        let sink = Arc::new(CapturingSink::default());
        let s = session(TransportKind::WebSocket, sink.clone());
        s.send(b"{}");
        let delivered = sink.delivered.lock();
        assert_eq!(delivered[0], vec![0x81, 0x02, b'{', b'}']);
    }

    #[test]
    fn test_websocket_extended_length() {
        let payload = vec![b'a'; 300];
        let frame = websocket_text_frame(&payload);
        assert_eq!(frame[0], 0x81);
        assert_eq!(frame[1], 126);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 300);
        assert_eq!(frame.len(), 4 + 300);
    }

    #[test]
    fn test_buffer_lines_handles_partial_input() {
        let sink = Arc::new(CapturingSink::default());
        let s = session(TransportKind::UnixSocket, sink);
        assert!(s.buffer_lines(b"{\"a\":").unwrap().is_empty());
        let lines = s.buffer_lines(b"1}\r\n{\"b\":2}\n{\"c\"").unwrap();
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        let lines = s.buffer_lines(b":3}\n").unwrap();
        assert_eq!(lines, vec!["{\"c\":3}"]);
    }

    #[test]
    fn test_buffer_overflow_is_fatal() {
        let sink = Arc::new(CapturingSink::default());
        let s = session(TransportKind::UnixSocket, sink);
        let big = vec![b'x'; UNIX_READ_BUFFER_MAX + 1];
        assert!(s.buffer_lines(&big).is_err());
    }

    #[test]
    fn test_websocket_keepalive_cycle() {
        let sink = Arc::new(CapturingSink::default());
        let s = session(TransportKind::WebSocket, sink.clone());
        s.mark_handshake_completed();
        let now = Utc::now();

        assert_eq!(s.websocket_keepalive(now), KeepaliveAction::None);

        let later = now + Duration::seconds(RPC_WEBSOCKET_PING_SECS + 1);
        assert_eq!(s.websocket_keepalive(later), KeepaliveAction::PingSent);
        assert_eq!(sink.delivered.lock().last().unwrap()[0], 0x89);

        // Still within grace after the ping
        assert_eq!(s.websocket_keepalive(later), KeepaliveAction::None);

        let dead = now + Duration::seconds(RPC_WEBSOCKET_PING_SECS * 2 + 1);
        assert_eq!(s.websocket_keepalive(dead), KeepaliveAction::Dead);

        // Inbound traffic resets the cycle
        s.touch();
        assert_eq!(s.websocket_keepalive(Utc::now()), KeepaliveAction::None);
    }
}
