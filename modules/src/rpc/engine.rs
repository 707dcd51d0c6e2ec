//! JSON-RPC 2.0 call engine
//!
//! Owns request validation, envelope construction, and routing between local
//! transport sessions and remote servers over the RRPC relay. Handlers reply
//! through [`RpcEngine::response`] and [`RpcEngine::error`]; the engine never
//! replies on a handler's behalf.

use super::outstanding::OutstandingTable;
use super::registry::HandlerRegistry;
use super::relay::{
    fragment_payload, request_id, RelayDirection, RelayKey, RelayPhase, RelayTable, StartOutcome,
};
use super::transport::{RpcSession, SessionTable, TransportKind};
use chrono::Utc;
use ferrumd_core::{
    sid_prefix, Message, MessageType, NumericReply, Prefix, RemoteSender, Result,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Cap on the `message` field of an error envelope
pub const ERROR_MESSAGE_MAX: usize = 512;

/// JSON-RPC error codes; the numeric values are wire contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ServerGone,
    Timeout,
    RemoteServerNoRpc,
    NotFound,
    AlreadyExists,
    InvalidName,
    Denied,
}

impl RpcErrorCode {
    pub fn code(&self) -> i64 {
        match self {
            RpcErrorCode::ParseError => -32700,
            RpcErrorCode::InvalidRequest => -32600,
            RpcErrorCode::MethodNotFound => -32601,
            RpcErrorCode::InvalidParams => -32602,
            RpcErrorCode::InternalError => -32603,
            RpcErrorCode::ServerGone => -1000,
            RpcErrorCode::Timeout => -1001,
            RpcErrorCode::RemoteServerNoRpc => -1002,
            RpcErrorCode::NotFound => -1003,
            RpcErrorCode::AlreadyExists => -1004,
            RpcErrorCode::InvalidName => -1005,
            RpcErrorCode::Denied => -1008,
        }
    }
}

/// Who issued a call and where the reply must go
#[derive(Debug, Clone)]
pub enum RpcCaller {
    /// A directly attached management session
    Local(Arc<RpcSession>),
    /// A session on another server, reachable over the relay
    Remote {
        /// Network id of the remote requester
        uid: String,
        /// Request id as it appeared on the relay frames
        request_id: String,
    },
}

/// The RPC engine: one per server process
pub struct RpcEngine {
    me_id: String,
    me_name: String,
    links: Arc<dyn RemoteSender>,
    sessions: Arc<SessionTable>,
    registry: HandlerRegistry,
    relay: RelayTable,
    outstanding: OutstandingTable,
}

impl RpcEngine {
    pub fn new(
        me_id: &str,
        me_name: &str,
        links: Arc<dyn RemoteSender>,
        sessions: Arc<SessionTable>,
    ) -> Self {
        Self {
            me_id: me_id.to_string(),
            me_name: me_name.to_string(),
            links,
            sessions,
            registry: HandlerRegistry::new(),
            relay: RelayTable::new(),
            outstanding: OutstandingTable::new(),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn outstanding(&self) -> &OutstandingTable {
        &self.outstanding
    }

    pub fn relay(&self) -> &RelayTable {
        &self.relay
    }

    /// Feed raw inbound bytes from a session. UNIX sockets assemble
    /// newline-terminated documents; HTTP bodies and WebSocket text frames
    /// arrive whole. An error return is fatal for the connection.
    pub async fn deliver(&self, session: &Arc<RpcSession>, bytes: &[u8]) -> Result<()> {
        match session.transport {
            TransportKind::UnixSocket => {
                let lines = match session.buffer_lines(bytes) {
                    Ok(lines) => lines,
                    Err(e) => {
                        self.error(
                            &RpcCaller::Local(session.clone()),
                            None,
                            RpcErrorCode::ParseError,
                            "Request too large",
                        )
                        .await;
                        session.close();
                        return Err(e);
                    }
                };
                for line in lines {
                    if !line.trim().is_empty() {
                        self.call_text(session, &line).await;
                    }
                }
                Ok(())
            }
            TransportKind::Http | TransportKind::WebSocket => {
                session.touch();
                let text = String::from_utf8_lossy(bytes);
                self.call_text(session, &text).await;
                Ok(())
            }
        }
    }

    /// Run one JSON document from a local session through the engine
    pub async fn call_text(&self, session: &Arc<RpcSession>, text: &str) {
        let caller = RpcCaller::Local(session.clone());
        match serde_json::from_str::<Value>(text) {
            Ok(request) => self.call(&caller, &request).await,
            Err(e) => {
                debug!("RPC parse failure from {}: {}", session.name, e);
                self.error(
                    &caller,
                    None,
                    RpcErrorCode::ParseError,
                    "Unable to parse JSON data",
                )
                .await;
                session.close();
            }
        }
    }

    /// Validate and dispatch one parsed request. Exactly one response or
    /// error envelope results from every invocation.
    pub async fn call(&self, caller: &RpcCaller, request: &Value) {
        match request.get("jsonrpc").and_then(Value::as_str) {
            Some("2.0") => {}
            _ => {
                self.error(
                    caller,
                    Some(request),
                    RpcErrorCode::InvalidRequest,
                    "Only JSON-RPC version 2.0 is supported",
                )
                .await;
                return;
            }
        }

        match request.get("id") {
            None => {
                self.error(
                    caller,
                    Some(request),
                    RpcErrorCode::InvalidRequest,
                    "Missing 'id'",
                )
                .await;
                return;
            }
            Some(Value::String(_)) => {}
            Some(Value::Number(n)) if n.as_i64().is_some() || n.as_u64().is_some() => {}
            Some(_) => {
                self.error(
                    caller,
                    Some(request),
                    RpcErrorCode::InvalidRequest,
                    "Invalid 'id': must be a string or an integer",
                )
                .await;
                return;
            }
        }

        let method = match request.get("method").and_then(Value::as_str) {
            Some(method) => method,
            None => {
                self.error(
                    caller,
                    Some(request),
                    RpcErrorCode::InvalidRequest,
                    "Missing 'method'",
                )
                .await;
                return;
            }
        };

        let info = match self.registry.find(method) {
            Some(info) => info,
            None => {
                self.error(
                    caller,
                    Some(request),
                    RpcErrorCode::MethodNotFound,
                    "Unsupported method",
                )
                .await;
                return;
            }
        };

        let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

        if let Err(e) = info.handler.call(self, caller, request, &params).await {
            warn!("RPC handler {} failed: {}", method, e);
            self.error(
                caller,
                Some(request),
                RpcErrorCode::InternalError,
                "Internal error while processing the request",
            )
            .await;
        }
    }

    /// Send a success envelope back to the caller
    pub async fn response(&self, caller: &RpcCaller, request: &Value, result: Value) {
        let mut envelope = json!({ "jsonrpc": "2.0", "result": result });
        echo_request_fields(&mut envelope, Some(request));
        self.route(caller, &envelope).await;
    }

    /// Send an error envelope back to the caller
    pub async fn error(
        &self,
        caller: &RpcCaller,
        request: Option<&Value>,
        code: RpcErrorCode,
        message: &str,
    ) {
        let mut envelope = json!({
            "jsonrpc": "2.0",
            "error": {
                "code": code.code(),
                "message": truncate_message(message),
            }
        });
        echo_request_fields(&mut envelope, request);
        self.route(caller, &envelope).await;
    }

    async fn route(&self, caller: &RpcCaller, envelope: &Value) {
        match caller {
            RpcCaller::Local(session) => {
                session.send(envelope.to_string().as_bytes());
            }
            RpcCaller::Remote { uid, request_id } => {
                self.send_response_to_remote(uid, request_id, envelope).await;
            }
        }
    }

    /// Relay a call from a local session to another server. An outstanding
    /// entry is registered before any frame leaves.
    pub async fn send_request_to_remote(
        &self,
        session: &Arc<RpcSession>,
        destination: &str,
        request: &Value,
    ) {
        let caller = RpcCaller::Local(session.clone());
        let req_id = match request_id(request) {
            Some(id) => id,
            None => {
                self.error(
                    &caller,
                    Some(request),
                    RpcErrorCode::InvalidRequest,
                    "Missing 'id'",
                )
                .await;
                return;
            }
        };

        let dest_sid = sid_prefix(destination).to_string();
        if !self.links.is_linked(&dest_sid).await {
            self.error(
                &caller,
                Some(request),
                RpcErrorCode::RemoteServerNoRpc,
                "Remote server cannot handle this request",
            )
            .await;
            return;
        }

        if self
            .outstanding
            .register(&session.uid, &dest_sid, &req_id, Utc::now())
            .is_err()
        {
            self.error(
                &caller,
                Some(request),
                RpcErrorCode::InvalidRequest,
                "A request with that id is already in progress. Use unique id's!",
            )
            .await;
            return;
        }

        if let Err(e) = self
            .relay_payload(
                RelayDirection::Request,
                &session.uid,
                &dest_sid,
                &req_id,
                &request.to_string(),
            )
            .await
        {
            warn!("RPC relay to {} failed: {}", dest_sid, e);
            self.outstanding.resolve(&session.uid, &req_id);
            self.error(
                &caller,
                Some(request),
                RpcErrorCode::ServerGone,
                "Remote server disconnected while processing the request",
            )
            .await;
        }
    }

    async fn send_response_to_remote(&self, destination: &str, request_id: &str, envelope: &Value) {
        if let Err(e) = self
            .relay_payload(
                RelayDirection::Response,
                &self.me_id,
                destination,
                request_id,
                &envelope.to_string(),
            )
            .await
        {
            debug!("RPC response relay to {} failed: {}", destination, e);
        }
    }

    async fn relay_payload(
        &self,
        direction: RelayDirection,
        source: &str,
        destination: &str,
        request_id: &str,
        payload: &str,
    ) -> Result<()> {
        for (phase, chunk) in fragment_payload(payload) {
            let message = Message::with_prefix(
                Prefix::Server(self.me_name.clone()),
                MessageType::Rrpc,
                vec![
                    direction.marker().to_string(),
                    source.to_string(),
                    destination.to_string(),
                    request_id.to_string(),
                    phase.marker().to_string(),
                    chunk.to_string(),
                ],
            );
            self.links
                .send_to_server(sid_prefix(destination), message)
                .await?;
        }
        Ok(())
    }

    /// Process one inbound RRPC frame from a directly linked server
    pub async fn handle_rrpc(&self, from_sid: &str, message: &Message) -> Result<()> {
        if message.params.len() < 6 {
            return self
                .send_numeric(
                    from_sid,
                    NumericReply::ErrNeedMoreParams,
                    vec!["RRPC".to_string(), "Not enough parameters".to_string()],
                )
                .await;
        }

        let direction = match RelayDirection::parse(&message.params[0]) {
            Some(direction) => direction,
            None => {
                return self.protocol_error(from_sid, "Invalid parameter").await;
            }
        };
        let source = message.params[1].as_str();
        let destination = message.params[2].as_str();
        let req_id = message.params[3].as_str();
        let phase_str = message.params[4].as_str();
        let chunk = message.params[5].as_bytes();

        // Not addressed to us: store-and-forward toward the destination
        if sid_prefix(destination) != self.me_id {
            let dest_sid = sid_prefix(destination);
            if self.links.is_linked(dest_sid).await {
                return self.links.send_to_server(dest_sid, message.clone()).await;
            }
            return self
                .send_numeric(
                    from_sid,
                    NumericReply::ErrNoSuchServer,
                    vec![destination.to_string(), "No such server".to_string()],
                )
                .await;
        }

        let phase = match RelayPhase::parse(phase_str) {
            Some(phase) => phase,
            None => {
                return self
                    .protocol_error(from_sid, "Only actions S/C/F are supported")
                    .await;
            }
        };
        let key = RelayKey::new(source, destination, req_id);

        if phase.is_start() {
            if self.relay.start(key.clone(), direction) == StartOutcome::Duplicate {
                return self.protocol_error(from_sid, "Duplicate request found").await;
            }
            if phase.is_finish() {
                if let Some(transfer) = self.relay.finish(&key, chunk) {
                    self.dispatch_transfer(source, destination, req_id, transfer)
                        .await;
                }
            } else {
                self.relay.append(&key, chunk);
            }
            return Ok(());
        }

        if phase.is_finish() {
            match self.relay.finish(&key, chunk) {
                Some(transfer) => {
                    self.dispatch_transfer(source, destination, req_id, transfer)
                        .await;
                    Ok(())
                }
                None => self.protocol_error(from_sid, "Request not found").await,
            }
        } else {
            if !self.relay.append(&key, chunk) {
                return self.protocol_error(from_sid, "Request not found").await;
            }
            Ok(())
        }
    }

    /// A reassembled relay payload is ready: requests enter the engine with
    /// a remote caller identity, responses settle an outstanding entry.
    async fn dispatch_transfer(
        &self,
        source: &str,
        destination: &str,
        req_id: &str,
        transfer: super::relay::RelayTransfer,
    ) {
        match transfer.direction {
            RelayDirection::Request => {
                let caller = RpcCaller::Remote {
                    uid: source.to_string(),
                    request_id: req_id.to_string(),
                };
                match serde_json::from_slice::<Value>(&transfer.data) {
                    Ok(request) => self.call(&caller, &request).await,
                    Err(e) => {
                        debug!("Relayed request from {} undecodable: {}", source, e);
                        self.error(
                            &caller,
                            None,
                            RpcErrorCode::ParseError,
                            "Unable to parse JSON data",
                        )
                        .await;
                    }
                }
            }
            RelayDirection::Response => {
                if self.outstanding.resolve(destination, req_id).is_none() {
                    debug!(
                        "Relayed response for unknown request {} to {}",
                        req_id, destination
                    );
                    return;
                }
                let session = match self.sessions.get(destination) {
                    Some(session) => session,
                    None => return,
                };
                match serde_json::from_slice::<Value>(&transfer.data) {
                    Ok(envelope) => session.send(envelope.to_string().as_bytes()),
                    Err(e) => {
                        debug!("Relayed response from {} undecodable: {}", source, e);
                        self.synthetic_error(
                            &session,
                            req_id,
                            RpcErrorCode::ParseError,
                            "Unable to parse JSON data",
                        );
                    }
                }
            }
        }
    }

    /// A server left the network: every transfer touching it is discarded
    /// and every request waiting on it fails with exactly one ServerGone.
    pub async fn handle_server_gone(&self, sid: &str) {
        let dropped = self.relay.discard_for_peer(sid);
        if dropped > 0 {
            debug!("Discarded {} open relay transfers for {}", dropped, sid);
        }
        for entry in self.outstanding.cancel_for_peer(sid) {
            if let Some(session) = self.sessions.get(&entry.source) {
                self.synthetic_error(
                    &session,
                    &entry.request_id,
                    RpcErrorCode::ServerGone,
                    "Remote server disconnected while processing the request",
                );
            }
        }
    }

    /// Timeout sweep tick: each expired entry yields exactly one Timeout
    /// error to its local session.
    pub fn sweep_timeouts(&self, now: chrono::DateTime<Utc>) {
        for entry in self.outstanding.sweep(now) {
            if let Some(session) = self.sessions.get(&entry.source) {
                self.synthetic_error(
                    &session,
                    &entry.request_id,
                    RpcErrorCode::Timeout,
                    "Request timed out",
                );
            }
        }
    }

    /// Error envelope for a request we no longer hold; the id survives only
    /// as its wire rendering, so it goes out as a string.
    fn synthetic_error(
        &self,
        session: &Arc<RpcSession>,
        request_id: &str,
        code: RpcErrorCode,
        message: &str,
    ) {
        let envelope = json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "error": {
                "code": code.code(),
                "message": truncate_message(message),
            }
        });
        session.send(envelope.to_string().as_bytes());
    }

    async fn protocol_error(&self, sid: &str, text: &str) -> Result<()> {
        self.send_numeric(
            sid,
            NumericReply::ErrCannotDoCommand,
            vec!["RRPC".to_string(), text.to_string()],
        )
        .await
    }

    async fn send_numeric(
        &self,
        sid: &str,
        numeric: NumericReply,
        params: Vec<String>,
    ) -> Result<()> {
        let mut reply = numeric.reply(sid, params);
        reply.prefix = Some(Prefix::Server(self.me_name.clone()));
        self.links.send_to_server(sid, reply).await
    }
}

impl std::fmt::Debug for RpcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEngine")
            .field("me_id", &self.me_id)
            .field("methods", &self.registry.len())
            .field("outstanding", &self.outstanding.len())
            .finish()
    }
}

fn echo_request_fields(envelope: &mut Value, request: Option<&Value>) {
    let Some(request) = request else { return };
    let Some(obj) = envelope.as_object_mut() else {
        return;
    };
    if let Some(method) = request.get("method").and_then(Value::as_str) {
        obj.insert("method".to_string(), Value::String(method.to_string()));
    }
    match request.get("id") {
        Some(Value::String(_)) | Some(Value::Number(_)) => {
            obj.insert("id".to_string(), request["id"].clone());
        }
        _ => {}
    }
}

fn truncate_message(message: &str) -> String {
    if message.len() <= ERROR_MESSAGE_MAX {
        return message.to_string();
    }
    let mut cut = ERROR_MESSAGE_MAX;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    message[..cut].to_string()
}
