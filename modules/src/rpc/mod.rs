//! JSON-RPC management interface
//!
//! The public face of the RPC plugin: session lifecycle, the HTTP/WebSocket
//! front door, the `rpc.info` and `user.*` methods, and the glue that feeds
//! inbound RRPC server traffic into the engine.

pub mod auth;
pub mod engine;
pub mod outstanding;
pub mod registry;
pub mod relay;
pub mod transport;
pub mod user;
pub mod web;

use auth::RpcAuthenticator;
use chrono::Utc;
use engine::{RpcCaller, RpcEngine};
use ferrumd_core::{
    async_trait, Client, CredentialVerifier, Database, Message, MessageType, Module, ModuleResult,
    RemoteSender, Result, RpcConfig,
};
use parking_lot::Mutex;
use registry::{RpcHandler, RpcHandlerInfo};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::info;
use transport::{ResponseSink, RpcSession, SessionTable, TransportKind};
use user::{UserGetHandler, UserListHandler};
use web::{WebDecision, WebRequest};

const MODULE_NAME: &str = "rpc";
const MODULE_VERSION: &str = "1.0.0";

/// `rpc.info`: enumerate every registered method with its owning module
struct RpcInfoHandler;

#[async_trait]
impl RpcHandler for RpcInfoHandler {
    async fn call(
        &self,
        engine: &RpcEngine,
        caller: &RpcCaller,
        request: &Value,
        _params: &Value,
    ) -> Result<()> {
        let mut methods = Map::new();
        for (method, module, version) in engine.registry().methods() {
            methods.insert(
                method.clone(),
                json!({
                    "name": method,
                    "module": module,
                    "version": version,
                }),
            );
        }
        engine
            .response(caller, request, json!({ "methods": methods }))
            .await;
        Ok(())
    }
}

/// The RPC plugin
pub struct RpcModule {
    engine: Arc<RpcEngine>,
    sessions: Arc<SessionTable>,
    authenticator: Arc<RpcAuthenticator>,
    database: Arc<Database>,
    me_id: String,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RpcModule {
    pub fn new(
        me_id: &str,
        me_name: &str,
        config: &RpcConfig,
        links: Arc<dyn RemoteSender>,
        database: Arc<Database>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        let sessions = Arc::new(SessionTable::new());
        let engine = Arc::new(RpcEngine::new(me_id, me_name, links, sessions.clone()));
        let authenticator = Arc::new(RpcAuthenticator::new(config.users.clone(), verifier));
        Self {
            engine,
            sessions,
            authenticator,
            database,
            me_id: me_id.to_string(),
            sweeper: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<RpcEngine> {
        &self.engine
    }

    /// Accept-time network gate, checked before any bytes are read
    pub fn accept_allowed(&self, addr: &str) -> bool {
        self.authenticator.allowed_by_any(addr)
    }

    /// Open a UNIX-socket session; the local principal needs no credentials
    pub fn open_unix_session(&self, addr: &str, sink: Arc<dyn ResponseSink>) -> Arc<RpcSession> {
        let session = Arc::new(RpcSession::new(
            &self.me_id,
            "RPC:local",
            TransportKind::UnixSocket,
            addr,
            "<local>",
            sink,
        ));
        self.sessions.open(session.clone());
        session
    }

    /// Gate an HTTP request and open the matching session kind on success
    pub async fn handle_web_request(
        &self,
        addr: &str,
        request: &WebRequest,
        sink: Arc<dyn ResponseSink>,
    ) -> std::result::Result<Arc<RpcSession>, (u16, String)> {
        match web::evaluate(&self.authenticator, addr, request).await {
            WebDecision::Reject { status, body } => Err((status, body)),
            WebDecision::AcceptPost { principal } => {
                let session = Arc::new(RpcSession::new(
                    &self.me_id,
                    &format!("RPC:{}", principal),
                    TransportKind::Http,
                    addr,
                    &principal,
                    sink,
                ));
                self.sessions.open(session.clone());
                Ok(session)
            }
            WebDecision::UpgradeWebSocket { principal } => {
                let session = Arc::new(RpcSession::new(
                    &self.me_id,
                    &format!("RPC:{}", principal),
                    TransportKind::WebSocket,
                    addr,
                    &principal,
                    sink,
                ));
                self.sessions.open(session.clone());
                Ok(session)
            }
        }
    }

    /// Feed inbound bytes from a session's transport
    pub async fn deliver(&self, session: &Arc<RpcSession>, bytes: &[u8]) -> Result<()> {
        self.engine.deliver(session, bytes).await
    }

    /// The transport closed; forget the session
    pub fn close_session(&self, session: &RpcSession) {
        self.sessions.close(&session.uid);
    }
}

#[async_trait]
impl Module for RpcModule {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn version(&self) -> &str {
        MODULE_VERSION
    }

    fn description(&self) -> &str {
        "JSON-RPC management interface with cross-server relay"
    }

    async fn init(&mut self) -> Result<()> {
        let registry = self.engine.registry();
        registry.register(RpcHandlerInfo {
            method: "rpc.info".to_string(),
            module: MODULE_NAME.to_string(),
            version: MODULE_VERSION.to_string(),
            handler: Arc::new(RpcInfoHandler),
        })?;
        registry.register(RpcHandlerInfo {
            method: "user.list".to_string(),
            module: MODULE_NAME.to_string(),
            version: MODULE_VERSION.to_string(),
            handler: Arc::new(UserListHandler::new(self.database.clone())),
        })?;
        registry.register(RpcHandlerInfo {
            method: "user.get".to_string(),
            module: MODULE_NAME.to_string(),
            version: MODULE_VERSION.to_string(),
            handler: Arc::new(UserGetHandler::new(self.database.clone())),
        })?;

        let engine = self.engine.clone();
        let sessions = self.sessions.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(
                outstanding::TIMEOUT_SWEEP_SECS,
            ));
            loop {
                tick.tick().await;
                let now = Utc::now();
                engine.sweep_timeouts(now);
                for session in sessions.all() {
                    if session.transport == TransportKind::WebSocket
                        && session.websocket_keepalive(now) == transport::KeepaliveAction::Dead
                    {
                        session.close();
                        sessions.close(&session.uid);
                    }
                }
            }
        });
        *self.sweeper.lock() = Some(handle);

        info!("RPC module ready, {} methods", self.engine.registry().len());
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<()> {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        for session in self.sessions.all() {
            session.close();
            self.sessions.close(&session.uid);
        }
        Ok(())
    }

    async fn handle_message(&mut self, _client: &Client, _message: &Message) -> Result<ModuleResult> {
        // Management traffic never arrives over an IRC client connection
        Ok(ModuleResult::NotHandled)
    }

    async fn handle_server_message(
        &mut self,
        from_sid: &str,
        message: &Message,
    ) -> Result<ModuleResult> {
        if message.command != MessageType::Rrpc {
            return Ok(ModuleResult::NotHandled);
        }
        self.engine.handle_rrpc(from_sid, message).await?;
        Ok(ModuleResult::Handled)
    }

    async fn handle_server_disconnect(&mut self, sid: &str) -> Result<()> {
        self.engine.handle_server_gone(sid).await;
        Ok(())
    }
}
