//! Server-to-server log relay
//!
//! `SLOG <level> <subsystem> <event-id> :<message>` carries log events across
//! the network. A `s2s/json` message tag may hold the serialized structured
//! fields of the event; it is accepted from and forwarded to servers only.

use ferrumd_core::{
    async_trait, Client, Message, MessageType, Module, ModuleResult, Prefix, RemoteSender, Result,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const MODULE_NAME: &str = "slog";
const MODULE_VERSION: &str = "1.0.0";

/// Message tag carrying the structured event fields
pub const JSON_TAG: &str = "s2s/json";

const SUBSYSTEM_MAX: usize = 32;
const EVENT_ID_MAX: usize = 64;

/// Log severities carried on the wire, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            "fatal" => Some(LogLevel::Fatal),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }
}

/// Subsystems are short lowercase-ish tokens like `linking` or `tkl`
pub fn valid_subsystem(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= SUBSYSTEM_MAX
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Event ids are SCREAMING_SNAKE identifiers like `LINK_ESTABLISHED`
pub fn valid_event_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= EVENT_ID_MAX
        && s.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Log relay plugin
pub struct SlogModule {
    me_name: String,
    links: Arc<dyn RemoteSender>,
}

impl SlogModule {
    pub fn new(me_name: &str, links: Arc<dyn RemoteSender>) -> Self {
        Self {
            me_name: me_name.to_string(),
            links,
        }
    }

    /// Broadcast one of our own log events to the network
    pub async fn deliver(
        &self,
        level: LogLevel,
        subsystem: &str,
        event_id: &str,
        text: &str,
        json: Option<&Value>,
    ) -> Result<()> {
        let mut message = Message::with_prefix(
            Prefix::Server(self.me_name.clone()),
            MessageType::Slog,
            vec![
                level.name().to_string(),
                subsystem.to_string(),
                event_id.to_string(),
                text.to_string(),
            ],
        );
        if let Some(json) = json {
            message = message.with_tag(JSON_TAG, &json.to_string());
        }
        self.links.broadcast(None, message).await
    }

    fn emit_local(&self, origin: &str, level: LogLevel, subsystem: &str, event_id: &str, text: &str, json: Option<&str>) {
        let json = json.unwrap_or("");
        match level {
            LogLevel::Debug => {
                debug!(%origin, %subsystem, %event_id, %json, "{}", text)
            }
            LogLevel::Info => info!(%origin, %subsystem, %event_id, %json, "{}", text),
            LogLevel::Warn => warn!(%origin, %subsystem, %event_id, %json, "{}", text),
            LogLevel::Error | LogLevel::Fatal => {
                error!(%origin, %subsystem, %event_id, %json, "{}", text)
            }
        }
    }
}

#[async_trait]
impl Module for SlogModule {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn version(&self) -> &str {
        MODULE_VERSION
    }

    fn description(&self) -> &str {
        "Network-wide log event relay"
    }

    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }

    async fn handle_message(&mut self, _client: &Client, _message: &Message) -> Result<ModuleResult> {
        // Server-only command
        Ok(ModuleResult::NotHandled)
    }

    async fn handle_server_message(
        &mut self,
        from_sid: &str,
        message: &Message,
    ) -> Result<ModuleResult> {
        if message.command != MessageType::Slog {
            return Ok(ModuleResult::NotHandled);
        }
        if message.params.len() < 4 {
            debug!("SLOG from {} with too few parameters", from_sid);
            return Ok(ModuleResult::Handled);
        }
        let Some(level) = LogLevel::parse(&message.params[0]) else {
            debug!("SLOG from {} with unknown level {}", from_sid, message.params[0]);
            return Ok(ModuleResult::Handled);
        };
        let subsystem = &message.params[1];
        let event_id = &message.params[2];
        let text = &message.params[3];
        if !valid_subsystem(subsystem) || !valid_event_id(event_id) {
            debug!("SLOG from {} with invalid subsystem or event id", from_sid);
            return Ok(ModuleResult::Handled);
        }

        let origin = match &message.prefix {
            Some(Prefix::Server(name)) => name.clone(),
            _ => from_sid.to_string(),
        };
        self.emit_local(&origin, level, subsystem, event_id, text, message.tag(JSON_TAG));

        // Onward to the rest of the network, away from where it came
        self.links.broadcast(Some(from_sid), message.clone()).await?;
        Ok(ModuleResult::Handled)
    }
}
