//! Local client connection handles

use crate::{Error, Message, NumericReply, Result, User};
use std::collections::HashSet;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Client connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Just connected, not registered
    Connected,
    /// Fully registered
    Registered,
    /// Disconnected
    Disconnected,
}

/// A local client connection as the host hands it to the plugins
#[derive(Debug)]
pub struct Client {
    /// Unique client ID
    pub id: Uuid,
    /// Client state
    pub state: ClientState,
    /// User information (if registered)
    pub user: Option<User>,
    /// Remote address
    pub remote_addr: String,
    /// Message sender for the connection's outgoing queue
    pub sender: mpsc::UnboundedSender<Message>,
    /// Negotiated capabilities
    pub capabilities: HashSet<String>,
}

impl Client {
    /// Create a new client
    pub fn new(id: Uuid, remote_addr: String, sender: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            state: ClientState::Connected,
            user: None,
            remote_addr,
            sender,
            capabilities: HashSet::new(),
        }
    }

    /// Send a message to the client
    pub fn send(&self, message: Message) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| Error::Connection("Failed to send message to client".to_string()))?;
        Ok(())
    }

    /// Send a numeric reply to the client
    pub fn send_numeric(&self, numeric: NumericReply, params: &[&str]) -> Result<()> {
        let target = self.nickname().unwrap_or("*").to_string();
        let msg = numeric.reply(&target, params.iter().map(|p| p.to_string()).collect());
        self.send(msg)
    }

    /// Check if client is fully registered
    pub fn is_registered(&self) -> bool {
        self.state == ClientState::Registered
    }

    /// Check if the client negotiated a capability
    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.contains(cap)
    }

    /// Get client nickname
    pub fn nickname(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.nick.as_str())
    }
}
