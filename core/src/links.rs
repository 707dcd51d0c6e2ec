//! Server link registry and the outbound server-to-server seam

use crate::config::SERVER_ID_LEN;
use crate::{Error, Message, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;

/// Leading server-id portion of any network identifier (SID or UID).
/// Ids that are too short or split a multibyte character at the cut are
/// returned whole; they can never match a valid SID.
pub fn sid_prefix(id: &str) -> &str {
    id.get(..SERVER_ID_LEN).unwrap_or(id)
}

/// Reliable, ordered server-link send primitive the plugins rely on
#[async_trait]
pub trait RemoteSender: Send + Sync {
    /// Send a message toward the server owning `sid`
    async fn send_to_server(&self, sid: &str, message: Message) -> Result<()>;

    /// Broadcast to all directly linked servers, except `except`
    async fn broadcast(&self, except: Option<&str>, message: Message) -> Result<()>;

    /// Whether a server with this id is currently linked
    async fn is_linked(&self, sid: &str) -> bool;
}

/// One directly linked server
#[derive(Debug)]
pub struct ServerLink {
    /// Server id (SID)
    pub id: String,
    /// Server name
    pub name: String,
    /// Outgoing queue of the link
    pub sender: mpsc::UnboundedSender<Message>,
    /// Link establishment time
    pub connected_at: DateTime<Utc>,
}

/// Registry of directly linked servers, keyed by SID
pub struct ServerLinks {
    me_id: String,
    me_name: String,
    links: DashMap<String, ServerLink>,
}

impl ServerLinks {
    /// Create the registry for this server's identity
    pub fn new(me_id: &str, me_name: &str) -> Self {
        Self {
            me_id: me_id.to_string(),
            me_name: me_name.to_string(),
            links: DashMap::new(),
        }
    }

    /// This server's id
    pub fn me_id(&self) -> &str {
        &self.me_id
    }

    /// This server's name
    pub fn me_name(&self) -> &str {
        &self.me_name
    }

    /// Whether an id (SID or UID) belongs to this server
    pub fn is_mine(&self, id: &str) -> bool {
        sid_prefix(id) == self.me_id
    }

    /// Register a newly linked server
    pub fn register(&self, link: ServerLink) {
        self.links.insert(link.id.clone(), link);
    }

    /// Remove a linked server (on netsplit)
    pub fn unregister(&self, sid: &str) -> Option<ServerLink> {
        self.links.remove(sid).map(|(_, l)| l)
    }

    /// Look up a linked server's name
    pub fn name_of(&self, sid: &str) -> Option<String> {
        self.links.get(sid).map(|l| l.name.clone())
    }

    /// Find the SID of a linked server by name
    pub fn sid_by_name(&self, name: &str) -> Option<String> {
        self.links
            .iter()
            .find(|l| l.name.eq_ignore_ascii_case(name))
            .map(|l| l.id.clone())
    }
}

#[async_trait]
impl RemoteSender for ServerLinks {
    async fn send_to_server(&self, sid: &str, message: Message) -> Result<()> {
        let sid = sid_prefix(sid);
        let link = self
            .links
            .get(sid)
            .ok_or_else(|| Error::Server(format!("No such server: {}", sid)))?;
        link.sender
            .send(message)
            .map_err(|_| Error::Connection(format!("Link to {} is closed", sid)))?;
        Ok(())
    }

    async fn broadcast(&self, except: Option<&str>, message: Message) -> Result<()> {
        for link in self.links.iter() {
            if Some(link.id.as_str()) == except {
                continue;
            }
            // A closed link is unregistered by the host shortly after; skip it here
            let _ = link.sender.send(message.clone());
        }
        Ok(())
    }

    async fn is_linked(&self, sid: &str) -> bool {
        self.links.contains_key(sid_prefix(sid))
    }
}
