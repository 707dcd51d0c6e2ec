//! User management and tracking

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// User information and state
#[derive(Debug, Clone)]
pub struct User {
    /// Unique user ID
    pub id: Uuid,
    /// Nickname
    pub nick: String,
    /// Username (ident)
    pub username: String,
    /// Real name
    pub realname: String,
    /// Hostname/IP
    pub host: String,
    /// Server the user is attached to
    pub server: String,
    /// Services account the user is authenticated to, if any
    pub account: Option<String>,
    /// Registration time
    pub registered_at: DateTime<Utc>,
    /// Whether user completed registration
    pub registered: bool,
}

impl User {
    /// Create a new user
    pub fn new(
        nick: String,
        username: String,
        realname: String,
        host: String,
        server: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            nick,
            username,
            realname,
            host,
            server,
            account: None,
            registered_at: Utc::now(),
            registered: false,
        }
    }

    /// Get the user's nickname
    pub fn nickname(&self) -> &str {
        &self.nick
    }

    /// Whether the user is authenticated to a services account
    pub fn is_identified(&self) -> bool {
        self.account.is_some()
    }

    /// Full nick!user@host mask
    pub fn full_mask(&self) -> String {
        format!("{}!{}@{}", self.nick, self.username, self.host)
    }
}
