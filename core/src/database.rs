//! In-memory user directory
//!
//! Backs the `user.*` RPC handlers. The host keeps this up to date as users
//! register, change nicks, and disconnect.

use crate::{Error, Result, User};
use dashmap::DashMap;
use uuid::Uuid;

/// User directory with a case-insensitive nickname index
pub struct Database {
    /// Users by id
    users: DashMap<Uuid, User>,
    /// Nickname (lowercased) to id index
    nick_index: DashMap<String, Uuid>,
}

impl Database {
    /// Create an empty directory
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            nick_index: DashMap::new(),
        }
    }

    /// Add a user
    pub fn add_user(&self, user: User) -> Result<()> {
        let nick_lower = user.nick.to_lowercase();
        if self.nick_index.contains_key(&nick_lower) {
            return Err(Error::Generic(format!("Nick {} already in use", user.nick)));
        }
        self.nick_index.insert(nick_lower, user.id);
        self.users.insert(user.id, user);
        Ok(())
    }

    /// Remove a user by id
    pub fn remove_user(&self, id: Uuid) -> Option<User> {
        let (_, user) = self.users.remove(&id)?;
        self.nick_index.remove(&user.nick.to_lowercase());
        Some(user)
    }

    /// Look up a user by id
    pub fn get_user(&self, id: Uuid) -> Option<User> {
        self.users.get(&id).map(|u| u.clone())
    }

    /// Look up a user by nickname (case-insensitive)
    pub fn get_user_by_nick(&self, nick: &str) -> Option<User> {
        let id = *self.nick_index.get(&nick.to_lowercase())?;
        self.get_user(id)
    }

    /// Replace a stored user (e.g. after account login)
    pub fn update_user(&self, user: User) {
        self.users.insert(user.id, user);
    }

    /// Snapshot of all users
    pub fn all_users(&self) -> Vec<User> {
        self.users.iter().map(|u| u.clone()).collect()
    }

    /// Number of known users
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}
