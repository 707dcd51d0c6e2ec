//! Extended ban types
//!
//! An extended ban is a `~<letter>:<value>` mask in a ban list. Each type
//! validates and normalizes its value at set time and decides at match time
//! whether a user is covered.

pub mod account;

use dashmap::DashMap;
use ferrumd_core::{Error, Result, User};
use std::sync::Arc;

pub use account::AccountExtBan;

/// One extended ban type
pub trait ExtBan: Send + Sync {
    /// The letter after `~`
    fn letter(&self) -> char;

    /// Validate and normalize the value part of the mask; `None` rejects it
    fn conv_param(&self, value: &str) -> Option<String>;

    /// Whether this ban value covers the user
    fn is_banned(&self, user: &User, value: &str) -> bool;
}

/// Registered extended ban types, keyed by letter
pub struct ExtBanRegistry {
    types: DashMap<char, Arc<dyn ExtBan>>,
}

impl ExtBanRegistry {
    pub fn new() -> Self {
        Self {
            types: DashMap::new(),
        }
    }

    /// Register a ban type; refuses duplicate letters
    pub fn register(&self, extban: Arc<dyn ExtBan>) -> Result<()> {
        let letter = extban.letter();
        if self.types.contains_key(&letter) {
            return Err(Error::Module(format!(
                "Extban letter '{}' is already registered",
                letter
            )));
        }
        self.types.insert(letter, extban);
        Ok(())
    }

    pub fn find(&self, letter: char) -> Option<Arc<dyn ExtBan>> {
        self.types.get(&letter).map(|e| e.clone())
    }

    /// Normalize a full `~<letter>:<value>` mask; `None` rejects it
    pub fn conv_mask(&self, mask: &str) -> Option<String> {
        let (letter, value) = split_mask(mask)?;
        let extban = self.find(letter)?;
        let value = extban.conv_param(value)?;
        Some(format!("~{}:{}", letter, value))
    }

    /// Whether a full extban mask covers the user
    pub fn is_banned(&self, user: &User, mask: &str) -> bool {
        let Some((letter, value)) = split_mask(mask) else {
            return false;
        };
        match self.find(letter) {
            Some(extban) => extban.is_banned(user, value),
            None => false,
        }
    }
}

impl Default for ExtBanRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn split_mask(mask: &str) -> Option<(char, &str)> {
    let rest = mask.strip_prefix('~')?;
    let mut chars = rest.chars();
    let letter = chars.next()?;
    let rest = chars.as_str();
    let value = rest.strip_prefix(':')?;
    Some((letter, value))
}
