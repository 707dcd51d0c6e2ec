//! Configuration management

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Length of a server id (SID) on the wire
pub const SERVER_ID_LEN: usize = 3;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server information
    pub server: ServerConfig,
    /// RPC plugin settings
    #[serde(default)]
    pub rpc: RpcConfig,
    /// SASL relay settings
    #[serde(default)]
    pub sasl: SaslConfig,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server name (e.g. irc.example.org)
    pub name: String,
    /// Server id: 3 characters, digit first, used for routing
    pub id: String,
    /// Server description
    pub description: String,
}

/// RPC plugin configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Whether the RPC plugin is enabled
    #[serde(default)]
    pub enabled: bool,
    /// rpc-user blocks: who may issue RPC calls
    #[serde(default)]
    pub users: Vec<RpcUserConfig>,
}

/// One rpc-user block: a principal allowed to issue RPC calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcUserConfig {
    /// Principal name
    pub name: String,
    /// Address masks the principal may connect from (wildcards allowed)
    pub masks: Vec<String>,
    /// Stored password hash (argon2 PHC string or sha256 hex)
    pub password: String,
}

impl RpcUserConfig {
    /// Check whether a connecting address is allowed by this principal's masks
    pub fn matches_address(&self, addr: &str) -> bool {
        self.masks.iter().any(|m| matches_pattern(addr, m))
    }
}

/// SASL relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaslConfig {
    /// Whether the SASL relay is enabled
    #[serde(default)]
    pub enabled: bool,
    /// Name of the authentication-provider server (services); empty when
    /// unconfigured
    #[serde(default)]
    pub server: String,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.name.is_empty() {
            return Err(Error::Config("Server name is required".to_string()));
        }
        if self.server.id.len() != SERVER_ID_LEN
            || !self.server.id.chars().next().is_some_and(|c| c.is_ascii_digit())
            || !self.server.id.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(Error::Config(format!(
                "Server id must be {} alphanumeric characters starting with a digit",
                SERVER_ID_LEN
            )));
        }

        for user in &self.rpc.users {
            if user.name.is_empty() {
                return Err(Error::Config(
                    "rpc-user block needs to have a name".to_string(),
                ));
            }
            if user.masks.is_empty() {
                return Err(Error::Config(format!(
                    "rpc-user '{}' needs at least one match mask",
                    user.name
                )));
            }
            if user.password.is_empty() {
                return Err(Error::Config(format!(
                    "rpc-user '{}' needs a password",
                    user.name
                )));
            }
        }

        if self.sasl.enabled && self.sasl.server.is_empty() {
            return Err(Error::Config(
                "sasl.server is required when the SASL relay is enabled".to_string(),
            ));
        }

        Ok(())
    }
}

/// Wildcard pattern matching with `*` and `?`
pub fn matches_pattern(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();

    // Iterative glob match with single-star backtracking
    let (mut t, mut p) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

/// Password hashing utilities
pub struct PasswordHasher;

impl PasswordHasher {
    /// Hash a password using SHA256 (hex encoded)
    pub fn hash_password(password: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Verify a password against a SHA256 hex hash
    pub fn verify_password(password: &str, hash: &str) -> bool {
        Self::hash_password(password).eq_ignore_ascii_case(hash)
    }
}
