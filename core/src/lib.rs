//! Ferrumd Core
//!
//! Host-side object model and seams for the ferrumd plugin suite: the wire
//! message codec, configuration, user directory, server link registry, and
//! the module/credential traits the plugins are wired against.

pub mod auth;
pub mod client;
pub mod config;
pub mod database;
pub mod error;
pub mod links;
pub mod message;
pub mod module;
pub mod numeric;
pub mod user;

pub use auth::{ConfigCredentialVerifier, CredentialVerifier};
pub use client::{Client, ClientState};
pub use config::{Config, RpcConfig, RpcUserConfig, SaslConfig, ServerConfig, SERVER_ID_LEN};
pub use database::Database;
pub use error::{Error, Result};
pub use links::{sid_prefix, RemoteSender, ServerLink, ServerLinks};
pub use message::{Message, MessageType, Prefix};
pub use module::{Module, ModuleManager, ModuleResult};
pub use numeric::NumericReply;
pub use user::User;

/// Re-exports for convenience
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
pub use tracing::{debug, error, info, warn};
