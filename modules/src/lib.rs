//! Plugin suite for the ferrumd IRC daemon
//!
//! - `rpc`: JSON-RPC management interface with cross-server relay (RRPC)
//! - `sasl`: SASL authentication relayed to a network services agent
//! - `slog`: network-wide log event relay
//! - `extbans`: extended ban types

pub mod extbans;
pub mod rpc;
pub mod sasl;
pub mod slog;

pub use extbans::{AccountExtBan, ExtBan, ExtBanRegistry};
pub use rpc::RpcModule;
pub use sasl::SaslModule;
pub use slog::SlogModule;
