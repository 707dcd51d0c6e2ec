//! RPC handler registry
//!
//! Method name to handler mapping. Populated once at module load, read-only
//! afterward; lookups are safe under concurrent invocation.

use crate::rpc::engine::{RpcCaller, RpcEngine};
use dashmap::DashMap;
use ferrumd_core::{async_trait, Error, Result};
use serde_json::Value;
use std::sync::Arc;

/// One registered RPC method implementation
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Handle a validated call. The handler must produce exactly one
    /// response or error through the engine; the engine never auto-replies.
    async fn call(
        &self,
        engine: &RpcEngine,
        caller: &RpcCaller,
        request: &Value,
        params: &Value,
    ) -> Result<()>;
}

/// Registration record: the handler plus ownership metadata for `rpc.info`
#[derive(Clone)]
pub struct RpcHandlerInfo {
    /// Method name, e.g. `user.list`
    pub method: String,
    /// Owning module name
    pub module: String,
    /// Owning module version
    pub version: String,
    /// The handler itself
    pub handler: Arc<dyn RpcHandler>,
}

/// Name to handler mapping
pub struct HandlerRegistry {
    handlers: DashMap<String, RpcHandlerInfo>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register a handler; refuses duplicate method names
    pub fn register(&self, info: RpcHandlerInfo) -> Result<()> {
        if self.handlers.contains_key(&info.method) {
            return Err(Error::Rpc(format!(
                "RPC method {} is already registered",
                info.method
            )));
        }
        self.handlers.insert(info.method.clone(), info);
        Ok(())
    }

    /// Look up a handler by method name
    pub fn find(&self, method: &str) -> Option<RpcHandlerInfo> {
        self.handlers.get(method).map(|h| h.clone())
    }

    /// All registered methods as (method, module, version), sorted by method
    pub fn methods(&self) -> Vec<(String, String, String)> {
        let mut out: Vec<_> = self
            .handlers
            .iter()
            .map(|h| (h.method.clone(), h.module.clone(), h.version.clone()))
            .collect();
        out.sort();
        out
    }

    /// Number of registered methods
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no methods are registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
