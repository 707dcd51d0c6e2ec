//! Module system the host uses to load the plugins

use crate::{Client, Message, Result};
use async_trait::async_trait;
use std::collections::HashMap;

/// Module trait that all plugins implement
#[async_trait]
pub trait Module: Send + Sync {
    /// Module name
    fn name(&self) -> &str;

    /// Module version
    fn version(&self) -> &str;

    /// Module description
    fn description(&self) -> &str;

    /// Initialize the module
    async fn init(&mut self) -> Result<()>;

    /// Cleanup the module
    async fn cleanup(&mut self) -> Result<()>;

    /// Handle a message from a local client
    async fn handle_message(&mut self, client: &Client, message: &Message) -> Result<ModuleResult>;

    /// Handle a message arriving from a directly linked server
    async fn handle_server_message(
        &mut self,
        from_sid: &str,
        message: &Message,
    ) -> Result<ModuleResult>;

    /// A local client completed registration
    async fn handle_user_registration(&mut self, _client: &Client) -> Result<()> {
        Ok(())
    }

    /// A local client disconnected
    async fn handle_user_disconnection(&mut self, _client: &Client) -> Result<()> {
        Ok(())
    }

    /// A server (anywhere on the network) left the server graph
    async fn handle_server_disconnect(&mut self, _sid: &str) -> Result<()> {
        Ok(())
    }
}

/// Result of module message handling
#[derive(Debug, Clone)]
pub enum ModuleResult {
    /// Message was handled, stop processing
    Handled,
    /// Message was not handled, continue to next module
    NotHandled,
    /// Message was rejected, send error
    Rejected(String),
}

/// Module manager for loading and dispatching to plugins
pub struct ModuleManager {
    modules: HashMap<String, Box<dyn Module>>,
    load_order: Vec<String>,
}

impl ModuleManager {
    /// Create a new module manager
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
            load_order: Vec::new(),
        }
    }

    /// Load a module
    pub async fn load_module(&mut self, mut module: Box<dyn Module>) -> Result<()> {
        let name = module.name().to_string();
        module.init().await?;
        tracing::info!(module = %name, version = %module.version(), "Module loaded");
        self.load_order.push(name.clone());
        self.modules.insert(name, module);
        Ok(())
    }

    /// Unload a module
    pub async fn unload_module(&mut self, name: &str) -> Result<()> {
        if let Some(mut module) = self.modules.remove(name) {
            module.cleanup().await?;
            self.load_order.retain(|n| n != name);
            tracing::info!(module = %name, "Module unloaded");
        }
        Ok(())
    }

    /// Get a module by name
    pub fn get_module(&self, name: &str) -> Option<&dyn Module> {
        self.modules.get(name).map(|m| m.as_ref())
    }

    /// Handle a message from a local client
    pub async fn handle_message(
        &mut self,
        client: &Client,
        message: &Message,
    ) -> Result<ModuleResult> {
        for name in &self.load_order {
            if let Some(module) = self.modules.get_mut(name) {
                match module.handle_message(client, message).await {
                    Ok(ModuleResult::NotHandled) => continue,
                    Ok(result) => return Ok(result),
                    Err(e) => {
                        tracing::error!(module = %name, error = %e, "Error in module");
                        continue;
                    }
                }
            }
        }
        Ok(ModuleResult::NotHandled)
    }

    /// Handle a message from a linked server
    pub async fn handle_server_message(
        &mut self,
        from_sid: &str,
        message: &Message,
    ) -> Result<ModuleResult> {
        for name in &self.load_order {
            if let Some(module) = self.modules.get_mut(name) {
                match module.handle_server_message(from_sid, message).await {
                    Ok(ModuleResult::NotHandled) => continue,
                    Ok(result) => return Ok(result),
                    Err(e) => {
                        tracing::error!(module = %name, error = %e, "Error in module");
                        continue;
                    }
                }
            }
        }
        Ok(ModuleResult::NotHandled)
    }

    /// Fan out a server disconnect to every module
    pub async fn handle_server_disconnect(&mut self, sid: &str) -> Result<()> {
        for name in &self.load_order {
            if let Some(module) = self.modules.get_mut(name) {
                if let Err(e) = module.handle_server_disconnect(sid).await {
                    tracing::error!(module = %name, error = %e, "Error in module");
                }
            }
        }
        Ok(())
    }

    /// Fan out a client disconnect to every module
    pub async fn handle_user_disconnection(&mut self, client: &Client) -> Result<()> {
        for name in &self.load_order {
            if let Some(module) = self.modules.get_mut(name) {
                if let Err(e) = module.handle_user_disconnection(client).await {
                    tracing::error!(module = %name, error = %e, "Error in module");
                }
            }
        }
        Ok(())
    }

    /// Names of every loaded module, in load order
    pub fn loaded_modules(&self) -> Vec<&str> {
        self.load_order.iter().map(|n| n.as_str()).collect()
    }
}

impl Default for ModuleManager {
    fn default() -> Self {
        Self::new()
    }
}
