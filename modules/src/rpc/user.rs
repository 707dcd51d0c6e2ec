//! `user.*` RPC handlers

use super::engine::{RpcCaller, RpcEngine, RpcErrorCode};
use super::registry::RpcHandler;
use ferrumd_core::{async_trait, Database, Result, User};
use serde_json::{json, Value};
use std::sync::Arc;

fn user_detail(user: &User) -> Value {
    json!({
        "name": user.nick,
        "id": user.id.to_string(),
        "hostname": user.host,
        "username": user.username,
        "realname": user.realname,
        "account": user.account,
        "server": user.server,
    })
}

/// `user.list`: every registered user on the network
pub struct UserListHandler {
    database: Arc<Database>,
}

impl UserListHandler {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }
}

#[async_trait]
impl RpcHandler for UserListHandler {
    async fn call(
        &self,
        engine: &RpcEngine,
        caller: &RpcCaller,
        request: &Value,
        _params: &Value,
    ) -> Result<()> {
        let list: Vec<Value> = self
            .database
            .all_users()
            .iter()
            .map(user_detail)
            .collect();
        engine.response(caller, request, json!({ "list": list })).await;
        Ok(())
    }
}

/// `user.get`: one user, looked up by nick
pub struct UserGetHandler {
    database: Arc<Database>,
}

impl UserGetHandler {
    pub fn new(database: Arc<Database>) -> Self {
        Self { database }
    }
}

#[async_trait]
impl RpcHandler for UserGetHandler {
    async fn call(
        &self,
        engine: &RpcEngine,
        caller: &RpcCaller,
        request: &Value,
        params: &Value,
    ) -> Result<()> {
        let nick = match params.get("nick").and_then(Value::as_str) {
            Some(nick) if !nick.is_empty() => nick,
            _ => {
                engine
                    .error(
                        caller,
                        Some(request),
                        RpcErrorCode::InvalidParams,
                        "Missing parameter: 'nick'",
                    )
                    .await;
                return Ok(());
            }
        };

        match self.database.get_user_by_nick(nick) {
            Some(user) => {
                engine
                    .response(caller, request, json!({ "client": user_detail(&user) }))
                    .await;
            }
            None => {
                engine
                    .error(
                        caller,
                        Some(request),
                        RpcErrorCode::NotFound,
                        "Nickname not found",
                    )
                    .await;
            }
        }
        Ok(())
    }
}
