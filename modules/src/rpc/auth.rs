//! RPC access control
//!
//! Two gates guard a management connection: the client address must match at
//! least one configured rpc-user mask before the connection is accepted at
//! all, and HTTP transports must then present credentials for a specific
//! rpc-user whose own masks also cover the address.

use base64::Engine as _;
use ferrumd_core::{CredentialVerifier, RpcUserConfig};
use std::sync::Arc;
use tracing::debug;

pub struct RpcAuthenticator {
    users: Vec<RpcUserConfig>,
    verifier: Arc<dyn CredentialVerifier>,
}

impl RpcAuthenticator {
    pub fn new(users: Vec<RpcUserConfig>, verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self { users, verifier }
    }

    /// Accept-time gate: some rpc-user lists a mask covering this address
    pub fn allowed_by_any(&self, addr: &str) -> bool {
        self.users.iter().any(|user| user.matches_address(addr))
    }

    /// Credential gate. Returns the matched rpc-user name on success.
    /// The matched user's own masks must cover the address; matching some
    /// other user's mask at accept time is not enough.
    pub async fn authenticate(
        &self,
        addr: &str,
        username: &str,
        password: &str,
    ) -> Option<String> {
        let user = self.users.iter().find(|u| u.name == username)?;
        if !user.matches_address(addr) {
            debug!("RPC auth: user {} not allowed from {}", username, addr);
            return None;
        }
        if self.verifier.verify(&user.password, password).await {
            Some(user.name.clone())
        } else {
            debug!("RPC auth: bad password for user {}", username);
            None
        }
    }
}

/// Decode an HTTP `Authorization: Basic` header value into credentials
pub fn parse_basic_auth(header_value: &str) -> Option<(String, String)> {
    let encoded = header_value.strip_prefix("Basic ")?.trim();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    if user.is_empty() {
        return None;
    }
    Some((user.to_string(), pass.to_string()))
}

/// Extract `username` and `password` query parameters from a request URI
pub fn parse_uri_auth(uri: &str) -> Option<(String, String)> {
    let query = uri.split_once('?')?.1;
    let mut username = None;
    let mut password = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "username" => username = Some(value.into_owned()),
            "password" => password = Some(value.into_owned()),
            _ => {}
        }
    }
    match (username, password) {
        (Some(u), Some(p)) if !u.is_empty() => Some((u, p)),
        _ => None,
    }
}
