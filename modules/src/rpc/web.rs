//! HTTP front door for the RPC interface
//!
//! The host hands over each parsed HTTP request once headers are complete.
//! This module decides what becomes of it: rejected with a status, accepted
//! as a single-shot POST call, or upgraded to a WebSocket session. The
//! upgrade handshake itself stays with the host's HTTP layer.

use super::auth::{parse_basic_auth, parse_uri_auth, RpcAuthenticator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Other,
}

impl HttpMethod {
    pub fn parse(s: &str) -> Self {
        match s {
            "GET" => HttpMethod::Get,
            "POST" => HttpMethod::Post,
            _ => HttpMethod::Other,
        }
    }
}

/// A parsed inbound HTTP request
#[derive(Debug)]
pub struct WebRequest {
    pub method: HttpMethod,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl WebRequest {
    /// Header lookup, case-insensitive on the name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn wants_websocket(&self) -> bool {
        self.header("Upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or(&self.uri)
    }
}

/// What to do with an inbound HTTP request
#[derive(Debug, PartialEq, Eq)]
pub enum WebDecision {
    Reject { status: u16, body: String },
    /// Run the body as one JSON-RPC call, reply, close
    AcceptPost { principal: String },
    /// Complete the WebSocket handshake and open a persistent session
    UpgradeWebSocket { principal: String },
}

/// Gate an HTTP request: credentials first, then routing
pub async fn evaluate(
    auth: &RpcAuthenticator,
    addr: &str,
    request: &WebRequest,
) -> WebDecision {
    let credentials = request
        .header("Authorization")
        .and_then(parse_basic_auth)
        .or_else(|| parse_uri_auth(&request.uri));

    let principal = match credentials {
        Some((username, password)) => {
            match auth.authenticate(addr, &username, &password).await {
                Some(principal) => principal,
                None => return reject(401, "Authentication required"),
            }
        }
        None => return reject(401, "Authentication required"),
    };

    if request.wants_websocket() {
        match request.header("Sec-WebSocket-Key") {
            // A colon in the key would corrupt the handshake header line
            Some(key) if key.contains(':') => {
                return reject(400, "Invalid Sec-WebSocket-Key");
            }
            Some(_) => return WebDecision::UpgradeWebSocket { principal },
            None => return reject(400, "Missing Sec-WebSocket-Key"),
        }
    }

    match request.path() {
        "/api" => {
            if request.method == HttpMethod::Post {
                WebDecision::AcceptPost { principal }
            } else {
                reject(
                    200,
                    "To use the RPC API you should make a POST request to the /api endpoint",
                )
            }
        }
        _ => reject(404, "Page not found"),
    }
}

fn reject(status: u16, body: &str) -> WebDecision {
    WebDecision::Reject {
        status,
        body: body.to_string(),
    }
}
