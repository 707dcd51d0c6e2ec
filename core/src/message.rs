//! IRC wire message parsing and handling
//!
//! Implements the RFC 1459 message format plus IRCv3 message tags, which the
//! server-to-server log relay uses to carry structured payloads (`s2s/json`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// IRC message prefix (server or user)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prefix {
    /// Server name or id
    Server(String),
    /// User prefix (nick!user@host)
    User {
        nick: String,
        user: String,
        host: String,
    },
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::Server(name) => write!(f, "{}", name),
            Prefix::User { nick, user, host } => write!(f, "{}!{}@{}", nick, user, host),
        }
    }
}

/// Commands the plugin suite deals with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    // Server-to-server plugin commands
    Rrpc,
    Slog,
    Sasl,
    SvsLogin,

    // Client registration / liveness
    Authenticate,
    Ping,
    Pong,
    Quit,
    Error,

    // Everything else
    Custom(String),
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::Rrpc => "RRPC",
            MessageType::Slog => "SLOG",
            MessageType::Sasl => "SASL",
            MessageType::SvsLogin => "SVSLOGIN",
            MessageType::Authenticate => "AUTHENTICATE",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
            MessageType::Quit => "QUIT",
            MessageType::Error => "ERROR",
            MessageType::Custom(cmd) => cmd,
        };
        write!(f, "{}", s)
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "RRPC" => MessageType::Rrpc,
            "SLOG" => MessageType::Slog,
            "SASL" => MessageType::Sasl,
            "SVSLOGIN" => MessageType::SvsLogin,
            "AUTHENTICATE" => MessageType::Authenticate,
            "PING" => MessageType::Ping,
            "PONG" => MessageType::Pong,
            "QUIT" => MessageType::Quit,
            "ERROR" => MessageType::Error,
            _ => MessageType::Custom(s.to_string()),
        }
    }
}

/// Escape a tag value per the IRCv3 message-tags rules
fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

/// Unescape a tag value per the IRCv3 message-tags rules
fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// IRC message as defined in RFC 1459, with optional IRCv3 message tags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message tags (`@key=value;...`), sorted for stable serialization
    pub tags: BTreeMap<String, String>,
    /// Optional prefix (server or user)
    pub prefix: Option<Prefix>,
    /// Message command/type
    pub command: MessageType,
    /// Message parameters
    pub params: Vec<String>,
}

impl Message {
    /// Create a new message
    pub fn new(command: MessageType, params: Vec<String>) -> Self {
        Self {
            tags: BTreeMap::new(),
            prefix: None,
            command,
            params,
        }
    }

    /// Create a new message with prefix
    pub fn with_prefix(prefix: Prefix, command: MessageType, params: Vec<String>) -> Self {
        Self {
            tags: BTreeMap::new(),
            prefix: Some(prefix),
            command,
            params,
        }
    }

    /// Attach a message tag
    pub fn with_tag(mut self, name: &str, value: &str) -> Self {
        self.tags.insert(name.to_string(), value.to_string());
        self
    }

    /// Look up a message tag value
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(|v| v.as_str())
    }

    /// Parse an IRC message from a string
    pub fn parse(input: &str) -> crate::Result<Self> {
        let mut input = input.trim_end_matches(['\r', '\n']).trim_start();
        if input.is_empty() {
            return Err(crate::Error::MessageParse("Empty message".to_string()));
        }

        let mut tags = BTreeMap::new();
        if let Some(rest) = input.strip_prefix('@') {
            let (tag_str, remainder) = rest
                .split_once(' ')
                .ok_or_else(|| crate::Error::MessageParse("Tags without command".to_string()))?;
            for tag in tag_str.split(';') {
                if tag.is_empty() {
                    continue;
                }
                match tag.split_once('=') {
                    Some((name, value)) => {
                        tags.insert(name.to_string(), unescape_tag_value(value));
                    }
                    None => {
                        tags.insert(tag.to_string(), String::new());
                    }
                }
            }
            input = remainder.trim_start();
        }

        let parts = input.split(' ').filter(|p| !p.is_empty()).collect::<Vec<_>>();
        if parts.is_empty() {
            return Err(crate::Error::MessageParse("No command found".to_string()));
        }

        let (prefix, command_idx) = if parts[0].starts_with(':') {
            if parts.len() < 2 {
                return Err(crate::Error::MessageParse("Prefix without command".to_string()));
            }
            let prefix_str = &parts[0][1..];
            let prefix = if prefix_str.contains('!') {
                let nick_rest: Vec<&str> = prefix_str.splitn(2, '!').collect();
                let user_host: Vec<&str> = nick_rest[1].splitn(2, '@').collect();
                if user_host.len() != 2 {
                    return Err(crate::Error::MessageParse(
                        "Invalid user prefix format".to_string(),
                    ));
                }
                Prefix::User {
                    nick: nick_rest[0].to_string(),
                    user: user_host[0].to_string(),
                    host: user_host[1].to_string(),
                }
            } else {
                Prefix::Server(prefix_str.to_string())
            };
            (Some(prefix), 1)
        } else {
            (None, 0)
        };

        let command = MessageType::from(parts[command_idx]);

        let mut params = Vec::new();
        let mut i = command_idx + 1;
        while i < parts.len() {
            if let Some(trailing) = parts[i].strip_prefix(':') {
                let mut rest = trailing.to_string();
                for part in &parts[i + 1..] {
                    rest.push(' ');
                    rest.push_str(part);
                }
                params.push(rest);
                break;
            }
            params.push(parts[i].to_string());
            i += 1;
        }

        Ok(Message {
            tags,
            prefix,
            command,
            params,
        })
    }

    /// Serialize message to its wire form (CRLF terminated)
    pub fn serialize(&self) -> String {
        let mut result = String::new();

        if !self.tags.is_empty() {
            result.push('@');
            let mut first = true;
            for (name, value) in &self.tags {
                if !first {
                    result.push(';');
                }
                first = false;
                result.push_str(name);
                if !value.is_empty() {
                    result.push('=');
                    result.push_str(&escape_tag_value(value));
                }
            }
            result.push(' ');
        }

        if let Some(ref prefix) = self.prefix {
            result.push(':');
            result.push_str(&prefix.to_string());
            result.push(' ');
        }

        result.push_str(&self.command.to_string());

        for (i, param) in self.params.iter().enumerate() {
            result.push(' ');
            if i == self.params.len() - 1 && (param.contains(' ') || param.is_empty()) {
                result.push(':');
            }
            result.push_str(param);
        }

        result.push_str("\r\n");
        result
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serialize().trim_end())
    }
}
