//! Remote RPC relay (RRPC) state machine
//!
//! JSON payloads cross server links as a sequence of bounded frames:
//!
//! `:<server> RRPC <REQ|RES> <source> <destination> <request-id> <S|C|F|SF> :<chunk>`
//!
//! This module owns the pure protocol state: phase markers, the in-flight
//! transfer table, and payload fragmentation. Dispatch of completed payloads
//! lives in the engine.

use ferrumd_core::sid_prefix;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

/// Maximum payload bytes per relay frame, chosen to stay under typical
/// inter-server line-length limits after command framing overhead.
pub const RELAY_CHUNK_MAX: usize = 450;

/// Whether a relayed payload is a request or a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDirection {
    Request,
    Response,
}

impl RelayDirection {
    /// Parse the wire marker
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REQ" => Some(RelayDirection::Request),
            "RES" => Some(RelayDirection::Response),
            _ => None,
        }
    }

    /// Wire marker
    pub fn marker(&self) -> &'static str {
        match self {
            RelayDirection::Request => "REQ",
            RelayDirection::Response => "RES",
        }
    }
}

/// Frame phase: where a chunk sits within its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Start,
    Continuation,
    Finish,
    StartFinish,
}

impl RelayPhase {
    /// Parse the phase letters; markers may combine (e.g. `SF`)
    pub fn parse(s: &str) -> Option<Self> {
        let start = s.contains('S');
        let finish = s.contains('F');
        let cont = s.contains('C');
        match (start, finish, cont) {
            (true, true, _) => Some(RelayPhase::StartFinish),
            (true, false, _) => Some(RelayPhase::Start),
            (false, true, _) => Some(RelayPhase::Finish),
            (false, false, true) => Some(RelayPhase::Continuation),
            (false, false, false) => None,
        }
    }

    /// Whether this frame opens a transfer
    pub fn is_start(&self) -> bool {
        matches!(self, RelayPhase::Start | RelayPhase::StartFinish)
    }

    /// Whether this frame terminates a transfer
    pub fn is_finish(&self) -> bool {
        matches!(self, RelayPhase::Finish | RelayPhase::StartFinish)
    }

    /// Wire marker
    pub fn marker(&self) -> &'static str {
        match self {
            RelayPhase::Start => "S",
            RelayPhase::Continuation => "C",
            RelayPhase::Finish => "F",
            RelayPhase::StartFinish => "SF",
        }
    }
}

/// Identity of one in-flight transfer. Request ids are only unique
/// per-source, so all three parts are required.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct RelayKey {
    pub source: String,
    pub destination: String,
    pub request_id: String,
}

impl RelayKey {
    pub fn new(source: &str, destination: &str, request_id: &str) -> Self {
        Self {
            source: source.to_string(),
            destination: destination.to_string(),
            request_id: request_id.to_string(),
        }
    }
}

/// One open transfer: accumulated bytes, not yet terminated
#[derive(Debug)]
pub struct RelayTransfer {
    pub direction: RelayDirection,
    pub data: Vec<u8>,
}

/// Outcome of a Start frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Transfer opened
    Opened,
    /// A transfer with this key was already open; it has been discarded
    /// (two colliding transfers must never merge their byte streams)
    Duplicate,
}

/// Process-wide table of in-flight relay transfers
pub struct RelayTable {
    transfers: RwLock<HashMap<RelayKey, RelayTransfer>>,
}

impl RelayTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            transfers: RwLock::new(HashMap::new()),
        }
    }

    /// Open a transfer. On a duplicate key the stale open transfer is
    /// force-discarded and no new one is created; the sender must retry.
    pub fn start(&self, key: RelayKey, direction: RelayDirection) -> StartOutcome {
        let mut transfers = self.transfers.write();
        if transfers.remove(&key).is_some() {
            return StartOutcome::Duplicate;
        }
        transfers.insert(
            key,
            RelayTransfer {
                direction,
                data: Vec::new(),
            },
        );
        StartOutcome::Opened
    }

    /// Append continuation bytes; false when no such transfer is open
    pub fn append(&self, key: &RelayKey, chunk: &[u8]) -> bool {
        let mut transfers = self.transfers.write();
        match transfers.get_mut(key) {
            Some(transfer) => {
                transfer.data.extend_from_slice(chunk);
                true
            }
            None => false,
        }
    }

    /// Append the final chunk and consume the transfer
    pub fn finish(&self, key: &RelayKey, chunk: &[u8]) -> Option<RelayTransfer> {
        let mut transfers = self.transfers.write();
        let mut transfer = transfers.remove(key)?;
        transfer.data.extend_from_slice(chunk);
        Some(transfer)
    }

    /// Discard every transfer whose source or destination belongs to a
    /// now-gone server; returns how many were dropped
    pub fn discard_for_peer(&self, sid: &str) -> usize {
        let mut transfers = self.transfers.write();
        let before = transfers.len();
        transfers.retain(|key, _| {
            sid_prefix(&key.source) != sid && sid_prefix(&key.destination) != sid
        });
        before - transfers.len()
    }

    /// Number of open transfers
    pub fn len(&self) -> usize {
        self.transfers.read().len()
    }

    /// Whether no transfers are open
    pub fn is_empty(&self) -> bool {
        self.transfers.read().is_empty()
    }
}

impl Default for RelayTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a serialized payload into phased chunks of at most
/// [`RELAY_CHUNK_MAX`] bytes, on character boundaries.
pub fn fragment_payload(payload: &str) -> Vec<(RelayPhase, &str)> {
    let mut frames = Vec::new();
    let mut rest = payload;
    let mut first = true;
    while !rest.is_empty() {
        let mut take = RELAY_CHUNK_MAX.min(rest.len());
        while !rest.is_char_boundary(take) {
            take -= 1;
        }
        let (chunk, tail) = rest.split_at(take);
        let last = tail.is_empty();
        let phase = match (first, last) {
            (true, true) => RelayPhase::StartFinish,
            (true, false) => RelayPhase::Start,
            (false, false) => RelayPhase::Continuation,
            (false, true) => RelayPhase::Finish,
        };
        frames.push((phase, chunk));
        first = false;
        rest = tail;
    }
    frames
}

/// Extract the request id from an envelope, as rendered on the wire:
/// strings verbatim, integers in decimal.
pub fn request_id(request: &Value) -> Option<String> {
    match request.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else {
                n.as_u64().map(|u| u.to_string())
            }
        }
        _ => None,
    }
}
