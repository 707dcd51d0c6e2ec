//! Outstanding remote request tracking
//!
//! Every request relayed to a remote server gets an entry here the moment it
//! is sent. Entries leave the table in exactly one of three ways: a matching
//! response arrives, the timeout sweep expires them, or the destination
//! server disappears from the network.

use chrono::{DateTime, Duration, Utc};
use ferrumd_core::sid_prefix;
use parking_lot::RwLock;

/// How long a remote request may stay unanswered
pub const REMOTE_TIMEOUT_SECS: i64 = 15;

/// Sweep tick period; bounds worst-case timeout detection latency
pub const TIMEOUT_SWEEP_SECS: u64 = 1;

/// One sent-but-unanswered remote request
#[derive(Debug, Clone)]
pub struct OutstandingRequest {
    /// Network id of the local requester
    pub source: String,
    /// Server id the request was sent to
    pub destination: String,
    /// Request id, as rendered on the wire
    pub request_id: String,
    /// Send timestamp
    pub sent: DateTime<Utc>,
}

/// Registration failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// A request with this (source, request-id) is already in flight
    AlreadyExists,
}

/// Process-wide table of outstanding remote requests
///
/// Scanned linearly by key equality; at most one live entry per
/// (source, request-id) at any time.
pub struct OutstandingTable {
    entries: RwLock<Vec<OutstandingRequest>>,
}

impl OutstandingTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Track a freshly sent request
    pub fn register(
        &self,
        source: &str,
        destination: &str,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RegisterError> {
        let mut entries = self.entries.write();
        if entries
            .iter()
            .any(|e| e.source == source && e.request_id == request_id)
        {
            return Err(RegisterError::AlreadyExists);
        }
        entries.push(OutstandingRequest {
            source: source.to_string(),
            destination: destination.to_string(),
            request_id: request_id.to_string(),
            sent: now,
        });
        Ok(())
    }

    /// Remove and return the entry matching a received response
    pub fn resolve(&self, source: &str, request_id: &str) -> Option<OutstandingRequest> {
        let mut entries = self.entries.write();
        let pos = entries
            .iter()
            .position(|e| e.source == source && e.request_id == request_id)?;
        Some(entries.remove(pos))
    }

    /// Remove and return every entry older than the timeout deadline
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<OutstandingRequest> {
        let deadline = now - Duration::seconds(REMOTE_TIMEOUT_SECS);
        let mut entries = self.entries.write();
        let mut expired = Vec::new();
        entries.retain(|e| {
            if e.sent < deadline {
                expired.push(e.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Remove and return every entry addressed to a now-gone server
    pub fn cancel_for_peer(&self, sid: &str) -> Vec<OutstandingRequest> {
        let mut entries = self.entries.write();
        let mut cancelled = Vec::new();
        entries.retain(|e| {
            if sid_prefix(&e.destination) == sid {
                cancelled.push(e.clone());
                false
            } else {
                true
            }
        });
        cancelled
    }

    /// Number of tracked requests
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for OutstandingTable {
    fn default() -> Self {
        Self::new()
    }
}
