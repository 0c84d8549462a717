//! Append-only message ledgers and cursored reader sockets.
//!
//! Every agent owns one [`Ledger`]; the FSM owns one more for the initial
//! request. A [`Socket`] is a named reader over somebody else's ledger with
//! its own cursor, so several consumers can follow the same ledger at their
//! own pace. Ledgers only ever grow; snapshots are immutable once committed.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Immutable record of one committed output.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// Unix timestamp (seconds) of the commit.
    pub timestamp: f64,
    /// The committed output text.
    pub output: String,
    /// The task context the output was produced from, when known.
    pub context: Option<String>,
}

impl Snapshot {
    /// Render the snapshot as a stable JSON string.
    ///
    /// Field order follows the struct declaration, so the rendering is
    /// deterministic and safe to embed in prompts.
    #[must_use]
    pub fn render(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// An append-only log of [`Snapshot`]s with a single writer.
///
/// Shared as `Arc<Ledger>`: the owning agent commits, any number of sockets
/// read. Interior locking keeps reads consistent with concurrent commits.
#[derive(Debug, Default)]
pub struct Ledger {
    snapshots: RwLock<Vec<Snapshot>>,
}

impl Ledger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty, shareable ledger.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Commit a new snapshot.
    pub fn commit(&self, output: impl Into<String>, context: Option<String>) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        self.write().push(Snapshot {
            timestamp,
            output: output.into(),
            context,
        });
    }

    /// Number of snapshots committed so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether nothing has been committed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// The most recent snapshot, if any.
    #[must_use]
    pub fn last(&self) -> Option<Snapshot> {
        self.read().last().cloned()
    }

    /// The most recent snapshot rendered as text, if any.
    #[must_use]
    pub fn last_rendered(&self) -> Option<String> {
        self.read().last().map(Snapshot::render)
    }

    /// All snapshots rendered as text, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<String> {
        self.read().iter().map(Snapshot::render).collect()
    }

    /// Snapshots from `start` onward, rendered as text.
    #[must_use]
    pub fn rendered_since(&self, start: usize) -> Vec<String> {
        let guard = self.read();
        guard
            .get(start..)
            .unwrap_or_default()
            .iter()
            .map(Snapshot::render)
            .collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Snapshot>> {
        self.snapshots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Snapshot>> {
        self.snapshots.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// A named, cursored reader over another ledger.
///
/// Sockets are single-reader: two consumers that want independent positions
/// on the same ledger use two sockets. The cursor only ever moves forward
/// and never past the ledger's length.
#[derive(Debug)]
pub struct Socket {
    name: String,
    description: String,
    ledger: Arc<Ledger>,
    cursor: usize,
}

impl Socket {
    /// Attach a new socket to `ledger`, starting before the first snapshot.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, ledger: Arc<Ledger>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ledger,
            cursor: 0,
        }
    }

    /// The socket's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The human description of what this socket carries.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Current cursor position.
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Whether snapshots exist past the cursor. Pure check, no side effects.
    #[must_use]
    pub fn has_new(&self) -> bool {
        self.ledger.len() > self.cursor
    }

    /// How many snapshots are pending past the cursor.
    #[must_use]
    pub fn unread_count(&self) -> usize {
        self.ledger.len().saturating_sub(self.cursor)
    }

    /// Latest snapshot text without advancing the cursor.
    #[must_use]
    pub fn peek_latest(&self) -> Option<String> {
        self.ledger.last_rendered()
    }

    /// Latest snapshot text, advancing the cursor to the ledger's end.
    pub fn read_latest(&mut self) -> Option<String> {
        self.cursor = self.ledger.len();
        self.ledger.last_rendered()
    }

    /// Snapshots committed since the cursor, advancing it past them.
    pub fn read_new_history(&mut self) -> Vec<String> {
        let items = self.ledger.rendered_since(self.cursor);
        self.cursor = self.ledger.len();
        items
    }

    /// The whole history, advancing the cursor to the ledger's end.
    pub fn read_all(&mut self) -> Vec<String> {
        self.cursor = self.ledger.len();
        self.ledger.history()
    }
}
