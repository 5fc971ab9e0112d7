//! Durable conversation sessions keyed by a stable session key.
//!
//! A session outlives the connection that created it: a client that
//! reconnects with the same key resumes the same history. Only the live
//! connection binding is attached and detached.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use super::sequencer::{ArrivalSequencer, Lane};

/// Identifier for one live transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a process-unique connection id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Who produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRole {
    User,
    Assistant,
    System,
}

/// One message in a session's history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// A conversation session: history, running flags, and the live connection binding.
pub struct Session {
    key: String,
    history: Mutex<Vec<HistoryEntry>>,
    /// Oldest entries are trimmed past this length (0 = unbounded).
    history_limit: usize,
    streaming: AtomicBool,
    connection: Mutex<Option<ConnectionId>>,
    intake: ArrivalSequencer,
    outbound: ArrivalSequencer,
}

impl Session {
    fn new(key: String, history_limit: usize) -> Self {
        Self {
            key,
            history: Mutex::new(Vec::new()),
            history_limit,
            streaming: AtomicBool::new(false),
            connection: Mutex::new(None),
            intake: ArrivalSequencer::new(),
            outbound: ArrivalSequencer::new(),
        }
    }

    /// Stable session key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append an entry to the history, trimming the oldest past the limit.
    pub fn push_history(&self, role: HistoryRole, text: impl Into<String>) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push(HistoryEntry {
            role,
            text: text.into(),
            at: Utc::now(),
        });
        if self.history_limit > 0 && history.len() > self.history_limit {
            let excess = history.len() - self.history_limit;
            history.drain(..excess);
        }
    }

    /// Snapshot of the history.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of history entries.
    pub fn history_len(&self) -> usize {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether a streamed reply is currently being sent.
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Relaxed)
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::Relaxed);
    }

    /// The connection currently bound to this session, if any.
    pub fn connection(&self) -> Option<ConnectionId> {
        *self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Per-session arrival ordering for `lane`.
    pub fn sequencer(&self, lane: Lane) -> &ArrivalSequencer {
        match lane {
            Lane::Intake => &self.intake,
            Lane::Outbound => &self.outbound,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("history_len", &self.history_len())
            .field("streaming", &self.is_streaming())
            .field("connection", &self.connection())
            .finish()
    }
}

/// Registry of conversation sessions, keyed by session key.
///
/// Sessions are never removed while the process is alive.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    history_limit: usize,
}

impl SessionRegistry {
    /// Create an empty registry whose sessions keep at most `history_limit` entries.
    pub fn new(history_limit: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            history_limit,
        }
    }

    /// Look up a session by key, creating it on first contact.
    pub fn get_or_create(&self, key: &str) -> Arc<Session> {
        self.get_or_create_inner(key).0
    }

    fn get_or_create_inner(&self, key: &str) -> (Arc<Session>, bool) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = sessions.get(key) {
            return (Arc::clone(existing), true);
        }
        debug!(session = key, "creating session");
        let session = Arc::new(Session::new(key.to_owned(), self.history_limit));
        sessions.insert(key.to_owned(), Arc::clone(&session));
        (session, false)
    }

    /// Bind `connection` to the session for `key`.
    ///
    /// Returns the session and whether it already existed (a resumed conversation).
    pub fn attach(&self, key: &str, connection: ConnectionId) -> (Arc<Session>, bool) {
        let (session, resumed) = self.get_or_create_inner(key);
        let previous = session
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(connection);
        info!(
            session = key,
            %connection,
            resumed,
            replaced = previous.is_some(),
            "connection attached"
        );
        (session, resumed)
    }

    /// Unbind `connection` from whichever session it is attached to.
    ///
    /// A session that has since been re-attached by a newer connection is left alone.
    pub fn detach(&self, connection: ConnectionId) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        for session in sessions.values() {
            let mut bound = session
                .connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *bound == Some(connection) {
                *bound = None;
                info!(session = session.key(), %connection, "connection detached");
                return Some(Arc::clone(session));
            }
        }
        None
    }

    /// Look up a session without creating it.
    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// List all session keys.
    pub fn session_keys(&self) -> Vec<String> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(0)
    }
}
