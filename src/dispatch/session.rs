use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

use crate::cost::DispatchStats;

#[derive(Debug)]
pub struct SessionEntry {
    pub stats: DispatchStats,
    pub last_seen: Instant,
}

pub type SessionHandle = Arc<AsyncMutex<SessionEntry>>;

/// Per-session governor state.
///
/// Each session sits behind its own async mutex so requests for one session
/// run one at a time while other sessions proceed in parallel.
pub struct SessionStore {
    idle: Duration,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionStore {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn handle(&self, session_id: &str, create: impl FnOnce() -> DispatchStats) -> SessionHandle {
        let mut sessions = self.sessions.lock();
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(SessionEntry {
                    stats: create(),
                    last_seen: Instant::now(),
                }))
            })
            .clone()
    }

    /// Drop sessions idle for longer than the configured period. Sessions with
    /// a request in flight are kept.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, handle| {
            if Arc::strong_count(handle) > 1 {
                return true;
            }
            match handle.try_lock() {
                Ok(entry) => now.duration_since(entry.last_seen) < self.idle,
                Err(_) => true,
            }
        });
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!(removed = removed, "Swept idle sessions");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
