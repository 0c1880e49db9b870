//! # Session Registry
//!
//! Bookkeeping for live WebSocket sessions: admission against the concurrency
//! limit, per-session counters, and snapshots for the reporting endpoints.
//!
//! ## Thread Safety:
//! One `Arc<RwLock<HashMap>>` shared by every clone of the registry. Locks are
//! held only for the duration of a map operation, never across `.await`.

use super::{SessionMode, SessionState};
use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

/// What the registry knows about one live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub mode: SessionMode,
    pub speaker: u32,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub segments_rendered: u64,
    pub segments_dropped: u64,
    pub frames_sent: u64,
}

/// Aggregate view used by the health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub active: usize,
    pub capacity: usize,
    pub by_state: BTreeMap<&'static str, usize>,
}

#[derive(Debug, Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
    max_concurrent_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_concurrent_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_concurrent_sessions,
        }
    }

    /// Admit a new session and return its id.
    ///
    /// ## Returns:
    /// - **Ok(session_id)**: Registered in `Connecting` state
    /// - **Err(AppError::Unavailable)**: The concurrency limit is reached
    pub fn try_register(&self, mode: SessionMode, speaker: u32) -> Result<String, AppError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        if sessions.len() >= self.max_concurrent_sessions {
            return Err(AppError::Unavailable(format!(
                "Maximum concurrent sessions ({}) reached",
                self.max_concurrent_sessions
            )));
        }

        let id = Uuid::new_v4().to_string();
        sessions.insert(
            id.clone(),
            SessionRecord {
                id: id.clone(),
                mode,
                speaker,
                state: SessionState::Connecting,
                created_at: Utc::now(),
                segments_rendered: 0,
                segments_dropped: 0,
                frames_sent: 0,
            },
        );
        Ok(id)
    }

    /// Apply `update` to a session's record, if it is still registered.
    pub fn update(&self, id: &str, update: impl FnOnce(&mut SessionRecord)) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = sessions.get_mut(id) {
            update(record);
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(id).cloned()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.max_concurrent_sessions
    }

    /// All live sessions, oldest first.
    pub fn snapshot(&self) -> Vec<SessionRecord> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut records: Vec<SessionRecord> = sessions.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn summary(&self) -> SessionSummary {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut by_state = BTreeMap::new();
        for record in sessions.values() {
            *by_state.entry(record.state.as_str()).or_insert(0) += 1;
        }
        SessionSummary {
            active: sessions.len(),
            capacity: self.max_concurrent_sessions,
            by_state,
        }
    }
}
