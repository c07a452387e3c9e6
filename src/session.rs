//! Explicit session entities.
//!
//! A session is created and expired through the registry and passed by id
//! into every call; there is no global mutable chat state. The registry
//! tracks which chunks recent conversation turns referenced, which feeds the
//! assembler's conversation boost.
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Chunks referenced in this many most-recent turns feed the boost.
const RECENT_TURNS: usize = 8;

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    /// Chunk uids referenced per recent conversation turn, newest last.
    turns: VecDeque<Vec<String>>,
}

impl Session {
    /// Chunk uids referenced in the recent turn window.
    #[must_use]
    pub fn recent_chunk_uids(&self) -> Vec<String> {
        let mut uids = Vec::new();
        for turn in &self.turns {
            for uid in turn {
                if !uids.contains(uid) {
                    uids.push(uid.clone());
                }
            }
        }
        uids
    }
}

/// Owns every live session; entries expire after the configured TTL.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    ttl: Duration,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl: Duration::seconds(ttl_secs),
        }
    }

    /// Create a session for a project and return its id.
    pub fn create(&self, project_id: &str) -> String {
        let now = Utc::now();
        let session = Session {
            session_id: format!("sess-{}", Uuid::new_v4().simple()),
            project_id: project_id.to_string(),
            created_at: now,
            last_active: now,
            turns: VecDeque::new(),
        };
        let id = session.session_id.clone();
        self.sessions.lock().unwrap().insert(id.clone(), session);
        id
    }

    /// Snapshot of a live session; refreshes its activity timestamp.
    pub fn get(&self, session_id: &str) -> Result<Session> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;
        session.last_active = Utc::now();
        Ok(session.clone())
    }

    /// Record the chunks one conversation turn referenced.
    pub fn note_turn(&self, session_id: &str, chunk_uids: &[String]) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;
        session.turns.push_back(chunk_uids.to_vec());
        while session.turns.len() > RECENT_TURNS {
            session.turns.pop_front();
        }
        session.last_active = Utc::now();
        Ok(())
    }

    /// Explicitly end a session.
    pub fn expire(&self, session_id: &str) {
        self.sessions.lock().unwrap().remove(session_id);
    }

    /// Drop sessions whose TTL has lapsed. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now() - self.ttl;
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|_, s| s.last_active >= cutoff);
        before - sessions.len()
    }
}
