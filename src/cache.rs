//! Hot-window cache: the most recently assembled bundle per session.
//!
//! This is the only mutable state shared by concurrent requests in the same
//! session, so the whole structure sits behind one mutex and entries are
//! copied out as `Arc` snapshots. Cross-session entries are independent.
//! Validity is decided by fingerprint comparison against the chunk store,
//! never by cache age alone; the TTL only bounds entry lifetime to the
//! session's.
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;

/// One cached context piece with enough state to revalidate it.
#[derive(Debug, Clone)]
pub struct CachedPiece {
    pub uid: String,
    pub fingerprint: String,
    pub text: String,
    pub token_count: usize,
}

/// The cached window for one `(session, project)` pair.
#[derive(Debug)]
pub struct CachedWindow {
    pub pieces: Vec<CachedPiece>,
    pub stored_at: DateTime<Utc>,
}

type Key = (String, String);

pub struct HotWindowCache {
    entries: Mutex<LruCache<Key, Arc<CachedWindow>>>,
    ttl: Duration,
}

impl HotWindowCache {
    /// Cache with a fixed entry capacity and a TTL tied to session lifetime.
    #[must_use]
    pub fn new(capacity: usize, ttl_secs: i64) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: Duration::seconds(ttl_secs),
        }
    }

    /// Store the pieces of a freshly assembled bundle.
    pub fn store(&self, session_id: &str, project_id: &str, pieces: Vec<CachedPiece>) {
        let window = Arc::new(CachedWindow {
            pieces,
            stored_at: Utc::now(),
        });
        self.entries
            .lock()
            .unwrap()
            .put((session_id.to_string(), project_id.to_string()), window);
    }

    /// Fetch the cached window, dropping it if the TTL has lapsed.
    pub fn lookup(&self, session_id: &str, project_id: &str) -> Option<Arc<CachedWindow>> {
        let key = (session_id.to_string(), project_id.to_string());
        let mut entries = self.entries.lock().unwrap();
        let window = entries.get(&key)?.clone();
        if Utc::now() - window.stored_at > self.ttl {
            entries.pop(&key);
            return None;
        }
        Some(window)
    }

    /// Drop one entry. Called on fingerprint mismatch (self-heal) and on
    /// session expiry.
    pub fn invalidate(&self, session_id: &str, project_id: &str) {
        self.entries
            .lock()
            .unwrap()
            .pop(&(session_id.to_string(), project_id.to_string()));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
