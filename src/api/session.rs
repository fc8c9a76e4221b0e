use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

/// Lifetime of a login session.
pub const SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "session";

/// Upper bound on live sessions; the oldest is evicted beyond this.
const MAX_SESSIONS: usize = 1024;

const SESSION_ID_LEN: usize = 32;

/// In-memory store of login sessions.
///
/// A session id is a random value handed out as a cookie after a successful
/// login. It is never derived from the access token, so leaking a cookie does
/// not leak the token. Sessions live only as long as the process; rotating
/// the token clears them all.
pub struct SessionStore {
    inner: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_ttl(SESSION_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a new session id.
    pub fn create(&self) -> String {
        let mut map = self.inner.lock();

        let now = Instant::now();
        let ttl = self.ttl;
        map.retain(|_, created| now.duration_since(*created) < ttl);

        if map.len() >= MAX_SESSIONS {
            if let Some(oldest) = map
                .iter()
                .min_by_key(|(_, created)| **created)
                .map(|(id, _)| id.clone())
            {
                map.remove(&oldest);
            }
        }

        let id: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(SESSION_ID_LEN)
            .map(char::from)
            .collect();
        map.insert(id.clone(), now);
        id
    }

    /// True if `id` names a live session. Does not consume it.
    pub fn validate(&self, id: &str) -> bool {
        let mut map = self.inner.lock();
        match map.get(id) {
            Some(created) if created.elapsed() < self.ttl => true,
            Some(_) => {
                map.remove(id);
                false
            }
            None => false,
        }
    }

    pub fn revoke(&self, id: &str) -> bool {
        self.inner.lock().remove(id).is_some()
    }

    /// Drop every session.
    pub fn clear(&self) {
        let mut map = self.inner.lock();
        let dropped = map.len();
        map.clear();
        tracing::info!(dropped, "all sessions invalidated");
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
