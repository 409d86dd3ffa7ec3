use std::time::{Duration, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// The logical identity of one controller run.
///
/// Exactly one `Session` is live on the server at a time. A new one is
/// created at startup and on every reset; requests carrying any other id
/// are stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    id: String,
    created_at: SystemTime,
}

impl Session {
    /// Create a session with a fresh, globally unique token.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: SystemTime::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Time since this session was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed().unwrap_or_default()
    }

    /// True if `token` names this session.
    pub fn matches(&self, token: &str) -> bool {
        self.id == token
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Offset in milliseconds between a controller timestamp and the local clock.
///
/// Positive when the controller clock is ahead.
pub fn clock_offset_ms(controller_ms: u64) -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|now| controller_ms as i64 - now.as_millis() as i64)
        .unwrap_or(0)
}
