use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use quill_core::error::SessionError;
use quill_core::ids::SessionId;

/// Per-session mutual exclusion: at most one active turn per session.
/// The held token doubles as the turn's cancellation signal.
#[derive(Clone, Default)]
pub struct SessionLocks {
    inner: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for a session. Fails with `Busy` if a turn is live.
    pub fn acquire(&self, session_id: &SessionId) -> Result<TurnGuard, SessionError> {
        let mut held = self.inner.lock();
        if held.contains_key(session_id.as_str()) {
            return Err(SessionError::Busy {
                session_id: session_id.as_str().to_string(),
            });
        }
        let token = CancellationToken::new();
        held.insert(session_id.as_str().to_string(), token.clone());
        Ok(TurnGuard {
            locks: self.inner.clone(),
            session_id: session_id.clone(),
            token,
        })
    }

    pub fn assert_unlocked(&self, session_id: &SessionId) -> Result<(), SessionError> {
        if self.is_locked(session_id) {
            Err(SessionError::Busy {
                session_id: session_id.as_str().to_string(),
            })
        } else {
            Ok(())
        }
    }

    pub fn is_locked(&self, session_id: &SessionId) -> bool {
        self.inner.lock().contains_key(session_id.as_str())
    }

    /// Fire the held turn's cancellation signal. Returns whether a turn was
    /// live. The lock itself is released by the turn as it unwinds.
    pub fn cancel(&self, session_id: &SessionId) -> bool {
        let held = self.inner.lock();
        match held.get(session_id.as_str()) {
            Some(token) => {
                debug!(session_id = %session_id, "session turn cancelled");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every live turn; used on shutdown and dispose.
    pub fn cancel_all(&self) -> usize {
        let held = self.inner.lock();
        for token in held.values() {
            token.cancel();
        }
        held.len()
    }
}

/// RAII lock for one turn. Dropping releases the session on every exit path.
pub struct TurnGuard {
    locks: Arc<Mutex<HashMap<String, CancellationToken>>>,
    session_id: SessionId,
    token: CancellationToken,
}

impl TurnGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.locks.lock().remove(self.session_id.as_str());
    }
}
