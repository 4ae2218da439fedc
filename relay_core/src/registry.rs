//! Session registry
//!
//! Single source of truth for which transfers exist. Only the coordinator
//! creates and removes entries.

use crate::error::RelayError;
use crate::session::Session;
use crate::token::Token;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, PoisonError, RwLock};

/// Concurrency-safe mapping from token to session.
///
/// Implemented as a trait so a sharded map can be swapped in under contention.
pub trait Registry: Send + Sync {
    /// Insert a new session in `Created` state
    fn create(&self, token: Token) -> Result<Arc<Session>, RelayError>;

    fn lookup(&self, token: &Token) -> Option<Arc<Session>>;

    /// Idempotent; removing an absent token is a no-op
    fn remove(&self, token: &Token);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the live sessions
    fn sessions(&self) -> Vec<Arc<Session>>;
}

/// Registry behind one process-local `RwLock`
#[derive(Default)]
pub struct MemoryRegistry {
    sessions: RwLock<HashMap<Token, Arc<Session>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl Registry for MemoryRegistry {
    fn create(&self, token: Token) -> Result<Arc<Session>, RelayError> {
        // Built before taking the lock so readers only ever see whole sessions
        let session = Arc::new(Session::new(token.clone()));

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.entry(token) {
            Entry::Occupied(_) => Err(RelayError::DuplicateToken),
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok(session)
            }
        }
    }

    fn lookup(&self, token: &Token) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(token).cloned()
    }

    fn remove(&self, token: &Token) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(token);
    }

    fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
