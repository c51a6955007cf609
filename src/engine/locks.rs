//! Per-message single-writer guard
//!
//! At most one task works on a given outbound message inside this process.
//! Across processes the compare-and-set in the store is the backstop.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::domain::MessageId;
use crate::infra::{As2Error, Result};

#[derive(Debug, Clone, Default)]
pub struct MessageLocks {
    held: Arc<Mutex<HashSet<MessageId>>>,
}

impl MessageLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id`, failing with `MessageBusy` if another task holds it
    pub fn try_lock(&self, id: MessageId) -> Result<MessageGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(id) {
            return Err(As2Error::MessageBusy(id.to_string()));
        }
        Ok(MessageGuard {
            held: Arc::clone(&self.held),
            id,
        })
    }

    pub fn is_locked(&self, id: MessageId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }
}

/// Releases the message on drop
#[derive(Debug)]
pub struct MessageGuard {
    held: Arc<Mutex<HashSet<MessageId>>>,
    id: MessageId,
}

impl Drop for MessageGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}
