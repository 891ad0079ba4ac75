//! Session registry — at most one active relay session per target
//!
//! An explicit registry owned by the process and passed by handle, replacing
//! ambient per-address global state. Claiming an address that is already
//! relaying fails; the claim is released when the guard drops, so cleanup
//! survives early returns and panics.

use super::RelayError;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Registry of target addresses with an active relay session
#[derive(Clone, Default)]
pub struct SessionRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim exclusive relay access to a target address.
    ///
    /// Fails with [`RelayError::AlreadyRelaying`] when a session against the
    /// same address is still live.
    pub fn claim(&self, address: &str) -> Result<SessionGuard, RelayError> {
        let mut active = self.active.lock();
        if !active.insert(address.to_string()) {
            return Err(RelayError::AlreadyRelaying(address.to_string()));
        }
        debug!(address, "session claimed");
        Ok(SessionGuard {
            address: address.to_string(),
            active: self.active.clone(),
        })
    }

    /// Whether an address currently has an active session
    pub fn is_active(&self, address: &str) -> bool {
        self.active.lock().contains(address)
    }

    /// Number of active sessions
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

/// Exclusive claim on a target address; released on drop
#[derive(Debug)]
pub struct SessionGuard {
    address: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl SessionGuard {
    /// The claimed target address
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.address);
        debug!(address = %self.address, "session released");
    }
}
