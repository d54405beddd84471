//! Durable session persistence
//!
//! Non-clean sessions are written to an embedded fjall keyspace, one
//! bincode blob per client identifier. Every mutation of a non-clean
//! session (new subscription, message enqueue, status transition, clean
//! disconnect) is written and synced before the triggering
//! acknowledgement is considered complete, so state survives a process
//! crash between any two packets.

mod error;
mod models;

pub use error::{Result, StoreError};
pub use models::{StoredInbound, StoredOutbound, StoredSession, StoredSubscription};

use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use tracing::warn;

use crate::session::Session;

/// Keyed blob store for non-clean sessions
pub struct SessionStore {
    keyspace: Keyspace,
    sessions: PartitionHandle,
}

impl SessionStore {
    /// Open (or create) the store. Failure here aborts broker startup.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let keyspace = Config::new(path).open()?;
        let sessions = keyspace.open_partition("sessions", PartitionCreateOptions::default())?;
        Ok(Self { keyspace, sessions })
    }

    /// Serialize the session and write it in a single synced transaction
    pub fn save(&self, session: &Session) -> Result<()> {
        let stored = StoredSession::from_session(session);
        let bytes = bincode::encode_to_vec(&stored, bincode::config::standard())?;
        self.sessions.insert(session.client_id.as_ref(), bytes)?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// Load a stored session. A blob that fails to parse is purged and
    /// reported as absent, so the client falls back to a fresh session.
    pub fn load(&self, client_id: &str) -> Result<Option<StoredSession>> {
        let Some(bytes) = self.sessions.get(client_id)? else {
            return Ok(None);
        };

        match bincode::decode_from_slice(&bytes, bincode::config::standard()) {
            Ok((stored, _)) => Ok(Some(stored)),
            Err(e) => {
                warn!(client_id, error = %e, "purging unparsable stored session");
                self.remove(client_id)?;
                Ok(None)
            }
        }
    }

    pub fn contains(&self, client_id: &str) -> Result<bool> {
        Ok(self.sessions.contains_key(client_id)?)
    }

    /// Delete the stored session, if any
    pub fn remove(&self, client_id: &str) -> Result<()> {
        self.sessions.remove(client_id)?;
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}
