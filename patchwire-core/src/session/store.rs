//! Session persistence.
//!
//! On detach a session saves its resume token, the encoded values of its
//! `use_persisted` signals, the last event sequence it applied and the next
//! hid it would hand out. A resume
//! that finds no live session rebuilds one from this record.

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedSession {
    pub token: String,
    /// MessagePack-encoded signal values by persistence key.
    pub signals: BTreeMap<String, Vec<u8>>,
    pub last_event_seq: u64,
    /// First hid a rebuilt session may use. Every hid below it was already
    /// seen by the client.
    #[serde(default)]
    pub next_hid: u64,
}

/// Pluggable persistence backend.
pub trait SessionStore: Send + Sync {
    /// Saved state for `token`, or `None` if there is none.
    fn load(&self, token: &str) -> Result<Option<PersistedSession>, StoreError>;

    fn save(&self, session: &PersistedSession) -> Result<(), StoreError>;

    fn remove(&self, token: &str) -> Result<(), StoreError>;
}

/// In-process store. Records are kept encoded so that it behaves like an
/// external backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl SessionStore for MemoryStore {
    fn load(&self, token: &str) -> Result<Option<PersistedSession>, StoreError> {
        match self.records.get(token) {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(bytes.value())?)),
            None => Ok(None),
        }
    }

    fn save(&self, session: &PersistedSession) -> Result<(), StoreError> {
        let bytes = rmp_serde::to_vec_named(session)?;
        self.records.insert(session.token.clone(), bytes);
        Ok(())
    }

    fn remove(&self, token: &str) -> Result<(), StoreError> {
        self.records.remove(token);
        Ok(())
    }
}
