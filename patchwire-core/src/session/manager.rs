//! Session Manager
//!
//! Owns every session of a server: answers handshakes, tracks detached
//! sessions and their resume windows, and enforces the resource limits.
//!
//! # Limits
//!
//! - Detached sessions are kept in least-recently-detached order. Past
//!   `max_detached`, the oldest is dropped from memory; its saved state stays
//!   in the store until its resume window ends, so a late resume rebuilds it.
//!   Every other way a session ends (resume, expiry, eviction by address,
//!   logout) removes its saved state.
//! - Each source address may hold `max_sessions_per_addr` sessions. Beyond
//!   that a new connection is refused or the address's oldest session is
//!   expired, depending on the policy.
//!
//! Sessions are locked one at a time and never while a registry lock is
//! held.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;

use super::core::{Session, SessionHandle, SessionState};
use super::store::{MemoryStore, SessionStore};
use crate::config::{AddrLimitPolicy, SessionConfig};
use crate::error::SessionError;
use crate::protocol::{Capabilities, HandshakeReply, HandshakeStatus, Hello, PatchFrame};
use crate::render::Component;

/// Builds the root component for a new connection.
pub trait RootFactory: Send + Sync {
    fn create(&self, hello: &Hello) -> Component;
}

impl<F> RootFactory for F
where
    F: Fn(&Hello) -> Component + Send + Sync,
{
    fn create(&self, hello: &Hello) -> Component {
        self(hello)
    }
}

/// Issues resume tokens and screens the ones clients present.
pub trait TokenValidator: Send + Sync {
    fn issue(&self) -> String;

    fn validate(&self, token: &str) -> bool;
}

/// Random v4 UUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidTokens;

impl TokenValidator for UuidTokens {
    fn issue(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn validate(&self, token: &str) -> bool {
        uuid::Uuid::parse_str(token).is_ok()
    }
}

/// Result of a handshake.
pub enum HandshakeOutcome {
    Accepted {
        session: SessionHandle,
        reply: HandshakeReply,
        /// Full tree for the client.
        patches: PatchFrame,
    },
    Refused(HandshakeReply),
}

impl HandshakeOutcome {
    pub fn reply(&self) -> &HandshakeReply {
        match self {
            HandshakeOutcome::Accepted { reply, .. } | HandshakeOutcome::Refused(reply) => reply,
        }
    }
}

impl std::fmt::Debug for HandshakeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeOutcome::Accepted { reply, patches, .. } => f
                .debug_struct("Accepted")
                .field("reply", reply)
                .field("patches", &patches.patches.len())
                .finish_non_exhaustive(),
            HandshakeOutcome::Refused(reply) => f.debug_tuple("Refused").field(reply).finish(),
        }
    }
}

pub struct SessionManager {
    config: SessionConfig,
    factory: Arc<dyn RootFactory>,
    tokens: Arc<dyn TokenValidator>,
    store: Arc<dyn SessionStore>,
    sessions: DashMap<String, SessionHandle>,
    /// Detached sessions, least recently detached first.
    detached: Mutex<IndexMap<String, Instant>>,
    /// Saved states waiting out their resume window.
    saved: Mutex<HashMap<String, Instant>>,
    /// Live sessions per address, oldest first.
    by_addr: DashMap<IpAddr, IndexSet<String>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, factory: impl RootFactory + 'static) -> Self {
        Self {
            config,
            factory: Arc::new(factory),
            tokens: Arc::new(UuidTokens),
            store: Arc::new(MemoryStore::new()),
            sessions: DashMap::new(),
            detached: Mutex::new(IndexMap::new()),
            saved: Mutex::new(HashMap::new()),
            by_addr: DashMap::new(),
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn with_tokens(mut self, tokens: Arc<dyn TokenValidator>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn get(&self, token: &str) -> Option<SessionHandle> {
        self.sessions.get(token).map(|entry| entry.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn detached_count(&self) -> usize {
        self.detached.lock().len()
    }

    pub fn sessions_for(&self, addr: IpAddr) -> usize {
        self.by_addr.get(&addr).map_or(0, |tokens| tokens.len())
    }

    /// Answer a client hello.
    pub fn handshake(&self, hello: &Hello, addr: Option<IpAddr>, now: Instant) -> HandshakeOutcome {
        if hello.version != self.config.protocol_version {
            let err = SessionError::VersionMismatch {
                client: hello.version,
                server: self.config.protocol_version,
            };
            tracing::warn!(error = %err, "handshake refused");
            return HandshakeOutcome::Refused(HandshakeReply::refused(
                HandshakeStatus::VersionMismatch,
                err.to_string(),
            ));
        }

        match &hello.resume_token {
            Some(token) => match self.resume(hello, token, addr, now) {
                Ok((session, patches)) => {
                    let last_seq = session.lock().last_event_seq();
                    HandshakeOutcome::Accepted {
                        session,
                        reply: HandshakeReply::accepted(token.clone(), true, last_seq),
                        patches,
                    }
                }
                Err(err) => {
                    tracing::info!(error = %err, "resume refused");
                    HandshakeOutcome::Refused(HandshakeReply::refused(HandshakeStatus::ResumeFailed, err.to_string()))
                }
            },
            None => match self.create_session(hello, addr) {
                Ok((session, patches)) => {
                    let token = session.lock().token().to_string();
                    HandshakeOutcome::Accepted {
                        session,
                        reply: HandshakeReply::accepted(token, false, 0),
                        patches,
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "session creation refused");
                    HandshakeOutcome::Refused(HandshakeReply::refused(HandshakeStatus::Rejected, err.to_string()))
                }
            },
        }
    }

    /// Create, render and register a new session.
    pub fn create_session(&self, hello: &Hello, addr: Option<IpAddr>) -> Result<(SessionHandle, PatchFrame), SessionError> {
        if let Some(addr) = addr {
            self.make_room_for(addr)?;
        }

        let token = self.tokens.issue();
        let mut session =
            Session::new(token.clone(), self.factory.create(hello), &self.config).with_capabilities(hello.capabilities);
        if let Some(addr) = addr {
            session = session.with_addr(addr);
        }
        let patches = session.start()?;
        let handle = self.register(token.clone(), session, addr);
        tracing::info!(session = %token, addr = ?addr, "session created");
        Ok((handle, patches))
    }

    fn register(&self, token: String, session: Session, addr: Option<IpAddr>) -> SessionHandle {
        let handle: SessionHandle = Arc::new(Mutex::new(session));
        self.sessions.insert(token.clone(), handle.clone());
        if let Some(addr) = addr {
            self.by_addr.entry(addr).or_default().insert(token);
        }
        handle
    }

    fn make_room_for(&self, addr: IpAddr) -> Result<(), SessionError> {
        let max = self.config.max_sessions_per_addr;
        if max == 0 {
            return Ok(());
        }
        loop {
            let oldest = match self.by_addr.get(&addr) {
                Some(tokens) if tokens.len() >= max => tokens.first().cloned(),
                _ => return Ok(()),
            };
            match (self.config.addr_limit_policy, oldest) {
                (AddrLimitPolicy::EvictOldest, Some(oldest)) => {
                    tracing::info!(session = %oldest, %addr, "evicting oldest session for address");
                    self.expire(&oldest);
                }
                _ => {
                    return Err(SessionError::ResourceLimit(format!(
                        "{addr} already holds {max} sessions"
                    )))
                }
            }
        }
    }

    fn resume(
        &self,
        hello: &Hello,
        token: &str,
        addr: Option<IpAddr>,
        now: Instant,
    ) -> Result<(SessionHandle, PatchFrame), SessionError> {
        if !hello.capabilities.contains(Capabilities::RESUME) {
            return Err(SessionError::ResumeFailed("client does not support resume".into()));
        }
        if !self.tokens.validate(token) {
            return Err(SessionError::ResumeFailed("invalid token".into()));
        }

        if let Some(handle) = self.get(token) {
            let result = {
                let mut session = handle.lock();
                if session.state() == SessionState::Active {
                    // The old transport has not noticed it is gone yet.
                    session.detach(now)?;
                }
                session.set_capabilities(hello.capabilities);
                session.resume_at(token, now)
            };
            return match result {
                Ok(patches) => {
                    self.detached.lock().shift_remove(token);
                    self.forget_saved(token);
                    Ok((handle, patches))
                }
                Err(err) => {
                    self.expire(token);
                    Err(err)
                }
            };
        }

        // Evicted from memory: rebuild from the store within the window.
        let saved_at = self.saved.lock().get(token).copied();
        let within_window = saved_at.is_some_and(|at| now.saturating_duration_since(at) < self.config.resume_window());
        if !within_window {
            return Err(SessionError::ResumeFailed("unknown or expired session".into()));
        }
        let saved = self
            .store
            .load(token)?
            .ok_or_else(|| SessionError::ResumeFailed("no saved state".into()))?;

        let mut session =
            Session::restore(self.factory.create(hello), &self.config, saved).with_capabilities(hello.capabilities);
        if let Some(addr) = addr {
            self.make_room_for(addr)?;
            session = session.with_addr(addr);
        }
        let patches = session.start()?;
        self.saved.lock().remove(token);
        self.store.remove(token)?;
        let handle = self.register(token.to_string(), session, addr);
        tracing::info!(session = %token, "session rebuilt from store");
        Ok((handle, patches))
    }

    /// Transport for `token` closed.
    pub fn detach(&self, token: &str, now: Instant) -> Result<(), SessionError> {
        let handle = self
            .get(token)
            .ok_or_else(|| SessionError::ResumeFailed(format!("no session {token}")))?;
        let snapshot = {
            let mut session = handle.lock();
            session.detach(now)?;
            session.snapshot()
        };
        match snapshot {
            Ok(saved) => {
                self.store.save(&saved)?;
                self.saved.lock().insert(token.to_string(), now);
            }
            Err(err) => tracing::error!(session = %token, error = %err, "failed to snapshot session"),
        }

        let evicted: Vec<String> = {
            let mut detached = self.detached.lock();
            detached.shift_remove(token);
            detached.insert(token.to_string(), now);
            let excess = detached.len().saturating_sub(self.config.max_detached);
            (0..excess)
                .filter_map(|_| detached.shift_remove_index(0).map(|(token, _)| token))
                .collect()
        };
        for token in evicted {
            tracing::info!(session = %token, "detached session cap reached, dropping oldest from memory");
            self.evict(&token);
        }
        Ok(())
    }

    /// End a session for good and forget its saved state.
    pub fn logout(&self, token: &str) -> Result<(), SessionError> {
        self.evict(token);
        self.saved.lock().remove(token);
        self.store.remove(token)?;
        Ok(())
    }

    /// Expire sessions and saved states whose window ended. Returns how many
    /// in-memory sessions were expired.
    pub fn sweep(&self, now: Instant) -> usize {
        let window = self.config.resume_window();
        let due: Vec<String> = self
            .detached
            .lock()
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) >= window)
            .map(|(token, _)| token.clone())
            .collect();
        for token in &due {
            self.expire(token);
        }

        let stale: Vec<String> = {
            let mut saved = self.saved.lock();
            let stale: Vec<String> = saved
                .iter()
                .filter(|(_, at)| now.saturating_duration_since(**at) >= window)
                .map(|(token, _)| token.clone())
                .collect();
            for token in &stale {
                saved.remove(token);
            }
            stale
        };
        for token in stale {
            if let Err(err) = self.store.remove(&token) {
                tracing::warn!(session = %token, error = %err, "failed to drop saved session");
            }
        }

        if !due.is_empty() {
            tracing::debug!(expired = due.len(), "sweep");
        }
        due.len()
    }

    /// End a session: dispose it and drop any saved state.
    fn expire(&self, token: &str) {
        self.evict(token);
        self.forget_saved(token);
    }

    fn forget_saved(&self, token: &str) {
        self.saved.lock().remove(token);
        if let Err(err) = self.store.remove(token) {
            tracing::warn!(session = %token, error = %err, "failed to drop saved session");
        }
    }

    /// Drop a session from memory and dispose it. Saved state is kept.
    fn evict(&self, token: &str) {
        self.detached.lock().shift_remove(token);
        let Some((_, handle)) = self.sessions.remove(token) else {
            return;
        };
        let addr = {
            let mut session = handle.lock();
            session.expire();
            session.addr()
        };
        if let Some(addr) = addr {
            let empty = match self.by_addr.get_mut(&addr) {
                Some(mut tokens) => {
                    tokens.shift_remove(token);
                    tokens.is_empty()
                }
                None => false,
            };
            if empty {
                self.by_addr.remove_if(&addr, |_, tokens| tokens.is_empty());
            }
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .field("detached", &self.detached_count())
            .finish_non_exhaustive()
    }
}
