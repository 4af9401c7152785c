//! Session identity: the per-tab session id and the cached user identity.
//!
//! The session id lives in a [`SessionStore`], the tab-scoped key/value
//! storage that survives navigations but not new tabs. The signed-in user
//! comes from an external [`IdentityProvider`]; the pipeline's control loop
//! watches it and records each change here so every other component can
//! read the current user synchronously.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::SessionStoreError;

pub(crate) const SESSION_ID_KEY: &str = "pagepulse.session_id";

// =============================================================================
// Session storage
// =============================================================================

/// Tab-scoped key/value persistence.
pub trait SessionStore: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<(), SessionStoreError>;
}

/// In-memory [`SessionStore`]. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
    read_only: bool,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that rejects every write, like storage disabled by the host.
    #[must_use]
    pub fn read_only() -> Self {
        Self {
            entries: Arc::default(),
            read_only: true,
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SessionStoreError> {
        if self.read_only {
            return Err(SessionStoreError(format!("write to {key} refused")));
        }
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| SessionStoreError("store lock poisoned".to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// =============================================================================
// Identity
// =============================================================================

/// An authenticated user as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub uid: String,
}

impl UserIdentity {
    #[must_use]
    pub fn new(uid: impl Into<String>) -> Self {
        Self { uid: uid.into() }
    }
}

/// Source of identity changes. `None` means signed out.
pub trait IdentityProvider: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<Option<UserIdentity>>;
}

impl IdentityProvider for watch::Sender<Option<UserIdentity>> {
    fn subscribe(&self) -> watch::Receiver<Option<UserIdentity>> {
        watch::Sender::subscribe(self)
    }
}

/// Effect of recording a new identity value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityTransition {
    /// First identity of this page session
    Resolved,
    /// A different user than before (or a user after a sign-out)
    Changed,
    SignedOut,
    Unchanged,
}

// =============================================================================
// SessionIdentity
// =============================================================================

pub struct SessionIdentity {
    store: Arc<dyn SessionStore>,
    user: RwLock<Option<UserIdentity>>,
    resolved_once: AtomicBool,
}

impl SessionIdentity {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            user: RwLock::new(None),
            resolved_once: AtomicBool::new(false),
        }
    }

    /// Stable id for this tab, generated and persisted on first call.
    ///
    /// `None` when no id exists and the store refuses to persist one: an id
    /// that would change on the next call is worse than none.
    pub fn session_id(&self) -> Option<String> {
        if let Some(existing) = self.store.get(SESSION_ID_KEY) {
            return Some(existing);
        }
        let generated = uuid::Uuid::new_v4().to_string();
        match self.store.set(SESSION_ID_KEY, &generated) {
            Ok(()) => {
                debug!(session_id = %generated, "Session id created");
                Some(generated)
            }
            Err(err) => {
                warn!(error = %err, "Session id could not be persisted");
                None
            }
        }
    }

    /// Identity as last reported by the provider.
    pub fn current_user(&self) -> Option<UserIdentity> {
        self.user.read().ok().and_then(|user| user.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.read().map(|user| user.is_some()).unwrap_or(false)
    }

    /// Record a provider update.
    pub fn set_identity(&self, next: Option<UserIdentity>) -> IdentityTransition {
        let Ok(mut current) = self.user.write() else {
            return IdentityTransition::Unchanged;
        };
        if *current == next {
            return IdentityTransition::Unchanged;
        }
        let transition = match &next {
            None => IdentityTransition::SignedOut,
            Some(_) if !self.resolved_once.swap(true, Ordering::SeqCst) => {
                IdentityTransition::Resolved
            }
            Some(_) => IdentityTransition::Changed,
        };
        *current = next;
        transition
    }
}

impl fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIdentity")
            .field("authenticated", &self.is_authenticated())
            .field("resolved_once", &self.resolved_once.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> SessionIdentity {
        SessionIdentity::new(Arc::new(MemorySessionStore::new()))
    }

    #[test]
    fn session_id_is_stable() {
        let session = identity();
        let first = session.session_id().unwrap();
        assert_eq!(session.session_id().unwrap(), first);
        assert!(uuid::Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn session_id_survives_new_context_on_same_store() {
        let store = MemorySessionStore::new();
        let first = SessionIdentity::new(Arc::new(store.clone()))
            .session_id()
            .unwrap();
        let second = SessionIdentity::new(Arc::new(store)).session_id().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn read_only_store_yields_no_session_id() {
        let session = SessionIdentity::new(Arc::new(MemorySessionStore::read_only()));
        assert!(session.session_id().is_none());
    }

    #[test]
    fn identity_transitions() {
        let session = identity();
        assert!(!session.is_authenticated());
        assert_eq!(session.set_identity(None), IdentityTransition::Unchanged);
        assert_eq!(
            session.set_identity(Some(UserIdentity::new("u1"))),
            IdentityTransition::Resolved
        );
        assert_eq!(
            session.set_identity(Some(UserIdentity::new("u1"))),
            IdentityTransition::Unchanged
        );
        assert_eq!(
            session.set_identity(Some(UserIdentity::new("u2"))),
            IdentityTransition::Changed
        );
        assert_eq!(session.set_identity(None), IdentityTransition::SignedOut);
        assert!(session.current_user().is_none());
        assert_eq!(
            session.set_identity(Some(UserIdentity::new("u1"))),
            IdentityTransition::Changed
        );
        assert_eq!(session.current_user(), Some(UserIdentity::new("u1")));
    }

    #[test]
    fn watch_sender_is_a_provider() {
        let (tx, _rx) = watch::channel(None);
        let mut rx = IdentityProvider::subscribe(&tx);
        tx.send_replace(Some(UserIdentity::new("u9")));
        assert!(rx.has_changed().unwrap());
        assert_eq!(
            rx.borrow_and_update().clone(),
            Some(UserIdentity::new("u9"))
        );
    }
}
