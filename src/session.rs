//! Token store: the authenticated flag plus the current token, persisted
//! across restarts.
//!
//! The store is the only place a `Session` is mutated. `login` and `logout`
//! are the two mutators; every mutation is mirrored to a `SessionStorage`
//! backend and announced to subscribers.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Credential issued by the backend.
///
/// `expires_in` on the wire is an absolute Unix timestamp in seconds, not a
/// lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default)]
    pub user_id: String,
    #[serde(rename = "expires_in", with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
}

impl Token {
    pub fn new(id_token: &str, user_id: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            id_token: id_token.to_string(),
            access_token: None,
            user_id: user_id.to_string(),
            expires_at,
        }
    }

    /// Seconds until expiry, negative once expired
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    is_authenticated: bool,
    #[serde(default)]
    token: Option<Token>,
}

impl Session {
    pub fn authenticated(token: Token) -> Self {
        Self {
            is_authenticated: true,
            token: Some(token),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.is_authenticated
    }

    /// The current token. Always `None` while unauthenticated, even if a
    /// stale token is still attached.
    pub fn token(&self) -> Option<&Token> {
        if self.is_authenticated {
            self.token.as_ref()
        } else {
            None
        }
    }

    /// An authenticated session without a token is not a session.
    fn normalize(self) -> Self {
        if self.is_authenticated && self.token.is_none() {
            warn!("persisted session claims authentication without a token, resetting");
            return Self::default();
        }
        self
    }
}

/// What changed in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn,
    /// `redirect` is advisory: whether the caller asked for navigation to
    /// the login entry point.
    LoggedOut { redirect: bool },
}

/// Key-value persistence for the serialized session
pub trait SessionStorage: Send {
    fn load(&self) -> Result<Option<Session>>;
    fn save(&self, session: &Session) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// JSON file on disk. Writes go through a sibling temp file and a rename so
/// a crash mid-write never leaves a truncated session behind.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "session.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SessionStorage for FileStorage {
    fn load(&self) -> Result<Option<Session>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let session: Session = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt session file {}", self.path.display()))?;
        Ok(Some(session))
    }

    fn save(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.temp_path();
        fs::write(&tmp, serde_json::to_string_pretty(session)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("Failed to remove {}", self.path.display()))?;
        }
        Ok(())
    }
}

/// In-process storage, lost on exit
#[derive(Default)]
pub struct MemoryStorage {
    slot: Mutex<Option<Session>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemoryStorage {
    fn load(&self) -> Result<Option<Session>> {
        Ok(self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, session: &Session) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

type Subscriber = Box<dyn Fn(&SessionEvent) -> bool + Send>;

struct StoreInner {
    session: Session,
    storage: Box<dyn SessionStorage>,
    subscribers: Vec<Subscriber>,
}

impl StoreInner {
    fn notify(&mut self, event: SessionEvent) {
        // Subscribers report whether they are still listening.
        self.subscribers.retain(|subscriber| subscriber(&event));
    }
}

/// Holds the session and mirrors every mutation to storage.
///
/// Mutations never fail: a storage error is logged and the in-memory state
/// still changes.
pub struct TokenStore {
    inner: Mutex<StoreInner>,
}

impl TokenStore {
    /// Restore the last persisted session, or start unauthenticated.
    pub fn open(storage: Box<dyn SessionStorage>) -> Self {
        let session = match storage.load() {
            Ok(Some(session)) => session.normalize(),
            Ok(None) => Session::default(),
            Err(err) => {
                warn!("failed to restore session, starting logged out: {:#}", err);
                Session::default()
            }
        };
        debug!(
            authenticated = session.is_authenticated(),
            "session store opened"
        );

        Self {
            inner: Mutex::new(StoreInner {
                session,
                storage,
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> Session {
        self.lock().session.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.lock().session.is_authenticated()
    }

    /// Replace the token and mark the session authenticated. The payload is
    /// trusted as-is.
    pub fn login(&self, token: Token) {
        let mut inner = self.lock();
        Self::apply_login(&mut inner, token);
    }

    /// Apply a refreshed token, but only if the session still holds the
    /// token that was refreshed. Returns false when the session moved on
    /// (logged out or logged in again) while the refresh was in flight.
    pub fn renew(&self, refreshed_id_token: &str, token: Token) -> bool {
        let mut inner = self.lock();
        let current = inner.session.token().map(|t| t.id_token.as_str());
        if current != Some(refreshed_id_token) {
            debug!("session changed during refresh, dropping renewed token");
            return false;
        }
        Self::apply_login(&mut inner, token);
        true
    }

    fn apply_login(inner: &mut StoreInner, token: Token) {
        if let Some(previous) = inner.session.token() {
            if token.expires_at < previous.expires_at {
                warn!(
                    previous = %previous.expires_at,
                    new = %token.expires_at,
                    "new token expires earlier than the one it replaces"
                );
            }
        }
        info!(user_id = %token.user_id, expires_at = %token.expires_at, "session logged in");

        inner.session = Session::authenticated(token);
        if let Err(err) = inner.storage.save(&inner.session) {
            warn!("failed to persist session: {:#}", err);
        }
        inner.notify(SessionEvent::LoggedIn);
    }

    /// Drop the token and mark the session unauthenticated.
    pub fn logout(&self, redirect: bool) {
        let mut inner = self.lock();
        info!(redirect, "session logged out");

        inner.session = Session::default();
        if let Err(err) = inner.storage.clear() {
            warn!("failed to clear persisted session: {:#}", err);
        }
        inner.notify(SessionEvent::LoggedOut { redirect });
    }

    /// Register a change callback. It runs with the store locked, so it must
    /// not call back into the store; returning false unsubscribes it.
    pub fn subscribe_with<F>(&self, subscriber: F)
    where
        F: Fn(&SessionEvent) -> bool + Send + 'static,
    {
        self.lock().subscribers.push(Box::new(subscriber));
    }

    pub fn subscribe(&self) -> Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribe_with(move |event| tx.send(event.clone()).is_ok());
        rx
    }
}
