//! Session guard: decides whether a session is left alone, refreshed, or
//! terminated, based on where "now" falls relative to token expiry.
//!
//! ```text
//!        login                 now >= expiry - window       now >= expiry
//! Unauthenticated ──> Valid ─────────────────────> RefreshWindow ──────────> Expired
//!        ^                ^   refresh succeeded         │                        │
//!        │                └─────────────────────────────┘                        │
//!        └──────────── logout (rejected refresh, or expired) ────────────────────┘
//! ```

use crate::api::{AuthApi, RefreshOutcome};
use crate::nav::{Navigator, Route};
use crate::session::{Session, TokenStore};
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default length of the refresh window before expiry, in seconds
pub const DEFAULT_REFRESH_WINDOW_SECS: u64 = 5 * 60;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Valid,
    RefreshWindow,
    Expired,
}

impl SessionState {
    pub fn classify(session: &Session, now: DateTime<Utc>, window: Duration) -> Self {
        let Some(token) = session.token() else {
            return Self::Unauthenticated;
        };

        let expiry = token.expires_at;
        // An expiry too close to the start of time has its window already open.
        let in_window = expiry
            .checked_sub_signed(window)
            .map_or(true, |reminder| now >= reminder);
        if now >= expiry {
            Self::Expired
        } else if in_window {
            Self::RefreshWindow
        } else {
            Self::Valid
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Valid => "valid",
            Self::RefreshWindow => "refresh window",
            Self::Expired => "expired",
        }
    }
}

/// What a recheck did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardAction {
    None,
    Refreshed,
    /// Refresh hit a transport fault or was held back; state untouched,
    /// retried next check.
    RefreshDeferred,
    LoggedOut,
    /// Another refresh was already in flight.
    Busy,
}

struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SessionGuard {
    store: Arc<TokenStore>,
    api: Arc<dyn AuthApi>,
    navigator: Arc<dyn Navigator>,
    clock: Box<dyn Clock>,
    window: Duration,
    refreshing: AtomicBool,
}

impl SessionGuard {
    pub fn new(
        store: Arc<TokenStore>,
        api: Arc<dyn AuthApi>,
        navigator: Arc<dyn Navigator>,
        clock: Box<dyn Clock>,
        window: std::time::Duration,
    ) -> Self {
        let window = Duration::from_std(window).unwrap_or_else(|_| {
            warn!(
                window_secs = window.as_secs(),
                "refresh window out of range, using default"
            );
            Duration::seconds(DEFAULT_REFRESH_WINDOW_SECS as i64)
        });
        Self {
            store,
            api,
            navigator,
            clock,
            window,
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn state(&self) -> SessionState {
        SessionState::classify(&self.store.snapshot(), self.clock.now(), self.window)
    }

    /// Evaluate the session once and act on the result.
    pub fn recheck(&self) -> GuardAction {
        self.check(true)
    }

    /// Like `recheck`, but a token inside its refresh window is left for a
    /// later check unless `allow_refresh` is set. Expiry is still enforced.
    pub fn check(&self, allow_refresh: bool) -> GuardAction {
        let session = self.store.snapshot();
        let state = SessionState::classify(&session, self.clock.now(), self.window);
        debug!(state = state.as_str(), "session recheck");

        match state {
            SessionState::Unauthenticated | SessionState::Valid => GuardAction::None,
            SessionState::Expired => {
                info!("token expired, logging out");
                self.force_logout();
                GuardAction::LoggedOut
            }
            SessionState::RefreshWindow if !allow_refresh => {
                debug!("refresh held until the next tick");
                GuardAction::RefreshDeferred
            }
            SessionState::RefreshWindow => match session.token() {
                Some(token) => self.refresh(&token.id_token),
                None => GuardAction::None,
            },
        }
    }

    fn refresh(&self, id_token: &str) -> GuardAction {
        let Some(_in_flight) = InFlight::acquire(&self.refreshing) else {
            debug!("refresh already in flight");
            return GuardAction::Busy;
        };

        info!("token inside refresh window, refreshing");
        match self.api.refresh_token(id_token) {
            RefreshOutcome::Renewed(token) => {
                if self.store.renew(id_token, token) {
                    GuardAction::Refreshed
                } else {
                    GuardAction::None
                }
            }
            RefreshOutcome::Rejected { status, message } => {
                warn!(status, %message, "refresh rejected, logging out");
                self.force_logout();
                GuardAction::LoggedOut
            }
            RefreshOutcome::TransportFault(err) => {
                warn!("refresh failed, will retry: {}", err);
                GuardAction::RefreshDeferred
            }
        }
    }

    fn force_logout(&self) {
        self.store.logout(false);
        self.navigator.navigate(Route::Login);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MemoryStorage, Token};
    use crate::testing::{t0, token_expiring_in, ManualClock, RecordingNavigator, ScriptedApi};

    struct Harness {
        store: Arc<TokenStore>,
        api: Arc<ScriptedApi>,
        nav: Arc<RecordingNavigator>,
        clock: ManualClock,
        guard: SessionGuard,
    }

    fn harness(api: ScriptedApi) -> Harness {
        let store = Arc::new(TokenStore::open(Box::new(MemoryStorage::new())));
        let api = Arc::new(api);
        let nav = Arc::new(RecordingNavigator::new());
        let clock = ManualClock::new(t0());
        let guard = SessionGuard::new(
            Arc::clone(&store),
            api.clone(),
            nav.clone(),
            Box::new(clock.clone()),
            std::time::Duration::from_secs(DEFAULT_REFRESH_WINDOW_SECS),
        );
        Harness {
            store,
            api,
            nav,
            clock,
            guard,
        }
    }

    fn window() -> Duration {
        Duration::minutes(5)
    }

    #[test]
    fn test_classify_boundaries() {
        let session = Session::authenticated(token_expiring_in("a", t0(), Duration::minutes(10)));
        let expiry = t0() + Duration::minutes(10);

        let at = |t| SessionState::classify(&session, t, window());
        assert_eq!(at(t0()), SessionState::Valid);
        assert_eq!(at(expiry - window() - Duration::seconds(1)), SessionState::Valid);
        assert_eq!(at(expiry - window()), SessionState::RefreshWindow);
        assert_eq!(at(expiry - Duration::seconds(1)), SessionState::RefreshWindow);
        assert_eq!(at(expiry), SessionState::Expired);
        assert_eq!(at(expiry + Duration::days(1)), SessionState::Expired);
    }

    #[test]
    fn test_classify_extreme_expiry() {
        let at_min: Session = serde_json::from_value(serde_json::json!({
            "is_authenticated": true,
            "token": {
                "id_token": "a",
                "user_id": "1",
                "expires_in": DateTime::<Utc>::MIN_UTC.timestamp()
            }
        }))
        .unwrap();
        assert_eq!(
            SessionState::classify(&at_min, t0(), window()),
            SessionState::Expired
        );
        assert_eq!(
            SessionState::classify(&at_min, DateTime::<Utc>::MIN_UTC, window()),
            SessionState::Expired
        );

        let near_min = Session::authenticated(Token::new(
            "a",
            "1",
            DateTime::<Utc>::MIN_UTC + Duration::minutes(1),
        ));
        assert_eq!(
            SessionState::classify(&near_min, DateTime::<Utc>::MIN_UTC, window()),
            SessionState::RefreshWindow
        );

        let at_max = Session::authenticated(Token::new("a", "1", DateTime::<Utc>::MAX_UTC));
        assert_eq!(
            SessionState::classify(&at_max, t0(), window()),
            SessionState::Valid
        );
    }

    #[test]
    fn test_valid_token_takes_no_action() {
        let h = harness(ScriptedApi::new());
        h.store
            .login(token_expiring_in("a", t0(), Duration::minutes(10)));

        assert_eq!(h.guard.recheck(), GuardAction::None);
        assert_eq!(h.api.refresh_calls(), 0);
        assert!(h.store.is_authenticated());
        assert!(h.nav.visited().is_empty());
    }

    #[test]
    fn test_refresh_window_refreshes_once() {
        let renewed = token_expiring_in("b", t0(), Duration::hours(1));
        let h = harness(ScriptedApi::with_refresh(RefreshOutcome::Renewed(
            renewed.clone(),
        )));
        h.store
            .login(token_expiring_in("a", t0(), Duration::minutes(3)));

        assert_eq!(h.guard.recheck(), GuardAction::Refreshed);
        assert_eq!(h.api.refresh_calls(), 1);
        assert_eq!(*h.api.refreshed_with.lock().unwrap(), vec!["a".to_string()]);

        let session = h.store.snapshot();
        assert!(session.is_authenticated());
        assert_eq!(session.token(), Some(&renewed));

        // The new token is outside its window, so the cycle starts over.
        assert_eq!(h.guard.recheck(), GuardAction::None);
        assert_eq!(h.api.refresh_calls(), 1);
    }

    #[test]
    fn test_check_without_refresh_still_enforces_expiry() {
        let h = harness(ScriptedApi::new());
        h.store
            .login(token_expiring_in("a", t0(), Duration::minutes(3)));

        assert_eq!(h.guard.check(false), GuardAction::RefreshDeferred);
        assert_eq!(h.api.refresh_calls(), 0);
        assert!(h.store.is_authenticated());

        h.clock.advance(Duration::minutes(3));
        assert_eq!(h.guard.check(false), GuardAction::LoggedOut);
        assert_eq!(h.nav.visited(), vec![Route::Login]);
    }

    #[test]
    fn test_rejected_refresh_logs_out_and_redirects() {
        let h = harness(ScriptedApi::with_refresh(RefreshOutcome::Rejected {
            status: 401,
            message: "token revoked".to_string(),
        }));
        h.store
            .login(token_expiring_in("a", t0(), Duration::minutes(3)));

        assert_eq!(h.guard.recheck(), GuardAction::LoggedOut);
        let session = h.store.snapshot();
        assert!(!session.is_authenticated());
        assert!(session.token().is_none());
        assert_eq!(h.nav.visited(), vec![Route::Login]);
    }

    #[test]
    fn test_transport_fault_leaves_session_alone() {
        let h = harness(ScriptedApi::with_refresh(RefreshOutcome::TransportFault(
            "connection refused".to_string(),
        )));
        let original = token_expiring_in("a", t0(), Duration::minutes(3));
        h.store.login(original.clone());

        assert_eq!(h.guard.recheck(), GuardAction::RefreshDeferred);
        assert_eq!(h.store.snapshot().token(), Some(&original));
        assert!(h.nav.visited().is_empty());

        // The next check tries again.
        h.api.push_refresh(RefreshOutcome::Renewed(token_expiring_in(
            "b",
            t0(),
            Duration::hours(1),
        )));
        assert_eq!(h.guard.recheck(), GuardAction::Refreshed);
        assert_eq!(h.api.refresh_calls(), 2);
    }

    #[test]
    fn test_expired_token_logs_out_without_refresh() {
        let h = harness(ScriptedApi::new());
        h.store
            .login(token_expiring_in("a", t0(), Duration::minutes(-1)));

        assert_eq!(h.guard.recheck(), GuardAction::LoggedOut);
        assert_eq!(h.api.refresh_calls(), 0);
        assert!(!h.store.is_authenticated());
        assert_eq!(h.nav.visited(), vec![Route::Login]);
    }

    #[test]
    fn test_unauthenticated_is_never_checked() {
        let h = harness(ScriptedApi::new());
        let stale: Session = serde_json::from_value(serde_json::json!({
            "is_authenticated": false,
            "token": { "id_token": "old", "user_id": "1", "expires_in": t0().timestamp() - 60 }
        }))
        .unwrap();
        assert_eq!(
            SessionState::classify(&stale, t0(), window()),
            SessionState::Unauthenticated
        );

        assert_eq!(h.guard.recheck(), GuardAction::None);
        assert_eq!(h.api.refresh_calls(), 0);
        assert!(h.nav.visited().is_empty());
    }

    #[test]
    fn test_time_passing_moves_through_states() {
        let h = harness(ScriptedApi::new());
        h.store
            .login(token_expiring_in("a", t0(), Duration::minutes(10)));

        assert_eq!(h.guard.state(), SessionState::Valid);
        h.clock.advance(Duration::minutes(6));
        assert_eq!(h.guard.state(), SessionState::RefreshWindow);
        h.clock.advance(Duration::minutes(4));
        assert_eq!(h.guard.state(), SessionState::Expired);
        assert_eq!(h.guard.recheck(), GuardAction::LoggedOut);
        assert_eq!(h.guard.state(), SessionState::Unauthenticated);
    }

    #[test]
    fn test_refresh_dropped_when_session_changed_meanwhile() {
        // The API logs the user out while "the request is in flight".
        struct LogoutDuringRefresh {
            store: Arc<TokenStore>,
        }
        impl AuthApi for LogoutDuringRefresh {
            fn login(
                &self,
                _: &crate::api::Credentials,
            ) -> Result<Token, crate::api::ApiError> {
                unreachable!()
            }
            fn refresh_token(&self, _: &str) -> RefreshOutcome {
                self.store.logout(true);
                RefreshOutcome::Renewed(Token::new("b", "42", t0() + Duration::hours(1)))
            }
            fn forget_password(&self, _: &str) -> Result<(), crate::api::ApiError> {
                Ok(())
            }
        }

        let store = Arc::new(TokenStore::open(Box::new(MemoryStorage::new())));
        store.login(token_expiring_in("a", t0(), Duration::minutes(3)));
        let guard = SessionGuard::new(
            Arc::clone(&store),
            Arc::new(LogoutDuringRefresh {
                store: Arc::clone(&store),
            }),
            Arc::new(RecordingNavigator::new()),
            Box::new(ManualClock::new(t0())),
            std::time::Duration::from_secs(300),
        );

        assert_eq!(guard.recheck(), GuardAction::None);
        assert!(!store.is_authenticated());
    }

    #[test]
    fn test_overlapping_recheck_is_busy() {
        use std::sync::{Mutex, OnceLock, Weak};

        struct Reentrant {
            guard: OnceLock<Weak<SessionGuard>>,
            inner: Mutex<Option<GuardAction>>,
        }
        impl AuthApi for Reentrant {
            fn login(
                &self,
                _: &crate::api::Credentials,
            ) -> Result<Token, crate::api::ApiError> {
                unreachable!()
            }
            fn refresh_token(&self, _: &str) -> RefreshOutcome {
                if let Some(guard) = self.guard.get().and_then(|g| g.upgrade()) {
                    *self.inner.lock().unwrap() = Some(guard.recheck());
                }
                RefreshOutcome::TransportFault("slow".to_string())
            }
            fn forget_password(&self, _: &str) -> Result<(), crate::api::ApiError> {
                Ok(())
            }
        }

        let store = Arc::new(TokenStore::open(Box::new(MemoryStorage::new())));
        store.login(token_expiring_in("a", t0(), Duration::minutes(3)));
        let api = Arc::new(Reentrant {
            guard: OnceLock::new(),
            inner: Mutex::new(None),
        });
        let guard = Arc::new(SessionGuard::new(
            Arc::clone(&store),
            api.clone(),
            Arc::new(RecordingNavigator::new()),
            Box::new(ManualClock::new(t0())),
            std::time::Duration::from_secs(300),
        ));
        api.guard.set(Arc::downgrade(&guard)).unwrap();

        assert_eq!(guard.recheck(), GuardAction::RefreshDeferred);
        assert_eq!(*api.inner.lock().unwrap(), Some(GuardAction::Busy));
        assert!(store.is_authenticated());
    }
}
