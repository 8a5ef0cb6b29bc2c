//! Fakes shared by unit tests.

use crate::api::{ApiError, AuthApi, Credentials, RefreshOutcome};
use crate::guard::Clock;
use crate::nav::{Navigator, Route};
use crate::session::Token;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

pub fn token_expiring_in(id: &str, now: DateTime<Utc>, lifetime: Duration) -> Token {
    Token::new(id, "42", now + lifetime)
}

/// Clock whose time only moves when told to
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Auth API that replays scripted refresh outcomes and counts calls.
/// Once the script runs out every refresh is a transport fault.
#[derive(Default)]
pub struct ScriptedApi {
    refreshes: Mutex<VecDeque<RefreshOutcome>>,
    refresh_calls: AtomicUsize,
    login_result: Mutex<Option<Result<Token, ApiError>>>,
    pub refreshed_with: Mutex<Vec<String>>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_refresh(outcome: RefreshOutcome) -> Self {
        let api = Self::default();
        api.push_refresh(outcome);
        api
    }

    pub fn push_refresh(&self, outcome: RefreshOutcome) {
        self.refreshes.lock().unwrap().push_back(outcome);
    }

    pub fn set_login(&self, result: Result<Token, ApiError>) {
        *self.login_result.lock().unwrap() = Some(result);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

impl AuthApi for ScriptedApi {
    fn login(&self, _credentials: &Credentials) -> Result<Token, ApiError> {
        self.login_result
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(ApiError::Transport("no scripted login".to_string())))
    }

    fn refresh_token(&self, id_token: &str) -> RefreshOutcome {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refreshed_with.lock().unwrap().push(id_token.to_string());
        self.refreshes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| RefreshOutcome::TransportFault("script exhausted".to_string()))
    }

    fn forget_password(&self, _email: &str) -> Result<(), ApiError> {
        Ok(())
    }
}

/// Navigator that remembers every navigation
#[derive(Default)]
pub struct RecordingNavigator {
    pub visited: Mutex<Vec<Route>>,
}

impl RecordingNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visited(&self) -> Vec<Route> {
        self.visited.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, route: Route) {
        self.visited.lock().unwrap().push(route);
    }

    fn current(&self) -> Route {
        self.visited
            .lock()
            .unwrap()
            .last()
            .copied()
            .unwrap_or(Route::Login)
    }
}
