//! Session context: owns the guard and the worker thread that drives it.
//!
//! The worker rechecks the session whenever the store reports a change and
//! on every tick of a fixed interval, so a token that expires while nothing
//! else happens is still caught.

use crate::guard::{GuardAction, SessionGuard};
use crate::session::{SessionEvent, TokenStore};
use anyhow::{Context as _, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

enum Signal {
    Changed(SessionEvent),
    Stop,
}

pub struct SessionContext {
    guard: Arc<SessionGuard>,
    tx: Sender<Signal>,
    worker: Option<JoinHandle<()>>,
}

impl SessionContext {
    /// Check the session once, then hand it to a supervisor thread that
    /// keeps checking until `shutdown`.
    pub fn start(guard: SessionGuard, tick: Duration) -> Result<Self> {
        let guard = Arc::new(guard);
        let boot = guard.recheck();
        debug!(?boot, "boot session check");

        let (tx, rx) = mpsc::channel();
        let events = tx.clone();
        guard
            .store()
            .subscribe_with(move |event| events.send(Signal::Changed(event.clone())).is_ok());

        let worker_guard = Arc::clone(&guard);
        let worker = thread::Builder::new()
            .name("session-supervisor".to_string())
            .spawn(move || supervise(&worker_guard, &rx, tick))
            .context("Failed to spawn session supervisor")?;

        info!(tick_ms = tick.as_millis() as u64, "session supervisor started");
        Ok(Self {
            guard,
            tx,
            worker: Some(worker),
        })
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        self.guard.store()
    }

    pub fn guard(&self) -> &SessionGuard {
        &self.guard
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.tx.send(Signal::Stop);
            match worker.join() {
                Ok(()) => info!("session supervisor stopped"),
                Err(_) => error!("session supervisor panicked"),
            }
        }
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.stop();
    }
}

fn supervise(guard: &SessionGuard, rx: &Receiver<Signal>, tick: Duration) {
    // A successful refresh renews the token, which notifies us again. At
    // most one refresh per tick, however short-lived the renewed token is.
    let mut hold_until: Option<Instant> = None;
    loop {
        let signal = rx.recv_timeout(tick);
        let allow_refresh = hold_until.map_or(true, |until| Instant::now() >= until);
        let action = match signal {
            Ok(Signal::Changed(SessionEvent::LoggedIn)) => {
                debug!("session logged in");
                guard.check(allow_refresh)
            }
            Ok(Signal::Changed(SessionEvent::LoggedOut { redirect })) => {
                debug!(redirect, "session logged out");
                hold_until = None;
                guard.recheck()
            }
            Err(RecvTimeoutError::Timeout) => guard.recheck(),
            Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
        };
        if action == GuardAction::Refreshed {
            hold_until = Some(Instant::now() + tick);
        }
        if action != GuardAction::None {
            debug!(?action, "supervisor acted");
        }
    }
}
