//! Bounded, blocking session pool.
//!
//! Bookkeeping lives under one mutex with a condvar for waiters; sessions are
//! opened, pinged and closed outside the lock. A slot being opened, validated
//! or pinged by the keep-alive sweep counts as checked out, so
//! `idle + checked_out` never exceeds `max`.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::{ConnectDescriptor, Credentials, PoolConfig, SessionOptions, validate_limits};
use crate::error::{Error, Result};
use crate::session::{Session, SessionState};

struct IdleSession {
    session: Session,
    since: Instant,
}

struct PoolState {
    idle: VecDeque<IdleSession>,
    checked_out: usize,
    min: usize,
    max: usize,
    increment: usize,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.checked_out
    }

    /// Remove idle sessions older than `max_idle`.
    fn take_expired(&mut self, max_idle: Option<Duration>, out: &mut Vec<Session>) {
        let Some(max_idle) = max_idle else {
            return;
        };
        let mut kept = VecDeque::with_capacity(self.idle.len());
        for idle in self.idle.drain(..) {
            if idle.since.elapsed() > max_idle {
                out.push(idle.session);
            } else {
                kept.push_back(idle);
            }
        }
        self.idle = kept;
    }
}

struct PoolInner {
    descriptor: ConnectDescriptor,
    credentials: Credentials,
    options: SessionOptions,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Sizes at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open sessions, idle and in use.
    pub size: usize,
    pub available: usize,
    pub in_use: usize,
    pub min_size: usize,
    pub max_size: usize,
}

enum Slot {
    Idle(IdleSession),
    Open(usize),
}

impl PoolInner {
    fn open(&self) -> Result<Session> {
        Session::connect(&self.descriptor, &self.credentials, &self.options)
    }

    /// Return reserved slots that were never filled.
    fn unreserve(&self, count: usize) {
        let mut state = self.state.lock();
        state.checked_out -= count;
        drop(state);
        self.available.notify_all();
    }

    /// Add a session for a reserved slot to the idle set.
    fn put_idle(&self, session: Session, since: Instant) {
        let mut state = self.state.lock();
        state.checked_out -= 1;
        if state.closed || state.total() >= state.max {
            drop(state);
            self.available.notify_one();
            close_quietly(&session, "pool full or closed");
            return;
        }
        state.idle.push_back(IdleSession { session, since });
        #[cfg(feature = "metrics")]
        crate::metrics::record_pool_size(state.idle.len(), state.checked_out);
        drop(state);
        self.available.notify_one();
    }

    /// Give up a checked-out session.
    fn discard(&self, session: &Session, reason: &'static str) {
        {
            let mut state = self.state.lock();
            state.checked_out -= 1;
        }
        self.available.notify_one();
        warn!(session = session.id(), state = %session.state(), reason, "discarding pooled session");
        #[cfg(feature = "metrics")]
        crate::metrics::record_pool_discard(reason);
        close_quietly(session, reason);
    }

    fn checkin(&self, session: Session) {
        if session.state() != SessionState::Ready {
            self.discard(&session, "not ready");
            return;
        }
        if session.in_transaction()
            && let Err(err) = session.rollback()
        {
            debug!(error = %err, "rollback on release failed");
            self.discard(&session, "rollback failed");
            return;
        }
        if let Err(err) = session.close_all_cursors() {
            debug!(error = %err, "closing cursors on release failed");
            self.discard(&session, "cursor cleanup failed");
            return;
        }

        let mut state = self.state.lock();
        if state.closed || state.total() > state.max {
            drop(state);
            self.discard(&session, "pool closed or shrunk");
            return;
        }
        state.checked_out -= 1;
        state.idle.push_back(IdleSession {
            session,
            since: Instant::now(),
        });
        drop(state);
        self.available.notify_one();
    }

    /// Open sessions for `count` reserved slots straight into the idle set.
    fn fill(&self, count: usize) -> Result<()> {
        let mut first_error = None;
        for _ in 0..count {
            match self.open() {
                Ok(session) => self.put_idle(session, Instant::now()),
                Err(err) => {
                    self.unreserve(1);
                    warn!(error = %err, "failed to open pooled session");
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn close_quietly(session: &Session, reason: &str) {
    if let Err(err) = session.close() {
        debug!(session = session.id(), reason, error = %err, "close failed");
    }
}

/// A pool of sessions to one service.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("address", &self.inner.descriptor.address())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Create the pool and open `config.min` sessions.
    ///
    /// # Errors
    ///
    /// `Config` for inconsistent limits, or the error of the first session
    /// that fails to open.
    pub fn new(
        descriptor: ConnectDescriptor,
        credentials: Credentials,
        options: SessionOptions,
        config: PoolConfig,
    ) -> Result<Self> {
        config.validate()?;
        let pool = Self {
            inner: Arc::new(PoolInner {
                descriptor,
                credentials,
                options,
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(config.max),
                    checked_out: config.min,
                    min: config.min,
                    max: config.max,
                    increment: config.increment,
                    closed: false,
                }),
                available: Condvar::new(),
                config,
            }),
        };
        if let Err(err) = pool.inner.fill(pool.inner.config.min) {
            pool.close();
            return Err(err);
        }
        info!(
            address = %pool.inner.descriptor.address(),
            min = pool.inner.config.min,
            max = pool.inner.config.max,
            "pool created"
        );
        Ok(pool)
    }

    /// Acquire with the configured wait timeout.
    pub fn get(&self) -> Result<PooledSession> {
        self.acquire(self.inner.config.wait_timeout)
    }

    /// Borrow a session, waiting up to `timeout` when the pool is at its
    /// maximum.
    ///
    /// # Errors
    ///
    /// - `PoolExhausted` when `timeout` is zero and no session is free
    /// - `PoolTimeout` when the wait elapses
    /// - `Closed` after [`Pool::close`]
    /// - the session error when opening a new session fails
    ///
    /// Idle sessions that fail validation are discarded and the next one is
    /// tried; once the idle set is used up a new session is opened.
    pub fn acquire(&self, timeout: Duration) -> Result<PooledSession> {
        let started = Instant::now();
        let deadline = started.checked_add(timeout);
        let mut discarded = 0usize;
        loop {
            let mut expired = Vec::new();
            let slot = self.reserve(timeout, deadline, &mut expired);
            for session in &expired {
                debug!(session = session.id(), "closing expired idle session");
                #[cfg(feature = "metrics")]
                crate::metrics::record_pool_discard("idle timeout");
                close_quietly(session, "idle timeout");
            }

            match slot? {
                Slot::Idle(idle) => {
                    if idle.since.elapsed() >= self.inner.config.ping_interval
                        && let Err(err) = idle.session.ping()
                    {
                        debug!(error = %err, "idle session failed validation");
                        self.inner.discard(&idle.session, "validation failed");
                        discarded += 1;
                        continue;
                    }
                    return Ok(self.lend(idle.session, started));
                }
                Slot::Open(count) => {
                    let session = match self.inner.open() {
                        Ok(session) => session,
                        Err(err) => {
                            self.inner.unreserve(count);
                            return Err(err);
                        }
                    };
                    debug!(
                        session = session.id(),
                        extra = count - 1,
                        discarded,
                        "opened pooled session"
                    );
                    // Extra sessions are best-effort.
                    let _ = self.inner.fill(count - 1);
                    return Ok(self.lend(session, started));
                }
            }
        }
    }

    /// Claim an idle session or a slot to open. `deadline` of `None` waits
    /// without limit.
    fn reserve(
        &self,
        timeout: Duration,
        deadline: Option<Instant>,
        expired: &mut Vec<Session>,
    ) -> Result<Slot> {
        let mut state = self.inner.state.lock();
        loop {
            if state.closed {
                return Err(Error::closed());
            }
            state.take_expired(self.inner.config.max_idle_time, expired);
            if let Some(idle) = state.idle.pop_back() {
                state.checked_out += 1;
                return Ok(Slot::Idle(idle));
            }
            let total = state.total();
            if total < state.max {
                let count = state.increment.clamp(1, state.max - total);
                state.checked_out += count;
                return Ok(Slot::Open(count));
            }
            if timeout.is_zero() {
                return Err(Error::pool_exhausted());
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .inner
                        .available
                        .wait_until(&mut state, deadline)
                        .timed_out()
                        && state.idle.is_empty()
                        && state.total() >= state.max
                    {
                        return Err(Error::pool_timeout(timeout));
                    }
                }
                None => self.inner.available.wait(&mut state),
            }
        }
    }

    fn lend(&self, session: Session, started: Instant) -> PooledSession {
        #[cfg(feature = "metrics")]
        crate::metrics::record_pool_wait(started.elapsed());
        debug!(
            session = session.id(),
            waited_us = started.elapsed().as_micros() as u64,
            "session acquired"
        );
        PooledSession {
            session: Some(session),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Return a session. Equivalent to dropping it.
    pub fn release(&self, session: PooledSession) {
        drop(session);
    }

    /// Change the limits. Surplus idle sessions are closed and sessions are
    /// opened up to the new minimum; checked-out sessions above the new
    /// maximum are discarded on release.
    pub fn resize(&self, min: usize, max: usize) -> Result<()> {
        validate_limits(min, max)?;
        let (surplus, deficit) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::closed());
            }
            state.min = min;
            state.max = max;
            let mut surplus = Vec::new();
            while state.total() > max {
                match state.idle.pop_front() {
                    Some(idle) => surplus.push(idle.session),
                    None => break,
                }
            }
            let deficit = min.saturating_sub(state.total());
            state.checked_out += deficit;
            (surplus, deficit)
        };
        info!(min, max, closing = surplus.len(), opening = deficit, "pool resized");
        for session in &surplus {
            close_quietly(session, "resize");
        }
        self.inner.available.notify_all();
        self.inner.fill(deficit)
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            size: state.total(),
            available: state.idle.len(),
            in_use: state.checked_out,
            min_size: state.min,
            max_size: state.max,
        }
    }

    /// One keep-alive pass: close expired idle sessions, ping the rest and
    /// top up to the minimum. Returns the number of sessions discarded.
    pub fn sweep(&self) -> usize {
        let (sessions, min) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return 0;
            }
            let taken: Vec<IdleSession> = state.idle.drain(..).collect();
            state.checked_out += taken.len();
            (taken, state.min)
        };

        let max_idle = self.inner.config.max_idle_time;
        let mut discarded = 0;
        for idle in sessions {
            let expired = max_idle.is_some_and(|limit| idle.since.elapsed() > limit);
            if expired && self.status().size > min {
                self.inner.discard(&idle.session, "idle timeout");
                discarded += 1;
            } else if let Err(err) = idle.session.ping() {
                debug!(error = %err, "keep-alive ping failed");
                self.inner.discard(&idle.session, "keep-alive failed");
                discarded += 1;
            } else {
                let since = if expired { Instant::now() } else { idle.since };
                self.inner.put_idle(idle.session, since);
            }
        }

        let deficit = {
            let mut state = self.inner.state.lock();
            let deficit = state.min.saturating_sub(state.total());
            state.checked_out += deficit;
            deficit
        };
        if let Err(err) = self.inner.fill(deficit) {
            warn!(error = %err, "keep-alive could not restore the minimum");
        }
        debug!(discarded, status = ?self.status(), "keep-alive sweep");
        discarded
    }

    /// Run [`Pool::sweep`] every `interval` on a background thread until the
    /// returned handle is stopped or dropped, or the pool is gone.
    pub fn spawn_keepalive(&self, interval: Duration) -> Result<KeepAlive> {
        let (stop, stopped) = mpsc::channel::<()>();
        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let thread = std::thread::Builder::new()
            .name("thinwire-keepalive".into())
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    let Some(inner) = pool.upgrade() else {
                        break;
                    };
                    Self { inner }.sweep();
                }
            })?;
        Ok(KeepAlive {
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    /// Close idle sessions and refuse further acquires. Checked-out sessions
    /// are closed as they come back.
    pub fn close(&self) {
        let idle: Vec<IdleSession> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.idle.drain(..).collect()
        };
        self.inner.available.notify_all();
        for entry in &idle {
            close_quietly(&entry.session, "pool closed");
        }
        info!(closed = idle.len(), "pool closed");
    }
}

/// A session on loan from a [`Pool`]; returned when dropped.
pub struct PooledSession {
    session: Option<Session>,
    pool: Arc<PoolInner>,
}

impl PooledSession {
    /// Take the session out of the pool for good.
    #[must_use]
    pub fn detach(mut self) -> Option<Session> {
        let session = self.session.take();
        if session.is_some() {
            self.pool.unreserve(1);
        }
        session
    }
}

impl Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        // Only `detach` and `drop` take the session, and both consume `self`.
        self.session.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledSession").field(&self.session).finish()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.checkin(session);
        }
    }
}

/// Handle to the keep-alive thread.
#[derive(Debug)]
pub struct KeepAlive {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl KeepAlive {
    /// Stop the thread and wait for a running sweep to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("keep-alive thread panicked");
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.shutdown();
    }
}
