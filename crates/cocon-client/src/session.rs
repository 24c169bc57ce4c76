//! Session lifecycle management.
//!
//! The [`SessionManager`] owns the single active server session and the
//! connection state machine:
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!       ▲                        │                 │
//!       └──────retries exhausted─┘    session lost │
//!                                                  ▼
//!       Closed ◀──close── (any)         Reconnecting ──▶ Connecting
//! ```
//!
//! State is published through a `watch` channel so the poller and the
//! command queue can suspend while no session is available. Every newly
//! established session bumps the *epoch*; subscription reconciliation is
//! keyed on it.
//!
//! Reconnects are requested by whoever observes the loss (poller, command
//! queue, keepalive) and carried out by [`SessionManager::supervise`].
//! Requests naming a session id other than the current one are stale and
//! ignored, so one loss never triggers more than one reconnect.

use crate::backoff::{self, BackoffPolicy};
use crate::config::Config;
use crate::errors::CoConError;
use crate::observability::metrics;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl SessionState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a reconnect was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    /// The server rejected the session id.
    SessionInvalid,
    /// The poller hit its consecutive failure ceiling.
    PollFailures,
    /// The local session TTL elapsed without a renewal.
    Expired,
}

impl ReconnectReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconnectReason::SessionInvalid => "session_invalid",
            ReconnectReason::PollFailures => "poll_failures",
            ReconnectReason::Expired => "expired",
        }
    }
}

/// An established server session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Server-assigned session id, attached to every request.
    pub id: String,
    pub established_at: DateTime<Utc>,
    /// Pushed forward by every successful poll or command.
    pub expires_at: DateTime<Utc>,
    /// Epoch this session was established in.
    pub epoch: u64,
}

/// Point-in-time view of the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// Present only while `state` is `Connected`.
    pub session: Option<Session>,
    /// Number of sessions established so far.
    pub epoch: u64,
}

impl SessionSnapshot {
    fn initial() -> Self {
        Self {
            state: SessionState::Disconnected,
            session: None,
            epoch: 0,
        }
    }

    /// The active session id, if connected.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self.state {
            SessionState::Connected => self.session.as_ref().map(|s| s.id.as_str()),
            _ => None,
        }
    }
}

/// Owns the active session and the connection state machine.
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    policy: BackoffPolicy,
    max_retries: u32,
    session_ttl: Duration,
    keepalive_interval: Duration,
    disconnect_timeout: Duration,
    state_tx: watch::Sender<SessionSnapshot>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("snapshot", &*self.state_tx.borrow())
            .field("max_retries", &self.max_retries)
            .field("session_ttl", &self.session_ttl)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: &Config) -> Self {
        let (state_tx, _) = watch::channel(SessionSnapshot::initial());
        Self {
            transport,
            policy: BackoffPolicy::from_config(config),
            max_retries: config.max_retries,
            session_ttl: config.session_ttl,
            keepalive_interval: config.keepalive_interval,
            disconnect_timeout: config.disconnect_timeout,
            state_tx,
        }
    }

    /// Current state and session.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state_tx.borrow().clone()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().state
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_tx.subscribe()
    }

    /// Establish a session, retrying with backoff.
    ///
    /// Makes at most `1 + max_retries` connect attempts. Returns the epoch of
    /// the new session. Calling this while already connected is a no-op that
    /// returns the current epoch.
    ///
    /// # Errors
    ///
    /// - `CoConError::ClientClosed` if the manager was closed.
    /// - `CoConError::FatalConnect` when every attempt failed; the state
    ///   returns to `Disconnected`.
    /// - `CoConError::Cancelled` if `cancel` fired first.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<u64, CoConError> {
        let mut current_epoch = None;
        let mut closed = false;
        self.state_tx.send_if_modified(|snap| match snap.state {
            SessionState::Closed => {
                closed = true;
                false
            }
            SessionState::Connected => {
                current_epoch = Some(snap.epoch);
                false
            }
            _ => {
                snap.state = SessionState::Connecting;
                snap.session = None;
                true
            }
        });
        if closed {
            return Err(CoConError::ClientClosed);
        }
        if let Some(epoch) = current_epoch {
            return Ok(epoch);
        }

        info!(target: "cocon.session", "Connecting to CoCon server");

        match self.establish(cancel).await {
            Ok(epoch) => Ok(epoch),
            Err(e) => {
                self.state_tx.send_if_modified(|snap| {
                    if snap.state == SessionState::Closed {
                        return false;
                    }
                    snap.state = SessionState::Disconnected;
                    snap.session = None;
                    true
                });
                Err(e)
            }
        }
    }

    async fn establish(&self, cancel: &CancellationToken) -> Result<u64, CoConError> {
        let mut attempt: u32 = 0;
        loop {
            let result = tokio::select! {
                () = cancel.cancelled() => return Err(CoConError::Cancelled),
                result = self.transport.connect() => result,
            };

            match result {
                Ok(grant) => return self.install(grant.id),
                Err(e) => {
                    if attempt >= self.max_retries {
                        error!(
                            target: "cocon.session",
                            attempts = attempt + 1,
                            error = %e,
                            "Giving up on connect"
                        );
                        return Err(CoConError::FatalConnect {
                            attempts: attempt + 1,
                            last_error: Box::new(e),
                        });
                    }

                    let delay = self.policy.delay_for(attempt);
                    attempt += 1;
                    warn!(
                        target: "cocon.session",
                        attempt,
                        delay_ms = backoff::millis(delay),
                        error = %e,
                        "Connect failed, retrying"
                    );

                    tokio::select! {
                        () = cancel.cancelled() => return Err(CoConError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn install(&self, id: String) -> Result<u64, CoConError> {
        let now = Utc::now();
        let expires_at = self.expiry_from(now);
        let mut installed = None;

        self.state_tx.send_if_modified(|snap| {
            if snap.state == SessionState::Closed {
                return false;
            }
            snap.epoch += 1;
            snap.state = SessionState::Connected;
            snap.session = Some(Session {
                id: id.clone(),
                established_at: now,
                expires_at,
                epoch: snap.epoch,
            });
            installed = Some(snap.epoch);
            true
        });

        match installed {
            Some(epoch) => {
                info!(target: "cocon.session", epoch, "Session established");
                debug!(target: "cocon.session", session_id = %id, epoch, "Session id assigned");
                Ok(epoch)
            }
            None => Err(CoConError::ClientClosed),
        }
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.session_ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Wait until a session is available and return its id.
    ///
    /// # Errors
    ///
    /// - `CoConError::ClientClosed` once the manager is closed.
    /// - `CoConError::NotConnected` when the state is `Disconnected`.
    pub async fn wait_connected(&self) -> Result<String, CoConError> {
        let mut rx = self.state_tx.subscribe();
        loop {
            {
                let snap = rx.borrow_and_update();
                match snap.state {
                    SessionState::Connected => {
                        if let Some(session) = &snap.session {
                            return Ok(session.id.clone());
                        }
                    }
                    SessionState::Closed => return Err(CoConError::ClientClosed),
                    SessionState::Disconnected => return Err(CoConError::NotConnected),
                    SessionState::Connecting | SessionState::Reconnecting => {}
                }
            }
            rx.changed()
                .await
                .map_err(|_| CoConError::ClientClosed)?;
        }
    }

    /// Report that `session_id` is no longer usable.
    ///
    /// Returns `true` if this call moved the state to `Reconnecting`. Requests
    /// for a session other than the current one are ignored.
    pub fn request_reconnect(&self, session_id: &str, reason: ReconnectReason) -> bool {
        let requested = self.state_tx.send_if_modified(|snap| {
            let current = snap.session_id() == Some(session_id);
            if current {
                snap.state = SessionState::Reconnecting;
                snap.session = None;
            }
            current
        });

        if requested {
            metrics::record_reconnect(reason.as_str());
            warn!(
                target: "cocon.session",
                reason = reason.as_str(),
                "Session lost, reconnecting"
            );
        } else {
            debug!(
                target: "cocon.session",
                session_id = %session_id,
                reason = reason.as_str(),
                "Ignoring stale reconnect request"
            );
        }
        requested
    }

    /// Push the expiry of `session_id` forward by one TTL.
    ///
    /// Renewal does not wake state watchers.
    pub fn renew(&self, session_id: &str) {
        let expires_at = self.expiry_from(Utc::now());
        self.state_tx.send_if_modified(|snap| {
            if let Some(session) = snap.session.as_mut() {
                if session.id == session_id {
                    session.expires_at = expires_at;
                }
            }
            false
        });
    }

    /// Whether the current session has passed its expiry.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.state_tx
            .borrow()
            .session
            .as_ref()
            .is_some_and(|s| s.expires_at <= Utc::now())
    }

    /// Drive keepalive checks and reconnects until `cancel` fires or a
    /// reconnect is exhausted.
    ///
    /// `on_connected` runs with the new epoch after every successful
    /// reconnect.
    pub async fn supervise<F>(&self, cancel: CancellationToken, on_connected: F)
    where
        F: Fn(u64) + Send,
    {
        let mut rx = self.state_tx.subscribe();
        let mut keepalive = tokio::time::interval(self.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(target: "cocon.session", "Supervisor received shutdown signal, exiting");
                    break;
                }
                _ = keepalive.tick() => {
                    let expired_id = {
                        let snap = self.state_tx.borrow();
                        snap.session_id()
                            .filter(|_| self.is_expired_in(&snap))
                            .map(str::to_owned)
                    };
                    if let Some(id) = expired_id {
                        self.request_reconnect(&id, ReconnectReason::Expired);
                    }
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let state = rx.borrow_and_update().state;
            match state {
                SessionState::Reconnecting => match self.reconnect(&cancel).await {
                    Ok(epoch) => on_connected(epoch),
                    Err(CoConError::Cancelled | CoConError::ClientClosed) => break,
                    Err(e) => {
                        error!(
                            target: "cocon.session",
                            error = %e,
                            "Reconnect failed, client is disconnected"
                        );
                        break;
                    }
                },
                SessionState::Closed | SessionState::Disconnected => break,
                SessionState::Connecting | SessionState::Connected => {}
            }
        }
    }

    fn is_expired_in(&self, snap: &SessionSnapshot) -> bool {
        snap.session
            .as_ref()
            .is_some_and(|s| s.expires_at <= Utc::now())
    }

    async fn reconnect(&self, cancel: &CancellationToken) -> Result<u64, CoConError> {
        let started = self.state_tx.send_if_modified(|snap| {
            if snap.state == SessionState::Reconnecting {
                snap.state = SessionState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(CoConError::NotConnected);
        }

        match self.establish(cancel).await {
            Ok(epoch) => Ok(epoch),
            Err(e) => {
                self.state_tx.send_if_modified(|snap| {
                    if snap.state == SessionState::Closed {
                        return false;
                    }
                    snap.state = SessionState::Disconnected;
                    snap.session = None;
                    true
                });
                Err(e)
            }
        }
    }

    /// Close the manager and release the server session.
    ///
    /// The disconnect request is best effort and bounded by the configured
    /// disconnect timeout; failures are logged and swallowed. Idempotent.
    pub async fn close(&self) {
        let mut released = None;
        let mut already_closed = false;
        self.state_tx.send_if_modified(|snap| {
            if snap.state == SessionState::Closed {
                already_closed = true;
                return false;
            }
            released = snap.session.take();
            snap.state = SessionState::Closed;
            true
        });
        if already_closed {
            return;
        }

        let Some(session) = released else {
            info!(target: "cocon.session", "Session manager closed");
            return;
        };

        match tokio::time::timeout(
            self.disconnect_timeout,
            self.transport.disconnect(&session.id),
        )
        .await
        {
            Ok(Ok(())) => {
                info!(target: "cocon.session", epoch = session.epoch, "Session released");
            }
            Ok(Err(e)) => {
                warn!(
                    target: "cocon.session",
                    error = %e,
                    "Disconnect failed, dropping session"
                );
            }
            Err(_) => {
                warn!(
                    target: "cocon.session",
                    timeout_ms = backoff::millis(self.disconnect_timeout),
                    "Disconnect timed out, dropping session"
                );
            }
        }
    }
}
