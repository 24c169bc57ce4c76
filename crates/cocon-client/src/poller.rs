//! Long-poll notification loop.
//!
//! While a session is connected the poller keeps exactly one `Notification`
//! request outstanding. A poll that times out is the normal "nothing
//! happened" outcome: it renews the session and is re-issued at once without
//! counting as a failure. Transport failures back off exponentially; once
//! `poll_failure_ceiling` of them happen in a row the session is handed to
//! the supervisor for reconnection.

use crate::backoff::{self, BackoffPolicy};
use crate::config::Config;
use crate::dispatcher::NotificationEvent;
use crate::errors::CoConError;
use crate::observability::metrics;
use crate::session::{ReconnectReason, SessionManager};
use crate::transport::{PollOutcome, Transport};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// What the loop should do after one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    /// Events were forwarded to the dispatcher.
    Delivered(usize),
    /// No event was ready.
    Idle,
    /// A transport failure; wait this long before polling again.
    Backoff(Duration),
    /// The session was handed over for reconnection.
    Reconnect,
    /// A malformed response was discarded.
    Dropped,
}

pub struct NotificationPoller {
    session: Arc<SessionManager>,
    transport: Arc<dyn Transport>,
    events: mpsc::Sender<NotificationEvent>,
    policy: BackoffPolicy,
    poll_interval: Duration,
    failure_ceiling: u32,
    failures: AtomicU32,
}

impl fmt::Debug for NotificationPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationPoller")
            .field("poll_interval", &self.poll_interval)
            .field("failure_ceiling", &self.failure_ceiling)
            .field("failures", &self.consecutive_failures())
            .finish_non_exhaustive()
    }
}

impl NotificationPoller {
    #[must_use]
    pub fn new(
        session: Arc<SessionManager>,
        transport: Arc<dyn Transport>,
        events: mpsc::Sender<NotificationEvent>,
        config: &Config,
    ) -> Self {
        Self {
            session,
            transport,
            events,
            policy: BackoffPolicy::from_config(config),
            poll_interval: config.poll_interval,
            failure_ceiling: config.poll_failure_ceiling,
            failures: AtomicU32::new(0),
        }
    }

    /// Consecutive transport failures since the last successful poll.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Issue one long-poll for `session_id` and forward its events.
    pub async fn poll_once(&self, session_id: &str) -> PollStep {
        let outcome = self.transport.poll(session_id, self.poll_interval).await;

        match outcome {
            Ok(PollOutcome::Events(payloads)) => {
                self.failures.store(0, Ordering::SeqCst);
                self.session.renew(session_id);

                let count = payloads.len();
                metrics::record_poll(if count == 0 { "idle" } else { "events" });
                for payload in payloads {
                    if self.events.send(NotificationEvent::new(payload)).await.is_err() {
                        debug!(target: "cocon.poller", "Dispatcher gone, dropping events");
                        break;
                    }
                }
                if count == 0 {
                    PollStep::Idle
                } else {
                    debug!(target: "cocon.poller", count, "Notifications received");
                    PollStep::Delivered(count)
                }
            }
            Ok(PollOutcome::TimedOut { acknowledged }) => {
                metrics::record_poll("idle");
                // The request stayed open for the whole window, which keeps
                // the session alive server-side either way
                self.session.renew(session_id);
                if acknowledged {
                    self.failures.store(0, Ordering::SeqCst);
                }
                PollStep::Idle
            }
            Err(CoConError::SessionInvalid(reason)) => {
                metrics::record_poll("session_invalid");
                self.failures.store(0, Ordering::SeqCst);
                warn!(target: "cocon.poller", reason = %reason, "Server rejected session");
                self.session
                    .request_reconnect(session_id, ReconnectReason::SessionInvalid);
                PollStep::Reconnect
            }
            Err(CoConError::Protocol(reason)) => {
                metrics::record_poll("protocol");
                warn!(target: "cocon.poller", reason = %reason, "Dropping malformed notification");
                PollStep::Dropped
            }
            Err(e) => {
                metrics::record_poll("failure");
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;

                if failures >= self.failure_ceiling {
                    self.failures.store(0, Ordering::SeqCst);
                    warn!(
                        target: "cocon.poller",
                        failures,
                        error = %e,
                        "Poll failure ceiling reached, reconnecting"
                    );
                    self.session
                        .request_reconnect(session_id, ReconnectReason::PollFailures);
                    return PollStep::Reconnect;
                }

                let delay = self.policy.delay_for(failures - 1);
                warn!(
                    target: "cocon.poller",
                    failures,
                    delay_ms = backoff::millis(delay),
                    error = %e,
                    "Poll failed, backing off"
                );
                PollStep::Backoff(delay)
            }
        }
    }

    /// Poll until `cancel` fires or the session is gone for good.
    #[instrument(skip_all, name = "notification_poller")]
    pub async fn run(&self, cancel: CancellationToken) {
        debug!(target: "cocon.poller", "Notification poller started");

        loop {
            let session_id = tokio::select! {
                () = cancel.cancelled() => break,
                connected = self.session.wait_connected() => match connected {
                    Ok(id) => id,
                    Err(e) => {
                        debug!(target: "cocon.poller", reason = %e, "No session, stopping");
                        break;
                    }
                },
            };

            let step = tokio::select! {
                () = cancel.cancelled() => break,
                step = self.poll_once(&session_id) => step,
            };

            if let PollStep::Backoff(delay) = step {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }

        debug!(target: "cocon.poller", "Notification poller stopped");
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::testing::{connected_session, test_config, transient, StubTransport};
    use crate::transport::Payload;
    use serde_json::{json, Value};

    fn payload(label: &str) -> Payload {
        match json!({ "Delegate": { "label": label } }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    async fn poller(
        transport: Arc<StubTransport>,
        config: &Config,
    ) -> (
        NotificationPoller,
        mpsc::Receiver<NotificationEvent>,
        Arc<SessionManager>,
    ) {
        let session = connected_session(transport.clone(), config).await;
        let (tx, rx) = mpsc::channel(16);
        (
            NotificationPoller::new(session.clone(), transport, tx, config),
            rx,
            session,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_never_count_as_failures() {
        let transport = StubTransport::new();
        let (poller, _rx, _session) = poller(transport.clone(), &test_config()).await;

        transport.push_poll(Err(transient()));
        assert_eq!(
            poller.poll_once("session-1").await,
            PollStep::Backoff(Duration::from_secs(1))
        );
        assert_eq!(poller.consecutive_failures(), 1);

        for _ in 0..10 {
            transport.push_poll(Ok(PollOutcome::TimedOut {
                acknowledged: false,
            }));
            assert_eq!(poller.poll_once("session-1").await, PollStep::Idle);
        }
        assert_eq!(poller.consecutive_failures(), 1);

        // An empty script times out after poll_interval
        assert_eq!(poller.poll_once("session-1").await, PollStep::Idle);
        assert_eq!(poller.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_side_timeout_renews_session() {
        let transport = StubTransport::new();
        let (poller, _rx, session) = poller(transport.clone(), &test_config()).await;
        let before = session.snapshot().session.unwrap().expires_at;
        // Wall-clock expiry: let real time move past the millisecond
        std::thread::sleep(Duration::from_millis(5));
        transport.push_poll(Ok(PollOutcome::TimedOut {
            acknowledged: false,
        }));

        assert_eq!(poller.poll_once("session-1").await, PollStep::Idle);
        assert!(session.snapshot().session.unwrap().expires_at > before);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_back_off_and_reset_on_success() {
        let transport = StubTransport::new();
        let (poller, mut rx, _session) = poller(transport.clone(), &test_config()).await;

        for _ in 0..3 {
            transport.push_poll(Err(transient()));
        }
        transport.push_poll(Ok(PollOutcome::Events(vec![payload("A")])));

        let mut delays = Vec::new();
        for _ in 0..3 {
            match poller.poll_once("session-1").await {
                PollStep::Backoff(delay) => delays.push(delay),
                other => panic!("expected backoff, got {other:?}"),
            }
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );

        assert_eq!(poller.poll_once("session-1").await, PollStep::Delivered(1));
        assert_eq!(poller.consecutive_failures(), 0);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_ceiling_requests_reconnect() {
        let transport = StubTransport::new();
        let config = Config::builder().poll_failure_ceiling(2).build().unwrap();
        let (poller, _rx, session) = poller(transport.clone(), &config).await;

        transport.push_poll(Err(transient()));
        transport.push_poll(Err(transient()));

        assert!(matches!(
            poller.poll_once("session-1").await,
            PollStep::Backoff(_)
        ));
        assert_eq!(poller.poll_once("session-1").await, PollStep::Reconnect);
        assert_eq!(poller.consecutive_failures(), 0);
        assert_eq!(session.state(), SessionState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_invalid_requests_reconnect() {
        let transport = StubTransport::new();
        let (poller, _rx, session) = poller(transport.clone(), &test_config()).await;

        transport.push_poll(Err(CoConError::SessionInvalid("HTTP 400".into())));
        assert_eq!(poller.poll_once("session-1").await, PollStep::Reconnect);
        assert_eq!(session.state(), SessionState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_errors_are_dropped() {
        let transport = StubTransport::new();
        let (poller, _rx, session) = poller(transport.clone(), &test_config()).await;

        transport.push_poll(Err(CoConError::Protocol("not json".into())));
        assert_eq!(poller.poll_once("session-1").await, PollStep::Dropped);
        assert_eq!(poller.consecutive_failures(), 0);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_are_forwarded_in_order() {
        let transport = StubTransport::new();
        let (poller, mut rx, _session) = poller(transport.clone(), &test_config()).await;

        transport.push_poll(Ok(PollOutcome::Events(vec![
            payload("A"),
            payload("B"),
            payload("C"),
        ])));
        assert_eq!(poller.poll_once("session-1").await, PollStep::Delivered(3));

        let mut labels = Vec::new();
        while let Ok(event) = rx.try_recv() {
            labels.push(event.payload["Delegate"]["label"].as_str().unwrap().to_owned());
        }
        assert_eq!(labels, vec!["A", "B", "C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_continuously_until_cancelled() {
        let transport = StubTransport::new();
        let (poller, mut rx, _session) = poller(transport.clone(), &test_config()).await;
        transport.push_poll(Err(transient()));
        transport.push_poll(Ok(PollOutcome::Events(vec![payload("A")])));

        let poller = Arc::new(poller);
        let cancel = CancellationToken::new();
        let task = {
            let poller = poller.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { poller.run(cancel).await })
        };

        let event = rx.recv().await.unwrap();
        assert_eq!(event.model(), Some(crate::models::Model::Delegate));

        // Idle polls keep going
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(transport.polls_issued() >= 5);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_when_session_closes() {
        let transport = StubTransport::new();
        let (poller, _rx, session) = poller(transport.clone(), &test_config()).await;
        let poller = Arc::new(poller);
        transport.push_poll(Err(CoConError::SessionInvalid("gone".into())));
        let task = {
            let poller = poller.clone();
            tokio::spawn(async move { poller.run(CancellationToken::new()).await })
        };

        // Nobody reconnects, so the poller parks until the session closes
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(session.state(), SessionState::Reconnecting);
        session.close().await;
        task.await.unwrap();
    }
}
