//! Scripted transport for CoCon client testing.
//!
//! Every request kind has its own FIFO script. When a script is empty the
//! mock falls back to a healthy server:
//! - connect grants `session-1`, `session-2`, ...
//! - poll waits out the long-poll window and reports an unacknowledged timeout
//! - send answers `{"ok": true}`
//! - disconnect succeeds
//!
//! Sends are recorded with their `tokio::time::Instant`, so retry spacing can
//! be asserted under a paused clock.
//!
//! # Example
//!
//! ```rust,ignore
//! let transport = MockTransport::new();
//! transport.push_send(Err(CoConError::TransientNetwork("reset".into())));
//! transport.push_send(Ok(json!({"ok": true})));
//!
//! // ... run the client ...
//!
//! assert_eq!(transport.sent_names(), vec!["SetState", "SetState"]);
//! ```

use async_trait::async_trait;
use cocon_client::{
    CoConError, CommandParams, Payload, PollOutcome, SessionGrant, Transport,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A command delivered through the mock.
#[derive(Debug, Clone)]
pub struct RecordedSend {
    pub session_id: String,
    pub name: String,
    pub params: CommandParams,
    pub at: Instant,
}

impl RecordedSend {
    /// Value of a query parameter, if present.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

#[derive(Default)]
struct Scripts {
    connects: VecDeque<Result<SessionGrant, CoConError>>,
    polls: VecDeque<Result<PollOutcome, CoConError>>,
    sends: VecDeque<Result<Value, CoConError>>,
}

/// Mock CoCon server for client tests.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<Scripts>,
    sent: Mutex<Vec<RecordedSend>>,
    disconnected: Mutex<Vec<String>>,
    send_delay: Mutex<Option<Duration>>,
    connects: AtomicU32,
    polls: AtomicU32,
    sent_notify: Notify,
}

impl MockTransport {
    /// Create a mock with empty scripts.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script the outcome of the next unscripted connect.
    pub fn push_connect(&self, result: Result<SessionGrant, CoConError>) {
        self.scripts.lock().unwrap().connects.push_back(result);
    }

    /// Script `count` consecutive connect failures with `error`.
    pub fn fail_connects(&self, count: usize, error: CoConError) {
        let mut scripts = self.scripts.lock().unwrap();
        for _ in 0..count {
            scripts.connects.push_back(Err(error.clone()));
        }
    }

    /// Script the outcome of the next poll.
    pub fn push_poll(&self, result: Result<PollOutcome, CoConError>) {
        self.scripts.lock().unwrap().polls.push_back(result);
    }

    /// Script the next poll to deliver `events`.
    pub fn push_poll_events(&self, events: Vec<Payload>) {
        self.push_poll(Ok(PollOutcome::Events(events)));
    }

    /// Script the outcome of the next send.
    pub fn push_send(&self, result: Result<Value, CoConError>) {
        self.scripts.lock().unwrap().sends.push_back(result);
    }

    /// Delay every send by `delay` after it was recorded.
    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = Some(delay);
    }

    /// Every send so far, in delivery order.
    pub fn sent(&self) -> Vec<RecordedSend> {
        self.sent.lock().unwrap().clone()
    }

    /// Command names of every send so far.
    pub fn sent_names(&self) -> Vec<String> {
        self.sent().into_iter().map(|s| s.name).collect()
    }

    /// Sends of the named command.
    pub fn sent_named(&self, name: &str) -> Vec<RecordedSend> {
        self.sent().into_iter().filter(|s| s.name == name).collect()
    }

    /// Number of connect requests issued.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of poll requests issued.
    pub fn poll_count(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    /// Session ids released through disconnect.
    pub fn disconnected(&self) -> Vec<String> {
        self.disconnected.lock().unwrap().clone()
    }

    /// Wait until at least `count` sends were recorded.
    ///
    /// # Panics
    ///
    /// Panics if that does not happen within 60 seconds of (possibly
    /// paused) test time.
    pub async fn wait_for_sends(&self, count: usize) {
        let wait = async {
            loop {
                let notified = self.sent_notify.notified();
                if self.sent.lock().unwrap().len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(60), wait)
            .await
            .unwrap_or_else(|_| panic!("expected {count} sends, got {:?}", self.sent_names()));
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<SessionGrant, CoConError> {
        let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let scripted = self.scripts.lock().unwrap().connects.pop_front();
        scripted.unwrap_or_else(|| {
            Ok(SessionGrant {
                id: format!("session-{n}"),
            })
        })
    }

    async fn poll(&self, _session_id: &str, timeout: Duration) -> Result<PollOutcome, CoConError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.scripts.lock().unwrap().polls.pop_front();
        match scripted {
            Some(result) => result,
            None => {
                tokio::time::sleep(timeout).await;
                Ok(PollOutcome::TimedOut {
                    acknowledged: false,
                })
            }
        }
    }

    async fn send(
        &self,
        session_id: &str,
        name: &str,
        params: &CommandParams,
    ) -> Result<Value, CoConError> {
        self.sent.lock().unwrap().push(RecordedSend {
            session_id: session_id.to_owned(),
            name: name.to_owned(),
            params: params.clone(),
            at: Instant::now(),
        });
        self.sent_notify.notify_waiters();

        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.scripts.lock().unwrap().sends.pop_front();
        scripted.unwrap_or_else(|| Ok(json!({ "ok": true })))
    }

    async fn disconnect(&self, session_id: &str) -> Result<(), CoConError> {
        self.disconnected.lock().unwrap().push(session_id.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unscripted_connects_number_sessions() {
        let transport = MockTransport::new();
        assert_eq!(transport.connect().await.unwrap().id, "session-1");
        assert_eq!(transport.connect().await.unwrap().id, "session-2");
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_scripted_connect_failures_come_first() {
        let transport = MockTransport::new();
        transport.fail_connects(2, CoConError::TransientNetwork("refused".into()));

        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_err());
        assert_eq!(transport.connect().await.unwrap().id, "session-3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unscripted_poll_waits_out_the_window() {
        let transport = MockTransport::new();
        let started = Instant::now();

        let outcome = transport
            .poll("session-1", Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::TimedOut { acknowledged: false });
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_send_records_params() {
        let transport = MockTransport::new();
        let mut params = CommandParams::new();
        params.insert("Model".into(), "Delegate".into());

        transport.send("session-1", "Subscribe", &params).await.unwrap();

        let sent = transport.sent_named("Subscribe");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].param("Model"), Some("Delegate"));
        assert_eq!(sent[0].session_id, "session-1");
    }
}
