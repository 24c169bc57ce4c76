//! Minimal scripted transport for the unit tests of this crate.
//!
//! `cocon-test-utils` depends on this crate, so only integration tests can
//! use its richer `MockTransport`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::config::Config;
use crate::errors::CoConError;
use crate::session::SessionManager;
use crate::transport::{CommandParams, PollOutcome, SessionGrant, Transport};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub(crate) struct SentCommand {
    pub session_id: String,
    pub name: String,
    pub params: CommandParams,
    pub at: Instant,
}

#[derive(Default)]
pub(crate) struct StubTransport {
    sends: Mutex<VecDeque<Result<Value, CoConError>>>,
    polls: Mutex<VecDeque<Result<PollOutcome, CoConError>>>,
    sent: Mutex<Vec<SentCommand>>,
    connects: AtomicU32,
    polls_issued: AtomicU32,
    send_delay: Mutex<Option<Duration>>,
}

impl StubTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_send(&self, result: Result<Value, CoConError>) {
        self.sends.lock().unwrap().push_back(result);
    }

    pub fn push_poll(&self, result: Result<PollOutcome, CoConError>) {
        self.polls.lock().unwrap().push_back(result);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = Some(delay);
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_names(&self) -> Vec<String> {
        self.sent().into_iter().map(|c| c.name).collect()
    }

    pub fn polls_issued(&self) -> u32 {
        self.polls_issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn connect(&self) -> Result<SessionGrant, CoConError> {
        let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionGrant {
            id: format!("session-{n}"),
        })
    }

    async fn poll(&self, _session_id: &str, timeout: Duration) -> Result<PollOutcome, CoConError> {
        self.polls_issued.fetch_add(1, Ordering::SeqCst);
        let scripted = self.polls.lock().unwrap().pop_front();
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
        self.sent.lock().unwrap().push(SentCommand {
            session_id: session_id.to_owned(),
            name: name.to_owned(),
            params: params.clone(),
            at: Instant::now(),
        });
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.sends.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(json!({ "ok": true })))
    }

    async fn disconnect(&self, _session_id: &str) -> Result<(), CoConError> {
        Ok(())
    }
}

/// max_retries 3, backoff 1s doubling to a 10s cap.
pub(crate) fn test_config() -> Config {
    Config::builder()
        .max_retries(3)
        .backoff_base(Duration::from_secs(1))
        .backoff_cap(Duration::from_secs(10))
        .build()
        .unwrap()
}

pub(crate) async fn connected_session(
    transport: Arc<StubTransport>,
    config: &Config,
) -> Arc<SessionManager> {
    let session = Arc::new(SessionManager::new(transport, config));
    session.connect(&CancellationToken::new()).await.unwrap();
    session
}

pub(crate) fn transient() -> CoConError {
    CoConError::TransientNetwork("connection reset".into())
}
