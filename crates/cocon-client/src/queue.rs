//! Outbound command queue.
//!
//! Commands are delivered strictly one at a time in FIFO order. The head
//! command is retried with exponential backoff until it succeeds or runs out
//! of attempts; nothing is dispatched ahead of it meanwhile, so commands
//! reach the server in the order they were sent.
//!
//! Every enqueue returns a [`CommandHandle`], a future that resolves with the
//! command's terminal outcome. Handles for commands that could not be queued
//! resolve immediately.

use crate::backoff::{self, BackoffPolicy};
use crate::config::Config;
use crate::errors::CoConError;
use crate::observability::metrics;
use crate::session::{ReconnectReason, SessionManager};
use crate::transport::{CommandParams, Transport};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Lifecycle of a queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

/// A command as tracked by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: Uuid,
    pub name: String,
    pub params: CommandParams,
    /// Retries performed so far (0 on the first send).
    pub attempt: u32,
    pub status: CommandStatus,
    /// When the next retry fires, while waiting out a backoff delay.
    pub next_attempt_at: Option<Instant>,
    pub created_at: DateTime<Utc>,
}

/// Name and parameters of a command to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub name: String,
    pub params: CommandParams,
}

impl CommandRequest {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: CommandParams::new(),
        }
    }

    /// Add a query parameter.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Observer run with the terminal outcome, before the caller's handle resolves.
pub type CompletionHook = Box<dyn FnOnce(&Result<Value, CoConError>) + Send + 'static>;

/// Future resolving with a command's terminal outcome.
///
/// Dropping the handle does not cancel the command.
#[derive(Debug)]
#[must_use = "a CommandHandle does nothing unless awaited"]
pub struct CommandHandle {
    id: Uuid,
    rx: oneshot::Receiver<Result<Value, CoConError>>,
}

impl CommandHandle {
    /// A handle that is already resolved with `result`.
    pub fn resolved(id: Uuid, result: Result<Value, CoConError>) -> Self {
        let (tx, rx) = oneshot::channel();
        // The receiver is alive, so this cannot fail
        let _ = tx.send(result);
        Self { id, rx }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Future for CommandHandle {
    type Output = Result<Value, CoConError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(CoConError::Cancelled)))
    }
}

struct QueuedCommand {
    command: Command,
    responder: oneshot::Sender<Result<Value, CoConError>>,
    on_complete: Option<CompletionHook>,
    enqueued_at: Instant,
}

impl QueuedCommand {
    fn new(
        request: CommandRequest,
        on_complete: Option<CompletionHook>,
    ) -> (Self, CommandHandle) {
        let id = Uuid::new_v4();
        let (responder, rx) = oneshot::channel();
        let queued = Self {
            command: Command {
                id,
                name: request.name,
                params: request.params,
                attempt: 0,
                status: CommandStatus::Pending,
                next_attempt_at: None,
                created_at: Utc::now(),
            },
            responder,
            on_complete,
            enqueued_at: Instant::now(),
        };
        (queued, CommandHandle { id, rx })
    }
}

struct QueueInner {
    pending: VecDeque<QueuedCommand>,
    /// Copy of the command currently owned by the delivery loop.
    head: Option<Command>,
    /// Set while no delivery loop can accept work; new commands resolve
    /// with this error.
    closed: Option<CoConError>,
}

/// FIFO command queue with per-command retry.
pub struct CommandQueue {
    session: Arc<SessionManager>,
    transport: Arc<dyn Transport>,
    policy: BackoffPolicy,
    max_retries: u32,
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl CommandQueue {
    /// Create a queue. It rejects commands with `NotConnected` until
    /// [`CommandQueue::reopen`] is called.
    #[must_use]
    pub fn new(session: Arc<SessionManager>, transport: Arc<dyn Transport>, config: &Config) -> Self {
        Self {
            session,
            transport,
            policy: BackoffPolicy::from_config(config),
            max_retries: config.max_retries,
            capacity: config.queue_capacity,
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                head: None,
                closed: Some(CoConError::NotConnected),
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a command to the tail.
    pub fn enqueue(&self, request: CommandRequest) -> CommandHandle {
        self.push(request, None)
    }

    /// Append a command whose outcome is also reported to `hook`.
    pub fn enqueue_with_hook(&self, request: CommandRequest, hook: CompletionHook) -> CommandHandle {
        self.push(request, Some(hook))
    }

    fn push(&self, request: CommandRequest, hook: Option<CompletionHook>) -> CommandHandle {
        let (queued, handle) = QueuedCommand::new(request, hook);
        let mut inner = self.lock();

        let rejection = if let Some(err) = &inner.closed {
            Some(err.clone())
        } else if inner.pending.len() >= self.capacity {
            Some(CoConError::QueueFull {
                capacity: self.capacity,
            })
        } else {
            None
        };

        if let Some(err) = rejection {
            drop(inner);
            debug!(
                target: "cocon.queue",
                command = %queued.command.name,
                error = %err,
                "Command rejected"
            );
            Self::finish(queued, Err(err));
            return handle;
        }

        debug!(
            target: "cocon.queue",
            command_id = %queued.command.id,
            command = %queued.command.name,
            "Command queued"
        );
        inner.pending.push_back(queued);
        metrics::set_queue_depth(inner.pending.len());
        drop(inner);
        self.notify.notify_one();
        handle
    }

    /// Queue commands ahead of everything pending, behind the command
    /// currently being delivered. Order within `batch` is preserved.
    ///
    /// Used for subscription reconciliation, so capacity is not enforced.
    pub fn enqueue_front(
        &self,
        batch: Vec<(CommandRequest, Option<CompletionHook>)>,
    ) -> Vec<CommandHandle> {
        let mut handles = Vec::with_capacity(batch.len());
        let mut queued = Vec::with_capacity(batch.len());
        for (request, hook) in batch {
            let (item, handle) = QueuedCommand::new(request, hook);
            queued.push(item);
            handles.push(handle);
        }

        let mut inner = self.lock();
        if let Some(err) = inner.closed.clone() {
            drop(inner);
            for item in queued {
                Self::finish(item, Err(err.clone()));
            }
            return handles;
        }
        for item in queued.into_iter().rev() {
            inner.pending.push_front(item);
        }
        metrics::set_queue_depth(inner.pending.len());
        drop(inner);
        self.notify.notify_one();
        handles
    }

    /// Number of commands waiting behind the head.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the head command (if any) followed by pending commands.
    #[must_use]
    pub fn commands(&self) -> Vec<Command> {
        let inner = self.lock();
        inner
            .head
            .iter()
            .cloned()
            .chain(inner.pending.iter().map(|q| q.command.clone()))
            .collect()
    }

    /// Accept commands again after a previous run ended.
    pub fn reopen(&self) {
        self.lock().closed = None;
    }

    /// Stop accepting commands and resolve every pending one with `error`.
    ///
    /// Commands sent afterwards resolve with `ClientClosed` when `error` is
    /// `Cancelled`, otherwise with `error` itself.
    pub fn shutdown(&self, error: CoConError) {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            inner.closed = Some(match error {
                CoConError::Cancelled => CoConError::ClientClosed,
                ref other => other.clone(),
            });
            metrics::set_queue_depth(0);
            inner.pending.drain(..).collect()
        };

        if !drained.is_empty() {
            info!(
                target: "cocon.queue",
                count = drained.len(),
                error = %error,
                "Releasing pending commands"
            );
        }
        for item in drained {
            Self::finish(item, Err(error.clone()));
        }
    }

    /// Deliver commands until `cancel` fires or the session is gone for good.
    ///
    /// On exit every remaining command resolves: with `Cancelled` after
    /// cancellation, otherwise with the session error (`NotConnected` or
    /// `ClientClosed`).
    #[instrument(skip_all, name = "command_queue")]
    pub async fn run(&self, cancel: CancellationToken) {
        debug!(target: "cocon.queue", "Command queue started");

        let exit_error = loop {
            let Some(mut item) = self.next(&cancel).await else {
                break CoConError::Cancelled;
            };

            let result = self.deliver(&mut item, &cancel).await;
            self.lock().head = None;

            let stop = match &result {
                Err(CoConError::Cancelled) if cancel.is_cancelled() => Some(CoConError::Cancelled),
                Err(e @ (CoConError::NotConnected | CoConError::ClientClosed)) => Some(e.clone()),
                _ => None,
            };
            Self::finish(item, result);

            if let Some(err) = stop {
                break err;
            }
        };

        self.shutdown(exit_error.clone());
        debug!(target: "cocon.queue", reason = %exit_error, "Command queue stopped");
    }

    async fn next(&self, cancel: &CancellationToken) -> Option<QueuedCommand> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(item) = inner.pending.pop_front() {
                    inner.head = Some(item.command.clone());
                    metrics::set_queue_depth(inner.pending.len());
                    return Some(item);
                }
            }
            tokio::select! {
                () = cancel.cancelled() => return None,
                () = self.notify.notified() => {}
            }
        }
    }

    fn update_head(&self, command: &Command) {
        self.lock().head = Some(command.clone());
    }

    async fn deliver(
        &self,
        item: &mut QueuedCommand,
        cancel: &CancellationToken,
    ) -> Result<Value, CoConError> {
        loop {
            let session_id = tokio::select! {
                () = cancel.cancelled() => return Err(CoConError::Cancelled),
                connected = self.session.wait_connected() => connected?,
            };

            let command = &mut item.command;
            command.status = CommandStatus::InFlight;
            command.next_attempt_at = None;
            self.update_head(command);

            let sent = tokio::select! {
                () = cancel.cancelled() => return Err(CoConError::Cancelled),
                sent = self.transport.send(&session_id, &command.name, &command.params) => sent,
            };

            let err = match sent {
                Ok(value) => {
                    self.session.renew(&session_id);
                    command.status = CommandStatus::Succeeded;
                    debug!(
                        target: "cocon.queue",
                        command_id = %command.id,
                        command = %command.name,
                        attempt = command.attempt,
                        "Command delivered"
                    );
                    return Ok(value);
                }
                Err(e) if e.is_retryable() || e.is_session_invalid() => e,
                Err(e) => {
                    command.status = CommandStatus::Failed;
                    warn!(
                        target: "cocon.queue",
                        command_id = %command.id,
                        command = %command.name,
                        error = %e,
                        "Command failed"
                    );
                    return Err(e);
                }
            };

            if err.is_session_invalid() {
                // The resend, if any, waits in wait_connected until the session is back
                self.session
                    .request_reconnect(&session_id, ReconnectReason::SessionInvalid);
            }

            if command.attempt >= self.max_retries {
                command.status = CommandStatus::Failed;
                warn!(
                    target: "cocon.queue",
                    command_id = %command.id,
                    command = %command.name,
                    attempts = command.attempt + 1,
                    error = %err,
                    "Command retries exhausted"
                );
                return Err(CoConError::RetryExhausted {
                    command: command.name.clone(),
                    attempts: command.attempt + 1,
                    last_error: Box::new(err),
                });
            }

            metrics::record_command_retry();
            command.status = CommandStatus::Pending;

            if err.is_session_invalid() {
                command.attempt += 1;
                self.update_head(command);
                continue;
            }

            let delay = self.policy.delay_for(command.attempt);
            command.attempt += 1;
            command.next_attempt_at = Some(Instant::now() + delay);
            self.update_head(command);
            debug!(
                target: "cocon.queue",
                command_id = %command.id,
                command = %command.name,
                attempt = command.attempt,
                delay_ms = backoff::millis(delay),
                error = %err,
                "Command failed, retrying"
            );

            tokio::select! {
                () = cancel.cancelled() => return Err(CoConError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn finish(item: QueuedCommand, result: Result<Value, CoConError>) {
        let status = match &result {
            Ok(_) => "succeeded",
            Err(CoConError::Cancelled) => "cancelled",
            Err(_) => "failed",
        };
        metrics::record_command(status);
        metrics::record_command_latency(item.enqueued_at.elapsed());

        if let Some(hook) = item.on_complete {
            hook(&result);
        }
        // The caller may have dropped its handle
        let _ = item.responder.send(result);
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
    use serde_json::json;
    use std::time::Duration;

    async fn running_queue(
        transport: Arc<StubTransport>,
        config: &Config,
    ) -> (Arc<CommandQueue>, CancellationToken, tokio::task::JoinHandle<()>) {
        let session = connected_session(transport.clone(), config).await;
        let queue = Arc::new(CommandQueue::new(session, transport, config));
        queue.reopen();
        let cancel = CancellationToken::new();
        let task = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.run(cancel).await })
        };
        (queue, cancel, task)
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_are_delivered_in_order() {
        let transport = StubTransport::new();
        transport.push_send(Ok(json!({ "first": true })));
        let (queue, cancel, task) = running_queue(transport.clone(), &test_config()).await;

        let a = queue.enqueue(CommandRequest::new("Meeting_Agenda/StartMeeting"));
        let b = queue.enqueue(CommandRequest::new("Timer/Start").param("Duration", "60"));
        let c = queue.enqueue(CommandRequest::new("Voting/Stop"));

        assert_eq!(a.await.unwrap(), json!({ "first": true }));
        b.await.unwrap();
        c.await.unwrap();

        assert_eq!(
            transport.sent_names(),
            vec!["Meeting_Agenda/StartMeeting", "Timer/Start", "Voting/Stop"]
        );
        let sent = transport.sent();
        assert_eq!(sent[1].params.get("Duration").map(String::as_str), Some("60"));
        assert!(sent.iter().all(|c| c.session_id == "session-1"));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_after_backoff_sequence() {
        let transport = StubTransport::new();
        for _ in 0..4 {
            transport.push_send(Err(transient()));
        }
        let (queue, cancel, task) = running_queue(transport.clone(), &test_config()).await;

        let handle = queue.enqueue(CommandRequest::new("Timer/Start"));
        match handle.await {
            Err(CoConError::RetryExhausted {
                command, attempts, ..
            }) => {
                assert_eq!(command, "Timer/Start");
                assert_eq!(attempts, 4);
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }

        let sent = transport.sent();
        assert_eq!(sent.len(), 4);
        let gaps: Vec<_> = sent.windows(2).map(|w| w[1].at - w[0].at).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_head_blocks_later_commands_while_retrying() {
        let transport = StubTransport::new();
        transport.push_send(Err(transient()));
        let (queue, cancel, task) = running_queue(transport.clone(), &test_config()).await;

        let first = queue.enqueue(CommandRequest::new("First"));
        let second = queue.enqueue(CommandRequest::new("Second"));
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(transport.sent_names(), vec!["First", "First", "Second"]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_command_is_not_retried() {
        let transport = StubTransport::new();
        transport.push_send(Err(CoConError::CommandRejected {
            endpoint: "Timer/Start".into(),
            status: 404,
            body: None,
        }));
        let (queue, cancel, task) = running_queue(transport.clone(), &test_config()).await;

        let rejected = queue.enqueue(CommandRequest::new("Timer/Start"));
        let next = queue.enqueue(CommandRequest::new("Timer/Stop"));

        assert!(matches!(
            rejected.await,
            Err(CoConError::CommandRejected { status: 404, .. })
        ));
        next.await.unwrap();
        assert_eq!(transport.sent_names(), vec!["Timer/Start", "Timer/Stop"]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full_resolves_immediately() {
        let transport = StubTransport::new();
        let config = Config::builder().queue_capacity(2).build().unwrap();
        let session = connected_session(transport.clone(), &config).await;
        let queue = CommandQueue::new(session, transport, &config);
        queue.reopen();

        let _a = queue.enqueue(CommandRequest::new("A"));
        let _b = queue.enqueue(CommandRequest::new("B"));
        let c = queue.enqueue(CommandRequest::new("C"));

        assert!(matches!(
            c.await,
            Err(CoConError::QueueFull { capacity: 2 })
        ));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_before_reopen_is_not_connected() {
        let transport = StubTransport::new();
        let config = test_config();
        let session = connected_session(transport.clone(), &config).await;
        let queue = CommandQueue::new(session, transport, &config);

        let handle = queue.enqueue(CommandRequest::new("A"));
        assert!(matches!(handle.await, Err(CoConError::NotConnected)));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_front_batch_runs_before_pending_commands() {
        let transport = StubTransport::new();
        let config = test_config();
        let session = connected_session(transport.clone(), &config).await;
        let queue = Arc::new(CommandQueue::new(session, transport.clone(), &config));
        queue.reopen();

        let user = queue.enqueue(CommandRequest::new("User"));
        let front = queue.enqueue_front(vec![
            (CommandRequest::new("Subscribe/A"), None),
            (CommandRequest::new("Subscribe/B"), None),
        ]);
        let names: Vec<_> = queue.commands().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["Subscribe/A", "Subscribe/B", "User"]);

        let cancel = CancellationToken::new();
        let task = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.run(cancel).await })
        };
        for handle in front {
            handle.await.unwrap();
        }
        user.await.unwrap();
        assert_eq!(
            transport.sent_names(),
            vec!["Subscribe/A", "Subscribe/B", "User"]
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_resolves_in_flight_and_pending() {
        let transport = StubTransport::new();
        transport.set_send_delay(Duration::from_secs(3600));
        let (queue, cancel, task) = running_queue(transport.clone(), &test_config()).await;

        let in_flight = queue.enqueue(CommandRequest::new("Slow"));
        let pending = queue.enqueue(CommandRequest::new("Waiting"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let head = queue.commands();
        assert_eq!(head[0].status, CommandStatus::InFlight);
        assert_eq!(head[1].status, CommandStatus::Pending);

        cancel.cancel();
        task.await.unwrap();

        assert!(matches!(in_flight.await, Err(CoConError::Cancelled)));
        assert!(matches!(pending.await, Err(CoConError::Cancelled)));

        // The queue refuses new work once stopped
        let late = queue.enqueue(CommandRequest::new("Late"));
        assert!(matches!(late.await, Err(CoConError::ClientClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_invalid_waits_for_reconnect() {
        let transport = StubTransport::new();
        transport.push_send(Err(CoConError::SessionInvalid("unknown id".into())));
        let config = test_config();
        let session = connected_session(transport.clone(), &config).await;
        let queue = Arc::new(CommandQueue::new(session.clone(), transport.clone(), &config));
        queue.reopen();

        let cancel = CancellationToken::new();
        let task = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.run(cancel).await })
        };
        let supervisor = {
            let session = session.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { session.supervise(cancel, |_| {}).await })
        };

        queue
            .enqueue(CommandRequest::new("Timer/Start"))
            .await
            .unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].session_id, "session-1");
        assert_eq!(sent[1].session_id, "session-2");
        assert_eq!(session.state(), SessionState::Connected);

        cancel.cancel();
        task.await.unwrap();
        supervisor.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_invalid_on_last_attempt_still_reconnects() {
        let transport = StubTransport::new();
        transport.push_send(Err(CoConError::SessionInvalid("unknown id".into())));
        let config = Config::builder().max_retries(0).build().unwrap();
        let session = connected_session(transport.clone(), &config).await;
        let queue = Arc::new(CommandQueue::new(session.clone(), transport.clone(), &config));
        queue.reopen();
        let cancel = CancellationToken::new();
        let task = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.run(cancel).await })
        };

        let err = queue
            .enqueue(CommandRequest::new("Timer/Start"))
            .await
            .unwrap_err();

        match err {
            CoConError::RetryExhausted {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 1);
                assert!(last_error.is_session_invalid());
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Reconnecting);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_session_resolves_not_connected() {
        let transport = StubTransport::new();
        transport.set_send_delay(Duration::from_secs(1));
        let config = test_config();
        let session = connected_session(transport.clone(), &config).await;
        let queue = Arc::new(CommandQueue::new(session.clone(), transport.clone(), &config));
        queue.reopen();

        transport.push_send(Err(CoConError::SessionInvalid("gone".into())));
        let task = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.run(CancellationToken::new()).await })
        };
        let first = queue.enqueue(CommandRequest::new("A"));
        let second = queue.enqueue(CommandRequest::new("B"));

        // No supervisor: simulate a reconnect that gave up
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(session.state(), SessionState::Reconnecting);
        session.close().await;

        task.await.unwrap();
        assert!(matches!(first.await, Err(CoConError::ClientClosed)));
        assert!(matches!(second.await, Err(CoConError::ClientClosed)));
    }

    #[tokio::test]
    async fn test_completion_hook_runs_before_handle_resolves() {
        let transport = StubTransport::new();
        let (queue, cancel, task) = running_queue(transport, &test_config()).await;

        let seen = Arc::new(Mutex::new(None));
        let handle = {
            let seen = seen.clone();
            queue.enqueue_with_hook(
                CommandRequest::new("A"),
                Box::new(move |result| *seen.lock().unwrap() = Some(result.is_ok())),
            )
        };
        handle.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(true));

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_resolved_handle_and_id() {
        let id = Uuid::new_v4();
        let handle = CommandHandle::resolved(id, Err(CoConError::NotConnected));
        assert_eq!(handle.id(), id);
        let result = block_on(handle);
        assert!(matches!(result, Err(CoConError::NotConnected)));
    }

    fn block_on<F: Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }
}
