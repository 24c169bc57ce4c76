//! `CoConClient` facade.
//!
//! Composes the session manager, command queue, subscription manager,
//! notification poller and event dispatcher. `connect` establishes a session
//! and starts the background tasks; `close` cancels them, releases every
//! outstanding command and the server session.
//!
//! # Lifecycle
//!
//! 1. `CoConClient::builder(config)...build()`
//! 2. `connect()` starts four tasks under a child cancellation token: the
//!    poller, the dispatcher, the command queue and the session supervisor
//! 3. `close()` (or dropping the last clone of the client, or dropping a
//!    `scoped` future) cancels them
//!
//! ```no_run
//! use cocon_client::{CoConClient, Config, Model, NotificationEvent};
//!
//! # async fn demo() -> Result<(), cocon_client::CoConError> {
//! let client = CoConClient::builder(Config::default())
//!     .handler(|event: &NotificationEvent| {
//!         println!("{:?}", event.payload);
//!         Ok(())
//!     })
//!     .build()?;
//!
//! client
//!     .scoped(|client| async move {
//!         client.subscribe(&[Model::Delegate]).await?;
//!         client.send("Timer/Start", Default::default()).await?;
//!         Ok::<_, cocon_client::CoConError>(())
//!     })
//!     .await??;
//! # Ok(())
//! # }
//! ```

use crate::config::Config;
use crate::dispatcher::{
    EventDispatcher, HandlerErrorHook, NotificationHandler, EVENT_CHANNEL_BUFFER,
};
use crate::errors::CoConError;
use crate::models::Model;
use crate::poller::NotificationPoller;
use crate::queue::{Command, CommandHandle, CommandQueue, CommandRequest};
use crate::session::{SessionManager, SessionSnapshot, SessionState};
use crate::subscriptions::{SubscriptionHandle, SubscriptionManager};
use crate::transport::{CommandParams, HttpTransport, Transport};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Builder for [`CoConClient`].
pub struct CoConClientBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    handler: Option<Arc<dyn NotificationHandler>>,
    error_hook: Option<Arc<dyn HandlerErrorHook>>,
}

impl CoConClientBuilder {
    /// Use `transport` instead of an [`HttpTransport`] built from the config.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn handler(mut self, handler: impl NotificationHandler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn error_hook(mut self, hook: impl HandlerErrorHook) -> Self {
        self.error_hook = Some(Arc::new(hook));
        self
    }

    /// Validate the configuration and assemble the client.
    ///
    /// # Errors
    ///
    /// - `CoConError::Config` for an invalid configuration.
    /// - `CoConError::TransientNetwork` if the default HTTP transport cannot
    ///   be created.
    pub fn build(self) -> Result<CoConClient, CoConError> {
        self.config.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&self.config)?),
        };

        let session = Arc::new(SessionManager::new(Arc::clone(&transport), &self.config));
        let queue = Arc::new(CommandQueue::new(
            Arc::clone(&session),
            Arc::clone(&transport),
            &self.config,
        ));
        let subscriptions = Arc::new(SubscriptionManager::new(
            Arc::clone(&session),
            Arc::clone(&queue),
            self.config.subscription_details,
        ));
        let dispatcher = Arc::new(EventDispatcher::new(self.config.handler_timeout));
        dispatcher.set_handler(self.handler);
        dispatcher.set_error_hook(self.error_hook);

        let root = CancellationToken::new();
        Ok(CoConClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                transport,
                session,
                queue,
                subscriptions,
                dispatcher,
                running: Mutex::new(None),
                _drop_guard: root.clone().drop_guard(),
                root,
            }),
        })
    }
}

/// Background tasks of one connected run.
struct RunningTasks {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningTasks {
    async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(target: "cocon.client", error = %e, "Background task ended abnormally");
            }
        }
    }
}

struct ClientInner {
    config: Config,
    transport: Arc<dyn Transport>,
    session: Arc<SessionManager>,
    queue: Arc<CommandQueue>,
    subscriptions: Arc<SubscriptionManager>,
    dispatcher: Arc<EventDispatcher>,
    running: Mutex<Option<RunningTasks>>,
    root: CancellationToken,
    /// Cancels every task when the last client clone is dropped.
    _drop_guard: DropGuard,
}

/// Closes the client when a `scoped` future is dropped before finishing.
struct ScopeGuard {
    client: Option<CoConClient>,
}

impl ScopeGuard {
    fn disarm(mut self) {
        self.client = None;
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            client.abort();
        }
    }
}

/// Long-lived CoCon client.
///
/// Cheap to clone; clones share one session. Background tasks stop when
/// `close` is called or the last clone is dropped.
#[derive(Clone)]
pub struct CoConClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for CoConClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoConClient")
            .field("base_url", &self.inner.config.base_url())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CoConClient {
    #[must_use]
    pub fn builder(config: Config) -> CoConClientBuilder {
        CoConClientBuilder {
            config,
            transport: None,
            handler: None,
            error_hook: None,
        }
    }

    /// Client over HTTP with no handler; events are logged.
    ///
    /// # Errors
    ///
    /// See [`CoConClientBuilder::build`].
    pub fn new(config: Config) -> Result<Self, CoConError> {
        Self::builder(config).build()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.session.state()
    }

    /// State, session and epoch.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.session.snapshot()
    }

    /// Establish a session and start the background tasks.
    ///
    /// Idempotent while connected. After the session was lost for good
    /// (state `Disconnected`), calling it again starts a fresh run.
    ///
    /// # Errors
    ///
    /// - `CoConError::FatalConnect` when every connect attempt failed.
    /// - `CoConError::ClientClosed` after `close`.
    pub async fn connect(&self) -> Result<(), CoConError> {
        let inner = &self.inner;
        let mut running = inner.running.lock().await;

        match inner.session.state() {
            SessionState::Closed => return Err(CoConError::ClientClosed),
            SessionState::Disconnected => {}
            SessionState::Connecting | SessionState::Connected | SessionState::Reconnecting => {
                if running.is_some() {
                    return Ok(());
                }
            }
        }

        if let Some(previous) = running.take() {
            debug!(target: "cocon.client", "Stopping tasks of the previous run");
            previous.stop().await;
        }

        let epoch = inner.session.connect(&inner.root).await?;
        let cancel = inner.root.child_token();
        inner.queue.reopen();

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let poller = NotificationPoller::new(
            Arc::clone(&inner.session),
            Arc::clone(&inner.transport),
            events_tx,
            &inner.config,
        );

        let mut tasks = Vec::with_capacity(4);
        {
            let dispatcher = Arc::clone(&inner.dispatcher);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move { dispatcher.run(events_rx, cancel).await }));
        }
        {
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move { poller.run(cancel).await }));
        }
        {
            let queue = Arc::clone(&inner.queue);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move { queue.run(cancel).await }));
        }
        {
            let session = Arc::clone(&inner.session);
            let subscriptions = Arc::clone(&inner.subscriptions);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                session
                    .supervise(cancel, move |epoch| {
                        let _reconciled = subscriptions.reconcile(epoch);
                    })
                    .await;
            }));
        }

        let _reconciled = inner.subscriptions.reconcile(epoch);
        *running = Some(RunningTasks { cancel, tasks });

        info!(target: "cocon.client", epoch, "CoCon client connected");
        Ok(())
    }

    /// Stop the background tasks and release the session.
    ///
    /// Every pending or in-flight command resolves with `Cancelled`. The
    /// client cannot be reconnected afterwards. Idempotent.
    pub async fn close(&self) {
        let inner = &self.inner;
        // Also aborts a connect that is still retrying
        inner.root.cancel();

        let running = inner.running.lock().await.take();
        if let Some(running) = running {
            running.stop().await;
        }
        inner.queue.shutdown(CoConError::Cancelled);
        inner.session.close().await;

        info!(target: "cocon.client", "CoCon client closed");
    }

    /// Connect, run `f`, then close, whatever way `f` ends.
    ///
    /// If the returned future is dropped early the client is still closed,
    /// even while other clones are alive: the tasks are cancelled, every
    /// command resolves with `Cancelled` and the server session is released
    /// from a spawned task.
    ///
    /// # Errors
    ///
    /// Returns the connect error; `f`'s own output is passed through.
    pub async fn scoped<F, Fut, T>(self, f: F) -> Result<T, CoConError>
    where
        F: FnOnce(CoConClient) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = ScopeGuard {
            client: Some(self.clone()),
        };

        let result = match self.connect().await {
            Ok(()) => Ok(f(self.clone()).await),
            Err(e) => Err(e),
        };
        self.close().await;

        guard.disarm();
        result
    }

    /// Synchronous part of `close`; the server session is released from a
    /// spawned task.
    fn abort(&self) {
        let inner = &self.inner;
        inner.root.cancel();
        inner.queue.shutdown(CoConError::Cancelled);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let session = Arc::clone(&inner.session);
                runtime.spawn(async move { session.close().await });
            }
            Err(_) => {
                warn!(target: "cocon.client", "No runtime available, session not released");
            }
        }
        info!(target: "cocon.client", "CoCon client scope aborted");
    }

    /// Add models to the desired subscription set.
    pub fn subscribe(&self, models: &[Model]) -> SubscriptionHandle {
        if self.state() == SessionState::Closed {
            return SubscriptionHandle::rejected(models, &CoConError::ClientClosed);
        }
        self.inner.subscriptions.subscribe(models)
    }

    /// Remove models from the desired subscription set.
    pub fn unsubscribe(&self, models: &[Model]) -> SubscriptionHandle {
        if self.state() == SessionState::Closed {
            return SubscriptionHandle::rejected(models, &CoConError::ClientClosed);
        }
        self.inner.subscriptions.unsubscribe(models)
    }

    #[must_use]
    pub fn desired_subscriptions(&self) -> BTreeSet<Model> {
        self.inner.subscriptions.desired()
    }

    /// Queue a command; the handle resolves with the server's response.
    pub fn send(&self, name: impl Into<String>, params: CommandParams) -> CommandHandle {
        self.send_request(CommandRequest {
            name: name.into(),
            params,
        })
    }

    pub fn send_request(&self, request: CommandRequest) -> CommandHandle {
        if self.state() == SessionState::Closed {
            return CommandHandle::resolved(Uuid::new_v4(), Err(CoConError::ClientClosed));
        }
        self.inner.queue.enqueue(request)
    }

    /// Commands not yet terminal, head first.
    #[must_use]
    pub fn pending_commands(&self) -> Vec<Command> {
        self.inner.queue.commands()
    }

    /// Replace the notification handler.
    pub fn set_handler(&self, handler: impl NotificationHandler) {
        self.inner.dispatcher.set_handler(Some(Arc::new(handler)));
    }

    /// Remove the handler; events are logged instead.
    pub fn clear_handler(&self) {
        self.inner.dispatcher.set_handler(None);
    }

    pub fn set_error_hook(&self, hook: impl HandlerErrorHook) {
        self.inner.dispatcher.set_error_hook(Some(Arc::new(hook)));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::dispatcher::NotificationEvent;
    use crate::testing::{test_config, StubTransport};
    use crate::transport::PollOutcome;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn client(transport: Arc<StubTransport>) -> CoConClient {
        CoConClient::builder(test_config())
            .transport(transport)
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_send_close() {
        let transport = StubTransport::new();
        transport.push_send(Ok(json!({ "Timer": "started" })));
        let client = client(transport.clone());

        client.connect().await.unwrap();
        assert_eq!(client.state(), SessionState::Connected);
        // Connecting twice does not start a second run
        client.connect().await.unwrap();
        assert_eq!(client.snapshot().epoch, 1);

        let response = client.send("Timer/Start", CommandParams::new()).await.unwrap();
        assert_eq!(response, json!({ "Timer": "started" }));

        client.close().await;
        assert_eq!(client.state(), SessionState::Closed);
        assert!(matches!(
            client.send("Timer/Stop", CommandParams::new()).await,
            Err(CoConError::ClientClosed)
        ));
        assert!(matches!(
            client.subscribe(&[Model::Delegate]).await,
            Err(CoConError::ClientClosed)
        ));
        assert!(matches!(client.connect().await, Err(CoConError::ClientClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_before_connect_is_not_connected() {
        let client = client(StubTransport::new());
        assert!(matches!(
            client.send("Timer/Start", CommandParams::new()).await,
            Err(CoConError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_in_flight_and_pending() {
        let transport = StubTransport::new();
        transport.set_send_delay(Duration::from_secs(3600));
        let client = client(transport);
        client.connect().await.unwrap();

        let in_flight = client.send("Slow", CommandParams::new());
        let pending = client.send("Waiting", CommandParams::new());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.pending_commands().len(), 2);

        client.close().await;
        assert!(matches!(in_flight.await, Err(CoConError::Cancelled)));
        assert!(matches!(pending.await, Err(CoConError::Cancelled)));
        assert!(client.inner.running.lock().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_client_cancels_commands() {
        let transport = StubTransport::new();
        transport.set_send_delay(Duration::from_secs(3600));
        let client = client(transport);
        client.connect().await.unwrap();

        let handle = client.send("Slow", CommandParams::new());
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(client);

        assert!(matches!(handle.await, Err(CoConError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriptions_before_connect_are_sent_on_connect() {
        let transport = StubTransport::new();
        let client = client(transport.clone());

        let handle = client.subscribe(&[Model::Delegate, Model::Microphone]);
        assert!(handle.is_noop());
        assert_eq!(
            client.desired_subscriptions(),
            BTreeSet::from([Model::Delegate, Model::Microphone])
        );

        client.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.sent_names(), vec!["Subscribe", "Subscribe"]);

        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scoped_closes_on_exit() {
        let transport = StubTransport::new();
        let client = client(transport);
        let observer = client.clone();

        let value = client
            .scoped(|client| async move {
                assert_eq!(client.state(), SessionState::Connected);
                42
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(observer.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_handler_receives_polled_events() {
        let transport = StubTransport::new();
        let payload = match json!({ "Delegate": { "Id": 7 } }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        transport.push_poll(Ok(PollOutcome::Events(vec![payload])));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = CoConClient::builder(test_config())
            .transport(transport)
            .handler(move |event: &NotificationEvent| -> anyhow::Result<()> {
                tx.send(event.model())?;
                Ok(())
            })
            .build()
            .unwrap();
        client.connect().await.unwrap();

        assert_eq!(rx.recv().await, Some(Some(Model::Delegate)));
        client.close().await;
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = Config::default();
        config.queue_capacity = 0;
        assert!(matches!(
            CoConClient::builder(config)
                .transport(StubTransport::new())
                .build(),
            Err(CoConError::Config(_))
        ));
    }
}
