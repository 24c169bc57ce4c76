//! Event dispatch to the user handler.
//!
//! The dispatcher consumes events from the poller in arrival order and runs
//! the handler for one event at a time. Each invocation runs on the blocking
//! pool, bounded by the configured handler timeout, so a handler that errors,
//! panics or hangs is reported and skipped without stalling delivery.

use crate::errors::HandlerFailure;
use crate::models::Model;
use crate::observability::metrics;
use crate::transport::Payload;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Buffer between the poller and the dispatcher.
pub const EVENT_CHANNEL_BUFFER: usize = 256;

/// A decoded notification, handed to the handler once and not retained.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub payload: Payload,
    pub received_at: DateTime<Utc>,
}

impl NotificationEvent {
    #[must_use]
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            received_at: Utc::now(),
        }
    }

    /// The model this event belongs to.
    ///
    /// CoCon notifications are keyed by model tag, e.g.
    /// `{"Delegate": {...}}`. Payload keys are kept sorted, so if several
    /// keys name a model the alphabetically first one wins.
    #[must_use]
    pub fn model(&self) -> Option<Model> {
        self.payload.keys().find_map(|key| key.parse().ok())
    }
}

/// Receives notifications.
///
/// Implemented for any `Fn(&NotificationEvent) -> anyhow::Result<()>`.
pub trait NotificationHandler: Send + Sync + 'static {
    /// Handle one event. Errors are logged and reported to the error hook.
    fn handle(&self, event: &NotificationEvent) -> anyhow::Result<()>;
}

impl<F> NotificationHandler for F
where
    F: Fn(&NotificationEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Observes failed handler invocations.
pub trait HandlerErrorHook: Send + Sync + 'static {
    fn on_error(&self, failure: &HandlerFailure, event: &NotificationEvent);
}

impl<F> HandlerErrorHook for F
where
    F: Fn(&HandlerFailure, &NotificationEvent) + Send + Sync + 'static,
{
    fn on_error(&self, failure: &HandlerFailure, event: &NotificationEvent) {
        self(failure, event);
    }
}

/// Runs the handler for each event with failure isolation.
pub struct EventDispatcher {
    handler: RwLock<Option<Arc<dyn NotificationHandler>>>,
    error_hook: RwLock<Option<Arc<dyn HandlerErrorHook>>>,
    handler_timeout: Option<Duration>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("has_handler", &self.current_handler().is_some())
            .field("handler_timeout", &self.handler_timeout)
            .finish_non_exhaustive()
    }
}

impl EventDispatcher {
    /// Create a dispatcher with no handler; events are logged until one is
    /// set. `None` disables the per-invocation timeout.
    #[must_use]
    pub fn new(handler_timeout: Option<Duration>) -> Self {
        Self {
            handler: RwLock::new(None),
            error_hook: RwLock::new(None),
            handler_timeout,
        }
    }

    /// Replace the handler. Takes effect from the next event.
    pub fn set_handler(&self, handler: Option<Arc<dyn NotificationHandler>>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    pub fn set_error_hook(&self, hook: Option<Arc<dyn HandlerErrorHook>>) {
        *self.error_hook.write().unwrap_or_else(PoisonError::into_inner) = hook;
    }

    fn current_handler(&self) -> Option<Arc<dyn NotificationHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn current_error_hook(&self) -> Option<Arc<dyn HandlerErrorHook>> {
        self.error_hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deliver events from `events` until `cancel` fires or the sender side
    /// is dropped.
    #[instrument(skip_all, name = "event_dispatcher")]
    pub async fn run(&self, mut events: mpsc::Receiver<NotificationEvent>, cancel: CancellationToken) {
        debug!(target: "cocon.dispatcher", "Event dispatcher started");
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Some(event) => event,
                    None => break,
                },
            };

            tokio::select! {
                () = cancel.cancelled() => break,
                _ = self.dispatch(event) => {}
            }
        }
        debug!(target: "cocon.dispatcher", "Event dispatcher stopped");
    }

    /// Run the handler for a single event.
    ///
    /// # Errors
    ///
    /// Returns the [`HandlerFailure`] after it has been logged and reported
    /// to the error hook.
    pub async fn dispatch(&self, event: NotificationEvent) -> Result<(), HandlerFailure> {
        let Some(handler) = self.current_handler() else {
            let payload = Value::Object(event.payload);
            info!(
                target: "cocon.dispatcher",
                payload = %payload,
                "Notification received"
            );
            return Ok(());
        };

        metrics::record_event_dispatched();
        let event = Arc::new(event);
        let task = {
            let event = Arc::clone(&event);
            tokio::task::spawn_blocking(move || handler.handle(&event))
        };

        let joined = match self.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => return Err(self.report(HandlerFailure::TimedOut(limit), &event)),
            },
            None => task.await,
        };

        let failure = match joined {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => HandlerFailure::Error(e),
            Err(join_error) if join_error.is_panic() => {
                HandlerFailure::Panicked(panic_message(join_error.into_panic().as_ref()))
            }
            Err(join_error) => HandlerFailure::Panicked(join_error.to_string()),
        };
        Err(self.report(failure, &event))
    }

    fn report(&self, failure: HandlerFailure, event: &NotificationEvent) -> HandlerFailure {
        metrics::record_handler_failure(failure.kind());
        error!(
            target: "cocon.dispatcher",
            kind = failure.kind(),
            error = %failure,
            model = ?event.model(),
            "Notification handler failed"
        );

        if let Some(hook) = self.current_error_hook() {
            let outcome = catch_unwind(AssertUnwindSafe(|| hook.on_error(&failure, event)));
            if outcome.is_err() {
                error!(target: "cocon.dispatcher", "Handler error hook panicked");
            }
        }
        failure
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn event(value: Value) -> NotificationEvent {
        match value {
            Value::Object(payload) => NotificationEvent::new(payload),
            other => panic!("not an object: {other}"),
        }
    }

    fn label(event: &NotificationEvent) -> String {
        event
            .payload
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        failures: Mutex<Vec<(String, &'static str)>>,
    }

    fn dispatcher_with(
        recorder: &Arc<Recorder>,
        timeout: Option<Duration>,
        handler: impl Fn(&NotificationEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> EventDispatcher {
        let dispatcher = EventDispatcher::new(timeout);
        let seen = Arc::clone(recorder);
        dispatcher.set_handler(Some(Arc::new(move |event: &NotificationEvent| {
            seen.seen.lock().unwrap().push(label(event));
            handler(event)
        })));
        let failures = Arc::clone(recorder);
        dispatcher.set_error_hook(Some(Arc::new(
            move |failure: &HandlerFailure, event: &NotificationEvent| {
                failures
                    .failures
                    .lock()
                    .unwrap()
                    .push((label(event), failure.kind()));
            },
        )));
        dispatcher
    }

    #[tokio::test]
    async fn test_error_on_one_event_does_not_block_the_next() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher_with(&recorder, Some(Duration::from_secs(5)), |event| {
            if label(event) == "B" {
                anyhow::bail!("cannot handle B");
            }
            Ok(())
        });

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        for name in ["A", "B", "C"] {
            tx.send(event(json!({ "label": name }))).await.unwrap();
        }
        drop(tx);
        dispatcher.run(rx, CancellationToken::new()).await;

        assert_eq!(*recorder.seen.lock().unwrap(), vec!["A", "B", "C"]);
        assert_eq!(
            *recorder.failures.lock().unwrap(),
            vec![("B".to_string(), "error")]
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher_with(&recorder, None, |event| {
            if label(event) == "B" {
                panic!("handler bug");
            }
            Ok(())
        });

        assert!(dispatcher.dispatch(event(json!({ "label": "A" }))).await.is_ok());
        match dispatcher.dispatch(event(json!({ "label": "B" }))).await {
            Err(HandlerFailure::Panicked(message)) => assert_eq!(message, "handler bug"),
            other => panic!("expected panic failure, got {other:?}"),
        }
        assert!(dispatcher.dispatch(event(json!({ "label": "C" }))).await.is_ok());

        assert_eq!(*recorder.seen.lock().unwrap(), vec!["A", "B", "C"]);
        assert_eq!(
            *recorder.failures.lock().unwrap(),
            vec![("B".to_string(), "panic")]
        );
    }

    #[tokio::test]
    async fn test_slow_handler_times_out_and_delivery_continues() {
        let recorder = Arc::new(Recorder::default());
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let dispatcher = dispatcher_with(&recorder, Some(Duration::from_millis(50)), move |event| {
            if label(event) == "B" {
                let _ = release_rx.lock().unwrap().recv();
            }
            Ok(())
        });

        dispatcher.dispatch(event(json!({ "label": "A" }))).await.unwrap();
        let slow = dispatcher.dispatch(event(json!({ "label": "B" }))).await;
        assert!(matches!(slow, Err(HandlerFailure::TimedOut(_))));
        dispatcher.dispatch(event(json!({ "label": "C" }))).await.unwrap();

        assert_eq!(*recorder.seen.lock().unwrap(), vec!["A", "B", "C"]);
        assert_eq!(
            *recorder.failures.lock().unwrap(),
            vec![("B".to_string(), "timeout")]
        );

        // Let the abandoned invocation finish so the runtime can shut down
        release_tx.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_without_handler_events_are_only_logged() {
        let dispatcher = EventDispatcher::new(None);
        assert!(dispatcher.dispatch(event(json!({ "Delegate": {} }))).await.is_ok());
    }

    #[tokio::test]
    async fn test_set_handler_replaces_previous() {
        let first = Arc::new(Mutex::new(0));
        let second = Arc::new(Mutex::new(0));
        let dispatcher = EventDispatcher::new(None);

        let counter = Arc::clone(&first);
        dispatcher.set_handler(Some(Arc::new(move |_: &NotificationEvent| -> anyhow::Result<()> {
            *counter.lock().unwrap() += 1;
            Ok(())
        })));
        dispatcher.dispatch(event(json!({}))).await.unwrap();

        let counter = Arc::clone(&second);
        dispatcher.set_handler(Some(Arc::new(move |_: &NotificationEvent| -> anyhow::Result<()> {
            *counter.lock().unwrap() += 1;
            Ok(())
        })));
        dispatcher.dispatch(event(json!({}))).await.unwrap();

        assert_eq!(*first.lock().unwrap(), 1);
        assert_eq!(*second.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_panicking_error_hook_is_contained() {
        let dispatcher = EventDispatcher::new(None);
        dispatcher.set_handler(Some(Arc::new(
            |_: &NotificationEvent| -> anyhow::Result<()> { anyhow::bail!("fail") },
        )));
        dispatcher.set_error_hook(Some(Arc::new(
            |_: &HandlerFailure, _: &NotificationEvent| panic!("hook bug"),
        )));

        let result = dispatcher.dispatch(event(json!({}))).await;
        assert!(matches!(result, Err(HandlerFailure::Error(_))));
    }

    #[tokio::test]
    async fn test_cancel_stops_run() {
        let dispatcher = EventDispatcher::new(None);
        let (_tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        dispatcher.run(rx, cancel).await;
    }

    #[test]
    fn test_event_model_routing() {
        assert_eq!(
            event(json!({ "Delegate": { "Id": 3 } })).model(),
            Some(Model::Delegate)
        );
        assert_eq!(
            event(json!({ "ButtonLED_Event": {} })).model(),
            Some(Model::ButtonLedEvent)
        );
        assert_eq!(event(json!({ "Unknown": 1 })).model(), None);
        assert_eq!(
            event(json!({ "Voting": {}, "Audio": {}, "Aaa": 1 })).model(),
            Some(Model::Audio)
        );
    }
}
