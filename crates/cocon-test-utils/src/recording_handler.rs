//! Notification handler that records what it sees.

use cocon_client::{NotificationEvent, NotificationHandler};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Records every event it is invoked with, including the ones it fails.
///
/// Events whose `label` (see [`crate::fixtures::label_of`]) is registered
/// with [`RecordingHandler::fail_on`] make the handler return an error.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    seen: Mutex<Vec<NotificationEvent>>,
    failing: Mutex<HashSet<String>>,
    notify: Notify,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return an error for events carrying `label`.
    pub fn fail_on(&self, label: &str) {
        self.inner.failing.lock().unwrap().insert(label.to_owned());
    }

    /// Every event seen, in invocation order.
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.inner.seen.lock().unwrap().clone()
    }

    /// Labels of every event seen, in invocation order.
    pub fn labels(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| crate::fixtures::label_of(&e.payload))
            .collect()
    }

    /// Wait until at least `count` events were seen.
    ///
    /// # Panics
    ///
    /// Panics after 60 seconds of (possibly paused) test time.
    pub async fn wait_for(&self, count: usize) {
        let wait = async {
            loop {
                let notified = self.inner.notify.notified();
                if self.inner.seen.lock().unwrap().len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(60), wait)
            .await
            .unwrap_or_else(|_| panic!("expected {count} events, got {:?}", self.labels()));
    }
}

impl NotificationHandler for RecordingHandler {
    fn handle(&self, event: &NotificationEvent) -> anyhow::Result<()> {
        self.inner.seen.lock().unwrap().push(event.clone());
        self.inner.notify.notify_waiters();

        let label = crate::fixtures::label_of(&event.payload);
        let failing = self.inner.failing.lock().unwrap();
        match label {
            Some(label) if failing.contains(&label) => {
                anyhow::bail!("handler rejected event {label}")
            }
            _ => Ok(()),
        }
    }
}
