//! Desired-subscription tracking and reconciliation.
//!
//! The server keeps no subscription state across sessions, so the desired
//! set held here is the source of truth: every time a session is
//! established, [`SubscriptionManager::reconcile`] re-issues `Subscribe` for
//! exactly the desired models.

use crate::errors::CoConError;
use crate::models::{Endpoint, Model};
use crate::queue::{CommandHandle, CommandQueue, CommandRequest, CompletionHook};
use crate::session::{SessionManager, SessionState};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

/// Confirmation state of a model subscription, tagged with the session
/// epoch it applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Unconfirmed,
    /// A `Subscribe` was queued in this epoch.
    Pending(u64),
    /// The server accepted the `Subscribe` in this epoch.
    Confirmed(u64),
}

/// One model entry of the subscription table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub model: Model,
    pub desired: bool,
    pub status: SubscriptionStatus,
}

type Entries = Arc<Mutex<BTreeMap<Model, Subscription>>>;

/// Outcome of a `subscribe`/`unsubscribe` call.
///
/// Awaiting it waits for every command the call queued and yields the first
/// error. Calls that queued nothing resolve immediately.
#[derive(Debug)]
#[must_use = "dropping the handle does not cancel the commands, but hides their outcome"]
pub struct SubscriptionHandle {
    commands: Vec<(Model, CommandHandle)>,
}

impl SubscriptionHandle {
    /// Models a command was queued for.
    #[must_use]
    pub fn models(&self) -> Vec<Model> {
        self.commands.iter().map(|(model, _)| *model).collect()
    }

    /// True when the call did not need to queue anything.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.commands.is_empty()
    }

    /// A handle whose commands all failed with `error` before being queued.
    pub(crate) fn rejected(models: &[Model], error: &CoConError) -> Self {
        Self {
            commands: models
                .iter()
                .map(|&model| {
                    (
                        model,
                        CommandHandle::resolved(Uuid::new_v4(), Err(error.clone())),
                    )
                })
                .collect(),
        }
    }
}

impl IntoFuture for SubscriptionHandle {
    type Output = Result<(), CoConError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            let mut first_error = None;
            for (_, handle) in self.commands {
                if let Err(e) = handle.await {
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        })
    }
}

/// Tracks desired subscriptions and pushes them through the command queue.
pub struct SubscriptionManager {
    session: Arc<SessionManager>,
    queue: Arc<CommandQueue>,
    details: bool,
    entries: Entries,
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("desired", &self.desired())
            .field("details", &self.details)
            .finish_non_exhaustive()
    }
}

fn lock(entries: &Entries) -> MutexGuard<'_, BTreeMap<Model, Subscription>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SubscriptionManager {
    /// `details` is sent as the `details` flag of every `Subscribe`.
    #[must_use]
    pub fn new(session: Arc<SessionManager>, queue: Arc<CommandQueue>, details: bool) -> Self {
        Self {
            session,
            queue,
            details,
            entries: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    fn connected_epoch(&self) -> Option<u64> {
        let snapshot = self.session.snapshot();
        (snapshot.state == SessionState::Connected).then_some(snapshot.epoch)
    }

    /// Add `models` to the desired set.
    ///
    /// While connected, a `Subscribe` is queued for each model that is not
    /// already pending or confirmed in the current session.
    pub fn subscribe(&self, models: &[Model]) -> SubscriptionHandle {
        let epoch = self.connected_epoch();
        let mut to_send = Vec::new();
        {
            let mut entries = lock(&self.entries);
            for &model in models {
                let entry = entries.entry(model).or_insert(Subscription {
                    model,
                    desired: false,
                    status: SubscriptionStatus::Unconfirmed,
                });
                entry.desired = true;

                let Some(epoch) = epoch else {
                    continue;
                };
                let current = matches!(
                    entry.status,
                    SubscriptionStatus::Pending(e) | SubscriptionStatus::Confirmed(e) if e == epoch
                );
                if !current && !to_send.contains(&model) {
                    entry.status = SubscriptionStatus::Pending(epoch);
                    to_send.push(model);
                }
            }
        }

        debug!(
            target: "cocon.subscriptions",
            requested = models.len(),
            queued = to_send.len(),
            "Subscribe"
        );

        let Some(epoch) = epoch else {
            return SubscriptionHandle {
                commands: Vec::new(),
            };
        };
        let commands = to_send
            .into_iter()
            .map(|model| {
                let handle = self.queue.enqueue_with_hook(
                    self.subscribe_request(model),
                    self.confirmation_hook(model, epoch),
                );
                (model, handle)
            })
            .collect();
        SubscriptionHandle { commands }
    }

    /// Remove `models` from the desired set.
    ///
    /// While connected, an `Unsubscribe` is queued for each model that was
    /// desired.
    pub fn unsubscribe(&self, models: &[Model]) -> SubscriptionHandle {
        let connected = self.connected_epoch().is_some();
        let mut to_send = Vec::new();
        {
            let mut entries = lock(&self.entries);
            for &model in models {
                if let Some(entry) = entries.get_mut(&model) {
                    if entry.desired && connected {
                        to_send.push(model);
                    }
                    entry.desired = false;
                    entry.status = SubscriptionStatus::Unconfirmed;
                }
            }
        }

        debug!(
            target: "cocon.subscriptions",
            requested = models.len(),
            queued = to_send.len(),
            "Unsubscribe"
        );

        let commands = to_send
            .into_iter()
            .map(|model| {
                let request = CommandRequest::new(Endpoint::Unsubscribe.as_str())
                    .param("Model", model.as_str());
                (model, self.queue.enqueue(request))
            })
            .collect();
        SubscriptionHandle { commands }
    }

    /// Re-issue `Subscribe` for the whole desired set under `epoch`.
    ///
    /// The commands are queued ahead of pending user commands. Models already
    /// pending or confirmed in `epoch` are skipped.
    pub fn reconcile(&self, epoch: u64) -> SubscriptionHandle {
        let to_send: Vec<Model> = {
            let mut entries = lock(&self.entries);
            entries
                .values_mut()
                .filter(|entry| entry.desired)
                .filter(|entry| {
                    !matches!(
                        entry.status,
                        SubscriptionStatus::Pending(e) | SubscriptionStatus::Confirmed(e) if e == epoch
                    )
                })
                .map(|entry| {
                    entry.status = SubscriptionStatus::Pending(epoch);
                    entry.model
                })
                .collect()
        };

        if to_send.is_empty() {
            debug!(target: "cocon.subscriptions", epoch, "Nothing to reconcile");
            return SubscriptionHandle {
                commands: Vec::new(),
            };
        }

        info!(
            target: "cocon.subscriptions",
            epoch,
            models = ?to_send,
            "Re-asserting subscriptions"
        );

        let batch = to_send
            .iter()
            .map(|&model| {
                (
                    self.subscribe_request(model),
                    Some(self.confirmation_hook(model, epoch)),
                )
            })
            .collect();
        let handles = self.queue.enqueue_front(batch);
        SubscriptionHandle {
            commands: to_send.into_iter().zip(handles).collect(),
        }
    }

    fn subscribe_request(&self, model: Model) -> CommandRequest {
        CommandRequest::new(Endpoint::Subscribe.as_str())
            .param("Model", model.as_str())
            .param("details", if self.details { "true" } else { "false" })
    }

    /// Marks the entry confirmed (or unconfirmed on failure) if it is still
    /// desired and pending in `epoch`; stale outcomes are ignored.
    fn confirmation_hook(&self, model: Model, epoch: u64) -> CompletionHook {
        let entries = Arc::clone(&self.entries);
        Box::new(move |result: &Result<Value, CoConError>| {
            let mut entries = lock(&entries);
            let Some(entry) = entries.get_mut(&model) else {
                return;
            };
            if !entry.desired || entry.status != SubscriptionStatus::Pending(epoch) {
                return;
            }
            entry.status = match result {
                Ok(_) => SubscriptionStatus::Confirmed(epoch),
                Err(_) => SubscriptionStatus::Unconfirmed,
            };
        })
    }

    /// Models currently desired.
    #[must_use]
    pub fn desired(&self) -> BTreeSet<Model> {
        lock(&self.entries)
            .values()
            .filter(|entry| entry.desired)
            .map(|entry| entry.model)
            .collect()
    }

    /// Entry for `model`, if it was ever subscribed.
    #[must_use]
    pub fn get(&self, model: Model) -> Option<Subscription> {
        lock(&self.entries).get(&model).copied()
    }
}
