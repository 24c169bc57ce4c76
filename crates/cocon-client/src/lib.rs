//! CoCon Client Library
//!
//! Long-lived client runtime for the CoCon conferencing-control REST
//! interface. The client keeps one server session alive, receives
//! asynchronous notifications by long-polling, and delivers outbound commands
//! with retry and backoff:
//!
//! - Session lifecycle with keepalive and automatic reconnection
//! - Continuous long-poll loop with ordered event delivery
//! - Strict FIFO command queue with per-command retry
//! - Subscription state re-asserted after every reconnect
//! - Handler isolation (errors, panics, timeouts)
//!
//! # Architecture
//!
//! ```text
//! CoConClient (facade)
//! ├── SessionManager ── supervisor task (keepalive, reconnect)
//! ├── NotificationPoller ── poll task ──mpsc──▶ EventDispatcher ── dispatch task
//! ├── CommandQueue ── delivery task
//! └── SubscriptionManager (pushes Subscribe/Unsubscribe through the queue)
//! ```
//!
//! Every server request goes through the [`transport::Transport`] trait;
//! [`transport::HttpTransport`] is the production implementation.
//!
//! # Modules
//!
//! - [`client`] - `CoConClient` facade
//! - [`session`] - Session state machine and supervisor
//! - [`poller`] - Long-poll notification loop
//! - [`queue`] - Command queue and handles
//! - [`subscriptions`] - Desired-subscription set and reconciliation
//! - [`dispatcher`] - Handler invocation with failure isolation
//! - [`transport`] - HTTP capability
//! - [`config`] - Configuration from builder or environment
//! - [`errors`] - Error taxonomy

pub mod backoff;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod models;
pub mod observability;
pub mod poller;
pub mod queue;
pub mod session;
pub mod subscriptions;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::{CoConClient, CoConClientBuilder};
pub use config::{Config, ConfigError};
pub use dispatcher::{HandlerErrorHook, NotificationEvent, NotificationHandler};
pub use errors::{CoConError, HandlerFailure};
pub use models::Model;
pub use queue::{Command, CommandHandle, CommandRequest, CommandStatus};
pub use session::{SessionSnapshot, SessionState};
pub use subscriptions::{SubscriptionHandle, SubscriptionStatus};
pub use transport::{CommandParams, HttpTransport, Payload, PollOutcome, SessionGrant, Transport};
