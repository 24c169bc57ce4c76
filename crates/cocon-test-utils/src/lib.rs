//! # CoCon Test Utilities
//!
//! Shared test utilities for the CoCon client runtime.
//!
//! This crate provides a scripted transport, a recording notification
//! handler and payload fixtures so the runtime can be exercised without a
//! CoCon server.
//!
//! ## Modules
//!
//! - `mock_transport` - Scripted [`cocon_client::Transport`] with call recording
//! - `recording_handler` - Handler that records (and optionally fails) events
//! - `fixtures` - Notification payloads and configurations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cocon_test_utils::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     let transport = MockTransport::new();
//!     transport.push_poll_events(vec![delegate_event("alice")]);
//!
//!     let handler = RecordingHandler::new();
//!     let client = CoConClient::builder(fast_retry_config())
//!         .transport(transport.clone())
//!         .handler(handler.clone())
//!         .build()
//!         .unwrap();
//!
//!     client.connect().await.unwrap();
//!     handler.wait_for(1).await;
//! }
//! ```

pub mod fixtures;
pub mod mock_transport;
pub mod recording_handler;

pub use fixtures::*;
pub use mock_transport::{MockTransport, RecordedSend};
pub use recording_handler::RecordingHandler;
