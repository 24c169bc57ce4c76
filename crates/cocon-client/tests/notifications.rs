//! Notification delivery and subscription bookkeeping.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use std::sync::{Arc, Mutex};

use cocon_client::{CoConClient, HandlerFailure, Model, NotificationEvent, SessionState};
use cocon_test_utils::{
    delegate_event, fast_retry_config, label_of, microphone_event, wait_until, MockTransport,
    RecordingHandler,
};

#[tokio::test(start_paused = true)]
async fn test_failing_handler_does_not_break_ordering() {
    let transport = MockTransport::new();
    transport.push_poll_events(vec![
        delegate_event("A"),
        delegate_event("B"),
        delegate_event("C"),
    ]);
    let handler = RecordingHandler::new();
    handler.fail_on("B");

    let failures = Arc::new(Mutex::new(Vec::new()));
    let failures_clone = Arc::clone(&failures);
    let client = CoConClient::builder(fast_retry_config())
        .transport(transport.clone())
        .handler(handler.clone())
        .error_hook(move |failure: &HandlerFailure, event: &NotificationEvent| {
            failures_clone
                .lock()
                .unwrap()
                .push((failure.kind(), label_of(&event.payload)));
        })
        .build()
        .unwrap();

    client.connect().await.unwrap();
    handler.wait_for(3).await;

    assert_eq!(handler.labels(), vec!["A", "B", "C"]);
    assert_eq!(
        *failures.lock().unwrap(),
        vec![("error", Some("B".to_owned()))]
    );
    assert_eq!(client.state(), SessionState::Connected);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_panicking_handler_is_contained() {
    let transport = MockTransport::new();
    transport.push_poll_events(vec![delegate_event("A"), delegate_event("B")]);
    transport.push_poll_events(vec![delegate_event("C")]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    let client = CoConClient::builder(fast_retry_config())
        .transport(transport.clone())
        .handler(move |event: &NotificationEvent| -> anyhow::Result<()> {
            let label = label_of(&event.payload).unwrap_or_default();
            seen_clone.lock().unwrap().push(label.clone());
            if label == "B" {
                panic!("handler bug");
            }
            Ok(())
        })
        .build()
        .unwrap();

    client.connect().await.unwrap();
    wait_until("all events were handled", || seen.lock().unwrap().len() == 3).await;

    assert_eq!(*seen.lock().unwrap(), vec!["A", "B", "C"]);
    assert_eq!(transport.connect_count(), 1);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_handler_can_be_replaced_while_running() {
    let transport = MockTransport::new();
    let first = RecordingHandler::new();
    let second = RecordingHandler::new();
    let client = CoConClient::builder(fast_retry_config())
        .transport(transport.clone())
        .handler(first.clone())
        .build()
        .unwrap();
    client.connect().await.unwrap();

    transport.push_poll_events(vec![microphone_event("one")]);
    first.wait_for(1).await;

    client.set_handler(second.clone());
    transport.push_poll_events(vec![microphone_event("two")]);
    second.wait_for(1).await;

    assert_eq!(first.labels(), vec!["one"]);
    assert_eq!(second.labels(), vec!["two"]);
    assert_eq!(second.events()[0].model(), Some(Model::Microphone));

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_is_idempotent() {
    let transport = MockTransport::new();
    let client = CoConClient::builder(fast_retry_config())
        .transport(transport.clone())
        .build()
        .unwrap();
    client.connect().await.unwrap();

    let first = client.subscribe(&[Model::Delegate]);
    // Still pending: must not be sent twice
    let second = client.subscribe(&[Model::Delegate, Model::Delegate]);
    assert_eq!(first.models(), vec![Model::Delegate]);
    assert!(second.is_noop());

    first.await.unwrap();
    second.await.unwrap();

    // Already confirmed in this session
    assert!(client.subscribe(&[Model::Delegate]).is_noop());

    let sent = transport.sent_named("Subscribe");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].param("Model"), Some("Delegate"));
    assert_eq!(sent[0].param("details"), Some("true"));

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_of_unknown_model_sends_nothing() {
    let transport = MockTransport::new();
    let client = CoConClient::builder(fast_retry_config())
        .transport(transport.clone())
        .build()
        .unwrap();
    client.connect().await.unwrap();

    let handle = client.unsubscribe(&[Model::Timer]);

    assert!(handle.is_noop());
    handle.await.unwrap();
    assert!(transport.sent().is_empty());
    assert!(client.desired_subscriptions().is_empty());

    client.close().await;
}
