//! Session establishment and recovery.
//!
//! - Connect gives up after the configured attempts
//! - Poll timeouts are normal, never count as failures and keep an idle
//!   session alive
//! - Consecutive poll failures trigger a reconnect
//! - After a reconnect exactly the desired subscriptions are re-sent

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use std::sync::Arc;
use std::time::Duration;

use cocon_client::{CoConClient, CoConError, Config, Model, PollOutcome, SessionState};
use cocon_test_utils::{
    delegate_event, fast_retry_config, session_invalid, transient, wait_until, MockTransport,
    RecordingHandler,
};

fn build_client(transport: &Arc<MockTransport>, config: Config) -> CoConClient {
    CoConClient::builder(config)
        .transport(transport.clone())
        .build()
        .unwrap()
}

fn config_with_ceiling(ceiling: u32) -> Config {
    let mut config = fast_retry_config();
    config.poll_failure_ceiling = ceiling;
    config
}

#[tokio::test(start_paused = true)]
async fn test_connect_gives_up_after_every_attempt() {
    let transport = MockTransport::new();
    transport.fail_connects(4, transient());
    let client = build_client(&transport, fast_retry_config());

    let err = client.connect().await.unwrap_err();

    match err {
        CoConError::FatalConnect {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 4);
            assert!(last_error.is_retryable());
        }
        other => panic!("expected FatalConnect, got {other:?}"),
    }
    assert_eq!(transport.connect_count(), 4);
    assert_eq!(client.state(), SessionState::Disconnected);

    // A later connect starts over
    client.connect().await.unwrap();
    assert_eq!(client.state(), SessionState::Connected);
    assert_eq!(client.snapshot().session_id(), Some("session-5"));

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_is_idempotent_while_connected() {
    let transport = MockTransport::new();
    let client = build_client(&transport, fast_retry_config());

    client.connect().await.unwrap();
    client.connect().await.unwrap();

    assert_eq!(transport.connect_count(), 1);
    assert_eq!(client.snapshot().epoch, 1);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_poll_timeouts_are_not_failures() {
    let transport = MockTransport::new();
    let client = build_client(&transport, config_with_ceiling(2));
    client.connect().await.unwrap();

    // Twenty empty long-poll windows
    tokio::time::sleep(Duration::from_secs(600)).await;

    assert!(transport.poll_count() >= 20);
    assert_eq!(transport.connect_count(), 1);
    assert_eq!(client.state(), SessionState::Connected);

    client.close().await;
}

// Session expiry is wall-clock, so this one runs on the real clock
#[tokio::test]
async fn test_idle_session_outlives_its_ttl() {
    let transport = MockTransport::new();
    let config = Config::builder()
        .poll_interval(Duration::from_millis(200))
        .session_ttl(Duration::from_millis(500))
        .keepalive_interval(Duration::from_millis(100))
        .build()
        .unwrap();
    let client = build_client(&transport, config);
    client.connect().await.unwrap();
    client.subscribe(&[Model::Delegate]).await.unwrap();

    // Four TTLs of nothing but empty long-poll windows
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(transport.poll_count() >= 5);
    assert_eq!(transport.connect_count(), 1);
    assert_eq!(transport.sent_named("Subscribe").len(), 1);
    assert_eq!(client.state(), SessionState::Connected);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_acknowledged_timeout_resets_failure_count() {
    let transport = MockTransport::new();
    transport.push_poll(Err(transient()));
    transport.push_poll(Ok(PollOutcome::TimedOut { acknowledged: true }));
    transport.push_poll(Err(transient()));
    let client = build_client(&transport, config_with_ceiling(2));
    client.connect().await.unwrap();

    tokio::time::sleep(Duration::from_secs(300)).await;

    assert_eq!(transport.connect_count(), 1);
    assert_eq!(client.state(), SessionState::Connected);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_poll_failures_trigger_reconnect() {
    let transport = MockTransport::new();
    for _ in 0..3 {
        transport.push_poll(Err(transient()));
    }
    let client = build_client(&transport, config_with_ceiling(3));
    client.connect().await.unwrap();

    wait_until("the client reconnected", || transport.connect_count() == 2).await;
    wait_until("the new session is up", || client.state() == SessionState::Connected).await;

    assert_eq!(client.snapshot().session_id(), Some("session-2"));
    assert_eq!(client.snapshot().epoch, 2);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_reasserts_exactly_the_desired_subscriptions() {
    let transport = MockTransport::new();
    let client = build_client(&transport, fast_retry_config());
    client.connect().await.unwrap();

    client
        .subscribe(&[Model::Delegate, Model::Microphone])
        .await
        .unwrap();
    client.unsubscribe(&[Model::Microphone]).await.unwrap();
    assert_eq!(
        client.desired_subscriptions().into_iter().collect::<Vec<_>>(),
        vec![Model::Delegate]
    );

    transport.push_poll(Err(session_invalid()));
    transport.wait_for_sends(4).await;
    // Nothing else is on its way
    tokio::time::sleep(Duration::from_secs(5)).await;

    let resent: Vec<(String, Option<String>)> = transport
        .sent()
        .into_iter()
        .filter(|s| s.session_id == "session-2")
        .map(|s| (s.name.clone(), s.param("Model").map(str::to_owned)))
        .collect();
    assert_eq!(resent, vec![("Subscribe".to_owned(), Some("Delegate".to_owned()))]);
    assert_eq!(transport.connect_count(), 2);
    assert_eq!(client.snapshot().epoch, 2);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_before_connect_is_sent_on_connect() {
    let transport = MockTransport::new();
    let client = build_client(&transport, fast_retry_config());

    let handle = client.subscribe(&[Model::Voting]);
    assert!(handle.is_noop());
    assert!(transport.sent().is_empty());

    client.connect().await.unwrap();
    transport.wait_for_sends(1).await;

    let sent = transport.sent_named("Subscribe");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].param("Model"), Some("Voting"));
    assert_eq!(sent[0].session_id, "session-1");

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_events_flow_again_after_reconnect() {
    let transport = MockTransport::new();
    transport.push_poll_events(vec![delegate_event("before")]);
    transport.push_poll(Err(session_invalid()));
    transport.push_poll_events(vec![delegate_event("after")]);
    let handler = RecordingHandler::new();
    let client = CoConClient::builder(fast_retry_config())
        .transport(transport.clone())
        .handler(handler.clone())
        .build()
        .unwrap();

    client.connect().await.unwrap();
    handler.wait_for(2).await;

    assert_eq!(handler.labels(), vec!["before", "after"]);
    assert_eq!(transport.connect_count(), 2);
    assert_eq!(client.state(), SessionState::Connected);

    client.close().await;
}

