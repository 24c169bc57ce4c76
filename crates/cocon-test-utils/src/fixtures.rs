//! Notification payloads, errors and configurations used across tests.

use cocon_client::{CoConError, Config, Model, Payload};
use serde_json::{json, Value};
use std::time::Duration;

/// A notification for `model` whose body carries `label`.
///
/// Shape: `{"<Model>": {"label": "<label>"}}`.
pub fn event(model: Model, label: &str) -> Payload {
    let mut payload = Payload::new();
    payload.insert(model.as_str().to_owned(), json!({ "label": label }));
    payload
}

pub fn delegate_event(label: &str) -> Payload {
    event(Model::Delegate, label)
}

pub fn microphone_event(label: &str) -> Payload {
    event(Model::Microphone, label)
}

/// The `label` carried by a fixture payload.
pub fn label_of(payload: &Payload) -> Option<String> {
    payload.values().find_map(|body| match body.get("label") {
        Some(Value::String(label)) => Some(label.clone()),
        _ => None,
    })
}

pub fn transient() -> CoConError {
    CoConError::TransientNetwork("connection reset".into())
}

pub fn session_invalid() -> CoConError {
    CoConError::SessionInvalid("unknown connection id".into())
}

/// Three retries with backoff 1s, 2s, 4s (cap 10s, no jitter).
///
/// Keepalive and session lifetime are long enough to stay out of the way of
/// paused-clock tests.
pub fn fast_retry_config() -> Config {
    Config::builder()
        .max_retries(3)
        .backoff_base(Duration::from_secs(1))
        .backoff_cap(Duration::from_secs(10))
        .backoff_jitter(false)
        .poll_interval(Duration::from_secs(30))
        .keepalive_interval(Duration::from_secs(60))
        .session_ttl(Duration::from_secs(3600))
        .build()
        .unwrap()
}

/// Poll `condition` every 100ms of (possibly paused) test time.
///
/// # Panics
///
/// Panics if `condition` does not hold within 10 minutes of test time.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(600), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting until {what}"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_of_fixture_event() {
        assert_eq!(label_of(&delegate_event("a")), Some("a".to_owned()));
        assert_eq!(label_of(&Payload::new()), None);
    }
}
