//! Server-defined model categories and API endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A CoCon data model category that can be subscribed to.
///
/// The serialized form is the exact tag the server uses in `Subscribe`
/// requests and notification payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Model {
    Room,
    Microphone,
    MeetingAgenda,
    Voting,
    Timer,
    Delegate,
    Audio,
    Interpretation,
    Logging,
    #[serde(rename = "ButtonLED_Event")]
    ButtonLedEvent,
    Interactive,
    External,
    Intercom,
    Video,
}

impl Model {
    /// Every model the server defines, in declaration order.
    pub const ALL: [Model; 14] = [
        Model::Room,
        Model::Microphone,
        Model::MeetingAgenda,
        Model::Voting,
        Model::Timer,
        Model::Delegate,
        Model::Audio,
        Model::Interpretation,
        Model::Logging,
        Model::ButtonLedEvent,
        Model::Interactive,
        Model::External,
        Model::Intercom,
        Model::Video,
    ];

    /// Wire tag for this model.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Model::Room => "Room",
            Model::Microphone => "Microphone",
            Model::MeetingAgenda => "MeetingAgenda",
            Model::Voting => "Voting",
            Model::Timer => "Timer",
            Model::Delegate => "Delegate",
            Model::Audio => "Audio",
            Model::Interpretation => "Interpretation",
            Model::Logging => "Logging",
            Model::ButtonLedEvent => "ButtonLED_Event",
            Model::Interactive => "Interactive",
            Model::External => "External",
            Model::Intercom => "Intercom",
            Model::Video => "Video",
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown model tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown model: {0}")]
pub struct UnknownModel(pub String);

impl FromStr for Model {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim();
        Model::ALL
            .iter()
            .copied()
            .find(|m| m.as_str().eq_ignore_ascii_case(tag))
            .ok_or_else(|| UnknownModel(tag.to_string()))
    }
}

/// Known API endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Connect,
    Notification,
    Subscribe,
    Unsubscribe,
    Disconnect,
}

impl Endpoint {
    /// Path segment for this endpoint.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Connect => "Connect",
            Endpoint::Notification => "Notification",
            Endpoint::Subscribe => "Subscribe",
            Endpoint::Unsubscribe => "Unsubscribe",
            Endpoint::Disconnect => "Disconnect",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
