//! Messages exchanged over the live (push) transport.
use serde::{Deserialize, Serialize};

use crate::models::{EffectiveFeatureValue, FeatureConfiguration};

/// Which kind of state a live subscription delivers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SubscriptionMode {
    /// Values already resolved by the service for `audiences`.
    EffectiveValues { audiences: Vec<String> },
    /// Raw feature configurations, resolved locally per request.
    AllValues,
}

/// Frames sent from the SDK to the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Subscribe {
        api_key: String,
        mode: SubscriptionMode,
    },
}

/// Notifications pushed by the service, discriminated by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum NotificationMessage {
    StateOfTheWorld { features: Vec<FeatureConfiguration> },
    StateOfTheWorldEffectiveValues { features: Vec<EffectiveFeatureValue> },
    FeatureUpdated(FeatureConfiguration),
    FeatureAvailable(FeatureConfiguration),
    FeatureUnavailable { feature_key: String },
    FeatureValueUpdated(EffectiveFeatureValue),
    FeatureValueAvailable(EffectiveFeatureValue),
    SubscriptionError { error: String },
}

const KNOWN_KINDS: &[&str] = &[
    "state-of-the-world",
    "state-of-the-world-effective-values",
    "feature-updated",
    "feature-available",
    "feature-unavailable",
    "feature-value-updated",
    "feature-value-available",
    "subscription-error",
];

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Notification(NotificationMessage),
    /// Well-formed frame with a `kind` this SDK does not know about.
    Unknown { kind: String },
    /// Not JSON, no `kind`, or a known `kind` with the wrong shape.
    Malformed { reason: String },
}

impl InboundMessage {
    /// Decode a text frame. Never fails: problems are reported as [`InboundMessage::Malformed`].
    pub fn parse(data: &str) -> InboundMessage {
        let value: serde_json::Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(err) => {
                return InboundMessage::Malformed {
                    reason: err.to_string(),
                }
            }
        };

        let Some(kind) = value.get("kind").and_then(|kind| kind.as_str()) else {
            return InboundMessage::Malformed {
                reason: "message has no kind".to_owned(),
            };
        };

        if !KNOWN_KINDS.contains(&kind) {
            return InboundMessage::Unknown {
                kind: kind.to_owned(),
            };
        }

        match serde_json::from_value::<NotificationMessage>(value) {
            Ok(message) => InboundMessage::Notification(message),
            Err(err) => InboundMessage::Malformed {
                reason: err.to_string(),
            },
        }
    }

    /// Whether receiving this frame proves the subscription is live.
    pub(crate) fn is_live_proof(&self) -> bool {
        !matches!(self, InboundMessage::Malformed { .. })
    }
}
