//! Presence wire format.
//!
//! Every message is a JSON object `{clientId, rooms?}` published on one of the
//! `numPresent-*` channels. The channel, not the body, says what the message
//! means.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{error::ProtocolError, ids::InstanceId};

/// Prefix shared by every presence channel.
pub const CHANNEL_PREFIX: &str = "numPresent-";

const REQUEST_PREFIX: &str = "numPresent-request-full-update-";
const RESPONSE_PREFIX: &str = "numPresent-full-update-response-";

/// What a presence message means, derived from its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceKind {
    /// Sender just connected
    Start,
    /// Sender is leaving
    Stop,
    /// Heartbeat
    Ping,
    /// Incremental per-room counts
    Update,
    /// Broadcast snapshot replacing everything cached for the sender
    FullUpdate,
    /// Sender asks the recipient for a snapshot
    RequestFullUpdate,
    /// Snapshot addressed to the recipient
    FullUpdateResponse,
}

impl PresenceKind {
    /// Kinds published on channels shared by every instance.
    pub const SHARED: [Self; 5] =
        [Self::Start, Self::Stop, Self::Ping, Self::Update, Self::FullUpdate];

    /// Classify a channel as seen by instance `me`.
    ///
    /// Per-target channels addressed to another instance yield `None`.
    pub fn classify(channel: &str, me: &InstanceId) -> Option<Self> {
        let kind = match channel.strip_prefix(CHANNEL_PREFIX)? {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "ping" => Self::Ping,
            "update" => Self::Update,
            "full-update" => Self::FullUpdate,
            _ if channel.strip_prefix(REQUEST_PREFIX) == Some(me.as_str()) => {
                Self::RequestFullUpdate
            },
            _ if channel.strip_prefix(RESPONSE_PREFIX) == Some(me.as_str()) => {
                Self::FullUpdateResponse
            },
            _ => return None,
        };
        Some(kind)
    }

    /// Channel carrying this kind to `target`.
    ///
    /// `target` only matters for the per-target kinds.
    pub fn channel(self, target: &InstanceId) -> String {
        match self {
            Self::Start => format!("{CHANNEL_PREFIX}start"),
            Self::Stop => format!("{CHANNEL_PREFIX}stop"),
            Self::Ping => format!("{CHANNEL_PREFIX}ping"),
            Self::Update => format!("{CHANNEL_PREFIX}update"),
            Self::FullUpdate => format!("{CHANNEL_PREFIX}full-update"),
            Self::RequestFullUpdate => format!("{REQUEST_PREFIX}{target}"),
            Self::FullUpdateResponse => format!("{RESPONSE_PREFIX}{target}"),
        }
    }

    /// Every channel instance `me` listens on.
    pub fn subscriptions(me: &InstanceId) -> Vec<String> {
        Self::SHARED
            .iter()
            .chain(&[Self::FullUpdateResponse, Self::RequestFullUpdate])
            .map(|kind| kind.channel(me))
            .collect()
    }
}

/// Body of a presence message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMessage {
    /// Sender instance. Messages without one are ignored
    #[serde(rename = "clientId", default)]
    pub client_id: Option<InstanceId>,
    /// Absolute local counts per room (`update` and snapshots only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rooms: Option<BTreeMap<String, u64>>,
}

impl PresenceMessage {
    /// Message from `sender` with an optional room table.
    pub fn new(sender: &InstanceId, rooms: Option<BTreeMap<String, u64>>) -> Self {
        Self { client_id: Some(sender.clone()), rooms }
    }

    /// Decode a payload received on `channel`.
    pub fn decode(channel: &str, payload: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(payload).map_err(|e| ProtocolError::MalformedBusPayload {
            channel: channel.to_string(),
            reason: e.to_string(),
        })
    }

    /// Encode for the bus.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
