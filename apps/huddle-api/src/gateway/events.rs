//! Wire-format envelopes exchanged between group members and the gateway.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::models::group::{GroupId, GroupState, MemberId};

/// Field of an inbound message that addresses a single member.
pub const RECIPIENT: &str = "recipient";

// ---------------------------------------------------------------------------
// Member → group
// ---------------------------------------------------------------------------

/// A message sent by one member to its group.
///
/// `payload` is the member's JSON object exactly as received and is relayed
/// unchanged. `recipient` is the raw value of the `recipient` field; it is
/// only parsed into a [`MemberId`] by the dispatcher.
#[derive(Debug, Clone)]
pub struct GroupMessage {
    pub sender: MemberId,
    pub recipient: Option<String>,
    pub payload: Arc<str>,
}

impl GroupMessage {
    /// Parse a text frame from a member's connection.
    ///
    /// Anything that isn't a JSON object is answered with an error reply.
    pub fn parse(sender: MemberId, text: &str) -> Result<Self, ErrorReply> {
        let value: Value = serde_json::from_str(text)
            .map_err(|_| ErrorReply::new("Message isn't valid JSON."))?;
        let Value::Object(object) = value else {
            return Err(ErrorReply::new("Message must be a JSON object."));
        };

        let recipient = object.get(RECIPIENT).map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });

        Ok(Self {
            sender,
            recipient,
            payload: Arc::from(text),
        })
    }
}

// ---------------------------------------------------------------------------
// Group → member
// ---------------------------------------------------------------------------

/// What happened to the membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipEvent {
    Joined(MemberId),
    Dropped(MemberId),
}

impl MembershipEvent {
    pub fn member_id(&self) -> MemberId {
        match self {
            MembershipEvent::Joined(id) | MembershipEvent::Dropped(id) => *id,
        }
    }
}

/// Sent to every member whenever someone joins or drops out.
///
/// Serializes as
/// `{"joined": 1, "groupId": 9, "groupMembers": [1, 2], "groupState": "STARTED"}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipNotice {
    #[serde(flatten)]
    pub event: MembershipEvent,
    pub group_id: GroupId,
    pub group_members: Vec<MemberId>,
    /// `None` when the group store could not be reached.
    pub group_state: Option<GroupState>,
}

/// Sent back to a member whose message could not be routed.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReply {
    pub error: String,
}

impl ErrorReply {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }

    pub fn malformed_recipient(raw: &str) -> Self {
        Self::new(format!("Recipient {raw} isn't a member ID."))
    }

    pub fn unknown_recipient(member_id: MemberId) -> Self {
        Self::new(format!("Recipient {member_id} isn't member of this group."))
    }

    pub fn not_a_member() -> Self {
        Self::new("This channel isn't part of the group anymore.")
    }
}

/// Serialize an outbound envelope into a frame that can be shared between
/// many channels.
pub fn to_frame<T: Serialize>(value: &T) -> Option<Arc<str>> {
    match serde_json::to_string(value) {
        Ok(json) => Some(Arc::from(json)),
        Err(err) => {
            tracing::error!(?err, "failed to serialize group envelope");
            None
        }
    }
}
