use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Identifier of a group. Stable for the group's lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct GroupId(pub u64);

/// Identifier of one participating session. Survives reconnects.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct MemberId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MemberId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(MemberId)
    }
}

/// Lifecycle of a group as computed by the group store.
///
/// The gateway relays this value verbatim and never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupState {
    /// Open for new members.
    Started,
    /// No new members; current members may still reconnect.
    Fixed,
    /// Closed for good.
    Finished,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GroupState::Started => "STARTED",
            GroupState::Fixed => "FIXED",
            GroupState::Finished => "FINISHED",
        };
        f.write_str(s)
    }
}

/// Durable membership and lifecycle record of a group.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct GroupRecord {
    pub id: GroupId,
    pub state: GroupState,
    pub max_active_members: Option<u32>,
    /// Members currently taking part.
    #[schema(value_type = Vec<u64>)]
    pub active_members: BTreeSet<MemberId>,
    /// Everyone who has ever joined, including active members.
    #[schema(value_type = Vec<u64>)]
    pub history_members: BTreeSet<MemberId>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl GroupRecord {
    pub fn new(id: GroupId, max_active_members: Option<u32>, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            state: GroupState::Started,
            max_active_members,
            active_members: BTreeSet::new(),
            history_members: BTreeSet::new(),
            created_at,
            ended_at: None,
        }
    }

    /// Whether `member_id` may open a channel into this group.
    ///
    /// Active members may always reconnect. Newcomers need a STARTED group
    /// with room left.
    pub fn admits(&self, member_id: MemberId) -> bool {
        if self.active_members.contains(&member_id) {
            return self.state != GroupState::Finished;
        }
        match self.state {
            GroupState::Started => match self.max_active_members {
                Some(max) => self.active_members.len() < max as usize,
                None => true,
            },
            GroupState::Fixed | GroupState::Finished => false,
        }
    }
}
