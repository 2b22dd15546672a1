use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use huddle_common::snowflake::snowflake_timestamp;
use huddle_common::SnowflakeGenerator;

use crate::error::ApiError;
use crate::models::group::{GroupId, GroupRecord, GroupState, MemberId};

/// The narrow view of group persistence the gateway needs.
///
/// Dispatchers call this on every join and dropout before they tell the
/// group about it, and attach `group_state` to each notification.
#[async_trait]
pub trait GroupStateService: Send + Sync {
    async fn group_state(&self, group_id: GroupId) -> Result<GroupState, ApiError>;
    async fn persist_join(&self, group_id: GroupId, member_id: MemberId) -> Result<(), ApiError>;
    async fn persist_dropout(&self, group_id: GroupId, member_id: MemberId)
        -> Result<(), ApiError>;
}

/// Full group persistence used by the admin API.
#[async_trait]
pub trait GroupStore: GroupStateService {
    async fn create_group(&self, max_active_members: Option<u32>) -> Result<GroupRecord, ApiError>;
    async fn find_group(&self, group_id: GroupId) -> Result<Option<GroupRecord>, ApiError>;
    async fn set_state(&self, group_id: GroupId, state: GroupState) -> Result<GroupRecord, ApiError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

pub struct MemoryGroupStore {
    groups: DashMap<GroupId, Mutex<GroupRecord>>,
    ids: SnowflakeGenerator,
}

impl MemoryGroupStore {
    pub fn new(node_id: u16) -> Self {
        Self {
            groups: DashMap::new(),
            ids: SnowflakeGenerator::new(node_id),
        }
    }

    fn with_group<T>(
        &self,
        group_id: GroupId,
        f: impl FnOnce(&mut GroupRecord) -> T,
    ) -> Result<T, ApiError> {
        let entry = self
            .groups
            .get(&group_id)
            .ok_or_else(|| ApiError::not_found(format!("Group {group_id} not found")))?;
        let mut record = entry.lock();
        Ok(f(&mut record))
    }
}

fn finish(record: &mut GroupRecord) {
    record.state = GroupState::Finished;
    record.ended_at = Some(Utc::now());
}

#[async_trait]
impl GroupStateService for MemoryGroupStore {
    async fn group_state(&self, group_id: GroupId) -> Result<GroupState, ApiError> {
        self.with_group(group_id, |record| record.state)
    }

    async fn persist_join(&self, group_id: GroupId, member_id: MemberId) -> Result<(), ApiError> {
        self.with_group(group_id, |record| {
            record.active_members.insert(member_id);
            record.history_members.insert(member_id);
        })
    }

    async fn persist_dropout(
        &self,
        group_id: GroupId,
        member_id: MemberId,
    ) -> Result<(), ApiError> {
        self.with_group(group_id, |record| {
            record.active_members.remove(&member_id);
            // A fixed group cannot refill, so it is over once it runs empty.
            if record.state == GroupState::Fixed && record.active_members.is_empty() {
                finish(record);
            }
        })
    }
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn create_group(&self, max_active_members: Option<u32>) -> Result<GroupRecord, ApiError> {
        if max_active_members == Some(0) {
            return Err(ApiError::bad_request("max_active_members must be at least 1"));
        }
        let raw_id = self.ids.generate();
        let created_at = snowflake_timestamp(raw_id).unwrap_or_else(Utc::now);
        let id = GroupId(raw_id);
        let record = GroupRecord::new(id, max_active_members, created_at);
        self.groups.insert(id, Mutex::new(record.clone()));
        Ok(record)
    }

    async fn find_group(&self, group_id: GroupId) -> Result<Option<GroupRecord>, ApiError> {
        Ok(self.groups.get(&group_id).map(|entry| entry.lock().clone()))
    }

    async fn set_state(&self, group_id: GroupId, state: GroupState) -> Result<GroupRecord, ApiError> {
        self.with_group(group_id, |record| {
            match (record.state, state) {
                (GroupState::Finished, GroupState::Finished) => {}
                (GroupState::Finished, _) => {
                    return Err(ApiError::conflict("A finished group cannot be reopened"));
                }
                (_, GroupState::Finished) => finish(record),
                (_, GroupState::Fixed) if record.active_members.is_empty() => finish(record),
                _ => record.state = state,
            }
            Ok(record.clone())
        })?
    }
}
