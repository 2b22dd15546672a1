//! Process-wide directory of live group dispatchers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::db::groups::GroupStateService;
use crate::error::ApiError;
use crate::models::group::GroupId;

use super::channel::GroupChannel;
use super::dispatcher::{DispatcherHandle, GroupDispatcher};

/// How often a join is retried when it races a stopping dispatcher.
const JOIN_ATTEMPTS: usize = 3;

struct RegistryInner {
    dispatchers: DashMap<GroupId, DispatcherHandle>,
    state: Arc<dyn GroupStateService>,
    mailbox_capacity: usize,
    next_dispatcher_id: AtomicU64,
}

/// Maps group ids to their running dispatcher.
///
/// Dispatchers are created on demand and remove themselves when their group
/// runs empty. `DashMap`'s entry API makes creation atomic, so concurrent
/// callers for one group always end up with the same dispatcher.
#[derive(Clone)]
pub struct GroupRegistry {
    inner: Arc<RegistryInner>,
}

impl GroupRegistry {
    pub fn new(state: Arc<dyn GroupStateService>, mailbox_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                dispatchers: DashMap::new(),
                state,
                mailbox_capacity,
                next_dispatcher_id: AtomicU64::new(1),
            }),
        }
    }

    /// Return the group's dispatcher, starting one if none is running.
    pub fn get_or_create(&self, group_id: GroupId) -> DispatcherHandle {
        self.inner
            .dispatchers
            .entry(group_id)
            .or_insert_with(|| {
                let id = self.inner.next_dispatcher_id.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%group_id, dispatcher_id = id, "starting group dispatcher");
                GroupDispatcher::spawn(
                    id,
                    group_id,
                    self.inner.mailbox_capacity,
                    self.clone(),
                    self.inner.state.clone(),
                )
            })
            .clone()
    }

    /// Look up a running dispatcher without starting one.
    pub fn get(&self, group_id: GroupId) -> Option<DispatcherHandle> {
        self.inner
            .dispatchers
            .get(&group_id)
            .map(|entry| entry.value().clone())
    }

    /// Join `channel` to its group, retrying against a fresh dispatcher if the
    /// current one stopped before it could take the join.
    pub async fn join(
        &self,
        group_id: GroupId,
        channel: GroupChannel,
    ) -> Result<DispatcherHandle, ApiError> {
        let mut last_err = None;
        for attempt in 1..=JOIN_ATTEMPTS {
            let dispatcher = self.get_or_create(group_id);
            match dispatcher.join(channel.clone()).await {
                Ok(()) => return Ok(dispatcher),
                Err(err) => {
                    tracing::debug!(
                        %group_id,
                        member_id = %channel.member_id(),
                        attempt,
                        "join raced a stopping dispatcher, retrying"
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ApiError::unavailable("Group dispatcher unavailable")))
    }

    /// Remove the mapping for `group_id`, but only if it still points at
    /// dispatcher `dispatcher_id`. A newer dispatcher for the same group is
    /// left alone.
    pub fn unregister(&self, group_id: GroupId, dispatcher_id: u64) -> bool {
        self.inner
            .dispatchers
            .remove_if(&group_id, |_, handle| handle.id() == dispatcher_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.dispatchers.is_empty()
    }
}
