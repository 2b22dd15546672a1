//! Per-group dispatcher: owns a group's live membership and routes messages
//! between its channels.
//!
//! Each dispatcher is a tokio task draining its own bounded mailbox one
//! message at a time. The membership map is only ever touched from that task,
//! so it needs no lock. Dispatchers of different groups run in parallel.
//!
//! Frames go out with `try_send`. A member whose queue is full is removed
//! and its channel closed, exactly like a dropout.
//!
//! A dispatcher stops itself once its last member is gone: it removes itself
//! from the [`GroupRegistry`], closes its mailbox and turns away whatever was
//! still queued. A channel whose join is turned away that way simply retries
//! against a fresh dispatcher (see [`GroupRegistry::join`]).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::db::groups::GroupStateService;
use crate::error::ApiError;
use crate::models::group::{GroupId, MemberId};

use super::channel::{Delivery, GroupChannel};
use super::events::{to_frame, ErrorReply, GroupMessage, MembershipEvent, MembershipNotice};
use super::registry::GroupRegistry;

/// Everything a dispatcher can be asked to do.
#[derive(Debug)]
pub enum DispatcherMessage {
    /// Add (or replace) a member's channel.
    Join {
        channel: GroupChannel,
        respond_to: oneshot::Sender<()>,
    },
    /// A channel went away. Ignored unless `channel_id` is the member's
    /// current channel.
    Dropout {
        member_id: MemberId,
        channel_id: Arc<str>,
    },
    /// Remove a member on behalf of the service and close its channel.
    /// Replies whether the member was connected.
    ForcedClose {
        member_id: MemberId,
        respond_to: oneshot::Sender<bool>,
    },
    /// A member's message, broadcast or addressed.
    Message {
        from: GroupChannel,
        message: GroupMessage,
    },
    /// Current member ids, ascending.
    Members {
        respond_to: oneshot::Sender<Vec<MemberId>>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle to a running dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    id: u64,
    group_id: GroupId,
    sender: mpsc::Sender<DispatcherMessage>,
}

impl DispatcherHandle {
    /// Unique per dispatcher instance, also across instances of one group.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Join `channel` to the group and wait until every member, including the
    /// new one, has been told.
    ///
    /// Fails if the dispatcher stopped before handling the join.
    pub async fn join(&self, channel: GroupChannel) -> Result<(), ApiError> {
        let (tx, rx) = oneshot::channel();
        self.send(DispatcherMessage::Join {
            channel,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| stopped())
    }

    /// Route a member's message through the group.
    pub async fn message(&self, from: GroupChannel, message: GroupMessage) -> Result<(), ApiError> {
        self.send(DispatcherMessage::Message { from, message }).await
    }

    /// Remove `member_id` and close its channel. Returns `false` if the
    /// member wasn't connected.
    ///
    /// The group store is left untouched; callers persist the drop.
    pub async fn forced_close(&self, member_id: MemberId) -> Result<bool, ApiError> {
        let (tx, rx) = oneshot::channel();
        self.send(DispatcherMessage::ForcedClose {
            member_id,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| stopped())
    }

    pub async fn members(&self) -> Result<Vec<MemberId>, ApiError> {
        let (tx, rx) = oneshot::channel();
        self.send(DispatcherMessage::Members { respond_to: tx }).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Report that a channel went away. Never waits, so it can run from
    /// `Drop`.
    pub fn dropout(&self, member_id: MemberId, channel_id: Arc<str>) {
        let msg = DispatcherMessage::Dropout {
            member_id,
            channel_id,
        };
        match self.sender.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                // Mailbox is busy; hand the dropout to a task so it still lands.
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        let sender = self.sender.clone();
                        runtime.spawn(async move {
                            let _ = sender.send(msg).await;
                        });
                    }
                    Err(_) => {
                        error!(group_id = %self.group_id, %member_id, "dropout lost: no runtime");
                    }
                }
            }
            // The dispatcher is gone, and the member with it.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    async fn send(&self, msg: DispatcherMessage) -> Result<(), ApiError> {
        self.sender.send(msg).await.map_err(|_| stopped())
    }
}

fn stopped() -> ApiError {
    ApiError::unavailable("Group dispatcher has stopped")
}

// ---------------------------------------------------------------------------
// Dispatcher task
// ---------------------------------------------------------------------------

enum Flow {
    Continue,
    Stop,
}

pub(crate) struct GroupDispatcher {
    id: u64,
    group_id: GroupId,
    members: HashMap<MemberId, GroupChannel>,
    inbox: mpsc::Receiver<DispatcherMessage>,
    registry: GroupRegistry,
    state: Arc<dyn GroupStateService>,
}

impl GroupDispatcher {
    /// Spawn a dispatcher task for `group_id` and return its handle.
    pub(crate) fn spawn(
        id: u64,
        group_id: GroupId,
        mailbox_capacity: usize,
        registry: GroupRegistry,
        state: Arc<dyn GroupStateService>,
    ) -> DispatcherHandle {
        let (sender, inbox) = mpsc::channel(mailbox_capacity.max(1));
        let dispatcher = Self {
            id,
            group_id,
            members: HashMap::new(),
            inbox,
            registry,
            state,
        };
        tokio::spawn(dispatcher.run());
        DispatcherHandle {
            id,
            group_id,
            sender,
        }
    }

    async fn run(mut self) {
        debug!(group_id = %self.group_id, dispatcher_id = self.id, "group dispatcher started");

        while let Some(msg) = self.inbox.recv().await {
            if let Flow::Stop = self.handle(msg).await {
                break;
            }
        }

        self.shutdown().await;
    }

    async fn handle(&mut self, msg: DispatcherMessage) -> Flow {
        match msg {
            DispatcherMessage::Join {
                channel,
                respond_to,
            } => {
                let lagging = self.join(channel).await;
                let _ = respond_to.send(());
                self.evict(lagging).await
            }
            DispatcherMessage::Dropout {
                member_id,
                channel_id,
            } => self.dropout(member_id, &channel_id).await,
            DispatcherMessage::ForcedClose {
                member_id,
                respond_to,
            } => self.forced_close(member_id, respond_to).await,
            DispatcherMessage::Message { from, message } => {
                let lagging = self.route(&from, message);
                self.evict(lagging).await
            }
            DispatcherMessage::Members { respond_to } => {
                let _ = respond_to.send(self.member_ids());
                Flow::Continue
            }
        }
    }

    async fn join(&mut self, channel: GroupChannel) -> Vec<MemberId> {
        let member_id = channel.member_id();
        info!(
            group_id = %self.group_id,
            %member_id,
            channel_id = channel.id(),
            "member joined group"
        );

        // A second join for the same member replaces the stored channel.
        if let Some(previous) = self.members.insert(member_id, channel) {
            debug!(
                group_id = %self.group_id,
                %member_id,
                previous_channel_id = previous.id(),
                "replaced existing channel of member"
            );
        }

        if let Err(err) = self.state.persist_join(self.group_id, member_id).await {
            error!(group_id = %self.group_id, %member_id, %err, "failed to persist join");
        }
        self.notify_all(MembershipEvent::Joined(member_id)).await
    }

    async fn dropout(&mut self, member_id: MemberId, channel_id: &str) -> Flow {
        let is_current = self
            .members
            .get(&member_id)
            .is_some_and(|current| current.id() == channel_id);

        if is_current {
            self.members.remove(&member_id);
            info!(group_id = %self.group_id, %member_id, channel_id, "member dropped out of group");

            if let Err(err) = self.state.persist_dropout(self.group_id, member_id).await {
                error!(group_id = %self.group_id, %member_id, %err, "failed to persist dropout");
            }
            let lagging = self.notify_all(MembershipEvent::Dropped(member_id)).await;
            self.evict(lagging).await;
        } else {
            debug!(group_id = %self.group_id, %member_id, channel_id, "ignoring stale dropout");
        }

        self.stop_if_empty()
    }

    async fn forced_close(&mut self, member_id: MemberId, respond_to: oneshot::Sender<bool>) -> Flow {
        let Some(channel) = self.members.remove(&member_id) else {
            let _ = respond_to.send(false);
            return Flow::Continue;
        };

        info!(
            group_id = %self.group_id,
            %member_id,
            channel_id = channel.id(),
            "closing channel of member"
        );
        channel.close();
        let lagging = self.notify_all(MembershipEvent::Dropped(member_id)).await;
        let _ = respond_to.send(true);
        self.evict(lagging).await;

        self.stop_if_empty()
    }

    /// Route a member's message. Returns the members whose queue overflowed.
    fn route(&self, from: &GroupChannel, message: GroupMessage) -> Vec<MemberId> {
        let is_member = self
            .members
            .get(&from.member_id())
            .is_some_and(|current| current.is_same(from));
        if !is_member {
            debug!(
                group_id = %self.group_id,
                sender = %message.sender,
                channel_id = from.id(),
                "message from a channel that left the group"
            );
            if let Some(frame) = to_frame(&ErrorReply::not_a_member()) {
                from.deliver(frame);
            }
            return Vec::new();
        }

        let Some(raw) = message.recipient.as_deref() else {
            let mut delivered = 0usize;
            let mut lagging = Vec::new();
            for channel in self.members.values().filter(|c| !c.is_same(from)) {
                match channel.deliver(message.payload.clone()) {
                    Delivery::Queued => delivered += 1,
                    Delivery::Lagging => lagging.push(channel.member_id()),
                    Delivery::Gone => {}
                }
            }
            debug!(
                group_id = %self.group_id,
                sender = %message.sender,
                delivered,
                "broadcast group message"
            );
            return lagging;
        };

        let reply = match raw.parse::<MemberId>() {
            Err(_) => ErrorReply::malformed_recipient(raw),
            Ok(recipient) => match self.members.get(&recipient) {
                Some(channel) => {
                    return match channel.deliver(message.payload) {
                        Delivery::Lagging => vec![recipient],
                        Delivery::Queued | Delivery::Gone => Vec::new(),
                    };
                }
                None => ErrorReply::unknown_recipient(recipient),
            },
        };

        debug!(
            group_id = %self.group_id,
            sender = %message.sender,
            error = %reply.error,
            "rejected addressed group message"
        );
        match to_frame(&reply).map(|frame| from.deliver(frame)) {
            Some(Delivery::Lagging) => vec![from.member_id()],
            _ => Vec::new(),
        }
    }

    /// Tell every member about `event`. Returns the members whose queue
    /// overflowed.
    async fn notify_all(&self, event: MembershipEvent) -> Vec<MemberId> {
        let group_state = match self.state.group_state(self.group_id).await {
            Ok(state) => Some(state),
            Err(err) => {
                error!(group_id = %self.group_id, %err, "failed to read group state");
                None
            }
        };

        let notice = MembershipNotice {
            event,
            group_id: self.group_id,
            group_members: self.member_ids(),
            group_state,
        };
        let Some(frame) = to_frame(&notice) else {
            return Vec::new();
        };

        let mut lagging = Vec::new();
        for channel in self.members.values() {
            if channel.deliver(frame.clone()) == Delivery::Lagging {
                lagging.push(channel.member_id());
            }
        }
        lagging
    }

    /// Remove members whose channel can't keep up. Each removal closes the
    /// channel and counts as a dropout.
    async fn evict(&mut self, mut lagging: Vec<MemberId>) -> Flow {
        if lagging.is_empty() {
            return Flow::Continue;
        }

        while let Some(member_id) = lagging.pop() {
            let Some(channel) = self.members.remove(&member_id) else {
                continue;
            };
            warn!(
                group_id = %self.group_id,
                %member_id,
                channel_id = channel.id(),
                "channel queue overflowed, closing it"
            );
            channel.close();

            if let Err(err) = self.state.persist_dropout(self.group_id, member_id).await {
                error!(group_id = %self.group_id, %member_id, %err, "failed to persist dropout");
            }
            lagging.extend(self.notify_all(MembershipEvent::Dropped(member_id)).await);
        }

        self.stop_if_empty()
    }

    fn stop_if_empty(&self) -> Flow {
        if self.members.is_empty() {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    fn member_ids(&self) -> Vec<MemberId> {
        let mut ids: Vec<MemberId> = self.members.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    async fn shutdown(mut self) {
        self.registry.unregister(self.group_id, self.id);
        self.inbox.close();

        // Turn away whatever raced the shutdown. Dropping a join's reply
        // makes the joining channel retry against a fresh dispatcher.
        while let Some(msg) = self.inbox.recv().await {
            match msg {
                DispatcherMessage::Join { channel, .. } => {
                    debug!(
                        group_id = %self.group_id,
                        member_id = %channel.member_id(),
                        "join raced dispatcher shutdown"
                    );
                }
                DispatcherMessage::ForcedClose { respond_to, .. } => {
                    let _ = respond_to.send(false);
                }
                DispatcherMessage::Members { respond_to } => {
                    let _ = respond_to.send(Vec::new());
                }
                DispatcherMessage::Dropout { .. } | DispatcherMessage::Message { .. } => {}
            }
        }

        info!(group_id = %self.group_id, dispatcher_id = self.id, "group dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use tokio::time::timeout;

    use super::super::channel::DropoutGuard;
    use super::*;
    use crate::models::group::GroupState;

    const GROUP: GroupId = GroupId(77);

    /// Records every persistence call in order.
    #[derive(Default)]
    struct RecordingState {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingState {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl GroupStateService for RecordingState {
        async fn group_state(&self, _group_id: GroupId) -> Result<GroupState, ApiError> {
            Ok(GroupState::Started)
        }

        async fn persist_join(&self, _group_id: GroupId, member_id: MemberId) -> Result<(), ApiError> {
            self.calls.lock().push(format!("join {member_id}"));
            Ok(())
        }

        async fn persist_dropout(
            &self,
            _group_id: GroupId,
            member_id: MemberId,
        ) -> Result<(), ApiError> {
            self.calls.lock().push(format!("dropout {member_id}"));
            Ok(())
        }
    }

    struct Member {
        channel: GroupChannel,
        rx: mpsc::Receiver<Arc<str>>,
    }

    impl Member {
        fn new(id: u64) -> Self {
            Self::with_queue(id, 32)
        }

        fn with_queue(id: u64, capacity: usize) -> Self {
            let (tx, rx) = mpsc::channel(capacity);
            Self {
                channel: GroupChannel::new(MemberId(id), tx),
                rx,
            }
        }

        async fn next_json(&mut self) -> Value {
            let frame = timeout(Duration::from_secs(2), self.rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("channel closed");
            serde_json::from_str(&frame).unwrap()
        }

        fn assert_idle(&mut self) {
            assert!(self.rx.try_recv().is_err(), "unexpected event for member");
        }

        fn send(&self, handle: &DispatcherHandle, text: &str) -> impl std::future::Future<Output = ()> {
            let handle = handle.clone();
            let from = self.channel.clone();
            let message = GroupMessage::parse(from.member_id(), text).unwrap();
            async move { handle.message(from, message).await.unwrap() }
        }
    }

    fn setup() -> (GroupRegistry, Arc<RecordingState>) {
        let state = Arc::new(RecordingState::default());
        (GroupRegistry::new(state.clone(), 16), state)
    }

    async fn joined(registry: &GroupRegistry, member: &Member) -> DispatcherHandle {
        registry.join(GROUP, member.channel.clone()).await.unwrap()
    }

    async fn wait_until_unregistered(registry: &GroupRegistry) {
        timeout(Duration::from_secs(2), async {
            while registry.get(GROUP).is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("dispatcher was not unregistered");
    }

    #[tokio::test]
    async fn join_notifies_all_members() {
        let (registry, state) = setup();
        let mut one = Member::new(1);
        let mut two = Member::new(2);

        joined(&registry, &one).await;
        let notice = one.next_json().await;
        assert_eq!(notice, json!({"joined": 1, "groupId": 77, "groupMembers": [1], "groupState": "STARTED"}));

        joined(&registry, &two).await;
        for member in [&mut one, &mut two] {
            let notice = member.next_json().await;
            assert_eq!(notice["joined"], 2);
            assert_eq!(notice["groupMembers"], json!([1, 2]));
        }
        assert_eq!(state.calls(), vec!["join 1", "join 2"]);
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_but_sender() {
        let (registry, _state) = setup();
        let mut members: Vec<Member> = (1..=3).map(Member::new).collect();
        let mut handle = None;
        for m in &members {
            handle = Some(joined(&registry, m).await);
        }
        let handle = handle.unwrap();
        for m in members.iter_mut() {
            while m.rx.try_recv().is_ok() {}
        }

        members[0].send(&handle, r#"{"text":"X"}"#).await;
        let _ = handle.members().await.unwrap();

        for m in members.iter_mut().skip(1) {
            assert_eq!(m.next_json().await, json!({"text": "X"}));
            m.assert_idle();
        }
        members[0].assert_idle();
    }

    #[tokio::test]
    async fn addressed_message_reaches_only_recipient() {
        let (registry, _state) = setup();
        let mut members: Vec<Member> = (1..=3).map(Member::new).collect();
        let mut handle = None;
        for m in &members {
            handle = Some(joined(&registry, m).await);
        }
        let handle = handle.unwrap();
        for m in members.iter_mut() {
            while m.rx.try_recv().is_ok() {}
        }

        members[0].send(&handle, r#"{"recipient":"2","text":"psst"}"#).await;
        let _ = handle.members().await.unwrap();

        assert_eq!(members[1].next_json().await, json!({"recipient": "2", "text": "psst"}));
        members[0].assert_idle();
        members[2].assert_idle();
    }

    #[tokio::test]
    async fn unknown_or_malformed_recipient_yields_one_error() {
        let (registry, _state) = setup();
        let mut one = Member::new(1);
        let mut two = Member::new(2);
        joined(&registry, &one).await;
        let handle = joined(&registry, &two).await;
        while one.rx.try_recv().is_ok() {}
        while two.rx.try_recv().is_ok() {}

        one.send(&handle, r#"{"recipient":9,"text":"?"}"#).await;
        assert_eq!(one.next_json().await, json!({"error": "Recipient 9 isn't member of this group."}));

        one.send(&handle, r#"{"recipient":"bob"}"#).await;
        assert_eq!(one.next_json().await, json!({"error": "Recipient bob isn't a member ID."}));

        let _ = handle.members().await.unwrap();
        one.assert_idle();
        two.assert_idle();
    }

    #[tokio::test]
    async fn dropout_notifies_remaining_and_last_dropout_stops_dispatcher() {
        let (registry, state) = setup();
        let one = Member::new(1);
        let mut two = Member::new(2);
        joined(&registry, &one).await;
        let handle = joined(&registry, &two).await;
        while two.rx.try_recv().is_ok() {}

        handle.dropout(MemberId(1), Arc::from(one.channel.id()));
        let notice = two.next_json().await;
        assert_eq!(notice["dropped"], 1);
        assert_eq!(notice["groupMembers"], json!([2]));
        assert_eq!(handle.members().await.unwrap(), vec![MemberId(2)]);

        handle.dropout(MemberId(2), Arc::from(two.channel.id()));
        wait_until_unregistered(&registry).await;
        assert_eq!(state.calls(), vec!["join 1", "join 2", "dropout 1", "dropout 2"]);

        // A fresh dispatcher starts out empty.
        let fresh = registry.get_or_create(GROUP);
        assert_ne!(fresh.id(), handle.id());
        assert!(fresh.members().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_and_repeated_dropouts_are_ignored() {
        let (registry, state) = setup();
        let mut one = Member::new(1);
        let two = Member::new(2);
        let handle = joined(&registry, &one).await;
        joined(&registry, &two).await;

        // A dropout from a channel that isn't the member's current one.
        handle.dropout(MemberId(2), Arc::from("gch_stale"));
        assert_eq!(handle.members().await.unwrap(), vec![MemberId(1), MemberId(2)]);

        handle.dropout(MemberId(2), Arc::from(two.channel.id()));
        handle.dropout(MemberId(2), Arc::from(two.channel.id()));
        assert_eq!(handle.members().await.unwrap(), vec![MemberId(1)]);

        while one.rx.try_recv().is_ok() {}
        let _ = handle.members().await.unwrap();
        one.assert_idle();
        assert_eq!(state.calls(), vec!["join 1", "join 2", "dropout 2"]);
    }

    #[tokio::test]
    async fn rejoin_replaces_channel_and_old_dropout_is_stale() {
        let (registry, _state) = setup();
        let first = Member::new(1);
        let other = Member::new(2);
        let handle = joined(&registry, &first).await;
        joined(&registry, &other).await;

        let second = Member::new(1);
        joined(&registry, &second).await;
        assert_eq!(handle.members().await.unwrap(), vec![MemberId(1), MemberId(2)]);

        handle.dropout(MemberId(1), Arc::from(first.channel.id()));
        assert_eq!(handle.members().await.unwrap(), vec![MemberId(1), MemberId(2)]);
    }

    #[tokio::test]
    async fn forced_close_closes_channel_without_persisting() {
        let (registry, state) = setup();
        let mut one = Member::new(1);
        let mut two = Member::new(2);
        joined(&registry, &one).await;
        let handle = joined(&registry, &two).await;
        while one.rx.try_recv().is_ok() {}
        while two.rx.try_recv().is_ok() {}

        assert!(handle.forced_close(MemberId(2)).await.unwrap());
        assert!(two.channel.is_closing());
        two.assert_idle();
        assert_eq!(one.next_json().await["dropped"], 2);
        assert!(!handle.forced_close(MemberId(2)).await.unwrap());
        assert_eq!(state.calls(), vec!["join 1", "join 2"]);
    }

    #[tokio::test]
    async fn forced_close_of_last_member_stops_dispatcher() {
        let (registry, _state) = setup();
        let one = Member::new(1);
        let handle = joined(&registry, &one).await;

        assert!(handle.forced_close(MemberId(1)).await.unwrap());
        wait_until_unregistered(&registry).await;
        assert!(one.channel.is_closing());
        assert!(handle.members().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn forced_close_reaches_member_with_full_queue() {
        let (registry, _state) = setup();
        let mut one = Member::new(1);
        let two = Member::with_queue(2, 1);
        joined(&registry, &one).await;
        // Member 2's queue now holds its own joined notice and is full.
        let handle = joined(&registry, &two).await;
        while one.rx.try_recv().is_ok() {}

        assert!(handle.forced_close(MemberId(2)).await.unwrap());
        assert!(two.channel.is_closing());
        assert_eq!(one.next_json().await["dropped"], 2);

        // Whatever the closed channel still sends never reaches the group.
        two.send(&handle, r#"{"text":"ghost"}"#).await;
        assert_eq!(handle.members().await.unwrap(), vec![MemberId(1)]);
        one.assert_idle();
    }

    #[tokio::test]
    async fn replaced_channel_cannot_message_group() {
        let (registry, _state) = setup();
        let mut first = Member::new(1);
        let mut other = Member::new(2);
        joined(&registry, &first).await;
        joined(&registry, &other).await;
        let mut second = Member::new(1);
        let handle = joined(&registry, &second).await;
        while first.rx.try_recv().is_ok() {}
        while other.rx.try_recv().is_ok() {}
        while second.rx.try_recv().is_ok() {}

        first.send(&handle, r#"{"text":"X"}"#).await;
        let _ = handle.members().await.unwrap();

        assert_eq!(
            first.next_json().await,
            json!({"error": "This channel isn't part of the group anymore."})
        );
        second.assert_idle();
        other.assert_idle();
    }

    #[tokio::test]
    async fn overflowing_member_is_dropped_out() {
        let (registry, state) = setup();
        let mut one = Member::new(1);
        let two = Member::with_queue(2, 1);
        joined(&registry, &one).await;
        let handle = joined(&registry, &two).await;
        while one.rx.try_recv().is_ok() {}

        // Member 2 never drains its queue, so the broadcast can't be queued.
        one.send(&handle, r#"{"text":"X"}"#).await;

        let notice = one.next_json().await;
        assert_eq!(notice["dropped"], 2);
        assert_eq!(notice["groupMembers"], json!([1]));
        assert!(two.channel.is_closing());
        assert_eq!(handle.members().await.unwrap(), vec![MemberId(1)]);
        assert_eq!(state.calls(), vec!["join 1", "join 2", "dropout 2"]);
    }

    #[tokio::test]
    async fn dropout_guard_fires_once() {
        let (registry, state) = setup();
        let one = Member::new(1);
        let mut two = Member::new(2);
        let handle = joined(&registry, &one).await;
        joined(&registry, &two).await;
        while two.rx.try_recv().is_ok() {}

        let guard = DropoutGuard::new(handle.clone(), &one.channel);
        drop(guard);
        assert_eq!(two.next_json().await["dropped"], 1);

        let mut disarmed = DropoutGuard::new(handle.clone(), &two.channel);
        disarmed.disarm();
        drop(disarmed);
        assert_eq!(handle.members().await.unwrap(), vec![MemberId(2)]);
        assert_eq!(state.calls(), vec!["join 1", "join 2", "dropout 1"]);
    }
}
