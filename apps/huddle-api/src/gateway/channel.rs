//! Per-connection group channel: the dispatcher's handle to one member's
//! connection, and the guard that reports the connection's end.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use huddle_common::id::{prefix, prefixed_ulid};

use crate::models::group::MemberId;

use super::dispatcher::DispatcherHandle;

/// Outcome of queueing a frame on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The connection isn't draining its queue fast enough.
    Lagging,
    /// The connection task is gone.
    Gone,
}

/// Cheap, cloneable handle to one live connection.
///
/// Two handles are the same channel only if they share an id; a member that
/// reconnects gets a new channel with a new id.
///
/// Frames travel through a bounded queue. The close instruction doesn't: it
/// is a cancellation token, so it reaches the connection even when the queue
/// is full.
#[derive(Debug, Clone)]
pub struct GroupChannel {
    id: Arc<str>,
    member_id: MemberId,
    tx: mpsc::Sender<Arc<str>>,
    closing: CancellationToken,
}

impl GroupChannel {
    pub fn new(member_id: MemberId, tx: mpsc::Sender<Arc<str>>) -> Self {
        Self {
            id: Arc::from(prefixed_ulid(prefix::CHANNEL)),
            member_id,
            tx,
            closing: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    pub fn is_same(&self, other: &GroupChannel) -> bool {
        self.id == other.id
    }

    /// Queue a frame for the connection without waiting.
    pub fn deliver(&self, frame: Arc<str>) -> Delivery {
        match self.tx.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Lagging,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Gone,
        }
    }

    /// Tell the connection to close itself. Idempotent.
    pub fn close(&self) {
        self.closing.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) was called on any clone.
    pub async fn closed(&self) {
        self.closing.cancelled().await
    }
}

/// Reports a channel's departure to its dispatcher exactly once.
///
/// Dropping the guard sends the dropout, so it also fires when the
/// connection task is cancelled. A channel the dispatcher already removed
/// (forced close) disarms the guard instead.
pub struct DropoutGuard {
    dispatcher: Option<DispatcherHandle>,
    member_id: MemberId,
    channel_id: Arc<str>,
}

impl DropoutGuard {
    pub fn new(dispatcher: DispatcherHandle, channel: &GroupChannel) -> Self {
        Self {
            dispatcher: Some(dispatcher),
            member_id: channel.member_id,
            channel_id: channel.id.clone(),
        }
    }

    pub fn disarm(&mut self) {
        self.dispatcher = None;
    }
}

impl Drop for DropoutGuard {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.dropout(self.member_id, self.channel_id.clone());
        }
    }
}
