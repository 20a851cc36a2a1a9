//! Room presence: who is in a document, and transitions as they happen.
//!
//! Every membership or display-name change produces two kinds of traffic:
//!
//! - a single-member event (`user_joined` / `user_left`) so clients can show
//!   a transient notice without diffing;
//! - a full `users_list` snapshot for the whole room, never a diff. The list
//!   is read and enqueued under the registry lock, so under concurrent joins
//!   and leaves the last snapshot a member receives is the live membership.
//!
//! Announcing a departure is itself a broadcast and may evict further
//! overflowing members. [`PresenceTracker::settle`] drains those cascades with
//! a worklist until the room is quiet.

use std::collections::VecDeque;

use crate::broadcast::BroadcastEngine;
use crate::protocol::{Envelope, ProtocolError, UserId};
use crate::registry::{Departure, FanOut};

#[derive(Clone)]
pub struct PresenceTracker {
    engine: BroadcastEngine,
}

impl PresenceTracker {
    pub fn new(engine: BroadcastEngine) -> Self {
        Self { engine }
    }

    /// Announce a new member to the rest of the room, then resend the roster.
    pub async fn announce_join(&self, doc_id: &str, user_id: UserId, username: &str) -> Result<(), ProtocolError> {
        let joined = Envelope::user_joined(user_id, username);
        let fan_out = self.engine.broadcast(doc_id, &joined, Some(&user_id)).await?;
        self.settle(fan_out).await?;
        self.publish_members(doc_id).await
    }

    /// Announce a display-name change: roster first, then a re-announcement.
    pub async fn announce_rename(&self, doc_id: &str, user_id: UserId, username: &str) -> Result<(), ProtocolError> {
        self.publish_members(doc_id).await?;
        let joined = Envelope::user_joined(user_id, username);
        let fan_out = self.engine.broadcast(doc_id, &joined, Some(&user_id)).await?;
        self.settle(fan_out).await
    }

    /// Announce a member that has already been removed from the registry.
    pub async fn announce_leave(&self, departure: Departure) -> Result<(), ProtocolError> {
        self.settle(FanOut::from_evictions(vec![departure])).await
    }

    /// Broadcast the full member list of `doc_id` to the whole room.
    pub async fn publish_members(&self, doc_id: &str) -> Result<(), ProtocolError> {
        let fan_out = self.engine.broadcast_members(doc_id).await?;
        self.settle(fan_out).await
    }

    /// Announce every departure in `fan_out`, including members evicted by
    /// the announcements themselves.
    pub async fn settle(&self, fan_out: FanOut) -> Result<(), ProtocolError> {
        let mut pending: VecDeque<Departure> = fan_out.evicted.into();
        while let Some(departure) = pending.pop_front() {
            log::info!(
                "User {} ({}) left doc {}",
                departure.username,
                departure.user_id,
                departure.doc_id
            );
            if departure.room_empty {
                continue;
            }

            let left = Envelope::user_left(departure.user_id, &departure.username);
            let fan_out = self
                .engine
                .broadcast(&departure.doc_id, &left, Some(&departure.user_id))
                .await?;
            pending.extend(fan_out.evicted);

            let fan_out = self.engine.broadcast_members(&departure.doc_id).await?;
            pending.extend(fan_out.evicted);
        }
        Ok(())
    }
}
