//! Fan-out to a room's members with non-blocking backpressure.
//!
//! A message is serialized once and the resulting [`Payload`] is shared by
//! every recipient. Each member has a bounded outbound queue; enqueueing never
//! waits. A member whose queue is full is treated as unresponsive and evicted,
//! so one slow consumer never delays the sender or the rest of the room.
//!
//! Evictions are reported in the returned [`FanOut`]; announcing them to the
//! room is the presence tracker's job.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::protocol::{Envelope, Payload, ProtocolError, UserId};
use crate::registry::{DocumentSnapshot, FanOut, SessionRegistry};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Payloads handed to the engine (one per fan-out or reply)
    pub messages_sent: u64,
    /// Individual enqueues that succeeded
    pub deliveries: u64,
    /// Members removed for overflowing their queue
    pub evictions: u64,
}

/// Atomic broadcast stats, so the hot path takes no extra lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    deliveries: AtomicU64,
    evictions: AtomicU64,
}

/// Room fan-out over the session registry.
#[derive(Clone)]
pub struct BroadcastEngine {
    registry: Arc<SessionRegistry>,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastEngine {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Serialize `msg` once and enqueue it for every member of `doc_id`
    /// except `exclude`.
    pub async fn broadcast(
        &self,
        doc_id: &str,
        msg: &Envelope,
        exclude: Option<&UserId>,
    ) -> Result<FanOut, ProtocolError> {
        let payload = msg.encode()?;
        Ok(self.broadcast_raw(doc_id, payload, exclude).await)
    }

    /// Fan out an already serialized payload.
    pub async fn broadcast_raw(&self, doc_id: &str, payload: Payload, exclude: Option<&UserId>) -> FanOut {
        let fan_out = self.registry.fan_out(doc_id, &payload, exclude).await;
        self.record(&fan_out);
        fan_out
    }

    /// Apply a document update and fan out `payload` atomically with it.
    pub async fn broadcast_update<F>(
        &self,
        doc_id: &str,
        update: F,
        payload: Payload,
        exclude: Option<&UserId>,
    ) -> FanOut
    where
        F: FnOnce(&mut DocumentSnapshot),
    {
        let fan_out = self
            .registry
            .update_and_fan_out(doc_id, update, &payload, exclude)
            .await;
        self.record(&fan_out);
        fan_out
    }

    /// Send the room's current member list to the whole room.
    pub async fn broadcast_members(&self, doc_id: &str) -> Result<FanOut, ProtocolError> {
        let fan_out = self.registry.fan_out_members(doc_id).await?;
        if fan_out.delivered > 0 || !fan_out.evicted.is_empty() {
            self.record(&fan_out);
        }
        Ok(fan_out)
    }

    /// Reply to a single member.
    pub async fn send_to(&self, user_id: &UserId, msg: &Envelope) -> Result<FanOut, ProtocolError> {
        let payload = msg.encode()?;
        let fan_out = self.registry.deliver(user_id, &payload).await;
        self.record(&fan_out);
        Ok(fan_out)
    }

    fn record(&self, fan_out: &FanOut) {
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .deliveries
            .fetch_add(fan_out.delivered as u64, Ordering::Relaxed);
        if !fan_out.evicted.is_empty() {
            self.stats
                .evictions
                .fetch_add(fan_out.evicted.len() as u64, Ordering::Relaxed);
            for departure in &fan_out.evicted {
                log::warn!(
                    "Evicted unresponsive member {} ({}) from doc {}: outbound queue overflow",
                    departure.username,
                    departure.user_id,
                    departure.doc_id
                );
            }
        }
    }

    /// Lock-free snapshot of the counters.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use crate::registry::Member;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    async fn join(
        registry: &SessionRegistry,
        doc: &str,
        name: &str,
        capacity: usize,
    ) -> (UserId, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = Uuid::new_v4();
        registry.join(Member::new(id, name, doc, tx)).await.unwrap();
        (id, rx)
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_n_minus_one() {
        let registry = Arc::new(SessionRegistry::new());
        let engine = BroadcastEngine::new(registry.clone());

        let (alice, mut rx_a) = join(&registry, "d1", "Alice", 16).await;
        let (_bob, mut rx_b) = join(&registry, "d1", "Bob", 16).await;
        let (_carol, mut rx_c) = join(&registry, "d1", "Carol", 16).await;

        let msg = Envelope::rename("Notes", alice);
        let fan_out = engine.broadcast("d1", &msg, Some(&alice)).await.unwrap();
        assert_eq!(fan_out.delivered, 2);

        assert!(rx_a.try_recv().is_err());
        let from_b = Envelope::decode(&rx_b.recv().await.unwrap()).unwrap();
        let from_c = Envelope::decode(&rx_c.recv().await.unwrap()).unwrap();
        assert_eq!(from_b.message_kind(), Some(MessageKind::Rename));
        assert_eq!(from_b, from_c);
    }

    #[tokio::test]
    async fn test_payload_shared_not_reserialized() {
        let registry = Arc::new(SessionRegistry::new());
        let engine = BroadcastEngine::new(registry.clone());
        let (_a, mut rx_a) = join(&registry, "d1", "Alice", 4).await;
        let (_b, mut rx_b) = join(&registry, "d1", "Bob", 4).await;

        let payload = Payload::from(r#"{"type":"cursor_position","position":3}"#);
        engine.broadcast_raw("d1", payload.clone(), None).await;

        let got_a = rx_a.recv().await.unwrap();
        let got_b = rx_b.recv().await.unwrap();
        // Same buffer, not a copy
        assert_eq!(got_a.as_str().as_ptr(), payload.as_str().as_ptr());
        assert_eq!(got_b.as_str().as_ptr(), payload.as_str().as_ptr());
    }

    #[tokio::test]
    async fn test_slow_member_evicted_others_unaffected() {
        let registry = Arc::new(SessionRegistry::new());
        let engine = BroadcastEngine::new(registry.clone());

        let (slow, _slow_rx) = join(&registry, "d1", "Slow", 2).await;
        let (fast, mut fast_rx) = join(&registry, "d1", "Fast", 64).await;

        let mut evicted = Vec::new();
        for i in 0..10 {
            let payload = Payload::from(format!("{{\"n\":{i}}}"));
            evicted.extend(engine.broadcast_raw("d1", payload, None).await.evicted);
        }

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].user_id, slow);
        assert!(!registry.contains(&slow).await);
        assert!(registry.contains(&fast).await);

        for i in 0..10 {
            assert_eq!(&*fast_rx.recv().await.unwrap(), format!("{{\"n\":{i}}}"));
        }

        let stats = engine.stats();
        assert_eq!(stats.messages_sent, 10);
        assert_eq!(stats.evictions, 1);
        // Slow accepted two payloads before overflowing
        assert_eq!(stats.deliveries, 12);
    }

    #[tokio::test]
    async fn test_send_to_only_reaches_target() {
        let registry = Arc::new(SessionRegistry::new());
        let engine = BroadcastEngine::new(registry.clone());
        let (alice, mut rx_a) = join(&registry, "d1", "Alice", 4).await;
        let (_bob, mut rx_b) = join(&registry, "d1", "Bob", 4).await;

        let fan_out = engine.send_to(&alice, &Envelope::save_success()).await.unwrap();
        assert_eq!(fan_out.delivered, 1);

        let reply = Envelope::decode(&rx_a.recv().await.unwrap()).unwrap();
        assert_eq!(reply.message_kind(), Some(MessageKind::SaveSuccess));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_to_unknown_room_is_noop() {
        let registry = Arc::new(SessionRegistry::new());
        let engine = BroadcastEngine::new(registry);
        let fan_out = engine
            .broadcast("nowhere", &Envelope::save_success(), None)
            .await
            .unwrap();
        assert_eq!(fan_out.delivered, 0);
        assert!(fan_out.evicted.is_empty());
    }
}
