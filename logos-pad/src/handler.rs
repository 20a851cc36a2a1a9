//! Inbound message dispatch.
//!
//! One call to [`ProtocolHandler::handle`] per received text frame, in arrival
//! order for a given connection. The handler decodes the frame, stamps the
//! server-owned fields, mutates the registry and triggers the resulting
//! broadcasts or replies.
//!
//! | kind              | state change           | outbound                          |
//! |-------------------|------------------------|-----------------------------------|
//! | `username_change` | display name           | `users_list` + `user_joined`      |
//! | `text_change`     | content (whole value)  | relay to room, sender excluded    |
//! | `cursor_position` | none                   | relay to room, sender excluded    |
//! | `save`            | content, if non-empty  | `save_success` to sender          |
//! | `rename`          | title, if non-empty    | `rename` to room, sender included |
//! | anything else     | none                   | `error` to sender                 |
//!
//! Concurrent `text_change`s from different connections are not merged: the
//! last one applied by the registry is the stored content. Content and title
//! updates are stored and fanned out under one registry lock, so every peer
//! receives edits in the order they were stored.

use std::sync::Arc;

use crate::broadcast::BroadcastEngine;
use crate::presence::PresenceTracker;
use crate::protocol::{now_millis, ClientMessage, DocId, Envelope, Inbound, ProtocolError, UserId};
use crate::registry::SessionRegistry;

/// Identity of the connection a frame arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub doc_id: DocId,
}

impl Session {
    pub fn new(user_id: UserId, doc_id: impl Into<DocId>) -> Self {
        Self {
            user_id,
            doc_id: doc_id.into(),
        }
    }
}

#[derive(Clone)]
pub struct ProtocolHandler {
    registry: Arc<SessionRegistry>,
    engine: BroadcastEngine,
    presence: PresenceTracker,
}

impl ProtocolHandler {
    pub fn new(engine: BroadcastEngine, presence: PresenceTracker) -> Self {
        Self {
            registry: engine.registry().clone(),
            engine,
            presence,
        }
    }

    /// Process one inbound text frame.
    ///
    /// Malformed frames return an error and change nothing; the caller keeps
    /// the connection open. Frames from a session that is no longer
    /// registered (evicted, closing) are ignored.
    pub async fn handle(&self, session: &Session, text: &str) -> Result<(), ProtocolError> {
        let Inbound { message, raw } = Inbound::decode(text)?;

        let Some(mut username) = self.registry.display_name(&session.user_id).await else {
            log::debug!("Ignoring frame from unregistered user {}", session.user_id);
            return Ok(());
        };

        match message {
            ClientMessage::UsernameChange { username: requested } => {
                if !requested.is_empty() {
                    self.registry.rename_member(&session.user_id, requested.clone()).await;
                    username = requested;
                }
                log::debug!("User {} is now known as {username:?}", session.user_id);
                self.presence
                    .announce_rename(&session.doc_id, session.user_id, &username)
                    .await?;
            }

            ClientMessage::TextChange { content } => {
                let payload = raw.stamp(session.user_id, &username, now_millis())?;
                let fan_out = self
                    .engine
                    .broadcast_update(
                        &session.doc_id,
                        |doc| doc.content = content,
                        payload,
                        Some(&session.user_id),
                    )
                    .await;
                self.presence.settle(fan_out).await?;
            }

            ClientMessage::CursorPosition => {
                log::trace!("Cursor update from {} in doc {}", session.user_id, session.doc_id);
                let payload = raw.stamp(session.user_id, &username, now_millis())?;
                let fan_out = self
                    .engine
                    .broadcast_raw(&session.doc_id, payload, Some(&session.user_id))
                    .await;
                self.presence.settle(fan_out).await?;
            }

            ClientMessage::Save { content } => {
                if !content.is_empty() {
                    self.registry.update_content(&session.doc_id, content).await;
                }
                let fan_out = self
                    .engine
                    .send_to(&session.user_id, &Envelope::save_success())
                    .await?;
                self.presence.settle(fan_out).await?;
            }

            ClientMessage::Rename { title } => {
                if title.is_empty() {
                    return Ok(());
                }
                log::info!("Doc {} renamed to {title:?} by {}", session.doc_id, session.user_id);
                let payload = Envelope::rename(&title, session.user_id).encode()?;
                let fan_out = self
                    .engine
                    .broadcast_update(&session.doc_id, |doc| doc.title = title, payload, None)
                    .await;
                self.presence.settle(fan_out).await?;
            }

            ClientMessage::Unknown(kind) => {
                log::debug!("Unknown message type {kind:?} from {}", session.user_id);
                let fan_out = self
                    .engine
                    .send_to(&session.user_id, &Envelope::error("unknown message type"))
                    .await?;
                self.presence.settle(fan_out).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageKind, Payload};
    use crate::registry::Member;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct Room {
        registry: Arc<SessionRegistry>,
        handler: ProtocolHandler,
    }

    impl Room {
        fn new() -> Self {
            let registry = Arc::new(SessionRegistry::new());
            let engine = BroadcastEngine::new(registry.clone());
            let presence = PresenceTracker::new(engine.clone());
            Self {
                registry,
                handler: ProtocolHandler::new(engine, presence),
            }
        }

        async fn join(&self, doc: &str, name: &str) -> (Session, mpsc::Receiver<Payload>) {
            let (tx, rx) = mpsc::channel(64);
            let id = Uuid::new_v4();
            self.registry.join(Member::new(id, name, doc, tx)).await.unwrap();
            (Session::new(id, doc), rx)
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Payload>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            out.push(serde_json::from_str(&payload).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_text_change_relayed_to_others_only() {
        let room = Room::new();
        let (alice, mut rx_a) = room.join("d1", "Alice").await;
        let (_bob, mut rx_b) = room.join("d1", "Bob").await;
        let (_carol, mut rx_c) = room.join("d1", "Carol").await;

        room.handler
            .handle(&alice, r#"{"type":"text_change","content":"hello","userId":"spoofed"}"#)
            .await
            .unwrap();

        assert!(drain(&mut rx_a).is_empty());
        for rx in [&mut rx_b, &mut rx_c] {
            let got = drain(rx);
            assert_eq!(got.len(), 1);
            assert_eq!(got[0]["type"], "text_change");
            assert_eq!(got[0]["content"], "hello");
            assert_eq!(got[0]["userId"], alice.user_id.to_string());
            assert_eq!(got[0]["username"], "Alice");
        }
        assert_eq!(room.registry.snapshot("d1").await.unwrap().content, "hello");
    }

    #[tokio::test]
    async fn test_last_write_wins_with_cursor_traffic() {
        let room = Room::new();
        let (alice, _rx_a) = room.join("d1", "Alice").await;
        let (bob, _rx_b) = room.join("d1", "Bob").await;

        room.handler.handle(&alice, r#"{"type":"text_change","content":"a"}"#).await.unwrap();
        room.handler.handle(&bob, r#"{"type":"cursor_position","position":1}"#).await.unwrap();
        room.handler.handle(&bob, r#"{"type":"text_change","content":"b"}"#).await.unwrap();
        room.handler.handle(&alice, r#"{"type":"cursor_position","position":0}"#).await.unwrap();

        assert_eq!(room.registry.snapshot("d1").await.unwrap().content, "b");
    }

    #[tokio::test]
    async fn test_text_change_to_empty_content() {
        let room = Room::new();
        let (alice, _rx) = room.join("d1", "Alice").await;
        room.registry.update_content("d1", "something").await;

        room.handler.handle(&alice, r#"{"type":"text_change","content":""}"#).await.unwrap();
        assert_eq!(room.registry.snapshot("d1").await.unwrap().content, "");
    }

    #[tokio::test]
    async fn test_cursor_position_relay_keeps_fields() {
        let room = Room::new();
        let (alice, mut rx_a) = room.join("d1", "Alice").await;
        let (_bob, mut rx_b) = room.join("d1", "Bob").await;

        room.handler
            .handle(&alice, r#"{"type":"cursor_position","position":0,"cursor":4}"#)
            .await
            .unwrap();

        assert!(drain(&mut rx_a).is_empty());
        let got = drain(&mut rx_b);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["position"], 0);
        assert_eq!(got[0]["cursor"], 4);
        assert_eq!(got[0]["userId"], alice.user_id.to_string());
        assert_eq!(room.registry.snapshot("d1").await.unwrap().content, "");
    }

    #[tokio::test]
    async fn test_save_replies_to_sender_only() {
        let room = Room::new();
        let (alice, mut rx_a) = room.join("d1", "Alice").await;
        let (_bob, mut rx_b) = room.join("d1", "Bob").await;

        room.handler.handle(&alice, r#"{"type":"save","content":"draft"}"#).await.unwrap();

        let got = drain(&mut rx_a);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["type"], "save_success");
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(room.registry.snapshot("d1").await.unwrap().content, "draft");
    }

    #[tokio::test]
    async fn test_empty_save_keeps_content() {
        let room = Room::new();
        let (alice, mut rx_a) = room.join("d1", "Alice").await;
        room.registry.update_content("d1", "keep me").await;

        room.handler.handle(&alice, r#"{"type":"save"}"#).await.unwrap();

        assert_eq!(drain(&mut rx_a)[0]["type"], "save_success");
        assert_eq!(room.registry.snapshot("d1").await.unwrap().content, "keep me");
    }

    #[tokio::test]
    async fn test_rename_reaches_whole_room() {
        let room = Room::new();
        let (alice, mut rx_a) = room.join("d1", "Alice").await;
        let (_bob, mut rx_b) = room.join("d1", "Bob").await;

        room.handler.handle(&alice, r#"{"type":"rename","title":"Notes"}"#).await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let got = drain(rx);
            assert_eq!(got.len(), 1);
            assert_eq!(got[0]["type"], "rename");
            assert_eq!(got[0]["title"], "Notes");
        }
        assert_eq!(room.registry.snapshot("d1").await.unwrap().title, "Notes");
    }

    #[tokio::test]
    async fn test_empty_rename_is_noop() {
        let room = Room::new();
        let (alice, mut rx_a) = room.join("d1", "Alice").await;

        room.handler.handle(&alice, r#"{"type":"rename","title":""}"#).await.unwrap();

        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(room.registry.snapshot("d1").await.unwrap().title, "Untitled Document");
    }

    #[tokio::test]
    async fn test_username_change() {
        let room = Room::new();
        let (alice, mut rx_a) = room.join("d1", "Alice").await;
        let (_bob, mut rx_b) = room.join("d1", "Bob").await;

        room.handler
            .handle(&alice, r#"{"type":"username_change","username":"Alicia"}"#)
            .await
            .unwrap();

        assert_eq!(room.registry.display_name(&alice.user_id).await.as_deref(), Some("Alicia"));
        let to_bob = drain(&mut rx_b);
        let kinds: Vec<_> = to_bob.iter().map(|v| v["type"].as_str().unwrap().to_owned()).collect();
        assert_eq!(kinds, vec!["users_list", "user_joined"]);
        assert_eq!(to_bob[1]["username"], "Alicia");

        let to_alice = drain(&mut rx_a);
        assert_eq!(to_alice.len(), 1);
        assert_eq!(to_alice[0]["users"][0]["username"], "Alicia");
    }

    #[tokio::test]
    async fn test_unknown_kind_replies_error() {
        let room = Room::new();
        let (alice, mut rx_a) = room.join("d1", "Alice").await;
        let (_bob, mut rx_b) = room.join("d1", "Bob").await;

        room.handler.handle(&alice, r#"{"type":"format_disk"}"#).await.unwrap();

        let got = drain(&mut rx_a);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["type"], "error");
        assert_eq!(got[0]["message"], "unknown message type");
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frame_changes_nothing() {
        let room = Room::new();
        let (alice, mut rx_a) = room.join("d1", "Alice").await;
        let (_bob, mut rx_b) = room.join("d1", "Bob").await;

        assert!(room.handler.handle(&alice, "{not json").await.is_err());
        assert!(room.handler.handle(&alice, r#"{"content":"no type"}"#).await.is_err());

        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(room.registry.snapshot("d1").await.unwrap().content, "");
    }

    #[tokio::test]
    async fn test_unregistered_session_is_ignored() {
        let room = Room::new();
        let (alice, _rx_a) = room.join("d1", "Alice").await;
        let (_bob, mut rx_b) = room.join("d1", "Bob").await;
        room.registry.leave(&alice.user_id).await.unwrap();

        room.handler.handle(&alice, r#"{"type":"text_change","content":"ghost"}"#).await.unwrap();

        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(room.registry.snapshot("d1").await.unwrap().content, "");
    }

    #[tokio::test]
    async fn test_message_kind_of_relayed_frames() {
        let room = Room::new();
        let (alice, _rx_a) = room.join("d1", "Alice").await;
        let (_bob, mut rx_b) = room.join("d1", "Bob").await;

        room.handler.handle(&alice, r#"{"type":"text_change","content":"x"}"#).await.unwrap();
        let payload = rx_b.try_recv().unwrap();
        let env = Envelope::decode(&payload).unwrap();
        assert_eq!(env.message_kind(), Some(MessageKind::TextChange));
        assert!(env.timestamp.unwrap() > 1_600_000_000_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_edits_peers_end_on_stored_content() {
        for _ in 0..50 {
            let room = Arc::new(Room::new());
            let (_watcher, mut rx_w) = room.join("d1", "Watcher").await;

            let writers: Vec<_> = (0..4)
                .map(|w| {
                    let room = room.clone();
                    tokio::spawn(async move {
                        let (session, rx) = room.join("d1", &format!("Writer{w}")).await;
                        for n in 0..8 {
                            let frame = serde_json::json!({"type": "text_change", "content": format!("{w}:{n}")});
                            room.handler.handle(&session, &frame.to_string()).await.unwrap();
                        }
                        rx
                    })
                })
                .collect();
            // Writers' queues stay open until the end of the round.
            let mut _queues = Vec::new();
            for writer in writers {
                _queues.push(writer.await.unwrap());
            }

            let stored = room.registry.snapshot("d1").await.unwrap().content;
            let last_edit = drain(&mut rx_w)
                .into_iter()
                .filter(|v| v["type"] == "text_change")
                .last()
                .unwrap();
            assert_eq!(last_edit["content"], stored.as_str());
        }
    }
}
