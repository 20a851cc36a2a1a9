//! Authoritative store of documents and room membership.
//!
//! ```text
//!                 ┌──────────────── Mutex ────────────────┐
//!                 │ members:   UserId → Member (queue tx)  │
//!  join/leave ──► │ rooms:     DocId  → [UserId]           │ ◄── fan_out
//!                 │ documents: DocId  → (title, content)   │
//!                 └────────────────────────────────────────┘
//! ```
//!
//! All three maps sit behind one lock so that membership and the global
//! connection table can never disagree. Critical sections only touch memory:
//! enqueueing is a non-blocking `try_send`, and transport writes happen in each
//! connection's write loop.
//!
//! The registry holds the only sender of each member's outbound queue.
//! Removing a member therefore closes its queue, which is what stops the
//! member's write loop.

use std::collections::HashMap;

use tokio::sync::{mpsc, Mutex};

use crate::protocol::{DocId, Envelope, Payload, ProtocolError, UserId, UserMeta, DEFAULT_TITLE};

/// A registered connection.
#[derive(Debug)]
pub struct Member {
    user_id: UserId,
    username: String,
    doc_id: DocId,
    outbound: mpsc::Sender<Payload>,
}

impl Member {
    pub fn new(
        user_id: UserId,
        username: impl Into<String>,
        doc_id: impl Into<DocId>,
        outbound: mpsc::Sender<Payload>,
    ) -> Self {
        Self {
            user_id,
            username: username.into(),
            doc_id: doc_id.into(),
            outbound,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    fn meta(&self) -> UserMeta {
        UserMeta::new(self.user_id, self.username.clone())
    }
}

/// Copy of a document's mutable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub title: String,
    pub content: String,
}

impl Default for DocumentSnapshot {
    fn default() -> Self {
        Self {
            title: DEFAULT_TITLE.to_owned(),
            content: String::new(),
        }
    }
}

/// What a new member needs to render the room.
#[derive(Debug, Clone)]
pub struct JoinSnapshot {
    pub document: DocumentSnapshot,
    /// Current members in join order, including the joiner
    pub members: Vec<UserMeta>,
}

/// Record of a member's removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub user_id: UserId,
    pub doc_id: DocId,
    /// Display name at the moment of removal
    pub username: String,
    /// Whether the room has no members left (the document is kept)
    pub room_empty: bool,
}

/// Result of enqueueing one payload for many members.
#[derive(Debug, Default)]
pub struct FanOut {
    /// Members whose queue accepted the payload
    pub delivered: usize,
    /// Members removed because their queue was full or closed
    pub evicted: Vec<Departure>,
}

impl FanOut {
    pub fn from_evictions(evicted: Vec<Departure>) -> Self {
        Self { delivered: 0, evicted }
    }
}

#[derive(Default)]
struct RegistryState {
    members: HashMap<UserId, Member>,
    rooms: HashMap<DocId, Vec<UserId>>,
    documents: HashMap<DocId, DocumentSnapshot>,
}

impl RegistryState {
    fn remove_member(&mut self, user_id: &UserId) -> Option<Departure> {
        let member = self.members.remove(user_id)?;
        let mut room_empty = true;
        if let Some(room) = self.rooms.get_mut(&member.doc_id) {
            room.retain(|id| id != user_id);
            room_empty = room.is_empty();
            if room_empty {
                self.rooms.remove(&member.doc_id);
            }
        }
        Some(Departure {
            user_id: member.user_id,
            doc_id: member.doc_id,
            username: member.username,
            room_empty,
        })
    }

    fn fan_out(&mut self, doc_id: &str, payload: &Payload, exclude: Option<&UserId>) -> FanOut {
        let Some(room) = self.rooms.get(doc_id) else {
            return FanOut::default();
        };

        let mut delivered = 0;
        let mut unresponsive = Vec::new();
        for user_id in room {
            if exclude == Some(user_id) {
                continue;
            }
            let Some(member) = self.members.get(user_id) else {
                continue;
            };
            match member.outbound.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => unresponsive.push(*user_id),
            }
        }

        let evicted = unresponsive
            .iter()
            .filter_map(|id| self.remove_member(id))
            .collect();
        FanOut { delivered, evicted }
    }

    fn members_of(&self, doc_id: &str) -> Vec<UserMeta> {
        self.rooms
            .get(doc_id)
            .map(|room| {
                room.iter()
                    .filter_map(|id| self.members.get(id))
                    .map(Member::meta)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Lock-protected session registry.
///
/// Cheap to share behind an `Arc`; every operation is atomic with respect to
/// every other.
#[derive(Default)]
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a member with its document, creating the document if unseen.
    ///
    /// Returns `None` if the user id is already registered.
    pub async fn join(&self, member: Member) -> Option<JoinSnapshot> {
        let mut state = self.state.lock().await;
        if state.members.contains_key(&member.user_id) {
            return None;
        }

        let doc_id = member.doc_id.clone();
        let document = state
            .documents
            .entry(doc_id.clone())
            .or_default()
            .clone();
        state.rooms.entry(doc_id.clone()).or_default().push(member.user_id);
        state.members.insert(member.user_id, member);

        Some(JoinSnapshot {
            document,
            members: state.members_of(&doc_id),
        })
    }

    /// Remove a member. Returns `None` if it was already removed.
    pub async fn leave(&self, user_id: &UserId) -> Option<Departure> {
        self.state.lock().await.remove_member(user_id)
    }

    /// Replace a document's content. Returns whether the document exists.
    pub async fn update_content(&self, doc_id: &str, content: impl Into<String>) -> bool {
        let mut state = self.state.lock().await;
        match state.documents.get_mut(doc_id) {
            Some(doc) => {
                doc.content = content.into();
                true
            }
            None => false,
        }
    }

    /// Replace a document's title. Returns whether the document exists.
    pub async fn update_title(&self, doc_id: &str, title: impl Into<String>) -> bool {
        let mut state = self.state.lock().await;
        match state.documents.get_mut(doc_id) {
            Some(doc) => {
                doc.title = title.into();
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self, doc_id: &str) -> Option<DocumentSnapshot> {
        self.state.lock().await.documents.get(doc_id).cloned()
    }

    /// Current members of a document in join order.
    pub async fn list_members(&self, doc_id: &str) -> Vec<UserMeta> {
        self.state.lock().await.members_of(doc_id)
    }

    /// Change a member's display name, returning its document.
    pub async fn rename_member(&self, user_id: &UserId, username: impl Into<String>) -> Option<DocId> {
        let mut state = self.state.lock().await;
        let member = state.members.get_mut(user_id)?;
        member.username = username.into();
        Some(member.doc_id.clone())
    }

    pub async fn display_name(&self, user_id: &UserId) -> Option<String> {
        let state = self.state.lock().await;
        state.members.get(user_id).map(|m| m.username.clone())
    }

    pub async fn document_of(&self, user_id: &UserId) -> Option<DocId> {
        let state = self.state.lock().await;
        state.members.get(user_id).map(|m| m.doc_id.clone())
    }

    pub async fn contains(&self, user_id: &UserId) -> bool {
        self.state.lock().await.members.contains_key(user_id)
    }

    /// Number of registered connections.
    pub async fn member_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    /// Number of documents ever created (documents are never dropped).
    pub async fn document_count(&self) -> usize {
        self.state.lock().await.documents.len()
    }

    /// Number of documents with at least one member.
    pub async fn room_count(&self) -> usize {
        self.state.lock().await.rooms.len()
    }

    /// Enqueue `payload` for every member of `doc_id` except `exclude`.
    ///
    /// A member whose queue is full or closed is removed in the same critical
    /// section; delivery to the others continues.
    pub async fn fan_out(&self, doc_id: &str, payload: &Payload, exclude: Option<&UserId>) -> FanOut {
        self.state.lock().await.fan_out(doc_id, payload, exclude)
    }

    /// Apply `update` to a document and enqueue `payload` in the same critical
    /// section, so peers receive updates in the order they were stored.
    ///
    /// Nothing is sent if the document does not exist.
    pub async fn update_and_fan_out<F>(
        &self,
        doc_id: &str,
        update: F,
        payload: &Payload,
        exclude: Option<&UserId>,
    ) -> FanOut
    where
        F: FnOnce(&mut DocumentSnapshot),
    {
        let mut state = self.state.lock().await;
        let Some(document) = state.documents.get_mut(doc_id) else {
            return FanOut::default();
        };
        update(document);
        state.fan_out(doc_id, payload, exclude)
    }

    /// Send the room's current member list to the whole room.
    ///
    /// The list is read and enqueued under one lock, so the last `users_list`
    /// in every queue matches the membership after the last change. An empty
    /// room sends nothing.
    pub async fn fan_out_members(&self, doc_id: &str) -> Result<FanOut, ProtocolError> {
        let mut state = self.state.lock().await;
        let members = state.members_of(doc_id);
        if members.is_empty() {
            return Ok(FanOut::default());
        }
        let payload = Envelope::users_list(members).encode()?;
        Ok(state.fan_out(doc_id, &payload, None))
    }

    /// Enqueue `payload` for a single member, with the same overflow policy.
    pub async fn deliver(&self, user_id: &UserId, payload: &Payload) -> FanOut {
        let mut state = self.state.lock().await;
        let Some(member) = state.members.get(user_id) else {
            return FanOut::default();
        };
        match member.outbound.try_send(payload.clone()) {
            Ok(()) => FanOut { delivered: 1, evicted: Vec::new() },
            Err(_) => FanOut::from_evictions(state.remove_member(user_id).into_iter().collect()),
        }
    }
}
