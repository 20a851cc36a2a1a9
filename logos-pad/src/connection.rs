//! Per-connection lifecycle.
//!
//! ```text
//!  TCP ──► handshake (deadline) ──► join registry ──► init (direct write)
//!                                                         │
//!                         ┌───────────────────────────────┴──────────┐
//!                         ▼                                          ▼
//!                    read loop                                  write loop
//!              frames → ProtocolHandler               outbound queue → sink
//!                         │                                          │
//!                         └────────── first to finish ───────────────┘
//!                                          │
//!                                          ▼
//!                           leave registry (exactly once)
//!                           user_left + users_list
//! ```
//!
//! The write loop is the only consumer of the outbound queue and the only
//! writer to the socket after `init`. The registry holds the queue's only
//! sender, so both a normal leave and an overflow eviction close the queue and
//! stop the writer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::BroadcastEngine;
use crate::handler::{ProtocolHandler, Session};
use crate::presence::PresenceTracker;
use crate::protocol::{Envelope, Payload};
use crate::registry::{Member, SessionRegistry};
use crate::server::HubError;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Parameters read from the upgrade request's query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeParams {
    /// `doc`; `None` when absent or empty
    pub doc_id: Option<String>,
    /// `user`; empty when absent
    pub username: String,
}

impl HandshakeParams {
    /// Parse `doc` and `user` from a raw (still percent-encoded) query.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut params = Self::default();
        let Some(query) = query else {
            return params;
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "doc" if !value.is_empty() => params.doc_id = Some(value.into_owned()),
                "user" => params.username = value.into_owned(),
                _ => {}
            }
        }
        params
    }
}

/// Limits applied to every connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Outbound queue bound; overflowing it evicts the member
    pub queue_capacity: usize,
    /// Deadline for completing the WebSocket upgrade
    pub handshake_timeout: Duration,
}

/// Runs connections from upgrade to cleanup.
#[derive(Clone)]
pub struct ConnectionManager {
    registry: Arc<SessionRegistry>,
    presence: PresenceTracker,
    handler: ProtocolHandler,
    config: ConnectionConfig,
}

impl ConnectionManager {
    pub fn new(engine: BroadcastEngine, config: ConnectionConfig) -> Self {
        let presence = PresenceTracker::new(engine.clone());
        Self {
            registry: engine.registry().clone(),
            handler: ProtocolHandler::new(engine, presence.clone()),
            presence,
            config,
        }
    }

    /// Serve one TCP connection until it closes.
    ///
    /// Handshake failures return before any state is created.
    pub async fn serve(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), HubError> {
        let (ws, params) = self.upgrade(stream).await?;

        let doc_id = params.doc_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let user_id = Uuid::new_v4();
        let session = Session::new(user_id, doc_id.clone());

        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let member = Member::new(user_id, params.username.clone(), doc_id.clone(), tx);
        let joined = self
            .registry
            .join(member)
            .await
            .ok_or(HubError::DuplicateUser(user_id))?;
        log::info!(
            "User {:?} ({user_id}) from {addr} joined doc {doc_id} ({} members)",
            params.username,
            joined.members.len()
        );

        let init = Envelope::init(
            user_id,
            &joined.document.title,
            &joined.document.content,
            joined.members,
        );
        let result = self.run(&session, &params.username, ws, rx, init).await;
        self.release(&session).await;
        result
    }

    async fn upgrade(&self, stream: TcpStream) -> Result<(WebSocketStream<TcpStream>, HandshakeParams), HubError> {
        let mut query: Option<String> = None;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            query = req.uri().query().map(str::to_owned);
            Ok(resp)
        };

        let ws = match tokio::time::timeout(
            self.config.handshake_timeout,
            tokio_tungstenite::accept_hdr_async(stream, callback),
        )
        .await
        {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => return Err(HubError::Handshake(e.to_string())),
            Err(_) => {
                return Err(HubError::Handshake(format!(
                    "not completed within {:?}",
                    self.config.handshake_timeout
                )))
            }
        };
        Ok((ws, HandshakeParams::from_query(query.as_deref())))
    }

    async fn run(
        &self,
        session: &Session,
        username: &str,
        ws: WebSocketStream<TcpStream>,
        rx: mpsc::Receiver<Payload>,
        init: Envelope,
    ) -> Result<(), HubError> {
        let (mut sink, source) = ws.split();

        // Written before the writer starts, so it precedes anything queued.
        sink.send(Message::Text(init.encode()?)).await?;
        self.presence
            .announce_join(&session.doc_id, session.user_id, username)
            .await?;

        let mut writer = tokio::spawn(write_loop(sink, rx));
        tokio::select! {
            res = read_loop(&self.handler, session, source) => res,
            res = &mut writer => match res {
                Ok(res) => res,
                Err(e) => Err(HubError::Task(e.to_string())),
            },
        }
    }

    /// Remove the session and announce it, unless it was already evicted
    /// (in which case the evicting broadcast announced it).
    async fn release(&self, session: &Session) {
        match self.registry.leave(&session.user_id).await {
            Some(departure) => {
                if let Err(e) = self.presence.announce_leave(departure).await {
                    log::warn!("Failed to announce departure of {}: {e}", session.user_id);
                }
            }
            None => log::debug!("User {} was already removed", session.user_id),
        }
    }
}

/// Feed text frames to the handler until the peer goes away.
async fn read_loop(handler: &ProtocolHandler, session: &Session, mut source: WsSource) -> Result<(), HubError> {
    while let Some(frame) = source.next().await {
        match frame? {
            Message::Text(text) => {
                if let Err(e) = handler.handle(session, text.as_str()).await {
                    log::debug!("Dropping frame from {}: {e}", session.user_id);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

/// Drain the outbound queue onto the socket until the queue closes or a
/// send fails.
async fn write_loop(mut sink: WsSink, mut rx: mpsc::Receiver<Payload>) -> Result<(), HubError> {
    while let Some(payload) = rx.recv().await {
        sink.send(Message::Text(payload)).await?;
    }
    if let Err(e) = sink.close().await {
        log::debug!("Close after queue shutdown failed: {e}");
    }
    Ok(())
}
