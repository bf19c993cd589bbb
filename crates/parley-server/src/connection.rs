//! Per-connection lifecycle: `Unbound -> Bound -> Closed`.
//!
//! A [`Session`] owns the state machine and turns client events into calls on
//! the messaging service. [`handle_socket`] wires a session to an axum
//! WebSocket: a writer task drains the outbound queue while the reader loop
//! handles one event at a time in arrival order.

use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use parley_shared::protocol::{ClientEvent, PresenceNotice, ServerEvent};
use parley_shared::{ConnId, ProtocolError, UserId};

use crate::api::AppState;
use crate::error::MessagingError;
use crate::messaging::Messaging;
use crate::presence::ConnectionHandle;

/// How long queued events may take to flush after the reader loop ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

const DISPLACED_NOTICE: &str = "Signed in on another connection";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    Unbound,
    Bound(UserId),
    Closed,
}

/// What the reader loop should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub struct Session {
    handle: ConnectionHandle,
    state: ConnState,
    messaging: Messaging,
}

impl Session {
    /// Register a fresh connection. It starts `Unbound`.
    pub fn open(conn: ConnId, tx: mpsc::UnboundedSender<ServerEvent>, messaging: Messaging) -> Self {
        let handle = ConnectionHandle::new(conn, tx);
        messaging.dispatcher().register(handle.clone());
        Self {
            handle,
            state: ConnState::Unbound,
            messaging,
        }
    }

    pub fn conn(&self) -> ConnId {
        self.handle.id()
    }

    #[allow(dead_code)]
    pub fn state(&self) -> &ConnState {
        &self.state
    }

    /// Parse and handle one text frame. Malformed frames are reported and
    /// the connection stays open.
    pub async fn handle_text(&mut self, text: &str) -> Flow {
        match ClientEvent::from_json(text) {
            Ok(event) => self.handle_event(event).await,
            Err(e) => {
                debug!(conn = %self.conn(), error = %e, "Rejected malformed frame");
                self.reply(ServerEvent::error(None, e.to_string()));
                Flow::Continue
            }
        }
    }

    /// Handle one event. Failures become a `message-error` for this
    /// connection only.
    pub async fn handle_event(&mut self, event: ClientEvent) -> Flow {
        if self.state == ConnState::Closed {
            return Flow::Close;
        }

        let name = event.name();
        match self.dispatch(event).await {
            Ok(flow) => flow,
            Err(e) => {
                match &e {
                    MessagingError::StoreUnavailable(detail) => {
                        warn!(conn = %self.conn(), event = name, error = %detail, "Event failed");
                    }
                    other => {
                        debug!(conn = %self.conn(), event = name, error = %other, "Event rejected");
                    }
                }
                self.reply(ServerEvent::error(Some(name), e.client_message(name)));
                Flow::Continue
            }
        }
    }

    async fn dispatch(&mut self, event: ClientEvent) -> Result<Flow, MessagingError> {
        let conn = self.conn();
        let messaging = self.messaging.clone();

        match event {
            ClientEvent::IdentityAnnounce(announce) => {
                self.bind(announce.user_id)?;
            }
            ClientEvent::JoinConversation(room) => {
                messaging.dispatcher().rooms().join(room.conversation_id, conn);
            }
            ClientEvent::LeaveConversation(room) => {
                messaging.dispatcher().rooms().leave(room.conversation_id, conn);
            }
            ClientEvent::GetOnlineUsers => {
                self.send_snapshot();
            }
            ClientEvent::Logout => {
                self.close();
                return Ok(Flow::Close);
            }
            ClientEvent::SendMessage(request) => {
                let user = self.bound()?;
                messaging.send_message(conn, &user, request).await?;
            }
            ClientEvent::MarkSeen(seen) => {
                let user = self.bound()?;
                messaging
                    .mark_seen(&user, seen.message_id, &seen.user_id)
                    .await?;
            }
            ClientEvent::MarkAllSeen(seen) => {
                let user = self.bound()?;
                messaging
                    .mark_all_seen(&user, seen.conversation_id, &seen.user_id)
                    .await?;
            }
            ClientEvent::Typing(signal) => {
                let user = self.bound()?;
                messaging.relay_typing(conn, &user, &signal, false)?;
            }
            ClientEvent::StopTyping(signal) => {
                let user = self.bound()?;
                messaging.relay_typing(conn, &user, &signal, true)?;
            }
            ClientEvent::AddReaction(signal) => {
                let user = self.bound()?;
                messaging.relay_reaction(&user, &signal, true)?;
            }
            ClientEvent::RemoveReaction(signal) => {
                let user = self.bound()?;
                messaging.relay_reaction(&user, &signal, false)?;
            }
            ClientEvent::MessageDelivered(ack) => {
                self.bound()?;
                messaging.mark_delivered(&ack);
            }
            ClientEvent::DeleteMessage(delete) => {
                let user = self.bound()?;
                messaging
                    .delete_message(&user, delete.message_id, &delete.user_id)
                    .await?;
            }
        }

        Ok(Flow::Continue)
    }

    /// The identity this connection acts as. A connection displaced by a
    /// newer bind drops back to `Unbound` here.
    fn bound(&mut self) -> Result<UserId, MessagingError> {
        let ConnState::Bound(user) = &self.state else {
            return Err(MessagingError::NotBound);
        };
        let conn = self.conn();
        if self.messaging.dispatcher().presence().user_of(conn).as_ref() != Some(user) {
            debug!(conn = %conn, user = %user, "Binding lost, connection is unbound");
            self.state = ConnState::Unbound;
            return Err(MessagingError::NotBound);
        }
        Ok(user.clone())
    }

    fn bind(&mut self, user: UserId) -> Result<(), MessagingError> {
        if user.is_empty() {
            return Err(ProtocolError::MissingField("userId").into());
        }

        let dispatcher = self.messaging.dispatcher();
        let conn = self.conn();
        let outcome = dispatcher.presence().bind(&user, self.handle.clone());

        if let Some(previous) = outcome.previous_offline {
            info!(conn = %conn, from = %previous, to = %user, "Connection rebound");
            dispatcher.broadcast_all(
                &ServerEvent::UserOffline(PresenceNotice { user_id: previous }),
                Some(conn),
            );
        }
        for displaced in &outcome.displaced {
            info!(user = %user, conn = %displaced, "Connection displaced by newer bind");
            dispatcher.to_conn(
                *displaced,
                ServerEvent::error(Some("identity-announce"), DISPLACED_NOTICE),
            );
        }
        if outcome.came_online {
            info!(user = %user, conn = %conn, "User online");
            dispatcher.broadcast_all(
                &ServerEvent::UserOnline(PresenceNotice {
                    user_id: user.clone(),
                }),
                Some(conn),
            );
        }

        self.state = ConnState::Bound(user);
        self.send_snapshot();
        Ok(())
    }

    fn send_snapshot(&self) {
        let users = self.messaging.dispatcher().presence().snapshot();
        self.reply(ServerEvent::OnlineUsers(users));
    }

    fn reply(&self, event: ServerEvent) {
        self.messaging.dispatcher().to_conn(self.conn(), event);
    }

    /// Tear the connection down. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }

        let conn = self.conn();
        let dispatcher = self.messaging.dispatcher();
        let went_offline = dispatcher.presence().unbind(conn);
        let rooms = dispatcher.rooms().leave_all(conn);
        dispatcher.unregister(conn);

        if let Some(user) = went_offline {
            info!(user = %user, conn = %conn, "User offline");
            dispatcher.broadcast_all(
                &ServerEvent::UserOffline(PresenceNotice { user_id: user }),
                None,
            );
        }

        debug!(conn = %conn, rooms, "Connection closed");
        self.state = ConnState::Closed;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.messaging.clone()))
}

pub async fn handle_socket(socket: WebSocket, messaging: Messaging) {
    let conn = ConnId::new();
    info!(conn = %conn, "WebSocket connection established");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let mut writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                Some(event) = rx.recv() => match event.to_json() {
                    Ok(json) => WsMessage::Text(json),
                    Err(e) => {
                        warn!(conn = %conn, error = %e, "Failed to encode event");
                        continue;
                    }
                },
                Some(data) = pong_rx.recv() => WsMessage::Pong(data),
                else => break,
            };
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = Session::open(conn, tx, messaging);
    let mut writer_done = false;

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if session.handle_text(&text).await == Flow::Close {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = pong_tx.send(data);
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        session.reply(ServerEvent::error(None, "Binary frames are not supported"));
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!(conn = %conn, "Client closed connection");
                        break;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Err(e)) => {
                        warn!(conn = %conn, error = %e, "WebSocket error");
                        break;
                    }
                    None => break,
                }
            }
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        }
    }

    session.close();
    drop(session);
    drop(pong_tx);

    if !writer_done && tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        debug!(conn = %conn, "Writer did not drain in time");
        writer.abort();
    }

    info!(conn = %conn, "WebSocket connection finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parley_shared::protocol::{ConversationRef, IdentityAnnounce, SendMessage};
    use parley_shared::{ConversationId, MemberSet};

    use crate::backend::{SqliteBackend, Stores};
    use crate::dedup::DuplicateGuard;
    use crate::dispatcher::Dispatcher;
    use crate::presence::PresenceRegistry;
    use crate::rooms::RoomRegistry;

    fn messaging(multi_device: bool) -> Messaging {
        let dispatcher = Dispatcher::new(
            Arc::new(PresenceRegistry::new(multi_device)),
            Arc::new(RoomRegistry::new()),
        );
        Messaging::new(
            Stores::sqlite(SqliteBackend::in_memory()),
            DuplicateGuard::new(Duration::from_secs(5)),
            dispatcher,
        )
    }

    struct Peer {
        session: Session,
        rx: mpsc::UnboundedReceiver<ServerEvent>,
    }

    impl Peer {
        fn open(messaging: &Messaging) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                session: Session::open(ConnId::new(), tx, messaging.clone()),
                rx,
            }
        }

        async fn announce(&mut self, user: &str) {
            let event = ClientEvent::IdentityAnnounce(IdentityAnnounce {
                user_id: UserId::from(user),
            });
            assert_eq!(self.session.handle_event(event).await, Flow::Continue);
        }

        fn drain(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn online(user: &str) -> ServerEvent {
        ServerEvent::UserOnline(PresenceNotice {
            user_id: UserId::from(user),
        })
    }

    fn offline(user: &str) -> ServerEvent {
        ServerEvent::UserOffline(PresenceNotice {
            user_id: UserId::from(user),
        })
    }

    #[tokio::test]
    async fn test_unbound_connection_cannot_send() {
        let m = messaging(true);
        let mut peer = Peer::open(&m);

        let event = ClientEvent::SendMessage(SendMessage::default());
        assert_eq!(peer.session.handle_event(event).await, Flow::Continue);
        assert_eq!(
            peer.drain(),
            vec![ServerEvent::error(Some("send-message"), "Identity not announced")]
        );
        assert_eq!(peer.session.state(), &ConnState::Unbound);
    }

    #[tokio::test]
    async fn test_announce_binds_and_broadcasts_presence() {
        let m = messaging(true);
        let mut alice = Peer::open(&m);
        let mut bob = Peer::open(&m);

        alice.announce("alice").await;
        assert_eq!(
            alice.drain(),
            vec![ServerEvent::OnlineUsers(vec![UserId::from("alice")])]
        );
        assert_eq!(bob.drain(), vec![online("alice")]);
        assert_eq!(
            alice.session.state(),
            &ConnState::Bound(UserId::from("alice"))
        );
    }

    #[tokio::test]
    async fn test_blank_identity_is_rejected() {
        let m = messaging(true);
        let mut peer = Peer::open(&m);

        peer.announce("  ").await;
        let events = peer.drain();
        assert!(matches!(events.as_slice(), [ServerEvent::MessageError(_)]));
        assert_eq!(peer.session.state(), &ConnState::Unbound);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let m = messaging(true);
        let mut peer = Peer::open(&m);

        assert_eq!(peer.session.handle_text("{not json").await, Flow::Continue);
        assert!(matches!(peer.drain().as_slice(), [ServerEvent::MessageError(_)]));

        let flow = peer
            .session
            .handle_text(r#"{"event":"get-online-users"}"#)
            .await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(peer.drain(), vec![ServerEvent::OnlineUsers(Vec::new())]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_announces_offline_once() {
        let m = messaging(true);
        let mut alice = Peer::open(&m);
        let mut bob = Peer::open(&m);
        alice.announce("alice").await;
        bob.drain();

        alice.session.close();
        alice.session.close();

        assert_eq!(bob.drain(), vec![offline("alice")]);
        assert_eq!(alice.session.state(), &ConnState::Closed);
        assert!(!m.dispatcher().presence().is_online(&UserId::from("alice")));
        assert_eq!(m.dispatcher().connection_count(), 1);
    }

    #[tokio::test]
    async fn test_offline_only_after_last_device_closes() {
        let m = messaging(true);
        let mut phone = Peer::open(&m);
        let mut laptop = Peer::open(&m);
        let mut bob = Peer::open(&m);

        phone.announce("alice").await;
        laptop.announce("alice").await;
        assert_eq!(bob.drain(), vec![online("alice")]);

        phone.session.close();
        assert!(bob.drain().is_empty());
        laptop.session.close();
        assert_eq!(bob.drain(), vec![offline("alice")]);
    }

    #[tokio::test]
    async fn test_logout_closes_and_leaves_rooms() {
        let m = messaging(true);
        let mut alice = Peer::open(&m);
        let room = ConversationId::new();

        let join = ClientEvent::JoinConversation(ConversationRef {
            conversation_id: room,
        });
        assert_eq!(alice.session.handle_event(join).await, Flow::Continue);
        alice.announce("alice").await;
        assert_eq!(m.dispatcher().rooms().members(room), vec![alice.session.conn()]);

        assert_eq!(alice.session.handle_event(ClientEvent::Logout).await, Flow::Close);
        assert_eq!(alice.session.state(), &ConnState::Closed);
        assert!(m.dispatcher().rooms().members(room).is_empty());
        assert!(m.dispatcher().presence().snapshot().is_empty());

        // Events after close are ignored.
        assert_eq!(alice.session.handle_event(ClientEvent::GetOnlineUsers).await, Flow::Close);
    }

    #[tokio::test]
    async fn test_rebinding_to_another_identity() {
        let m = messaging(true);
        let mut peer = Peer::open(&m);
        let mut watcher = Peer::open(&m);

        peer.announce("alice").await;
        watcher.drain();
        peer.announce("carol").await;

        assert_eq!(watcher.drain(), vec![offline("alice"), online("carol")]);
        assert_eq!(
            m.dispatcher().presence().snapshot(),
            vec![UserId::from("carol")]
        );
    }

    #[tokio::test]
    async fn test_single_device_mode_routes_to_newest_only() {
        let m = messaging(false);
        let mut old = Peer::open(&m);
        let mut new = Peer::open(&m);

        old.announce("bob").await;
        new.announce("bob").await;
        old.drain();
        new.drain();

        let reached = m
            .dispatcher()
            .to_user(&UserId::from("bob"), &ServerEvent::OnlineUsers(Vec::new()));
        assert_eq!(reached, 1);
        assert!(old.drain().is_empty());
        assert_eq!(new.drain().len(), 1);

        // Closing the displaced connection does not take bob offline.
        old.session.close();
        assert!(m.dispatcher().presence().is_online(&UserId::from("bob")));
    }

    #[tokio::test]
    async fn test_send_between_two_sessions() {
        let m = messaging(true);
        let mut alice = Peer::open(&m);
        let mut bob = Peer::open(&m);
        alice.announce("alice").await;
        bob.announce("bob").await;
        alice.drain();
        bob.drain();

        let members = MemberSet::new([UserId::from("alice"), UserId::from("bob")]).unwrap();
        let (conversation, _) = m.open_conversation(&members).await.unwrap();

        let frame = format!(
            r#"{{"event":"send-message","data":{{"conversationId":"{}","sender":"alice","receiver":"bob","text":"hey"}}}}"#,
            conversation.id
        );
        assert_eq!(alice.session.handle_text(&frame).await, Flow::Continue);

        let received = bob.drain();
        let [ServerEvent::MessageReceived(incoming)] = received.as_slice() else {
            panic!("expected message-received, got {received:?}");
        };
        assert_eq!(incoming.message.text.as_deref(), Some("hey"));

        let acked = alice.drain();
        let [ServerEvent::MessageSent(ack)] = acked.as_slice() else {
            panic!("expected message-sent, got {acked:?}");
        };
        assert_eq!(ack.message.id, incoming.message.id);
    }

    #[tokio::test]
    async fn test_displaced_session_loses_its_identity() {
        let m = messaging(false);
        let mut old = Peer::open(&m);
        let mut new = Peer::open(&m);
        let mut alice = Peer::open(&m);

        old.announce("bob").await;
        alice.announce("alice").await;
        old.drain();
        new.announce("bob").await;
        // Still online throughout, so no second user-online.
        assert!(alice.drain().is_empty());

        assert_eq!(
            old.drain(),
            vec![ServerEvent::error(
                Some("identity-announce"),
                "Signed in on another connection"
            )]
        );

        let members = MemberSet::new([UserId::from("alice"), UserId::from("bob")]).unwrap();
        let (conversation, _) = m.open_conversation(&members).await.unwrap();
        let send = ClientEvent::SendMessage(SendMessage {
            conversation_id: Some(conversation.id),
            sender: Some(UserId::from("bob")),
            receiver: Some(UserId::from("alice")),
            text: Some("still me".into()),
            media: None,
        });
        assert_eq!(old.session.handle_event(send).await, Flow::Continue);

        assert_eq!(
            old.drain(),
            vec![ServerEvent::error(Some("send-message"), "Identity not announced")]
        );
        assert_eq!(old.session.state(), &ConnState::Unbound);
        assert!(alice.drain().is_empty());
        assert!(m
            .history(conversation.id, 50, None)
            .await
            .unwrap()
            .is_empty());

        // Re-announcing takes the identity back.
        old.announce("bob").await;
        assert_eq!(old.session.state(), &ConnState::Bound(UserId::from("bob")));
        assert_eq!(new.session.state(), &ConnState::Bound(UserId::from("bob")));
    }

    #[tokio::test]
    async fn test_reconnect_gets_no_retroactive_delivery() {
        let m = messaging(true);
        let mut alice = Peer::open(&m);
        let mut bob = Peer::open(&m);
        alice.announce("alice").await;
        bob.announce("bob").await;

        let members = MemberSet::new([UserId::from("alice"), UserId::from("bob")]).unwrap();
        let (conversation, _) = m.open_conversation(&members).await.unwrap();

        bob.session.close();
        alice.drain();

        let frame = format!(
            r#"{{"event":"send-message","data":{{"conversationId":"{}","sender":"alice","receiver":"bob","text":"while you were away"}}}}"#,
            conversation.id
        );
        assert_eq!(alice.session.handle_text(&frame).await, Flow::Continue);
        assert!(matches!(alice.drain().as_slice(), [ServerEvent::MessageSent(_)]));

        let mut bob = Peer::open(&m);
        bob.announce("bob").await;
        let events = bob.drain();
        assert_eq!(events.len(), 1, "unexpected events: {events:?}");
        assert!(matches!(&events[0], ServerEvent::OnlineUsers(users) if users.len() == 2));
        assert!(!events
            .iter()
            .any(|e| matches!(e, ServerEvent::MessageReceived(_))));

        let history = m.history(conversation.id, 50, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message.text.as_deref(), Some("while you were away"));
    }
}
