use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use classhub_types::events::{ClientCommand, ServerEvent, SignalKind, WhiteboardAction, WhiteboardUpdate};
use classhub_types::models::{ConnectionId, Identity};

use crate::error::{GatewayError, RegistryError};
use crate::oracle::{IdentityProvider, MembershipOracle};
use crate::registry::ConnectionRegistry;
use crate::store::RoomStateStore;

/// Highest whiteboard page a client may address. Bounds the densified
/// history array.
pub const MAX_PAGE_INDEX: u32 = 1024;

/// Authorizes inbound events, applies them to room state and routes the
/// results to the right connections.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: ConnectionRegistry,
    store: RoomStateStore,
    oracle: Arc<dyn MembershipOracle>,
    identity: Arc<dyn IdentityProvider>,
}

impl Dispatcher {
    pub fn new(
        registry: ConnectionRegistry,
        store: RoomStateStore,
        oracle: Arc<dyn MembershipOracle>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                registry,
                store,
                oracle,
                identity,
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &RoomStateStore {
        &self.inner.store
    }

    /// Register a new socket. Returns (conn_id, outbound event receiver).
    pub async fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        self.inner.registry.connect().await
    }

    /// Bind an identity and greet the connection with its status.
    pub async fn bind(&self, conn_id: ConnectionId, identity: Identity) -> Result<(), RegistryError> {
        self.inner.registry.bind(conn_id, identity.clone()).await?;
        info!(
            "{} ({}, {}) bound to connection {}",
            identity.username, identity.user_id, identity.role, conn_id
        );

        self.inner
            .registry
            .send_to(
                conn_id,
                ServerEvent::Status {
                    connection_id: conn_id,
                    user_id: identity.user_id,
                    username: identity.username,
                    role: identity.role,
                },
            )
            .await
    }

    /// Socket closed. Memberships vanish without a `user_left` to peers.
    pub async fn disconnect(&self, conn_id: ConnectionId) {
        match self.inner.registry.unbind(conn_id).await {
            Some(identity) => info!(
                "{} ({}) disconnected from gateway [conn={}]",
                identity.username, identity.user_id, conn_id
            ),
            None => info!("Unbound connection {} disconnected", conn_id),
        }
    }

    /// Route one inbound command. Never fails: problems end in a log line and,
    /// for a few cases, an `error` event to the sender.
    pub async fn handle(&self, conn_id: ConnectionId, cmd: ClientCommand) {
        let kind = cmd.kind();
        let result = match cmd {
            ClientCommand::Identify { token } => self.identify(conn_id, &token).await,
            ClientCommand::Join { room_id } => self.join(conn_id, &room_id).await,
            ClientCommand::Leave { room_id } => self.leave(conn_id, &room_id).await,
            ClientCommand::Message { room_id, text } => self.chat(conn_id, &room_id, text).await,
            ClientCommand::Whiteboard { room_id, action } => {
                self.whiteboard(conn_id, &room_id, action).await
            }
            ClientCommand::GetWhiteboardHistory { room_id } => {
                self.request_history(conn_id, &room_id).await
            }
            ClientCommand::WhiteboardPageChange {
                room_id,
                new_page_index,
            } => self.change_page(conn_id, &room_id, new_page_index).await,
            ClientCommand::WebrtcOffer {
                room_id,
                recipient_connection_id,
                payload,
            } => {
                self.relay_signal(conn_id, SignalKind::Offer, &room_id, recipient_connection_id, payload)
                    .await
            }
            ClientCommand::WebrtcAnswer {
                room_id,
                recipient_connection_id,
                payload,
            } => {
                self.relay_signal(conn_id, SignalKind::Answer, &room_id, recipient_connection_id, payload)
                    .await
            }
            ClientCommand::WebrtcIceCandidate {
                room_id,
                recipient_connection_id,
                payload,
            } => {
                self.relay_signal(
                    conn_id,
                    SignalKind::IceCandidate,
                    &room_id,
                    recipient_connection_id,
                    payload,
                )
                .await
            }
            ClientCommand::WebrtcPeerDisconnected { room_id } => {
                self.peer_disconnected(conn_id, &room_id).await
            }
        };

        match result {
            Ok(()) => {}
            Err(GatewayError::Store(e)) => {
                warn!("Dropped {} from {}: {}", kind, conn_id, e);
                let _ = self
                    .inner
                    .registry
                    .send_to(conn_id, ServerEvent::error("Could not save your change, please retry"))
                    .await;
            }
            Err(e) => debug!("Dropped {} from {}: {}", kind, conn_id, e),
        }
    }

    /// Late identity binding for sockets that upgraded without a token.
    pub async fn identify(&self, conn_id: ConnectionId, token: &str) -> Result<(), GatewayError> {
        let identity = self
            .inner
            .identity
            .identify(token)
            .ok_or(GatewayError::Unauthorized("token rejected"))?;

        if let Err(e) = self.bind(conn_id, identity).await {
            warn!("Identify on connection {} refused: {}", conn_id, e);
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn join(&self, conn_id: ConnectionId, room_id: &str) -> Result<(), GatewayError> {
        validate_room_id(room_id)?;

        let identity = match self.authorize(conn_id, room_id).await {
            Ok(identity) => identity,
            Err(e) => {
                let _ = self
                    .inner
                    .registry
                    .send_to(conn_id, ServerEvent::error("Not authorized to join this classroom"))
                    .await;
                return Err(e);
            }
        };

        // Holding the room lock keeps live chat from slipping in between the
        // membership change and the history snapshot.
        let room = self.inner.store.lock(room_id).await;
        self.inner.registry.join_room(conn_id, room_id).await?;
        info!(
            "{} ({}) joined room {} [conn={}]",
            identity.username, identity.user_id, room_id, conn_id
        );

        self.inner
            .registry
            .broadcast(
                room_id,
                ServerEvent::UserJoined {
                    room_id: room_id.to_string(),
                    username: identity.username,
                    role: identity.role,
                    connection_id: conn_id,
                },
                None,
            )
            .await;

        self.inner
            .registry
            .send_to(conn_id, ServerEvent::ChatHistory(room.chat_history()))
            .await?;
        Ok(())
    }

    pub async fn leave(&self, conn_id: ConnectionId, room_id: &str) -> Result<(), GatewayError> {
        validate_room_id(room_id)?;

        let identity = match self.authorize(conn_id, room_id).await {
            Ok(identity) => identity,
            Err(e) => {
                // Best-effort local cleanup; peers are not told
                self.inner.registry.leave_room(conn_id, room_id).await;
                return Err(e);
            }
        };

        // Only a member's room is locked; leave never creates room state
        if !self.inner.registry.is_member(conn_id, room_id).await {
            return Ok(());
        }
        let _room = self.inner.store.lock(room_id).await;
        if !self.inner.registry.leave_room(conn_id, room_id).await {
            return Ok(());
        }
        info!(
            "{} ({}) left room {} [conn={}]",
            identity.username, identity.user_id, room_id, conn_id
        );

        self.inner
            .registry
            .broadcast(
                room_id,
                ServerEvent::UserLeft {
                    room_id: room_id.to_string(),
                    username: identity.username,
                    connection_id: conn_id,
                },
                None,
            )
            .await;
        Ok(())
    }

    pub async fn chat(&self, conn_id: ConnectionId, room_id: &str, text: String) -> Result<(), GatewayError> {
        validate_room_id(room_id)?;
        if text.trim().is_empty() {
            return Err(GatewayError::InvalidPayload("empty message text"));
        }
        let identity = self.authorize(conn_id, room_id).await?;

        let mut room = self.inner.store.lock(room_id).await;
        let message = room.append_chat(&identity, text).await?;

        // The sender gets its own line back from here, not a local echo
        self.inner
            .registry
            .broadcast(room_id, ServerEvent::Message(message), None)
            .await;
        Ok(())
    }

    pub async fn whiteboard(
        &self,
        conn_id: ConnectionId,
        room_id: &str,
        action: WhiteboardAction,
    ) -> Result<(), GatewayError> {
        validate_room_id(room_id)?;
        validate_page_index(action.page_index())?;
        if let WhiteboardAction::Draw { stroke_data, .. } = &action {
            if stroke_data.is_null() {
                return Err(GatewayError::InvalidPayload("missing stroke data"));
            }
        }
        self.authorize_admin(conn_id, room_id).await?;

        let mut room = self.inner.store.lock(room_id).await;
        let update = match action {
            WhiteboardAction::Draw {
                page_index,
                stroke_data,
            } => {
                trace!("{} drew on room {} page {}", conn_id, room_id, page_index);
                room.append_stroke(page_index, stroke_data.clone()).await?;
                WhiteboardUpdate::Draw {
                    room_id: room_id.to_string(),
                    page_index,
                    stroke_data,
                }
            }
            WhiteboardAction::Clear { page_index } => {
                debug!("{} cleared room {} page {}", conn_id, room_id, page_index);
                room.clear_page(page_index).await?;
                WhiteboardUpdate::Clear {
                    room_id: room_id.to_string(),
                    page_index,
                }
            }
        };

        // The sender already rendered its own change
        self.inner
            .registry
            .broadcast(room_id, ServerEvent::Whiteboard(update), Some(conn_id))
            .await;
        Ok(())
    }

    pub async fn request_history(&self, conn_id: ConnectionId, room_id: &str) -> Result<(), GatewayError> {
        validate_room_id(room_id)?;
        self.authorize(conn_id, room_id).await?;

        let pages = self.inner.store.lock(room_id).await.snapshot();
        debug!(
            "Sending {} whiteboard pages of room {} to {}",
            pages.len(),
            room_id,
            conn_id
        );
        self.inner
            .registry
            .send_to(
                conn_id,
                ServerEvent::Whiteboard(WhiteboardUpdate::History {
                    room_id: room_id.to_string(),
                    pages,
                }),
            )
            .await?;
        Ok(())
    }

    /// Page index is a presentation cursor; nothing is stored.
    pub async fn change_page(
        &self,
        conn_id: ConnectionId,
        room_id: &str,
        new_page_index: u32,
    ) -> Result<(), GatewayError> {
        validate_room_id(room_id)?;
        validate_page_index(new_page_index)?;
        self.authorize_admin(conn_id, room_id).await?;

        let _room = self.inner.store.lock(room_id).await;
        self.inner
            .registry
            .broadcast(
                room_id,
                ServerEvent::WhiteboardPageChange {
                    room_id: room_id.to_string(),
                    new_page_index,
                },
                Some(conn_id),
            )
            .await;
        Ok(())
    }

    /// Bound identity plus a positive participant check.
    pub(crate) async fn authorize(&self, conn_id: ConnectionId, room_id: &str) -> Result<Identity, GatewayError> {
        let identity = self
            .inner
            .registry
            .identity(conn_id)
            .await
            .ok_or(GatewayError::Unauthorized("no identity bound"))?;

        let oracle = self.inner.oracle.clone();
        let room = room_id.to_string();
        let user_id = identity.user_id;
        let allowed = tokio::task::spawn_blocking(move || oracle.is_participant(&room, user_id))
            .await
            .unwrap_or_else(|e| {
                error!("spawn_blocking join error: {}", e);
                false
            });
        if !allowed {
            return Err(GatewayError::Unauthorized("not a participant"));
        }
        Ok(identity)
    }

    async fn authorize_admin(&self, conn_id: ConnectionId, room_id: &str) -> Result<Identity, GatewayError> {
        let identity = self.authorize(conn_id, room_id).await?;
        if !identity.role.is_admin() {
            return Err(GatewayError::Unauthorized("whiteboard control requires admin"));
        }
        Ok(identity)
    }
}

pub(crate) fn validate_room_id(room_id: &str) -> Result<(), GatewayError> {
    if room_id.trim().is_empty() {
        return Err(GatewayError::InvalidPayload("empty room id"));
    }
    Ok(())
}

fn validate_page_index(page_index: u32) -> Result<(), GatewayError> {
    if page_index > MAX_PAGE_INDEX {
        return Err(GatewayError::InvalidPayload("page index out of range"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{HistoryRecord, HistorySink, MemorySink, StoredHistory};
    use crate::store::RetryPolicy;
    use std::time::Duration;
    use classhub_types::models::Role;
    use serde_json::json;
    use uuid::Uuid;

    /// Everyone is a participant of "r1" and nothing else.
    struct OnlyR1;

    impl MembershipOracle for OnlyR1 {
        fn is_participant(&self, room_id: &str, _user_id: Uuid) -> bool {
            room_id == "r1"
        }
    }

    /// Accepts the token "good" as a fixed user.
    struct FixedToken;

    impl IdentityProvider for FixedToken {
        fn identify(&self, token: &str) -> Option<Identity> {
            (token == "good").then(|| Identity {
                user_id: Uuid::nil(),
                username: "late-bird".into(),
                role: Role::User,
            })
        }
    }

    /// Rejects every write.
    struct BrokenSink;

    impl HistorySink for BrokenSink {
        fn persist(&self, _record: &HistoryRecord) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }

        fn load(&self) -> anyhow::Result<StoredHistory> {
            Ok(StoredHistory::default())
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            ConnectionRegistry::new(),
            RoomStateStore::new(Arc::new(MemorySink::new()), RetryPolicy::default()),
            Arc::new(OnlyR1),
            Arc::new(FixedToken),
        )
    }

    fn identity(name: &str, role: Role) -> Identity {
        Identity {
            user_id: Uuid::new_v4(),
            username: name.into(),
            role,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_identify_binds_once() {
        let d = dispatcher();
        let (conn, mut rx) = d.connect().await;

        d.handle(conn, ClientCommand::Identify { token: "bad".into() }).await;
        assert!(d.registry().identity(conn).await.is_none());

        d.handle(conn, ClientCommand::Identify { token: "good".into() }).await;
        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [ServerEvent::Status { connection_id, .. }] if *connection_id == conn
        ));

        let err = d.identify(conn, "good").await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Registry(RegistryError::IdentityAlreadyBound(_))
        ));
    }

    #[tokio::test]
    async fn test_unbound_join_gets_error_notice() {
        let d = dispatcher();
        let (conn, mut rx) = d.connect().await;

        d.handle(conn, ClientCommand::Join { room_id: "r1".into() }).await;

        assert!(matches!(drain(&mut rx).as_slice(), [ServerEvent::Error { .. }]));
        assert!(d.registry().members_of("r1").await.is_empty());
    }

    #[tokio::test]
    async fn test_join_to_foreign_room_is_refused() {
        let d = dispatcher();
        let (conn, mut rx) = d.connect().await;
        d.bind(conn, identity("bob", Role::User)).await.unwrap();
        drain(&mut rx);

        d.handle(conn, ClientCommand::Join { room_id: "r2".into() }).await;

        assert!(matches!(drain(&mut rx).as_slice(), [ServerEvent::Error { .. }]));
        assert!(!d.registry().is_member(conn, "r2").await);
    }

    #[tokio::test]
    async fn test_blank_chat_is_dropped() {
        let d = dispatcher();
        let (conn, mut rx) = d.connect().await;
        d.bind(conn, identity("bob", Role::User)).await.unwrap();
        d.join(conn, "r1").await.unwrap();
        drain(&mut rx);

        d.handle(
            conn,
            ClientCommand::Message {
                room_id: "r1".into(),
                text: "   ".into(),
            },
        )
        .await;
        d.handle(
            conn,
            ClientCommand::Message {
                room_id: "".into(),
                text: "hello".into(),
            },
        )
        .await;

        assert!(drain(&mut rx).is_empty());
        assert!(d.store().read_chat_history("r1").await.is_empty());
    }

    #[tokio::test]
    async fn test_page_index_is_bounded() {
        let d = dispatcher();
        let (conn, _rx) = d.connect().await;
        d.bind(conn, identity("teacher", Role::Admin)).await.unwrap();

        let err = d
            .whiteboard(
                conn,
                "r1",
                WhiteboardAction::Draw {
                    page_index: MAX_PAGE_INDEX + 1,
                    stroke_data: json!("s"),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidPayload(_)));

        let err = d
            .whiteboard(
                conn,
                "r1",
                WhiteboardAction::Draw {
                    page_index: 0,
                    stroke_data: serde_json::Value::Null,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidPayload(_)));
        assert!(d.store().snapshot("r1").await.is_empty());
    }

    #[tokio::test]
    async fn test_leave_when_unauthorized_still_cleans_up() {
        let d = dispatcher();
        let (watcher, mut watcher_rx) = d.connect().await;
        let (conn, _rx) = d.connect().await;
        d.bind(watcher, identity("watcher", Role::User)).await.unwrap();
        d.join(watcher, "r1").await.unwrap();
        // Unbound connection placed in the room directly
        d.registry().join_room(conn, "r1").await.unwrap();
        drain(&mut watcher_rx);

        let err = d.leave(conn, "r1").await.unwrap_err();

        assert!(matches!(err, GatewayError::Unauthorized(_)));
        assert!(!d.registry().is_member(conn, "r1").await);
        assert!(drain(&mut watcher_rx).is_empty());
    }

    #[tokio::test]
    async fn test_leave_of_unjoined_room_is_silent() {
        let d = dispatcher();
        let (a, mut rx_a) = d.connect().await;
        let (b, _rx_b) = d.connect().await;
        d.bind(a, identity("a", Role::User)).await.unwrap();
        d.bind(b, identity("b", Role::User)).await.unwrap();
        d.join(a, "r1").await.unwrap();
        drain(&mut rx_a);

        d.leave(b, "r1").await.unwrap();

        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn test_refused_leave_creates_no_rooms() {
        let d = dispatcher();
        let (stranger, _rx) = d.connect().await;
        let (bob, _rx_bob) = d.connect().await;
        d.bind(bob, identity("bob", Role::User)).await.unwrap();

        for i in 0..1000 {
            d.handle(stranger, ClientCommand::Leave { room_id: format!("junk-{}", i) })
                .await;
            d.handle(bob, ClientCommand::Leave { room_id: format!("junk-{}", i) })
                .await;
        }
        // Authorized, but never joined
        d.handle(bob, ClientCommand::Leave { room_id: "r1".into() }).await;

        assert_eq!(d.store().room_count().await, 0);
    }

    #[tokio::test]
    async fn test_unsaved_changes_reach_only_the_sender() {
        let d = Dispatcher::new(
            ConnectionRegistry::new(),
            RoomStateStore::new(
                Arc::new(BrokenSink),
                RetryPolicy {
                    attempts: 2,
                    backoff: Duration::from_millis(1),
                },
            ),
            Arc::new(OnlyR1),
            Arc::new(FixedToken),
        );
        let (teacher, mut teacher_rx) = d.connect().await;
        let (student, mut student_rx) = d.connect().await;
        d.bind(teacher, identity("teacher", Role::Admin)).await.unwrap();
        d.bind(student, identity("student", Role::User)).await.unwrap();
        d.join(teacher, "r1").await.unwrap();
        d.join(student, "r1").await.unwrap();
        drain(&mut teacher_rx);
        drain(&mut student_rx);

        d.handle(
            teacher,
            ClientCommand::Message {
                room_id: "r1".into(),
                text: "hello".into(),
            },
        )
        .await;
        assert!(matches!(drain(&mut teacher_rx).as_slice(), [ServerEvent::Error { .. }]));
        assert!(drain(&mut student_rx).is_empty());

        d.handle(
            teacher,
            ClientCommand::Whiteboard {
                room_id: "r1".into(),
                action: WhiteboardAction::Draw {
                    page_index: 0,
                    stroke_data: json!({"points": [[0, 0], [1, 1]]}),
                },
            },
        )
        .await;
        assert!(matches!(drain(&mut teacher_rx).as_slice(), [ServerEvent::Error { .. }]));
        assert!(drain(&mut student_rx).is_empty());

        assert!(d.store().read_chat_history("r1").await.is_empty());
        assert!(d.store().snapshot("r1").await.is_empty());
    }
}
