use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChatMessage, ConnectionId, Role, RoomId, Stroke};

/// Commands sent FROM client TO server over WebSocket.
///
/// Framed as `{"type": "<snake_case tag>", "data": {...camelCase fields}}`.
/// Unknown fields are ignored, so a client-supplied `senderConnectionId`
/// never reaches the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    /// Bind an identity to a connection that upgraded without a token
    Identify { token: String },

    Join { room_id: RoomId },

    Leave { room_id: RoomId },

    /// Post a chat line
    Message { room_id: RoomId, text: String },

    /// Draw on or clear a whiteboard page
    Whiteboard {
        room_id: RoomId,
        #[serde(flatten)]
        action: WhiteboardAction,
    },

    GetWhiteboardHistory { room_id: RoomId },

    /// Move every other participant's page cursor
    WhiteboardPageChange { room_id: RoomId, new_page_index: u32 },

    WebrtcOffer {
        room_id: RoomId,
        recipient_connection_id: ConnectionId,
        payload: serde_json::Value,
    },

    WebrtcAnswer {
        room_id: RoomId,
        recipient_connection_id: ConnectionId,
        payload: serde_json::Value,
    },

    WebrtcIceCandidate {
        room_id: RoomId,
        recipient_connection_id: ConnectionId,
        payload: serde_json::Value,
    },

    /// Tell the rest of the room to tear down their peer connections to us
    WebrtcPeerDisconnected { room_id: RoomId },
}

impl ClientCommand {
    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Identify { .. } => "identify",
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Message { .. } => "message",
            Self::Whiteboard { .. } => "whiteboard",
            Self::GetWhiteboardHistory { .. } => "get_whiteboard_history",
            Self::WhiteboardPageChange { .. } => "whiteboard_page_change",
            Self::WebrtcOffer { .. } => "webrtc_offer",
            Self::WebrtcAnswer { .. } => "webrtc_answer",
            Self::WebrtcIceCandidate { .. } => "webrtc_ice_candidate",
            Self::WebrtcPeerDisconnected { .. } => "webrtc_peer_disconnected",
        }
    }

    /// Returns the room this command targets, if any.
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::Identify { .. } => None,
            Self::Join { room_id }
            | Self::Leave { room_id }
            | Self::Message { room_id, .. }
            | Self::Whiteboard { room_id, .. }
            | Self::GetWhiteboardHistory { room_id }
            | Self::WhiteboardPageChange { room_id, .. }
            | Self::WebrtcOffer { room_id, .. }
            | Self::WebrtcAnswer { room_id, .. }
            | Self::WebrtcIceCandidate { room_id, .. }
            | Self::WebrtcPeerDisconnected { room_id } => Some(room_id),
        }
    }
}

/// Mutating whiteboard actions, tagged by `action` inside the command body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WhiteboardAction {
    Draw { page_index: u32, stroke_data: Stroke },
    Clear { page_index: u32 },
}

impl WhiteboardAction {
    pub fn page_index(&self) -> u32 {
        match self {
            Self::Draw { page_index, .. } | Self::Clear { page_index } => *page_index,
        }
    }
}

/// Call-setup message kinds relayed point-to-point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }
}

/// Events sent FROM server TO client over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Identity bound; tells the client its own connection id
    Status {
        connection_id: ConnectionId,
        user_id: Uuid,
        username: String,
        role: Role,
    },

    UserJoined {
        room_id: RoomId,
        username: String,
        role: Role,
        connection_id: ConnectionId,
    },

    UserLeft {
        room_id: RoomId,
        username: String,
        connection_id: ConnectionId,
    },

    /// Full chat log of a room, oldest first, sent only to a new joiner
    ChatHistory(Vec<ChatMessage>),

    Message(ChatMessage),

    Whiteboard(WhiteboardUpdate),

    WhiteboardPageChange { room_id: RoomId, new_page_index: u32 },

    WebrtcOffer {
        room_id: RoomId,
        sender_connection_id: ConnectionId,
        payload: serde_json::Value,
    },

    WebrtcAnswer {
        room_id: RoomId,
        sender_connection_id: ConnectionId,
        payload: serde_json::Value,
    },

    WebrtcIceCandidate {
        room_id: RoomId,
        sender_connection_id: ConnectionId,
        payload: serde_json::Value,
    },

    WebrtcPeerDisconnected {
        room_id: RoomId,
        peer_connection_id: ConnectionId,
    },

    Error { message: String },
}

impl ServerEvent {
    /// Builds the outbound envelope for a relayed signal.
    pub fn signal(
        kind: SignalKind,
        room_id: RoomId,
        sender_connection_id: ConnectionId,
        payload: serde_json::Value,
    ) -> Self {
        match kind {
            SignalKind::Offer => Self::WebrtcOffer {
                room_id,
                sender_connection_id,
                payload,
            },
            SignalKind::Answer => Self::WebrtcAnswer {
                room_id,
                sender_connection_id,
                payload,
            },
            SignalKind::IceCandidate => Self::WebrtcIceCandidate {
                room_id,
                sender_connection_id,
                payload,
            },
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Body of an outbound `whiteboard` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WhiteboardUpdate {
    Draw {
        room_id: RoomId,
        page_index: u32,
        stroke_data: Stroke,
    },
    Clear {
        room_id: RoomId,
        page_index: u32,
    },
    /// Densified page array: index `i` holds page `i`'s strokes in append order
    History {
        room_id: RoomId,
        pages: Vec<Vec<Stroke>>,
    },
}
