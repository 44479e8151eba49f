//! Point-to-point relay of WebRTC call setup. Media never passes through here,
//! only the offer/answer/candidate metadata peers need to find each other.

use tracing::{debug, info, trace};

use classhub_types::events::{ServerEvent, SignalKind};
use classhub_types::models::ConnectionId;

use crate::dispatcher::{Dispatcher, validate_room_id};
use crate::error::GatewayError;

impl Dispatcher {
    /// Forward a signal to exactly one connection, stamped with the sender's
    /// connection id. No acknowledgement; a vanished recipient is a silent drop.
    pub async fn relay_signal(
        &self,
        conn_id: ConnectionId,
        kind: SignalKind,
        room_id: &str,
        recipient: ConnectionId,
        payload: serde_json::Value,
    ) -> Result<(), GatewayError> {
        validate_room_id(room_id)?;
        let identity = self.authorize(conn_id, room_id).await?;

        match kind {
            SignalKind::IceCandidate => trace!(
                "{} ({}) -> {} to {} in room {}",
                identity.username,
                conn_id,
                kind.as_str(),
                recipient,
                room_id
            ),
            _ => info!(
                "{} ({}) -> {} to {} in room {}",
                identity.username,
                conn_id,
                kind.as_str(),
                recipient,
                room_id
            ),
        }

        self.registry()
            .send_to(
                recipient,
                ServerEvent::signal(kind, room_id.to_string(), conn_id, payload),
            )
            .await
            .map_err(|_| GatewayError::RecipientUnavailable(recipient))
    }

    /// Everyone else in the room tears down their peer connection to the sender.
    pub async fn peer_disconnected(&self, conn_id: ConnectionId, room_id: &str) -> Result<(), GatewayError> {
        validate_room_id(room_id)?;
        let identity = self.authorize(conn_id, room_id).await?;

        let notified = self
            .registry()
            .broadcast(
                room_id,
                ServerEvent::WebrtcPeerDisconnected {
                    room_id: room_id.to_string(),
                    peer_connection_id: conn_id,
                },
                Some(conn_id),
            )
            .await;
        debug!(
            "{} ({}) hung up in room {}, notified {} peers",
            identity.username, conn_id, room_id, notified
        );
        Ok(())
    }
}
