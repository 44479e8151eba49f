use thiserror::Error;

use classhub_types::models::ConnectionId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} already has an identity bound")]
    IdentityAlreadyBound(ConnectionId),

    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The history sink kept failing; nothing was applied in memory.
    #[error("history sink rejected {what} for room {room_id} after {attempts} attempts: {last_error}")]
    Unavailable {
        room_id: String,
        what: &'static str,
        attempts: u32,
        last_error: String,
    },
}

/// Why an inbound event was not carried out.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),

    #[error("recipient {0} is no longer connected")]
    RecipientUnavailable(ConnectionId),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
