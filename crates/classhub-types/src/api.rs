use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Identity, Role};

// -- JWT Claims --

/// Claims carried by the tokens the login service issues. The hub only ever
/// decodes them; issuing tokens is not its concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub role: Role,
    pub exp: usize,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Identity {
            user_id: claims.sub,
            username: claims.username,
            role: claims.role,
        }
    }
}

// -- Health --

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
    pub rooms: usize,
}
