use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::debug;

use classhub_types::api::Claims;
use classhub_types::models::Identity;

use crate::oracle::IdentityProvider;

/// Trusts HS256 tokens signed with the shared secret of the login service.
pub struct JwtIdentityProvider {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityProvider {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }
}

impl IdentityProvider for JwtIdentityProvider {
    fn identify(&self, token: &str) -> Option<Identity> {
        match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(token_data) => Some(token_data.claims.into()),
            Err(e) => {
                debug!("Rejected gateway token: {}", e);
                None
            }
        }
    }
}
