//! Signed user tokens.
//!
//! A token is `<user id>.<hex HMAC-SHA256 of the id>`, keyed with the
//! configured secret. Tokens carry no expiry.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::errors::AppError;

type HmacSha256 = Hmac<Sha256>;

/// Domain separator mixed into every signature.
const TOKEN_SALT: &[u8] = b"whitelist";

#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl TokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self, user_id: &Uuid) -> Result<HmacSha256, AppError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| AppError::InternalError(format!("Invalid token key: {}", e)))?;
        mac.update(TOKEN_SALT);
        mac.update(user_id.as_bytes());
        Ok(mac)
    }

    pub fn issue(&self, user_id: Uuid) -> Result<String, AppError> {
        let signature = self.mac(&user_id)?.finalize().into_bytes();
        Ok(format!("{}.{}", user_id.simple(), hex::encode(signature)))
    }

    /// User id carried by `token`, or `Unauthorized` for anything not signed by us.
    pub fn verify(&self, token: &str) -> Result<Uuid, AppError> {
        let unauthorized = || AppError::Unauthorized("Invalid user token".to_string());

        let (id, signature) = token.trim().split_once('.').ok_or_else(unauthorized)?;
        let user_id = Uuid::parse_str(id).map_err(|_| unauthorized())?;
        let signature = hex::decode(signature).map_err(|_| unauthorized())?;

        self.mac(&user_id)?
            .verify_slice(&signature)
            .map_err(|_| unauthorized())?;
        Ok(user_id)
    }
}
