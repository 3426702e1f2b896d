//! Caller identity. Every request carries an `x-api-key` header: either the
//! admin key from the server flags, or a per-user key issued at user
//! creation. A user key only opens that user's paths.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::db;
use crate::error::ApiError;
use crate::server::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone)]
pub enum Caller {
    Admin,
    User(String),
}

impl Caller {
    /// Enforce that the caller may act on the `{user}` path segment.
    pub fn authorize(&self, user_id: &str) -> Result<(), ApiError> {
        match self {
            Caller::Admin => Ok(()),
            Caller::User(id) if id == user_id => Ok(()),
            Caller::User(_) => Err(ApiError::Forbidden(
                "API key is not bound to this user".to_string(),
            )),
        }
    }

    pub fn require_admin(&self) -> Result<(), ApiError> {
        match self {
            Caller::Admin => Ok(()),
            Caller::User(_) => Err(ApiError::Forbidden(
                "administrator API key required".to_string(),
            )),
        }
    }
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ApiError::Unauthorized(format!("missing {} header", API_KEY_HEADER))
            })?;
        if key == state.admin_api_key {
            return Ok(Caller::Admin);
        }
        match db::get_user_by_api_key(&state.pool, key).await? {
            Some(user) => Ok(Caller::User(user.id)),
            None => Err(ApiError::Unauthorized("unrecognized API key".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_key_is_bound_to_its_user() {
        let caller = Caller::User("u1".to_string());
        assert!(caller.authorize("u1").is_ok());
        assert!(caller.authorize("u2").is_err());
        assert!(caller.require_admin().is_err());
    }

    #[test]
    fn admin_key_opens_every_path() {
        let caller = Caller::Admin;
        assert!(caller.authorize("u1").is_ok());
        assert!(caller.authorize("u2").is_ok());
        assert!(caller.require_admin().is_ok());
    }
}
