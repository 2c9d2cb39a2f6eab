//! Authentication extractor.
//!
//! Every sync request names its replica in the `x-concord-replica` header.
//! With `AUTH_SECRET` set, a matching bearer token is required; without it
//! the relay runs open and the header is trusted as-is.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use concord_engine::{ReplicaId, REPLICA_ID_HEADER};

use super::verify_token;
use crate::error::AppError;
use crate::AppState;

/// Authenticated replica extracted from request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthReplica {
    pub replica_id: ReplicaId,
}

impl FromRequestParts<AppState> for AuthReplica {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let replica_id = parts
            .headers
            .get(REPLICA_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::Unauthorized("Missing replica id header".to_string()))?
            .to_string();

        let token = match parts.headers.get(AUTHORIZATION) {
            None => None,
            Some(value) => match value.to_str().ok().and_then(|h| h.strip_prefix("Bearer ")) {
                Some(token) if !token.is_empty() => Some(token),
                Some(_) => {
                    return Err(AppError::Unauthorized("Empty bearer token".to_string()));
                }
                None => {
                    return Err(AppError::Unauthorized(
                        "Invalid authorization header format".to_string(),
                    ));
                }
            },
        };

        if let Some(secret) = &state.config.auth_secret {
            let token = token
                .ok_or_else(|| AppError::Unauthorized("Missing authorization header".to_string()))?;
            if !verify_token(secret, &replica_id, token) {
                return Err(AppError::Unauthorized(format!(
                    "Token does not match replica {replica_id}"
                )));
            }
        }

        Ok(AuthReplica { replica_id })
    }
}
