//! The Auth Broker (C7): OAuth 2.0 authorization-code grant plus lazy user
//! provisioning. Every RPC call that is not `initialize`/`ping` must carry a
//! bearer token that resolves to an `AuthContext` before reaching the
//! Memory Core.

pub mod idp;
pub mod oauth;
pub mod users;

use std::sync::Arc;

use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::types::UserId;

/// Resolved identity for a single request. Constructed only by
/// `resolve_request`, never by hand, so an RPC handler cannot accidentally
/// run with a blank or guessed `user_id`.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: UserId,
    pub scope: String,
}

impl AuthContext {
    pub fn has_scope(&self, required: &str) -> bool {
        self.scope.split_whitespace().any(|s| s == required)
    }

    pub fn require_scope(&self, required: &str) -> Result<()> {
        if self.has_scope(required) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!("missing scope '{required}'")))
        }
    }
}

/// Resolves a bearer token presented over the HTTP transport into an
/// `AuthContext`, provisioning the `User` row on first sight. Returns
/// `Error::Unauthorized` for anything that doesn't resolve — unknown token,
/// expired token, revoked token, or inactive user.
pub fn resolve_bearer_token(conn: &Connection, token: &str) -> Result<AuthContext> {
    let access_token = oauth::validate_access_token(conn, token)?.ok_or(Error::Unauthorized)?;
    let user = users::get_user(conn, &access_token.user_id)?.ok_or(Error::Unauthorized)?;
    if !user.is_active {
        return Err(Error::Unauthorized);
    }
    Ok(AuthContext {
        user_id: access_token.user_id,
        scope: access_token.scope,
    })
}

/// Resolves an IdP token (used on the stdio transport, where there is no
/// separate OAuth dance) by verifying it with the configured provider and
/// provisioning the user on first sight. Full access scope is granted since
/// the stdio transport is assumed single-tenant-operator, per SPEC_FULL.md 6.
pub async fn resolve_idp_token(
    conn: &Connection,
    provider: &Arc<dyn idp::IdentityProvider>,
    bearer_token: &str,
) -> Result<AuthContext> {
    let claims = provider.verify(bearer_token).await?;
    let user = users::get_or_create_user(conn, &claims.subject, &claims.email)?;
    if !user.is_active {
        return Err(Error::Unauthorized);
    }
    Ok(AuthContext {
        user_id: user.id,
        scope: "memories:read memories:write".to_string(),
    })
}
