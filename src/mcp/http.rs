//! The HTTP transport for the RPC Surface (C8): `POST /rpc`, `GET /health`,
//! and the OAuth 2.0 authorization-code routes.
//!
//! Grounded on the teacher's `realtime/server.rs` `Router`/`State`
//! composition; `GET /health` is carried close to verbatim. There is no
//! interactive consent UI here (the teacher has none either) — `GET
//! /oauth/authorize` treats a valid `Authorization: Bearer <idp-token>`
//! header as the resource owner already being signed in and consenting,
//! which is the natural headless-service reading of spec.md 4.7's
//! authorize step. See DESIGN.md.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use super::dispatcher::Dispatcher;
use super::protocol::McpRequest;
use crate::auth::idp::IdentityProvider;
use crate::auth::{oauth, users};
use crate::storage::Storage;

#[derive(Clone)]
pub struct HttpState {
    pub dispatcher: Arc<Dispatcher>,
    pub storage: Storage,
    pub idp: Arc<dyn IdentityProvider>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/rpc", post(rpc_handler))
        .route("/api/mcp", post(rpc_handler))
        .route("/oauth/authorize", get(authorize_handler))
        .route("/oauth/token", post(token_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

fn bearer_token(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

async fn rpc_handler(
    State(state): State<HttpState>,
    headers: axum::http::HeaderMap,
    Json(request): Json<McpRequest>,
) -> impl IntoResponse {
    let token = bearer_token(&headers);
    let response = state.dispatcher.dispatch(request, token).await;
    Json(response)
}

#[derive(Debug, Deserialize)]
struct AuthorizeParams {
    client_id: String,
    redirect_uri: String,
    response_type: String,
    scope: String,
    state: Option<String>,
}

/// `GET /oauth/authorize?client_id&redirect_uri&response_type=code&scope&state`.
async fn authorize_handler(
    State(state): State<HttpState>,
    Query(params): Query<AuthorizeParams>,
    headers: axum::http::HeaderMap,
) -> Response {
    if params.response_type != "code" {
        return error_redirect(&params.redirect_uri, "unsupported_response_type", params.state.as_deref());
    }

    let Some(idp_token) = bearer_token(&headers) else {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "login_required" }))).into_response();
    };

    let conn = state.storage.connection();
    let client = match oauth::get_client(&conn, &params.client_id) {
        Ok(Some(c)) => c,
        Ok(None) => return error_redirect(&params.redirect_uri, "invalid_request", params.state.as_deref()),
        Err(_) => return error_redirect(&params.redirect_uri, "server_error", params.state.as_deref()),
    };
    if !client.redirect_uris.iter().any(|u| u == &params.redirect_uri) {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid_request", "error_description": "redirect_uri not registered" }))).into_response();
    }

    let claims = match state.idp.verify(idp_token).await {
        Ok(c) => c,
        Err(_) => return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "login_required" }))).into_response(),
    };
    let user = match users::get_or_create_user(&conn, &claims.subject, &claims.email) {
        Ok(u) => u,
        Err(_) => return error_redirect(&params.redirect_uri, "server_error", params.state.as_deref()),
    };

    match oauth::issue_authorization_code(&conn, &client, &user.id, &params.redirect_uri, &params.scope, params.state.clone()) {
        Ok(code) => {
            let mut url = format!("{}?code={}", params.redirect_uri, code.code);
            if let Some(s) = &params.state {
                url.push_str(&format!("&state={s}"));
            }
            Redirect::to(&url).into_response()
        }
        Err(_) => error_redirect(&params.redirect_uri, "invalid_request", params.state.as_deref()),
    }
}

fn error_redirect(redirect_uri: &str, error: &str, state: Option<&str>) -> Response {
    let mut url = format!("{redirect_uri}?error={error}");
    if let Some(s) = state {
        url.push_str(&format!("&state={s}"));
    }
    Redirect::to(&url).into_response()
}

#[derive(Debug, Deserialize)]
struct TokenParams {
    grant_type: String,
    code: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

/// `POST /oauth/token`. Accepts either form-encoded or JSON bodies — the
/// teacher's own HTTP handlers only ever consume JSON, but RFC 6749 mandates
/// `application/x-www-form-urlencoded` for this endpoint, so both are
/// wired in as separate extractors tried in sequence via content type.
async fn token_handler(State(state): State<HttpState>, headers: axum::http::HeaderMap, body: axum::body::Bytes) -> Response {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);

    let params: Result<TokenParams, String> = if is_json {
        serde_json::from_slice(&body).map_err(|e| e.to_string())
    } else {
        serde_urlencoded::from_bytes(&body).map_err(|e| e.to_string())
    };

    let params = match params {
        Ok(p) => p,
        Err(_) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid_request" }))).into_response(),
    };

    if params.grant_type != "authorization_code" {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "unsupported_grant_type" }))).into_response();
    }

    let conn = state.storage.connection();
    let client = match oauth::get_client(&conn, &params.client_id) {
        Ok(Some(c)) => c,
        Ok(None) => return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid_client" }))).into_response(),
        Err(_) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": "server_error" }))).into_response(),
    };
    if !oauth::verify_client_secret(&client, &params.client_secret) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid_client" }))).into_response();
    }

    match oauth::exchange_code_for_token(&conn, &client, &params.code, &params.redirect_uri) {
        Ok(token) => (
            StatusCode::OK,
            Json(json!({
                "access_token": token.token,
                "token_type": "Bearer",
                "expires_in": 3600,
                "scope": token.scope,
            })),
        )
            .into_response(),
        Err(_) => (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid_grant" }))).into_response(),
    }
}
