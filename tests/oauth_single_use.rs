//! Universal invariant 7 and scenario S5: an authorization code can be
//! exchanged for a token exactly once; the second attempt is `invalid_grant`
//! and issues nothing.

use engram::auth::oauth::{exchange_code_for_token, issue_authorization_code, register_client};
use engram::error::Error;
use engram::storage::Storage;

const USER: &str = "oauth-user";

#[test]
fn s5_code_exchange_then_second_exchange_is_invalid_grant() {
    let storage = Storage::open_in_memory().unwrap();
    let conn = storage.connection();

    let (client, _secret) = register_client(
        &conn,
        "test-client",
        vec!["https://app/cb".to_string()],
        vec!["memories:read".to_string()],
    )
    .unwrap();

    let code = issue_authorization_code(
        &conn,
        &client,
        &USER.to_string(),
        "https://app/cb",
        "memories:read",
        Some("abc".to_string()),
    )
    .unwrap();

    let token = exchange_code_for_token(&conn, &client, &code.code, "https://app/cb").unwrap();
    assert!(token.token.starts_with("tok_"));
    assert_eq!(token.scope, "memories:read");

    let second_attempt = exchange_code_for_token(&conn, &client, &code.code, "https://app/cb");
    assert!(matches!(second_attempt, Err(Error::Forbidden(_))), "expected invalid_grant on reuse, got {second_attempt:?}");
}

#[test]
fn exchange_with_wrong_redirect_uri_is_rejected() {
    let storage = Storage::open_in_memory().unwrap();
    let conn = storage.connection();

    let (client, _secret) = register_client(
        &conn,
        "test-client",
        vec!["https://app/cb".to_string()],
        vec!["memories:read".to_string()],
    )
    .unwrap();

    let code = issue_authorization_code(
        &conn,
        &client,
        &USER.to_string(),
        "https://app/cb",
        "memories:read",
        None,
    )
    .unwrap();

    let result = exchange_code_for_token(&conn, &client, &code.code, "https://attacker.example/cb");
    assert!(result.is_err());
}
