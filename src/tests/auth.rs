// Unit tests for API-key authorization.
//
// UNIT UNDER TEST: server::auth::AuthConfig
//
// BUSINESS RESPONSIBILITY:
//   - Accept Bearer or named-header credentials against plaintext or
//     hashed keys (constant-time compare)
//   - Normalize array and comma-separated key configuration identically
//   - 401 on no match, 403 when the predicate objects

use crate::server::auth::{AuthConfig, KeyList};
use axum::http::{HeaderMap, HeaderValue};
use sha2::{Digest, Sha256};
use std::sync::Arc;

fn headers(entries: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in entries {
        map.insert(
            axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    map
}

#[test]
fn test_disabled_auth_allows_everything() {
    let auth = AuthConfig::disabled();
    assert!(auth.authorize(&headers(&[])).is_ok());
}

#[test]
fn test_bearer_and_named_header_both_accepted() {
    let auth = AuthConfig::enabled(&KeyList::List(vec!["secret-1".to_string()]));

    assert!(auth
        .authorize(&headers(&[("authorization", "Bearer secret-1")]))
        .is_ok());
    assert!(auth.authorize(&headers(&[("x-api-key", "secret-1")])).is_ok());
}

#[test]
fn test_wrong_key_is_unauthorized() {
    let auth = AuthConfig::enabled(&KeyList::List(vec!["secret-1".to_string()]));
    let err = auth
        .authorize(&headers(&[("x-api-key", "nope")]))
        .unwrap_err();
    assert_eq!(err.code(), "unauthorized");
    assert_eq!(err.http_status(), 401);
}

#[test]
fn test_missing_credentials_is_unauthorized() {
    let auth = AuthConfig::enabled(&KeyList::List(vec!["secret-1".to_string()]));
    assert_eq!(auth.authorize(&headers(&[])).unwrap_err().code(), "unauthorized");
}

#[test]
fn test_comma_separated_keys_normalize_like_arrays() {
    let joined = KeyList::Joined(" a , b ,, c ".to_string());
    let list = KeyList::List(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    assert_eq!(joined.normalize(), list.normalize());
}

#[test]
fn test_sha256_prefixed_key_matches_hash_of_presented_credential() {
    let digest = hex::encode(Sha256::digest(b"secret-1"));
    let auth = AuthConfig::enabled(&KeyList::List(vec![format!("sha256:{digest}")]));

    assert!(auth.authorize(&headers(&[("x-api-key", "secret-1")])).is_ok());
    assert!(auth.authorize(&headers(&[("x-api-key", "secret-2")])).is_err());
}

#[test]
fn test_bare_hex_key_is_treated_as_digest() {
    let digest = hex::encode(Sha256::digest(b"secret-1"));
    let auth = AuthConfig::enabled(&KeyList::List(vec![digest]));
    assert!(auth.authorize(&headers(&[("x-api-key", "secret-1")])).is_ok());
}

#[test]
fn test_custom_header_name() {
    let auth = AuthConfig::enabled(&KeyList::List(vec!["secret-1".to_string()]))
        .with_header_name("x-custom-auth");
    assert!(auth
        .authorize(&headers(&[("x-custom-auth", "secret-1")]))
        .is_ok());
    assert!(auth.authorize(&headers(&[("x-api-key", "secret-1")])).is_err());
}

#[test]
fn test_forbid_predicate_turns_valid_key_into_403() {
    let auth = AuthConfig::enabled(&KeyList::List(vec!["secret-1".to_string()]))
        .with_forbid(Arc::new(|headers| {
            headers
                .get("x-tenant")
                .is_none()
                .then(|| "missing tenant".to_string())
        }));

    let err = auth
        .authorize(&headers(&[("x-api-key", "secret-1")]))
        .unwrap_err();
    assert_eq!(err.http_status(), 403);

    assert!(auth
        .authorize(&headers(&[("x-api-key", "secret-1"), ("x-tenant", "t1")]))
        .is_ok());
}
