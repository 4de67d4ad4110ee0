//! API-key authorization.
//!
//! Credentials arrive as `Authorization: Bearer <key>` or in a named
//! header (default `x-api-key`). Configured keys may be plaintext or
//! hashed (`sha256:<hex>` or a bare 64-char hex digest); comparison is
//! constant time either way. An optional caller-provided predicate can
//! turn an authenticated request into a 403.

use axum::http::HeaderMap;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::{CoordResult, CoordinatorError};

/// Predicate that may forbid an authenticated request; returns a reason.
pub type ForbidPredicate = Arc<dyn Fn(&HeaderMap) -> Option<String> + Send + Sync>;

/// Keys accepted as either an array or a comma-separated string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum KeyList {
    List(Vec<String>),
    Joined(String),
}

impl KeyList {
    /// Normalize both forms identically: split, trim, drop empties.
    pub fn normalize(&self) -> Vec<String> {
        let items: Vec<String> = match self {
            KeyList::List(list) => list.clone(),
            KeyList::Joined(joined) => joined.split(',').map(str::to_string).collect(),
        };
        items
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ConfiguredKey {
    Plain(String),
    Sha256(Vec<u8>),
}

/// Resolved auth configuration.
#[derive(Clone, Default)]
pub struct AuthConfig {
    enabled: bool,
    header_name: String,
    allow_bearer: bool,
    keys: Vec<ConfiguredKey>,
    forbid: Option<ForbidPredicate>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("enabled", &self.enabled)
            .field("header_name", &self.header_name)
            .field("allow_bearer", &self.allow_bearer)
            .field("key_count", &self.keys.len())
            .finish_non_exhaustive()
    }
}

impl AuthConfig {
    /// Auth disabled: every request passes.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Auth enabled with the given keys.
    pub fn enabled(keys: &KeyList) -> Self {
        Self {
            enabled: true,
            header_name: "x-api-key".to_string(),
            allow_bearer: true,
            keys: keys.normalize().iter().map(|k| parse_key(k)).collect(),
            forbid: None,
        }
    }

    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.header_name = name.into();
        self
    }

    pub fn with_bearer(mut self, allow: bool) -> Self {
        self.allow_bearer = allow;
        self
    }

    pub fn with_forbid(mut self, predicate: ForbidPredicate) -> Self {
        self.forbid = Some(predicate);
        self
    }

    /// Authorize a request: 401 unless at least one presented credential
    /// matches a configured key, then 403 if the predicate objects.
    pub fn authorize(&self, headers: &HeaderMap) -> CoordResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let mut candidates: Vec<&str> = Vec::new();
        if self.allow_bearer {
            if let Some(bearer) = headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
            {
                candidates.push(bearer.trim());
            }
        }
        if let Some(named) = headers
            .get(self.header_name.as_str())
            .and_then(|v| v.to_str().ok())
        {
            candidates.push(named.trim());
        }

        let authorized = candidates
            .iter()
            .any(|candidate| self.keys.iter().any(|key| matches(key, candidate)));
        if !authorized {
            return Err(CoordinatorError::Unauthorized);
        }

        if let Some(forbid) = &self.forbid {
            if let Some(reason) = forbid(headers) {
                return Err(CoordinatorError::forbidden(reason));
            }
        }
        Ok(())
    }
}

/// `sha256:<hex>` and bare 64-char hex parse as digests; everything else
/// is a plaintext key.
fn parse_key(key: &str) -> ConfiguredKey {
    let hex_part = key.strip_prefix("sha256:").unwrap_or(key);
    let looks_hashed = key.starts_with("sha256:")
        || (key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit()));
    if looks_hashed {
        if let Ok(digest) = hex::decode(hex_part) {
            return ConfiguredKey::Sha256(digest);
        }
    }
    ConfiguredKey::Plain(key.to_string())
}

fn matches(key: &ConfiguredKey, candidate: &str) -> bool {
    match key {
        ConfiguredKey::Plain(plain) => constant_time_eq(plain.as_bytes(), candidate.as_bytes()),
        ConfiguredKey::Sha256(digest) => {
            let hashed = Sha256::digest(candidate.as_bytes());
            constant_time_eq(digest, &hashed)
        }
    }
}

/// Length-gated constant-time byte comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
