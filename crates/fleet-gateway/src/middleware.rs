use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

/// Auth configuration for the gateway.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// API keys that are allowed to connect. Empty = no auth required.
    pub api_keys: Vec<String>,
}

impl AuthConfig {
    /// Accept the given keys. An empty list disables auth.
    pub fn new(api_keys: Vec<String>) -> Self {
        Self { api_keys }
    }

    /// Returns true if authentication is enabled (at least one key configured).
    pub fn is_enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }

    /// Whether `key` matches any configured key.
    pub fn accepts(&self, key: &str) -> bool {
        self.api_keys.iter().any(|k| constant_time_eq(k, key))
    }
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Auth middleware: validates API key from header or query param.
///
/// Checks `Authorization: Bearer <key>` header first, then `?api_key=<key>` query param.
/// If no API keys are configured, all requests are allowed.
pub async fn auth_middleware(
    State(auth): State<Arc<AuthConfig>>,
    headers: HeaderMap,
    query: Query<AuthQuery>,
    request: Request,
    next: Next,
) -> Response {
    if !auth.is_enabled() {
        return next.run(request).await;
    }

    let key_from_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    let key = key_from_header.or_else(|| query.api_key.clone());

    match key {
        Some(k) if auth.accepts(&k) => next.run(request).await,
        Some(_) => {
            warn!(path = %request.uri().path(), "Rejected request: invalid API key");
            (StatusCode::UNAUTHORIZED, "Invalid API key").into_response()
        }
        None => {
            warn!(path = %request.uri().path(), "Rejected request: missing API key");
            (StatusCode::UNAUTHORIZED, "API key required").into_response()
        }
    }
}

/// Query parameters inspected by [`auth_middleware`].
#[derive(serde::Deserialize, Default)]
pub struct AuthQuery {
    /// Key passed as `?api_key=`.
    pub api_key: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_without_keys() {
        assert!(!AuthConfig::default().is_enabled());
        assert!(AuthConfig::new(vec!["k".into()]).is_enabled());
    }

    #[test]
    fn test_accepts_only_exact_keys() {
        let auth = AuthConfig::new(vec!["secret-1".into(), "secret-2".into()]);
        assert!(auth.accepts("secret-2"));
        assert!(!auth.accepts("secret-3"));
        assert!(!auth.accepts("secret-"));
        assert!(!auth.accepts(""));
    }
}
