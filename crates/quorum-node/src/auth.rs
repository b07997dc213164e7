// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Bearer authentication for admin routes and the WebSocket upgrade.
//!
//! Token comparison is constant-time; a missing or wrong credential answers
//! 401 with `WWW-Authenticate: Bearer` so CLI clients know what to send.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;

use quorum_config::AuthConfig;

pub fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [("WWW-Authenticate", "Bearer")],
        "unauthorized",
    )
        .into_response()
}

fn token_matches(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Admin routes: open when no key is configured, bearer-gated otherwise.
pub fn check_admin(headers: &HeaderMap, admin_key: Option<&str>) -> Result<(), Response> {
    let Some(expected) = admin_key else {
        return Ok(());
    };
    match bearer_token(headers) {
        Some(provided) if token_matches(expected, provided) => Ok(()),
        _ => Err(unauthorized()),
    }
}

/// WebSocket upgrade auth per the configured mode.
pub fn check_ws(
    headers: &HeaderMap,
    query_token: Option<&str>,
    auth: &AuthConfig,
    admin_key: Option<&str>,
) -> Result<(), Response> {
    let Some(expected) = admin_key else {
        return Ok(());
    };
    let provided = match auth {
        AuthConfig::None => return Ok(()),
        AuthConfig::Bearer => bearer_token(headers),
        AuthConfig::Query => query_token,
    };
    match provided {
        Some(token) if token_matches(expected, token) => Ok(()),
        _ => Err(unauthorized()),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(token: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(t) = token {
            headers.insert(
                "authorization",
                HeaderValue::from_str(&format!("Bearer {t}")).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn open_when_no_key_configured() {
        assert!(check_admin(&headers_with(None), None).is_ok());
    }

    #[test]
    fn admin_requires_exact_bearer() {
        assert!(check_admin(&headers_with(Some("sekrit")), Some("sekrit")).is_ok());
        assert!(check_admin(&headers_with(Some("wrong")), Some("sekrit")).is_err());
        assert!(check_admin(&headers_with(None), Some("sekrit")).is_err());
    }

    #[test]
    fn ws_query_mode_reads_query_token() {
        let auth = AuthConfig::Query;
        assert!(check_ws(&headers_with(None), Some("sekrit"), &auth, Some("sekrit")).is_ok());
        assert!(check_ws(&headers_with(None), Some("nope"), &auth, Some("sekrit")).is_err());
        // Bearer header is ignored in query mode.
        assert!(check_ws(&headers_with(Some("sekrit")), None, &auth, Some("sekrit")).is_err());
    }

    #[test]
    fn unauthorized_carries_www_authenticate() {
        let resp = unauthorized();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.headers().get("WWW-Authenticate").unwrap(),
            "Bearer"
        );
    }
}
