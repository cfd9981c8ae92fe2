use axum::http::{header, HeaderMap};
use std::collections::HashMap;

/// Pull the credential token out of an upgrade request. Checked in order:
/// Authorization bearer header, `auth_token` cookie, `token` query
/// parameter (browsers cannot set headers on WebSocket upgrades).
pub fn extract_token(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    if let Some(auth_header) = headers.get(header::AUTHORIZATION) {
        if let Ok(auth_str) = auth_header.to_str() {
            return Some(
                auth_str
                    .strip_prefix("Bearer ")
                    .unwrap_or(auth_str)
                    .to_string(),
            );
        }
    }

    if let Some(cookie_header) = headers.get(header::COOKIE) {
        if let Ok(cookie_str) = cookie_header.to_str() {
            for cookie in cookie::Cookie::split_parse(cookie_str).flatten() {
                if cookie.name() == "auth_token" {
                    return Some(cookie.value().to_string());
                }
            }
        }
    }

    query.get("token").cloned()
}
