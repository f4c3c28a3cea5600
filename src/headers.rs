//! Header and cookie hygiene for proxied requests.
//!
//! The outbound upstream request gets a filtered copy of the inbound headers:
//! browser fetch-metadata and CSRF headers are dropped, conditional-caching
//! headers are removed so upstreams always answer with a full response, and
//! cookies are re-attached as bare pairs so upstream scoping attributes do
//! not leak across origins.

use std::collections::HashSet;

use cookie::Cookie;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, CACHE_CONTROL, COOKIE, USER_AGENT};
use hyper::Method;

/// Sent upstream when the inbound request carried no User-Agent.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:80.0) Gecko/20100101 Firefox/80.0";

/// Headers owned by the HTTP stacks on either leg; never copied through.
fn is_managed(name: &str) -> bool {
    matches!(
        name,
        "host"
            | "content-length"
            | "transfer-encoding"
            | "connection"
            | "keep-alive"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "upgrade"
            | "cookie"
            | "set-cookie"
    )
}

/// Headers the gateway refuses to forward upstream.
fn is_filtered(name: &str, method: &Method) -> bool {
    if name.starts_with("sec-") {
        return true;
    }
    if name == "x-csrf-token" && method != Method::POST {
        return true;
    }
    // Conditional-caching headers are always removed.
    matches!(name, "if-none-match" | "last-modified" | "if-modified-since")
}

/// Builds the outbound header map for an upstream request.
///
/// `drop_authorization` removes the inbound credential so a route-configured
/// one can be injected without ending up with two `Authorization` values.
pub fn sanitize_request_headers(
    inbound: &HeaderMap,
    method: &Method,
    drop_authorization: bool,
) -> HeaderMap {
    let mut outbound = HeaderMap::with_capacity(inbound.len() + 2);
    for (name, value) in inbound {
        if is_managed(name.as_str()) || is_filtered(name.as_str(), method) {
            continue;
        }
        if drop_authorization && name == AUTHORIZATION {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }

    if !outbound.contains_key(USER_AGENT) {
        outbound.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    }
    outbound.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));

    if let Some(cookies) = rebuild_cookie_header(inbound) {
        outbound.insert(COOKIE, cookies);
    }
    outbound
}

/// Re-attaches the inbound cookies as bare `name=value` pairs.
///
/// Request cookies carry no attributes on the wire, so dropping everything
/// but the pair is how `Secure`, `Domain`, and `SameSite` scoping is cleared.
pub fn rebuild_cookie_header(inbound: &HeaderMap) -> Option<HeaderValue> {
    let mut pairs = Vec::new();
    for value in inbound.get_all(COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for parsed in Cookie::split_parse(raw) {
            if let Ok(cookie) = parsed {
                pairs.push(format!("{}={}", cookie.name(), cookie.value()));
            }
        }
    }
    if pairs.is_empty() {
        return None;
    }
    HeaderValue::from_str(&pairs.join("; ")).ok()
}

/// Merges jar-stored cookies into the outbound `Cookie` header.
///
/// Inbound pairs stay as-is; stored cookies the client did not send are
/// appended, so upstream-issued cookies reach the upstream on every later
/// request through the route.
pub fn merge_jar_cookies(outbound: &mut HeaderMap, stored: &[(String, String)]) {
    if stored.is_empty() {
        return;
    }
    let mut pairs: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    if let Some(existing) = outbound.get(COOKIE).and_then(|v| v.to_str().ok()) {
        for parsed in Cookie::split_parse(existing) {
            if let Ok(cookie) = parsed {
                seen.insert(cookie.name().to_string());
                pairs.push(format!("{}={}", cookie.name(), cookie.value()));
            }
        }
    }
    for (name, value) in stored {
        if seen.insert(name.clone()) {
            pairs.push(format!("{}={}", name, value));
        }
    }
    if pairs.is_empty() {
        return;
    }
    if let Ok(header) = HeaderValue::from_str(&pairs.join("; ")) {
        outbound.insert(COOKIE, header);
    }
}

/// Copies upstream response headers to the client response.
///
/// Everything is copied verbatim, multi-valued included, except the
/// connection-management headers the server leg produces itself.
pub fn copy_response_headers(upstream: &HeaderMap, outbound: &mut HeaderMap) {
    for (name, value) in upstream {
        if matches!(name.as_str(), "connection" | "keep-alive" | "transfer-encoding") {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }
}
