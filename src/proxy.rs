//! Reverse-proxy engine: forwards a matched request to its upstream.
//!
//! The matched route prefix is replaced with the route's upstream URL, the
//! inbound query is merged with the route's forced parameters, headers and
//! cookies are sanitized, and the upstream answer streams back to the client
//! with the route's cookie jar replayed as gateway-scoped `Set-Cookie`s.

use std::collections::HashMap;

use futures::TryStreamExt;
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use hyper::header::{HeaderValue, AUTHORIZATION, SET_COOKIE};
use hyper::{Request, Response, StatusCode};
use tracing::{debug, error, info};
use url::form_urlencoded;
use url::Url;

use crate::headers;
use crate::route::ProxyRoute;
use crate::server::{self, ResponseBody};
use crate::upstream;

/// Forwards one matched request upstream and streams the answer back.
pub async fn forward(route: &ProxyRoute, prefix: &str, req: Request<Incoming>) -> Response<ResponseBody> {
    // The raw (still percent-encoded) path is the rewrite source, so encoded
    // characters survive into the upstream URL.
    let path = req.uri().path().to_string();
    let rewritten = path.replacen(prefix, &route.url_to, 1);
    let mut target = match Url::parse(&rewritten) {
        Ok(url) => url,
        Err(e) => {
            error!(target = %rewritten, error = %e, "Upstream URL rewrite produced an unparseable URL");
            return server::text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
    };
    apply_query(&mut target, req.uri().query(), &route.forced_parameters);

    debug!(from = %path, to = %target, "Proxying");

    let method = req.method().clone();
    let origin = upstream::origin_key(&target);
    let mut outbound_headers =
        headers::sanitize_request_headers(req.headers(), &method, route.auth.is_some());
    // Cookies stored from earlier upstream responses ride along on every
    // later request through this route.
    headers::merge_jar_cookies(&mut outbound_headers, &route.client.jar().snapshot(&origin));

    if route.log {
        info!("{} {}", method, target);
    }

    let mut builder = route
        .client
        .http()
        .request(method, target)
        .headers(outbound_headers);
    builder = apply_auth(builder, route.auth.as_deref());

    // Stream the inbound body through instead of buffering it.
    if !req.body().is_end_stream() {
        let frames = BodyStream::new(req.into_body())
            .try_filter_map(|frame| async move { Ok(frame.into_data().ok()) });
        builder = builder.body(reqwest::Body::wrap_stream(frames));
    }

    let upstream_response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Upstream request failed");
            return server::text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Proxy Error: {}", e),
            );
        }
    };

    let mut response = Response::new(server::empty());
    *response.status_mut() = upstream_response.status();
    headers::copy_response_headers(upstream_response.headers(), response.headers_mut());

    // Upstream-issued cookies feed the jar before its snapshot is replayed
    // to the client, rescoped to the gateway origin.
    for value in upstream_response.headers().get_all(SET_COOKIE) {
        if let Ok(raw) = value.to_str() {
            route.client.jar().store(&origin, raw);
        }
    }
    for (name, value) in route.client.jar().snapshot(&origin) {
        if let Ok(header) = HeaderValue::from_str(&format!("{}={}", name, value)) {
            response.headers_mut().append(SET_COOKIE, header);
        }
    }

    // Headers are already on the wire once the body streams; a copy error
    // can only be logged.
    let frames = upstream_response
        .bytes_stream()
        .inspect_err(|e| error!(error = %e, "Upstream body copy failed mid-stream"))
        .map_ok(Frame::data)
        .map_err(std::io::Error::other);
    *response.body_mut() = BodyExt::boxed_unsync(StreamBody::new(frames));
    response
}

/// Applies the inbound query, then overlays each forced parameter with set
/// semantics: exactly one value per forced key, inbound values overridden.
fn apply_query(target: &mut Url, inbound: Option<&str>, forced: &HashMap<String, String>) {
    let inbound_pairs: Vec<(String, String)> = inbound
        .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    {
        let mut pairs = target.query_pairs_mut();
        pairs.clear();
        pairs.extend_pairs(inbound_pairs.iter().filter(|(k, _)| !forced.contains_key(k)));
        pairs.extend_pairs(forced.iter());
    }
    if target.query() == Some("") {
        target.set_query(None);
    }
}

/// `user:password` becomes HTTP basic auth; anything without a colon is
/// treated as an already-encoded credential.
fn apply_auth(builder: reqwest::RequestBuilder, auth: Option<&str>) -> reqwest::RequestBuilder {
    let Some(auth) = auth else { return builder };
    match auth.split_once(':') {
        Some((user, password)) => builder.basic_auth(user, Some(password)),
        None => builder.header(AUTHORIZATION, format!("Basic {}", auth)),
    }
}
