//! Upstream HTTP client and per-route cookie jar.
//!
//! Each proxy route owns one pooled client for the lifetime of the process.
//! The jar persists upstream-issued cookies across requests, keyed by the
//! upstream origin, so they can be replayed both upstream and back to the
//! browser scoped to the gateway origin.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use cookie::Cookie;
use parking_lot::Mutex;
use tracing::debug;
use url::Url;

/// Ceiling on one upstream round-trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Ceiling on establishing one upstream connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Idle pooled connections are dropped after this long.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pooled HTTP/1.1 client plus cookie jar, exclusively owned by one proxy route.
pub struct UpstreamClient {
    http: reqwest::Client,
    jar: CookieJar,
}

impl UpstreamClient {
    pub fn new(insecure_tls: bool) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .danger_accept_invalid_certs(insecure_tls)
            .build()?;
        Ok(Self {
            http,
            jar: CookieJar::default(),
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn jar(&self) -> &CookieJar {
        &self.jar
    }
}

/// Cookie jar keyed by upstream origin, safe for concurrent use.
///
/// Only the `name=value` pair of each cookie is retained; scoping attributes
/// are deliberately discarded so replayed cookies bind to the replaying
/// origin instead of the upstream one.
#[derive(Default)]
pub struct CookieJar {
    cookies: Mutex<HashMap<String, BTreeMap<String, String>>>,
}

impl CookieJar {
    /// Records one `Set-Cookie` header value observed for `origin`.
    ///
    /// A cookie with `Max-Age` of zero or less removes the stored entry.
    pub fn store(&self, origin: &str, set_cookie: &str) {
        match Cookie::parse(set_cookie) {
            Ok(parsed) => {
                let expired = parsed
                    .max_age()
                    .map(|age| age.whole_seconds() <= 0)
                    .unwrap_or(false);
                let mut cookies = self.cookies.lock();
                let jar = cookies.entry(origin.to_string()).or_default();
                if expired {
                    jar.remove(parsed.name());
                } else {
                    jar.insert(parsed.name().to_string(), parsed.value().to_string());
                }
            }
            Err(e) => debug!(error = %e, "Ignoring unparseable Set-Cookie header"),
        }
    }

    /// Current cookies for `origin` as bare name/value pairs.
    pub fn snapshot(&self, origin: &str) -> Vec<(String, String)> {
        self.cookies
            .lock()
            .get(origin)
            .map(|jar| jar.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

/// Jar key for a target URL: scheme plus authority.
pub fn origin_key(url: &Url) -> String {
    format!("{}://{}", url.scheme(), url.authority())
}
