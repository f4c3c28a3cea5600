//! Route table: maps URL prefixes to their dispositions.
//!
//! The table is built once at startup and read-only afterwards; requests
//! select a route by longest-prefix match over the request URI.

use std::collections::HashMap;

use crate::upstream::UpstreamClient;

/// What happens to a request whose URI matched a route prefix.
pub enum Route {
    /// Forward to a remote upstream HTTP server.
    Proxy(ProxyRoute),
    /// Execute a local program and answer with its output.
    Plugin(PluginRoute),
}

impl Route {
    /// Human-readable target, for the startup route listing.
    pub fn target(&self) -> &str {
        match self {
            Route::Proxy(p) => &p.url_to,
            Route::Plugin(p) => &p.executable,
        }
    }
}

/// Disposition payload for a reverse-proxied prefix.
pub struct ProxyRoute {
    /// Absolute URL prefix of the upstream; replaces the matched route prefix.
    pub url_to: String,
    /// Query parameters forced onto every outbound request (set semantics).
    pub forced_parameters: HashMap<String, String>,
    /// `user:password`, or a pre-encoded basic credential without a colon.
    pub auth: Option<String>,
    /// Log `METHOD URL` for every request through this route.
    pub log: bool,
    /// Upstream TLS certificate verification is skipped.
    pub insecure_tls: bool,
    /// Pooled client plus cookie jar, exclusively owned by this route.
    pub client: UpstreamClient,
}

/// How a plugin's stdout is turned into an HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginMode {
    /// stdout becomes the response body verbatim.
    Simple,
    /// stdout carries CGI/1.1 headers, a blank line, and the body.
    Cgi,
}

/// Disposition payload for a plugin prefix.
pub struct PluginRoute {
    pub mode: PluginMode,
    /// Program to run; macro-expandable.
    pub executable: String,
    /// Arguments in order; each macro-expandable.
    pub arguments: Vec<String>,
    /// Default response Content-Type in simple mode.
    pub content_type: String,
    /// Forward the plugin's stderr to the gateway log.
    pub log: bool,
}

/// Immutable prefix-to-route mapping.
///
/// Routes are kept sorted longest prefix first (ties broken by lexicographic
/// order) so that a linear scan yields the deterministic longest-prefix match.
pub struct RouteTable {
    routes: Vec<(String, Route)>,
}

impl RouteTable {
    pub fn new(mut routes: Vec<(String, Route)>) -> Self {
        routes.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Self { routes }
    }

    /// Selects the route with the longest prefix of `request_uri`.
    ///
    /// Matching is plain prefix matching, not path-segment matching: a route
    /// `/a` also matches `/abc`.
    pub fn lookup(&self, request_uri: &str) -> Option<(&str, &Route)> {
        self.routes
            .iter()
            .find(|(prefix, _)| request_uri.starts_with(prefix.as_str()))
            .map(|(prefix, route)| (prefix.as_str(), route))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Route)> {
        self.routes.iter().map(|(prefix, route)| (prefix.as_str(), route))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin_route(executable: &str) -> Route {
        Route::Plugin(PluginRoute {
            mode: PluginMode::Simple,
            executable: executable.to_string(),
            arguments: Vec::new(),
            content_type: String::new(),
            log: false,
        })
    }

    fn table(prefixes: &[&str]) -> RouteTable {
        RouteTable::new(
            prefixes
                .iter()
                .map(|p| (p.to_string(), plugin_route(p)))
                .collect(),
        )
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = table(&["/a/", "/a/b/"]);
        let (prefix, _) = table.lookup("/a/b/c").unwrap();
        assert_eq!(prefix, "/a/b/");

        let (prefix, _) = table.lookup("/a/x").unwrap();
        assert_eq!(prefix, "/a/");
    }

    #[test]
    fn test_no_match_returns_none() {
        let table = table(&["/api/", "/app/"]);
        assert!(table.lookup("/other").is_none());
        assert!(table.lookup("/").is_none());
    }

    #[test]
    fn test_prefix_match_is_not_segment_match() {
        // Documented behavior: /a matches /abc.
        let table = table(&["/a"]);
        let (prefix, _) = table.lookup("/abc").unwrap();
        assert_eq!(prefix, "/a");
    }

    #[test]
    fn test_match_runs_over_path_and_query() {
        let table = table(&["/p"]);
        assert!(table.lookup("/p?x=1").is_some());
        assert!(table.lookup("/q?x=/p").is_none());
    }

    #[test]
    fn test_deterministic_order() {
        let table = table(&["/bb/", "/aa/", "/aa/x/"]);
        let order: Vec<&str> = table.iter().map(|(p, _)| p).collect();
        assert_eq!(order, vec!["/aa/x/", "/aa/", "/bb/"]);
    }

    #[test]
    fn test_route_target() {
        let table = table(&["/p/"]);
        let (_, route) = table.lookup("/p/x").unwrap();
        assert_eq!(route.target(), "/p/");
    }
}
