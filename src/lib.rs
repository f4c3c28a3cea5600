//! Portico - an HTTP front door for static files, proxies, and plugins
//!
//! This library provides a small gateway that:
//! - Serves a local directory of static files
//! - Forwards configured URL prefixes to remote upstream HTTP servers,
//!   with per-route cookie jars, forced query parameters, and header hygiene
//! - Executes local programs whose output becomes the HTTP response, either
//!   verbatim (simple plugins) or as CGI/1.1 responses (headers, blank line,
//!   body on stdout)
//! - Picks exactly one disposition per request by longest-prefix match over
//!   the request URI
//! - Bounds every upstream round-trip and plugin run with a wall-clock
//!   deadline

pub mod cgi;
pub mod config;
pub mod files;
pub mod headers;
pub mod macros;
pub mod plugin;
pub mod proxy;
pub mod route;
pub mod server;
pub mod upstream;
