//! Configuration loading and route-table construction.
//!
//! The configuration file is a JSON object with two mappings, `proxies` and
//! `plugins`, each keyed by URL prefix. Unknown keys are ignored and missing
//! keys take their type defaults. Validation failures are fatal at startup
//! with a specific process exit code.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::route::{PluginMode, PluginRoute, ProxyRoute, Route, RouteTable};
use crate::upstream::UpstreamClient;

pub const EXIT_CONFIG_PATH: i32 = 1;
pub const EXIT_READ_CONFIG: i32 = 2;
pub const EXIT_PARSE_CONFIG: i32 = 3;
pub const EXIT_SERVER_DIR: i32 = 4;
pub const EXIT_ROUTE_CONFLICT: i32 = 5;

/// On-disk configuration: two route maps keyed by URL prefix.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub proxies: HashMap<String, ProxyConfig>,
    #[serde(default)]
    pub plugins: HashMap<String, PluginConfig>,
}

/// One reverse-proxy entry.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProxyConfig {
    /// Absolute URL prefix of the upstream.
    #[serde(default)]
    pub url: String,

    /// Query parameters forced onto every request through this route.
    #[serde(default)]
    pub parameters: HashMap<String, String>,

    /// `user:password`, or a pre-encoded basic credential.
    #[serde(default)]
    pub auth: String,

    /// Log `METHOD URL` for every request.
    #[serde(default)]
    pub log: bool,

    /// Skip upstream TLS certificate verification.
    #[serde(default)]
    pub insecure: bool,
}

/// One plugin entry.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PluginConfig {
    /// `""` for simple plugins, `"cgi"` for CGI/1.1 plugins.
    #[serde(default, rename = "type")]
    pub kind: String,

    /// Program to run; macro-expandable.
    #[serde(default)]
    pub executable: String,

    /// Arguments in order; each macro-expandable.
    #[serde(default)]
    pub arguments: Vec<String>,

    /// Default response Content-Type in simple mode.
    #[serde(default, rename = "content-type")]
    pub content_type: String,

    /// Forward the plugin's stderr to the gateway log.
    #[serde(default)]
    pub log: bool,
}

/// Startup configuration failures, each tied to a process exit code.
#[derive(Debug)]
pub enum ConfigError {
    MissingPath,
    Read { path: PathBuf, source: std::io::Error },
    Parse(serde_json::Error),
    ServerDir { path: PathBuf, reason: String },
    InvalidPrefix(String),
    UnknownPluginKind { prefix: String, kind: String },
    DuplicatePrefix(String),
}

impl ConfigError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::MissingPath => EXIT_CONFIG_PATH,
            ConfigError::Read { .. } => EXIT_READ_CONFIG,
            ConfigError::Parse(_) => EXIT_PARSE_CONFIG,
            ConfigError::ServerDir { .. } => EXIT_SERVER_DIR,
            ConfigError::InvalidPrefix(_) => EXIT_PARSE_CONFIG,
            ConfigError::UnknownPluginKind { .. } => EXIT_PARSE_CONFIG,
            ConfigError::DuplicatePrefix(_) => EXIT_ROUTE_CONFLICT,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingPath => write!(f, "no configuration path provided"),
            ConfigError::Read { path, source } => {
                write!(f, "cannot read configuration \"{}\": {}", path.display(), source)
            }
            ConfigError::Parse(e) => write!(f, "invalid configuration JSON: {}", e),
            ConfigError::ServerDir { path, reason } => {
                write!(f, "invalid server directory \"{}\": {}", path.display(), reason)
            }
            ConfigError::InvalidPrefix(prefix) => {
                write!(f, "route prefix must start with '/': \"{}\"", prefix)
            }
            ConfigError::UnknownPluginKind { prefix, kind } => {
                write!(f, "plugin \"{}\" has unknown type \"{}\"", prefix, kind)
            }
            ConfigError::DuplicatePrefix(prefix) => {
                write!(f, "proxy/plugin URL prefix is not unique: \"{}\"", prefix)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&data).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Prefixes must start with `/` and be unique across proxies and plugins;
    /// plugin types must be `""` or `"cgi"`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::with_capacity(self.proxies.len() + self.plugins.len());
        for prefix in self.proxies.keys().chain(self.plugins.keys()) {
            if !prefix.starts_with('/') {
                return Err(ConfigError::InvalidPrefix(prefix.clone()));
            }
            if !seen.insert(prefix.as_str()) {
                return Err(ConfigError::DuplicatePrefix(prefix.clone()));
            }
        }
        for (prefix, plugin) in &self.plugins {
            if !matches!(plugin.kind.as_str(), "" | "cgi") {
                return Err(ConfigError::UnknownPluginKind {
                    prefix: prefix.clone(),
                    kind: plugin.kind.clone(),
                });
            }
        }
        Ok(())
    }

    /// Builds the immutable route table, constructing one upstream client
    /// per proxy route.
    pub fn build_routes(&self) -> anyhow::Result<RouteTable> {
        let mut routes = Vec::with_capacity(self.proxies.len() + self.plugins.len());

        for (prefix, proxy) in &self.proxies {
            let client = UpstreamClient::new(proxy.insecure)?;
            routes.push((
                prefix.clone(),
                Route::Proxy(ProxyRoute {
                    url_to: proxy.url.clone(),
                    forced_parameters: proxy.parameters.clone(),
                    auth: (!proxy.auth.is_empty()).then(|| proxy.auth.clone()),
                    log: proxy.log,
                    insecure_tls: proxy.insecure,
                    client,
                }),
            ));
        }

        for (prefix, plugin) in &self.plugins {
            let mode = if plugin.kind == "cgi" {
                PluginMode::Cgi
            } else {
                PluginMode::Simple
            };
            routes.push((
                prefix.clone(),
                Route::Plugin(PluginRoute {
                    mode,
                    executable: plugin.executable.clone(),
                    arguments: plugin.arguments.clone(),
                    content_type: plugin.content_type.clone(),
                    log: plugin.log,
                }),
            ));
        }

        Ok(RouteTable::new(routes))
    }
}

/// Resolves and checks the directory served for unrouted paths.
pub fn resolve_server_dir(dir: &Path) -> Result<PathBuf, ConfigError> {
    let resolved = dir.canonicalize().map_err(|e| ConfigError::ServerDir {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !resolved.is_dir() {
        return Err(ConfigError::ServerDir {
            path: dir.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }
    Ok(resolved)
}
