//! Macro expansion for plugin command strings.
//!
//! Plugin executables and arguments may carry `{{name}}` placeholders that
//! are substituted textually before the subprocess is spawned. Unknown
//! placeholders pass through unchanged.

use std::env::consts;

/// Expands the recognized macros in a single command string.
///
/// `path` is the request path with the matched route prefix already removed;
/// `query` is the raw query string without the leading `?`.
pub fn expand(value: &str, path: &str, query: &str) -> String {
    value
        .replace("{{extension}}", &host_extension())
        .replace("{{path}}", path)
        .replace("{{query}}", query)
}

/// Expands every argument independently.
pub fn expand_all(values: &[String], path: &str, query: &str) -> Vec<String> {
    values.iter().map(|value| expand(value, path, query)).collect()
}

/// Platform token: `exe` on Windows, `<os>.<arch>` elsewhere.
fn host_extension() -> String {
    if cfg!(windows) {
        "exe".to_string()
    } else {
        format!("{}.{}", consts::OS, consts::ARCH)
    }
}
