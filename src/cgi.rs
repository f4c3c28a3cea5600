//! CGI/1.1 adapter: environment construction and response parsing.
//!
//! CGI plugins receive the request metadata through environment variables
//! (RFC 3875) and answer on stdout with HTTP-style header lines, a blank
//! line, and the body.

use std::path::{Path, PathBuf};

use hyper::header::{HeaderMap, AUTHORIZATION, CONTENT_LENGTH};
use hyper::Request;
use tracing::error;

const GATEWAY_INTERFACE: &str = "CGI/1.1";
// Scripts are told HTTP/1.0 regardless of what the listener speaks.
const SERVER_PROTOCOL: &str = "HTTP/1.0";

/// Request-scoped values that do not live in the header map.
pub struct CgiContext<'a> {
    /// Matched route prefix.
    pub prefix: &'a str,
    /// Request path with the route prefix removed.
    pub path_info: &'a str,
    /// Raw query string without the leading `?`.
    pub query: &'a str,
    /// Client socket address, `ip:port`. No FQDN lookup is performed.
    pub remote_addr: &'a str,
    pub server_dir: &'a Path,
    pub server_port: u16,
}

/// CGI/1.1 environment for one request.
///
/// Variables whose source value is empty are omitted, and nothing is
/// inherited from the gateway's own environment.
pub fn environment<B>(req: &Request<B>, ctx: &CgiContext<'_>) -> Vec<(String, String)> {
    fn push(env: &mut Vec<(String, String)>, key: &str, value: &str) {
        if !value.is_empty() {
            env.push((key.to_string(), value.to_string()));
        }
    }

    let headers = req.headers();
    let mut env = Vec::with_capacity(21);

    push(&mut env, "GATEWAY_INTERFACE", GATEWAY_INTERFACE);
    push(&mut env, "AUTH_TYPE", header_str(headers, "auth-scheme"));
    push(&mut env, "PATH_INFO", ctx.path_info);
    push(
        &mut env,
        "PATH_TRANSLATED",
        &path_translated(ctx.server_dir, ctx.path_info).to_string_lossy(),
    );
    push(&mut env, "QUERY_STRING", ctx.query);
    push(&mut env, "REMOTE_ADDR", ctx.remote_addr);
    push(&mut env, "REMOTE_HOST", ctx.remote_addr);
    push(&mut env, "REQUEST_METHOD", req.method().as_str());
    push(&mut env, "SCRIPT_NAME", ctx.prefix);
    push(&mut env, "SERVER_NAME", header_str(headers, "host"));
    push(&mut env, "SERVER_PORT", &ctx.server_port.to_string());
    push(&mut env, "SERVER_PROTOCOL", SERVER_PROTOCOL);
    push(
        &mut env,
        "SERVER_SOFTWARE",
        &format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
    );

    push(&mut env, "HTTP_ACCEPT", header_str(headers, "accept"));
    push(&mut env, "HTTP_ACCEPT_CHARSET", header_str(headers, "accept-charset"));
    push(&mut env, "HTTP_ACCEPT_ENCODING", header_str(headers, "accept-encoding"));
    push(&mut env, "HTTP_ACCEPT_LANGUAGE", header_str(headers, "accept-language"));
    push(&mut env, "HTTP_USER_AGENT", header_str(headers, "user-agent"));

    if let Some(user) = basic_auth_user(headers) {
        push(&mut env, "REMOTE_USER", &user);
    }

    // Body metadata only when the client actually sent one.
    let content_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    if content_length > 0 {
        env.push(("CONTENT_LENGTH".to_string(), content_length.to_string()));
        push(&mut env, "CONTENT_TYPE", header_str(headers, "content-type"));
    }

    env
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Username from an inbound `Authorization: Basic` header, if any.
fn basic_auth_user(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let scheme = value.get(..6)?;
    if !scheme.eq_ignore_ascii_case("basic ") {
        return None;
    }
    let decoded = base64::Engine::decode(
        &base64::engine::general_purpose::STANDARD,
        value[6..].trim(),
    )
    .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, _) = decoded.split_once(':')?;
    Some(user.to_string())
}

fn path_translated(server_dir: &Path, path_info: &str) -> PathBuf {
    server_dir.join(path_info.trim_start_matches('/'))
}

/// A parsed CGI response: status, header lines, and the remaining body.
#[derive(Debug, PartialEq, Eq)]
pub struct CgiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Splits subprocess stdout into the header block and the body.
///
/// Lines are split on LF with all other bytes preserved. Header lines hold
/// `key: value` pairs; a `Status:` line overrides the response status
/// (default 200). The first empty line ends the header block, and every
/// following line is emitted followed by a single LF.
pub fn parse_response(output: &[u8]) -> CgiResponse {
    let mut status: u16 = 200;
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut body: Vec<u8> = Vec::new();
    let mut in_header = true;

    for line in output.split(|b| *b == b'\n') {
        if in_header {
            if line.is_empty() {
                in_header = false;
                continue;
            }
            let Some(colon) = line.iter().position(|b| *b == b':') else {
                error!(line = %String::from_utf8_lossy(line), "Malformed CGI header line");
                continue;
            };
            let key = String::from_utf8_lossy(&line[..colon]).trim().to_string();
            let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_string();

            if key.eq_ignore_ascii_case("status") {
                let token = value.split(' ').next().unwrap_or("");
                match token.parse::<u16>() {
                    Ok(code) => status = code,
                    Err(e) => {
                        error!(value = %value, error = %e, "Unparseable CGI Status header")
                    }
                }
            } else {
                headers.push((key, value));
            }
        } else {
            body.extend_from_slice(line);
            body.push(b'\n');
        }
    }

    CgiResponse { status, headers, body }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Method;

    fn request(headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().method(Method::GET).uri("/x");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    fn ctx<'a>(server_dir: &'a Path) -> CgiContext<'a> {
        CgiContext {
            prefix: "/cgi/",
            path_info: "tool/run",
            query: "x=1&y=2",
            remote_addr: "10.0.0.9:51234",
            server_dir,
            server_port: 8000,
        }
    }

    fn lookup<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
        env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_environment_core_variables() {
        let req = request(&[("host", "gw.example:8000"), ("accept", "text/html")]);
        let dir = Path::new("/srv/www");
        let env = environment(&req, &ctx(dir));

        assert_eq!(lookup(&env, "GATEWAY_INTERFACE"), Some("CGI/1.1"));
        assert_eq!(lookup(&env, "PATH_INFO"), Some("tool/run"));
        assert_eq!(lookup(&env, "PATH_TRANSLATED"), Some("/srv/www/tool/run"));
        assert_eq!(lookup(&env, "QUERY_STRING"), Some("x=1&y=2"));
        assert_eq!(lookup(&env, "REMOTE_ADDR"), Some("10.0.0.9:51234"));
        assert_eq!(lookup(&env, "REMOTE_HOST"), Some("10.0.0.9:51234"));
        assert_eq!(lookup(&env, "REQUEST_METHOD"), Some("GET"));
        assert_eq!(lookup(&env, "SCRIPT_NAME"), Some("/cgi/"));
        assert_eq!(lookup(&env, "SERVER_NAME"), Some("gw.example:8000"));
        assert_eq!(lookup(&env, "SERVER_PORT"), Some("8000"));
        assert_eq!(lookup(&env, "SERVER_PROTOCOL"), Some("HTTP/1.0"));
        assert_eq!(
            lookup(&env, "SERVER_SOFTWARE"),
            Some(format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")).as_str())
        );
        assert_eq!(lookup(&env, "HTTP_ACCEPT"), Some("text/html"));
    }

    #[test]
    fn test_environment_omits_empty_values() {
        let req = request(&[]);
        let env = environment(&req, &ctx(Path::new("/srv")));
        assert_eq!(lookup(&env, "AUTH_TYPE"), None);
        assert_eq!(lookup(&env, "SERVER_NAME"), None);
        assert_eq!(lookup(&env, "HTTP_USER_AGENT"), None);
        assert_eq!(lookup(&env, "CONTENT_LENGTH"), None);
        assert_eq!(lookup(&env, "CONTENT_TYPE"), None);
    }

    #[test]
    fn test_environment_remote_user_from_basic_auth() {
        // alice:secret
        let req = request(&[("authorization", "Basic YWxpY2U6c2VjcmV0")]);
        let env = environment(&req, &ctx(Path::new("/srv")));
        assert_eq!(lookup(&env, "REMOTE_USER"), Some("alice"));
    }

    #[test]
    fn test_environment_ignores_non_basic_auth() {
        let req = request(&[("authorization", "Bearer tok")]);
        let env = environment(&req, &ctx(Path::new("/srv")));
        assert_eq!(lookup(&env, "REMOTE_USER"), None);
    }

    #[test]
    fn test_environment_body_metadata_requires_content_length() {
        let req = request(&[("content-length", "5"), ("content-type", "text/plain")]);
        let env = environment(&req, &ctx(Path::new("/srv")));
        assert_eq!(lookup(&env, "CONTENT_LENGTH"), Some("5"));
        assert_eq!(lookup(&env, "CONTENT_TYPE"), Some("text/plain"));

        let req = request(&[("content-type", "text/plain")]);
        let env = environment(&req, &ctx(Path::new("/srv")));
        assert_eq!(lookup(&env, "CONTENT_LENGTH"), None);
        assert_eq!(lookup(&env, "CONTENT_TYPE"), None);
    }

    #[test]
    fn test_parse_status_and_headers() {
        let parsed = parse_response(b"Status: 201 Created\nX-Test: hi\n\nhello");
        assert_eq!(parsed.status, 201);
        assert_eq!(parsed.headers, vec![("X-Test".to_string(), "hi".to_string())]);
        assert_eq!(parsed.body, b"hello\n");
    }

    #[test]
    fn test_parse_content_type_only() {
        let parsed = parse_response(b"Content-Type: application/json\n\n{\"k\":1}");
        assert_eq!(parsed.status, 200);
        assert_eq!(
            parsed.headers,
            vec![("Content-Type".to_string(), "application/json".to_string())]
        );
        assert_eq!(parsed.body, b"{\"k\":1}\n");
    }

    #[test]
    fn test_parse_status_with_reason_phrase() {
        let parsed = parse_response(b"Status: 418 Teapot\n\nnope");
        assert_eq!(parsed.status, 418);
        assert_eq!(parsed.body, b"nope\n");
    }

    #[test]
    fn test_parse_malformed_header_line_is_skipped() {
        let parsed = parse_response(b"not a header\nX-Ok: yes\n\nbody");
        assert_eq!(parsed.headers, vec![("X-Ok".to_string(), "yes".to_string())]);
        assert_eq!(parsed.body, b"body\n");
    }

    #[test]
    fn test_parse_bad_status_keeps_running_status() {
        let parsed = parse_response(b"Status: banana\n\nx");
        assert_eq!(parsed.status, 200);

        let parsed = parse_response(b"Status: 503 down\nStatus: banana\n\nx");
        assert_eq!(parsed.status, 503);
    }

    #[test]
    fn test_parse_preserves_body_lines() {
        let parsed = parse_response(b"A: b\n\nline1\nline2");
        assert_eq!(parsed.body, b"line1\nline2\n");

        // A trailing LF in the output yields a trailing empty line.
        let parsed = parse_response(b"A: b\n\nline1\n");
        assert_eq!(parsed.body, b"line1\n\n");
    }

    #[test]
    fn test_parse_header_only_output() {
        let parsed = parse_response(b"X-Only: headers");
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.headers, vec![("X-Only".to_string(), "headers".to_string())]);
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn test_parse_crlf_header_values_are_trimmed() {
        let parsed = parse_response(b"X-Test: hi\r\nX-More: yes\n\nbody");
        assert_eq!(
            parsed.headers,
            vec![
                ("X-Test".to_string(), "hi".to_string()),
                ("X-More".to_string(), "yes".to_string())
            ]
        );
        assert_eq!(parsed.body, b"body\n");
    }

    #[test]
    fn test_parse_lone_cr_line_is_not_blank() {
        // The protocol is LF-delimited; a "\r" line is malformed, so a
        // CRLF-terminated blank line does not end the header block.
        let parsed = parse_response(b"X-Test: hi\r\n\r\nbody");
        assert_eq!(parsed.headers, vec![("X-Test".to_string(), "hi".to_string())]);
        assert!(parsed.body.is_empty());
    }
}
