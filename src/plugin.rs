//! Plugin execution: subprocesses whose output becomes the HTTP response.
//!
//! Both plugin flavors run through one spawn path: macro-expanded argv,
//! request body piped to stdin, stdout and stderr captured, and a wall-clock
//! deadline that kills the child when it elapses. Simple mode answers with
//! stdout verbatim; CGI mode parses stdout as a CGI/1.1 response.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use percent_encoding::percent_decode_str;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

use crate::cgi::{self, CgiContext};
use crate::macros;
use crate::route::{PluginMode, PluginRoute};
use crate::server::{self, ResponseBody};

/// Wall-clock bound on one plugin invocation.
pub const DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum PluginError {
    /// The executable could not be spawned.
    Spawn(std::io::Error),
    /// The deadline elapsed and the subprocess was killed.
    DeadlineExceeded(Duration),
    /// Waiting on the subprocess failed.
    Wait(std::io::Error),
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginError::Spawn(e) => write!(f, "failed to start plugin: {}", e),
            PluginError::DeadlineExceeded(d) => {
                write!(f, "plugin deadline of {}s exceeded", d.as_secs())
            }
            PluginError::Wait(e) => write!(f, "failed waiting for plugin: {}", e),
        }
    }
}

impl std::error::Error for PluginError {}

/// Captured result of one finished subprocess.
pub struct PluginOutput {
    pub status: std::process::ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Runs a prepared command with the request body on stdin.
///
/// If the deadline elapses, the in-flight wait is dropped and the child is
/// killed through `kill_on_drop`.
pub async fn run<B>(mut cmd: Command, body: B, deadline: Duration) -> Result<PluginOutput, PluginError>
where
    B: Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Send,
{
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(PluginError::Spawn)?;

    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            let mut body = body;
            while let Some(frame) = body.frame().await {
                let Ok(frame) = frame else { break };
                if let Ok(mut data) = frame.into_data() {
                    if let Err(e) = stdin.write_all_buf(&mut data).await {
                        debug!(error = %e, "Plugin closed stdin early");
                        break;
                    }
                }
            }
            // stdin drops here, closing the pipe.
        });
    }

    match tokio::time::timeout(deadline, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(PluginOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        }),
        Ok(Err(e)) => Err(PluginError::Wait(e)),
        Err(_) => Err(PluginError::DeadlineExceeded(deadline)),
    }
}

/// Dispatches a matched plugin request to the simple or CGI driver.
pub async fn execute(
    route: &PluginRoute,
    prefix: &str,
    req: Request<Incoming>,
    server_dir: &Path,
    server_port: u16,
    remote_addr: SocketAddr,
) -> Response<ResponseBody> {
    let path = percent_decode_str(req.uri().path()).decode_utf8_lossy().to_string();
    let path_info = path.replacen(prefix, "", 1);
    let query = req.uri().query().unwrap_or("").to_string();

    let executable = macros::expand(&route.executable, &path_info, &query);
    let arguments = macros::expand_all(&route.arguments, &path_info, &query);

    match route.mode {
        PluginMode::Simple => execute_simple(route, executable, arguments, req).await,
        PluginMode::Cgi => {
            let remote = remote_addr.to_string();
            let ctx = CgiContext {
                prefix,
                path_info: &path_info,
                query: &query,
                remote_addr: &remote,
                server_dir,
                server_port,
            };
            execute_cgi(route, executable, arguments, req, &ctx).await
        }
    }
}

/// Simple mode: stdout is the response body.
///
/// The subprocess inherits the gateway's environment; only CGI mode builds
/// a clean one.
async fn execute_simple(
    route: &PluginRoute,
    executable: String,
    arguments: Vec<String>,
    req: Request<Incoming>,
) -> Response<ResponseBody> {
    let mut cmd = Command::new(&executable);
    cmd.args(&arguments);

    match run(cmd, req.into_body(), DEADLINE).await {
        Ok(output) if output.status.success() => {
            if !output.stderr.is_empty() {
                // Verbatim passthrough of the plugin's error stream.
                eprint!("{}", String::from_utf8_lossy(&output.stderr));
            }
            simple_response(StatusCode::OK, &route.content_type, None, output.stdout)
        }
        Ok(output) => {
            error!(executable = %executable, status = %output.status, "Plugin exited with failure");
            match output.status.code() {
                Some(code) => simple_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &route.content_type,
                    Some(code),
                    output.stderr,
                ),
                None => simple_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &route.content_type,
                    None,
                    format!("plugin terminated abnormally: {}", output.status).into_bytes(),
                ),
            }
        }
        Err(e) => {
            error!(executable = %executable, error = %e, "Plugin execution failed");
            simple_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &route.content_type,
                None,
                e.to_string().into_bytes(),
            )
        }
    }
}

fn simple_response(
    status: StatusCode,
    content_type: &str,
    exit_code: Option<i32>,
    body: Vec<u8>,
) -> Response<ResponseBody> {
    let mut builder = Response::builder().status(status);
    if !content_type.is_empty() {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    if let Some(code) = exit_code {
        builder = builder.header("X-Exit-Code", code.to_string());
    }
    builder.body(server::full(body)).unwrap_or_else(|e| {
        error!(error = %e, "Failed to build plugin response");
        server::status_response(StatusCode::INTERNAL_SERVER_ERROR)
    })
}

/// CGI mode: a clean CGI/1.1 environment in, a parsed CGI response out.
async fn execute_cgi(
    route: &PluginRoute,
    executable: String,
    arguments: Vec<String>,
    req: Request<Incoming>,
    ctx: &CgiContext<'_>,
) -> Response<ResponseBody> {
    let env = cgi::environment(&req, ctx);

    let mut cmd = Command::new(&executable);
    cmd.args(&arguments).env_clear().envs(env);

    match run(cmd, req.into_body(), DEADLINE).await {
        Ok(output) => {
            if route.log && !output.stderr.is_empty() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                error!(executable = %executable, "CGI error output:\n |{}", stderr.replace('\n', "\n |"));
            }
            if output.status.success() {
                cgi_response(cgi::parse_response(&output.stdout))
            } else {
                let reason = match output.status.code() {
                    Some(code) => format!("exit status {}", code),
                    None => format!("{}", output.status),
                };
                error!(executable = %executable, reason = %reason, "CGI plugin failed");
                invocation_error(reason)
            }
        }
        Err(e) => {
            error!(executable = %executable, error = %e, "CGI plugin failed");
            invocation_error(e)
        }
    }
}

fn invocation_error(reason: impl fmt::Display) -> Response<ResponseBody> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(CONTENT_TYPE, "text/plain")
        .body(server::full(format!("CGI invocation error: {}\n", reason)))
        .expect("valid response builder")
}

fn cgi_response(parsed: cgi::CgiResponse) -> Response<ResponseBody> {
    let status = StatusCode::from_u16(parsed.status).unwrap_or_else(|_| {
        error!(status = parsed.status, "CGI status outside the valid range");
        StatusCode::OK
    });

    let mut response = Response::new(server::full(parsed.body));
    *response.status_mut() = status;
    for (key, value) in parsed.headers {
        match (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(&value)) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => error!(header = %key, "Invalid CGI response header"),
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{Empty, Full};
    use hyper::body::Bytes;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn no_body() -> Empty<Bytes> {
        Empty::new()
    }

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let output = run(sh("printf hello"), no_body(), DEADLINE).await.unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout, b"hello");
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_run_captures_stderr_and_exit_code() {
        let output = run(sh("printf boom >&2; exit 7"), no_body(), DEADLINE)
            .await
            .unwrap();
        assert_eq!(output.status.code(), Some(7));
        assert_eq!(output.stderr, b"boom");
    }

    #[tokio::test]
    async fn test_run_feeds_request_body_to_stdin() {
        let body = Full::new(Bytes::from_static(b"ping"));
        let output = run(sh("cat"), body, DEADLINE).await.unwrap();
        assert_eq!(output.stdout, b"ping");
    }

    #[tokio::test]
    async fn test_run_enforces_deadline() {
        let started = std::time::Instant::now();
        let result = run(sh("sleep 5"), no_body(), Duration::from_millis(250)).await;
        assert!(matches!(result, Err(PluginError::DeadlineExceeded(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_run_reports_spawn_failure() {
        let cmd = Command::new("/nonexistent/plugin-binary");
        let result = run(cmd, no_body(), DEADLINE).await;
        assert!(matches!(result, Err(PluginError::Spawn(_))));
    }

    #[test]
    fn test_plugin_error_display() {
        let e = PluginError::DeadlineExceeded(Duration::from_secs(10));
        assert_eq!(e.to_string(), "plugin deadline of 10s exceeded");
    }

    #[test]
    fn test_cgi_response_sets_status_and_headers() {
        let parsed = cgi::CgiResponse {
            status: 201,
            headers: vec![("X-Test".to_string(), "hi".to_string())],
            body: b"hello\n".to_vec(),
        };
        let response = cgi_response(parsed);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("x-test").unwrap(), "hi");
    }

    #[test]
    fn test_cgi_response_out_of_range_status_falls_back() {
        let parsed = cgi::CgiResponse {
            status: 99,
            headers: Vec::new(),
            body: Vec::new(),
        };
        assert_eq!(cgi_response(parsed).status(), StatusCode::OK);
    }

    #[test]
    fn test_simple_response_shape() {
        let response = simple_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            Some(7),
            b"boom".to_vec(),
        );
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/plain");
        assert_eq!(response.headers().get("x-exit-code").unwrap(), "7");
    }

    #[test]
    fn test_simple_response_skips_empty_content_type() {
        let response = simple_response(StatusCode::OK, "", None, Vec::new());
        assert!(response.headers().get(CONTENT_TYPE).is_none());
    }
}
