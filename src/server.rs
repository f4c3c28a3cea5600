//! The listening front door: accept loop, per-request dispatch, shutdown.
//!
//! Every request takes exactly one of three paths, chosen by longest-prefix
//! match over the request URI: reverse proxy, plugin execution, or the
//! static-file fallback. A watch channel signals shutdown; in-flight
//! connections get a bounded drain before the listener task returns.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::files;
use crate::plugin;
use crate::proxy;
use crate::route::{Route, RouteTable};

/// Body type produced by every handler in the gateway.
pub type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Clients that have not sent their request head within this window are cut.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);
/// In-flight requests get this long to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub fn full(body: impl Into<Bytes>) -> ResponseBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> ResponseBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .body(full(body))
        .expect("valid response builder")
}

pub fn status_response(status: StatusCode) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .body(empty())
        .expect("valid response builder")
}

/// Read-only gateway state shared by every request task.
pub struct Gateway {
    pub routes: RouteTable,
    /// Directory served for unrouted paths; also the CGI `PATH_TRANSLATED` root.
    pub server_dir: PathBuf,
    /// Listener port, exposed to CGI plugins as `SERVER_PORT`.
    pub port: u16,
}

/// The listening HTTP/1.1 front door.
pub struct GatewayServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(bind_addr: SocketAddr, gateway: Arc<Gateway>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            gateway,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Gateway listening (HTTP/1.1)");

        let graceful = GracefulShutdown::new();
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req: Request<Incoming>| {
                                let gateway = Arc::clone(&gateway);
                                async move { dispatch(req, gateway, addr).await }
                            });
                            let conn = http1::Builder::new()
                                .timer(TokioTimer::new())
                                .header_read_timeout(HEADER_READ_TIMEOUT)
                                .serve_connection(io, service);
                            let conn = graceful.watch(conn);
                            tokio::spawn(async move {
                                if let Err(e) = conn.await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        // Bounded drain of in-flight connections.
        tokio::select! {
            _ = graceful.shutdown() => {
                info!("All connections drained");
            }
            _ = tokio::time::sleep(DRAIN_TIMEOUT) => {
                warn!(timeout_secs = DRAIN_TIMEOUT.as_secs(), "Drain timed out, closing remaining connections");
            }
        }

        Ok(())
    }
}

/// Routes one request: longest matching prefix wins, no match falls through
/// to the static-file tree. Every request gets a terminal response; handler
/// failures never abort the connection.
async fn dispatch(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
    remote_addr: SocketAddr,
) -> Result<Response<ResponseBody>, Infallible> {
    let request_uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let response = match gateway.routes.lookup(&request_uri) {
        Some((prefix, Route::Proxy(route))) => proxy::forward(route, prefix, req).await,
        Some((prefix, Route::Plugin(route))) => {
            plugin::execute(route, prefix, req, &gateway.server_dir, gateway.port, remote_addr).await
        }
        None => files::serve(&gateway.server_dir, req).await,
    };

    Ok(response)
}
