//! Static-file serving for requests that matched no route.

use std::path::{Path, PathBuf};

use hyper::body::Incoming;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use percent_encoding::percent_decode_str;
use tracing::debug;

use crate::server::{self, ResponseBody};

/// Serves a file under `server_dir` for the request path.
///
/// Directories fall back to their `index.html`; missing files answer 404.
pub async fn serve(server_dir: &Path, req: Request<Incoming>) -> Response<ResponseBody> {
    let decoded = percent_decode_str(req.uri().path()).decode_utf8_lossy();
    let Some(path) = resolve(server_dir, &decoded) else {
        return server::text_response(StatusCode::BAD_REQUEST, "Invalid path\n");
    };

    let path = match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_dir() => path.join("index.html"),
        Ok(_) => path,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Static file not found");
            return not_found();
        }
    };

    match tokio::fs::read(&path).await {
        Ok(contents) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            let length = contents.len();
            let body = if req.method() == Method::HEAD {
                server::empty()
            } else {
                server::full(contents)
            };
            Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, mime.as_ref())
                .header(CONTENT_LENGTH, length)
                .body(body)
                .expect("valid response builder")
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Static file not readable");
            not_found()
        }
    }
}

fn not_found() -> Response<ResponseBody> {
    server::text_response(StatusCode::NOT_FOUND, "404 page not found\n")
}

/// Joins the request path under the root, rejecting traversal segments.
fn resolve(server_dir: &Path, request_path: &str) -> Option<PathBuf> {
    if request_path.split('/').any(|segment| segment == "..") {
        return None;
    }
    Some(server_dir.join(request_path.trim_start_matches('/')))
}
