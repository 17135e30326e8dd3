//! HTTP/1.1 surface over `StreamServer`.
//!
//! A non-blocking accept loop hands each connection to its own thread so long-lived
//! MJPEG feeds never hold up other requests. `ApiHandle::stop` stops accepting, flags
//! open feeds to end, and waits for connection threads to finish.

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::report::{day_bounds, hourly_rollup, parse_date};
use crate::server::{StreamServer, FEED_CONTENT_TYPE};
use crate::{classify, CameraId, FootfallError};

const MAX_REQUEST_BYTES: usize = 8192;
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Branch name → ordered camera URLs, served by `/branches/` and `/stream-info/`.
    pub branches: BTreeMap<String, Vec<String>>,
    /// Bound on a single blocking write to a viewer.
    pub write_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
            branches: BTreeMap::new(),
            write_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    server: StreamServer,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, server: StreamServer) -> Self {
        Self { cfg, server }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let ctx = Arc::new(Context {
            cfg: self.cfg,
            server: self.server,
            shutdown: shutdown.clone(),
        });
        let join = std::thread::Builder::new()
            .name("http-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, ctx, shutdown_thread) {
                    log::error!("http api stopped: {}", err);
                }
            })?;
        log::info!("http api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

struct Context {
    cfg: ApiConfig,
    server: StreamServer,
    shutdown: Arc<AtomicBool>,
}

fn run_api(listener: TcpListener, ctx: Arc<Context>, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let ctx = Arc::clone(&ctx);
                let spawned = std::thread::Builder::new()
                    .name("http-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &ctx) {
                            log::warn!("http request from {} failed: {:#}", peer, err);
                        }
                    });
                match spawned {
                    Ok(handle) => connections.push(handle),
                    Err(err) => log::error!("failed to spawn connection thread: {}", err),
                }
                connections.retain(|handle| !handle.is_finished());
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    for handle in connections {
        if handle.join().is_err() {
            log::error!("http connection thread panicked");
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, ctx: &Context) -> Result<()> {
    // Accepted sockets may inherit non-blocking mode from the listener.
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(ctx.cfg.write_timeout))?;

    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        return write_json_response(&mut stream, 405, &json!({"error": "method_not_allowed"}));
    }
    match request.route() {
        "/health" => write_json_response(&mut stream, 200, &json!({"status": "ok"})),
        "/video-feed" => video_feed(&mut stream, ctx, &request),
        "/camera-stats" => camera_stats(&mut stream, ctx, &request),
        "/check-status" => check_status(&mut stream, ctx, &request),
        "/branches" => write_json_response(
            &mut stream,
            200,
            &json!({"branches": ctx.cfg.branches}),
        ),
        "/stream-info" => stream_info(&mut stream, ctx, &request),
        "/camera-report" => camera_report(&mut stream, ctx, &request),
        _ => write_json_response(&mut stream, 404, &json!({"error": "not_found"})),
    }
}

fn no_url(stream: &mut TcpStream) -> Result<()> {
    write_json_response(stream, 400, &json!({"error": "No URL provided"}))
}

fn video_feed(stream: &mut TcpStream, ctx: &Context, request: &HttpRequest) -> Result<()> {
    let Some(url) = request.param("url") else {
        return no_url(stream);
    };
    let feed = match ctx.server.open_feed(url) {
        Ok(feed) => feed,
        Err(err) => {
            let (status, body) = error_body(&err);
            return write_json_response(stream, status, &body);
        }
    };
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        FEED_CONTENT_TYPE
    );
    if let Err(err) = stream.write_all(header.as_bytes()) {
        // Dropping the feed releases the camera.
        drop(feed);
        return Err(err.into());
    }
    let camera = feed.camera_id().clone();
    let end = feed.run(stream, &ctx.shutdown)?;
    log::info!("feed[{}]: ended ({:?})", camera, end);
    Ok(())
}

fn camera_stats(stream: &mut TcpStream, ctx: &Context, request: &HttpRequest) -> Result<()> {
    let Some(url) = request.param("url") else {
        return no_url(stream);
    };
    match ctx.server.current_counts(url) {
        Ok(counts) => write_json_response(
            stream,
            200,
            &json!({
                "count": counts.count,
                "total": counts.total,
                "timestamp": counts.timestamp,
                "status": "success",
            }),
        ),
        Err(err) => match classify(&err) {
            Some(FootfallError::InvalidRequest(msg)) => {
                write_json_response(stream, 400, &json!({"error": msg}))
            }
            Some(FootfallError::UnknownCamera(_)) => write_json_response(
                stream,
                200,
                &json!({
                    "count": 0,
                    "total": 0,
                    "timestamp": Utc::now().to_rfc3339(),
                    "status": "offline",
                }),
            ),
            _ => {
                log::error!("camera stats failed: {:#}", err);
                write_json_response(
                    stream,
                    500,
                    &json!({"error": format!("{:#}", err), "status": "error"}),
                )
            }
        },
    }
}

fn check_status(stream: &mut TcpStream, ctx: &Context, request: &HttpRequest) -> Result<()> {
    let Some(url) = request.param("url") else {
        return no_url(stream);
    };
    match ctx.server.check_status(url) {
        Ok(status) => write_json_response(stream, 200, &json!({"status": status, "url": url})),
        Err(err) => {
            if let Some(FootfallError::InvalidRequest(msg)) = classify(&err) {
                return write_json_response(stream, 400, &json!({"error": msg}));
            }
            log::error!("status check failed: {:#}", err);
            write_json_response(
                stream,
                200,
                &json!({"status": "error", "error": format!("{:#}", err), "url": url}),
            )
        }
    }
}

fn stream_info(stream: &mut TcpStream, ctx: &Context, request: &HttpRequest) -> Result<()> {
    let Some(url) = request.param("url") else {
        return no_url(stream);
    };
    let url = crate::normalize_source_url(url);
    let found = ctx.cfg.branches.iter().find_map(|(branch, urls)| {
        urls.iter()
            .position(|candidate| crate::normalize_source_url(candidate) == url)
            .map(|idx| (branch, idx + 1))
    });
    match found {
        Some((branch, camera_number)) => write_json_response(
            stream,
            200,
            &json!({
                "branch": branch,
                "camera_number": camera_number,
                "url": url,
                "status": "success",
            }),
        ),
        None => write_json_response(
            stream,
            404,
            &json!({"error": "URL not found", "status": "error"}),
        ),
    }
}

fn camera_report(stream: &mut TcpStream, ctx: &Context, request: &HttpRequest) -> Result<()> {
    let Some(url) = request.param("url") else {
        return no_url(stream);
    };
    let report = (|| -> Result<Value> {
        let camera = CameraId::from_url(url)?;
        let date = match request.param("date") {
            Some(raw) => parse_date(raw)?,
            None => Utc::now().date_naive(),
        };
        let (from, to) = day_bounds(date)?;
        let snapshots = ctx
            .server
            .registry()
            .store()
            .lock()
            .map_err(|_| anyhow!("count store lock poisoned"))?
            .snapshots(&camera, from, to)?;
        Ok(json!({
            "camera_id": camera,
            "date": date,
            "hours": hourly_rollup(&snapshots)?,
            "status": "success",
        }))
    })();
    match report {
        Ok(body) => write_json_response(stream, 200, &body),
        Err(err) => {
            let (status, body) = error_body(&err);
            write_json_response(stream, status, &body)
        }
    }
}

fn error_body(err: &anyhow::Error) -> (u16, Value) {
    match classify(err) {
        Some(FootfallError::InvalidRequest(msg)) => (400, json!({"error": msg})),
        Some(FootfallError::UnknownCamera(msg)) => {
            (404, json!({"error": msg, "status": "offline"}))
        }
        _ => {
            log::error!("request failed: {:#}", err);
            (500, json!({"error": format!("{:#}", err), "status": "error"}))
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let (path, query) = raw_path.split_once('?').unwrap_or((raw_path, ""));
    let params = url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        params,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    params: HashMap<String, String>,
}

impl HttpRequest {
    /// Path without its trailing slash.
    fn route(&self) -> &str {
        let trimmed = self.path.trim_end_matches('/');
        if trimmed.is_empty() {
            "/"
        } else {
            trimmed
        }
    }

    /// Non-blank query parameter.
    fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, query: &[(&str, &str)]) -> HttpRequest {
        HttpRequest {
            method: "GET".to_string(),
            path: path.to_string(),
            params: query
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn trailing_slash_is_optional() {
        assert_eq!(request("/video-feed/", &[]).route(), "/video-feed");
        assert_eq!(request("/video-feed", &[]).route(), "/video-feed");
        assert_eq!(request("/", &[]).route(), "/");
    }

    #[test]
    fn blank_params_count_as_missing() {
        let req = request("/camera-stats/", &[("url", "  "), ("date", "2024-01-01")]);
        assert_eq!(req.param("url"), None);
        assert_eq!(req.param("date"), Some("2024-01-01"));
    }

    #[test]
    fn error_body_maps_taxonomy() {
        let (status, _) = error_body(&FootfallError::InvalidRequest("bad".into()).into());
        assert_eq!(status, 400);
        let (status, body) = error_body(&FootfallError::UnknownCamera("x".into()).into());
        assert_eq!(status, 404);
        assert_eq!(body["status"], "offline");
        let (status, _) = error_body(&anyhow!("boom"));
        assert_eq!(status, 500);
    }
}
